//! The deployment document: the resources to manage, by name.
//!
//! ```json
//! {
//!   "resources": {
//!     "aks": {
//!       "type": "kubernetes_cluster",
//!       "id": "/subscriptions/.../managedClusters/aks1",
//!       "properties": { "location": "westeurope", ... }
//!     },
//!     "pool": {
//!       "type": "kubernetes_cluster_node_pool",
//!       "id": "/subscriptions/.../managedClusters/aks1/agentPools/pool1",
//!       "dependsOn": ["acr"],
//!       "properties": { "vmSize": "Standard_DS2_v2" }
//!     }
//!   }
//! }
//! ```
//!
//! A resource depends on the resources named in `dependsOn`, and on the
//! resource whose identifier encloses its own, if the document has one.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
};

use anyhow::{bail, Context as _, Result};
use fleetform_core::{DesiredState, Properties, ResourceIdentifier};
use fleetform_resource::{catalog, ResourceSchema};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Document {
    pub resources: BTreeMap<String, ResourceSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub properties: Properties,
}

/// A resource of a deployment, checked against the catalog.
#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub schema: &'static ResourceSchema,
    pub id: ResourceIdentifier,
    pub desired: DesiredState,
    /// The enclosing resource, when the deployment manages it too.
    pub parent: Option<String>,
    /// Explicit dependencies and the parent.
    pub depends_on: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Deployment {
    resources: BTreeMap<String, Resource>,
}

impl Deployment {
    pub fn load(path: &Path) -> Result<Deployment> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read deployment document {}", path.display()))?;
        let document: Document = serde_json::from_str(&text)
            .with_context(|| format!("Invalid deployment document {}", path.display()))?;
        Deployment::resolve(document)
    }

    pub fn resolve(document: Document) -> Result<Deployment> {
        let mut resources = BTreeMap::new();
        for (name, spec) in document.resources {
            let schema = match catalog::lookup(&spec.type_name) {
                Some(schema) => schema,
                None => bail!(
                    "Resource {}: unknown type {}; known types are {}",
                    name,
                    spec.type_name,
                    catalog::ALL
                        .iter()
                        .map(|s| s.type_name)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            };
            let id = schema
                .id_template
                .parse(&spec.id)
                .with_context(|| format!("Resource {}: invalid id", name))?;
            let depends_on: BTreeSet<String> = spec.depends_on.into_iter().collect();
            resources.insert(
                name.clone(),
                Resource {
                    name,
                    schema,
                    id,
                    desired: DesiredState::new(spec.properties),
                    parent: None,
                    depends_on,
                },
            );
        }

        let mut ids: HashMap<ResourceIdentifier, String> = HashMap::new();
        for resource in resources.values() {
            if let Some(other) = ids.insert(resource.id.clone(), resource.name.clone()) {
                bail!(
                    "Resources {} and {} have the same id {}",
                    other,
                    resource.name,
                    resource.id
                );
            }
        }

        for resource in resources.values() {
            for dependency in &resource.depends_on {
                if dependency == &resource.name {
                    bail!("Resource {} depends on itself", resource.name);
                }
                if !resources.contains_key(dependency) {
                    bail!(
                        "Resource {} depends on {}, which is not in the deployment",
                        resource.name,
                        dependency
                    );
                }
            }
        }

        for resource in resources.values_mut() {
            let parent = resource.id.parent().and_then(|p| ids.get(&p)).cloned();
            if let Some(parent) = &parent {
                resource.depends_on.insert(parent.clone());
            }
            resource.parent = parent;
        }

        Ok(Deployment { resources })
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// The resources that depend on `name`.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.resources
            .values()
            .filter(|r| r.depends_on.contains(name))
            .map(|r| r.name.clone())
            .collect()
    }
}
