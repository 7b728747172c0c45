use std::{collections::BTreeMap, process::exit};

use anyhow::{Context as _, Result};
use fleetform_core::Properties;
use fleetform_resource::{Imported, ResourceSchema};

use crate::{
    application::{open_state, reconciler_factory},
    config::{Document, ResourceSpec},
    interrupt::InterruptState,
    options::Options,
    state::ResourceRecord,
};

#[derive(clap::Parser, Debug)]
pub(crate) struct Args {
    /// The identifier of the resource, e.g. /subscriptions/.../managedClusters/aks1
    id: String,

    /// The name to give the resource in the deployment; the last segment of
    /// the identifier by default
    #[arg(long)]
    name: Option<String>,
}

#[derive(clap::Parser, Debug)]
pub(crate) struct ExistsArgs {
    /// The identifier of the resource
    id: String,
}

/// Exit status of `exists` for a resource that is not there.
const ABSENT: i32 = 2;

/// Run the `import` command: print the resource as a deployment document.
pub(crate) async fn import(
    interrupt_state: &InterruptState,
    options: &Options,
    args: &Args,
) -> Result<()> {
    let factory = reconciler_factory(interrupt_state, options)?;
    let imported = factory
        .importer()
        .import_raw(&args.id)
        .await
        .with_context(|| format!("Could not import {}", args.id))?;
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| imported.id.name.clone());

    if let Some(mut state) = open_state(options)? {
        state.record(
            "import",
            &name,
            &ResourceRecord::new(imported.schema.type_name, &imported.id, &imported.observed),
        )?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&document(&name, &imported))?
    );
    eprintln!(
        "Imported {} as {}; review the properties before adding it to {}.",
        imported.id,
        name,
        options.file.display()
    );
    Ok(())
}

/// A deployment document holding just the imported resource.
fn document(name: &str, imported: &Imported) -> Document {
    Document {
        resources: BTreeMap::from([(
            name.to_string(),
            ResourceSpec {
                type_name: imported.schema.type_name.to_string(),
                id: imported.id.to_string(),
                depends_on: Vec::new(),
                properties: settable(imported.schema, &imported.desired.properties),
            },
        )]),
    }
}

/// Drop the top-level properties only the remote can set.
fn settable(schema: &ResourceSchema, properties: &Properties) -> Properties {
    properties
        .iter()
        .filter(|(name, _)| !schema.field(name).is_some_and(|f| f.is_computed()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Run the `exists` command. Exits with status 2 when the resource is absent.
pub(crate) async fn exists(
    interrupt_state: &InterruptState,
    options: &Options,
    args: &ExistsArgs,
) -> Result<()> {
    let factory = reconciler_factory(interrupt_state, options)?;
    let present = factory
        .probe()
        .exists_raw(&args.id)
        .await
        .with_context(|| format!("Could not check {}", args.id))?;
    if present {
        eprintln!("{} exists", args.id);
        Ok(())
    } else {
        eprintln!("{} does not exist", args.id);
        exit(ABSENT)
    }
}

#[cfg(test)]
mod tests {
    use fleetform_core::{DesiredState, ObservedState, ResourceIdentifier};
    use fleetform_resource::catalog::CONTAINER_REGISTRY;
    use serde_json::json;

    use super::*;
    use crate::config::{tests::REGISTRY_ID, Deployment};

    fn imported() -> Imported {
        let properties = json!({
            "location": "westeurope",
            "sku": {"name": "Basic", "tier": "Basic"},
            "adminUserEnabled": false,
            "loginServer": "acr1.azurecr.io",
            "provisioningState": "Succeeded"
        });
        let id: ResourceIdentifier = REGISTRY_ID.parse().unwrap();
        Imported {
            schema: &CONTAINER_REGISTRY,
            id,
            desired: DesiredState::from(properties.clone()),
            observed: ObservedState {
                properties: serde_json::from_value(properties).unwrap(),
                etag: Some("W/\"1\"".to_string()),
            },
        }
    }

    #[test]
    fn documents_leave_out_computed_properties() {
        let document = document("acr", &imported());
        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(
            value,
            json!({
                "resources": {
                    "acr": {
                        "type": "container_registry",
                        "id": REGISTRY_ID,
                        "properties": {
                            "location": "westeurope",
                            "sku": {"name": "Basic", "tier": "Basic"},
                            "adminUserEnabled": false
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn documents_can_be_deployed() {
        let deployment = Deployment::resolve(document("acr", &imported())).unwrap();
        let acr = deployment.get("acr").unwrap();
        assert_eq!(acr.schema.type_name, "container_registry");
        assert_eq!(acr.id.to_string(), REGISTRY_ID);
    }
}
