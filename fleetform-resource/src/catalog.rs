//! The resource types fleetform manages.
//!
//! Property names are the remote's JSON names. Envelope properties
//! (`location`, `tags`, `sku`, `identity`, `zones`) sit next to the resource
//! properties; the HTTP facade moves them in and out of the envelope.

use fleetform_core::{IdTemplate, Properties, ResourceIdentifier, WriteMode};
use serde_json::{json, Value};

use crate::schema::{FieldSchema, ResourceSchema, Timeouts};

const CONTAINER_SERVICE: &str = "Microsoft.ContainerService";

const IDENTITY: &[FieldSchema] = &[
    FieldSchema::new("type").case_insensitive(),
    FieldSchema::new("userAssignedIdentities").map(),
    FieldSchema::new("principalId").computed(),
    FieldSchema::new("tenantId").computed(),
];

const CLUSTER_SKU: &[FieldSchema] = &[
    FieldSchema::new("name").case_insensitive().optional_computed(),
    FieldSchema::new("tier").case_insensitive().optional_computed(),
];

const CLUSTER_NETWORK_PROFILE: &[FieldSchema] = &[
    FieldSchema::new("networkPlugin").case_insensitive().optional_computed(),
    FieldSchema::new("networkPluginMode").case_insensitive().optional_computed(),
    FieldSchema::new("networkPolicy").case_insensitive().optional_computed(),
    FieldSchema::new("serviceCidr").optional_computed(),
    FieldSchema::new("dnsServiceIP").optional_computed(),
    FieldSchema::new("podCidr").optional_computed(),
    FieldSchema::new("outboundType").case_insensitive().optional_computed(),
    FieldSchema::new("loadBalancerSku").case_insensitive().optional_computed(),
];

const CLUSTER_FIELDS: &[FieldSchema] = &[
    FieldSchema::new("location").location(),
    FieldSchema::new("tags").map(),
    FieldSchema::new("sku").block(CLUSTER_SKU).optional_computed(),
    FieldSchema::new("identity").block(IDENTITY),
    FieldSchema::new("dnsPrefix").forces_replacement(),
    FieldSchema::new("kubernetesVersion").optional_computed(),
    FieldSchema::new("nodeResourceGroup")
        .forces_replacement()
        .optional_computed(),
    FieldSchema::new("enableRBAC").default(enabled),
    FieldSchema::new("agentPoolProfiles").list().optional_computed(),
    FieldSchema::new("networkProfile")
        .block(CLUSTER_NETWORK_PROFILE)
        .forces_replacement()
        .optional_computed(),
    FieldSchema::new("fqdn").computed(),
    FieldSchema::new("currentKubernetesVersion").computed(),
    FieldSchema::new("powerState").computed(),
    FieldSchema::new("provisioningState").computed(),
];

pub static KUBERNETES_CLUSTER: ResourceSchema = ResourceSchema {
    type_name: "kubernetes_cluster",
    id_template: IdTemplate::new(CONTAINER_SERVICE, &["managedClusters"]),
    write_mode: WriteMode::Put,
    fields: CLUSTER_FIELDS,
    validate: None,
    timeouts: Timeouts::minutes(60, 5, 60, 60),
};

const UPGRADE_SETTINGS: &[FieldSchema] = &[
    FieldSchema::new("maxSurge").optional_computed(),
    FieldSchema::new("drainTimeoutInMinutes")
        .replace_if(drain_timeout_cleared)
        .optional_computed(),
    FieldSchema::new("nodeSoakDurationInMinutes").optional_computed(),
];

const NODE_NETWORK_PROFILE: &[FieldSchema] = &[
    FieldSchema::new("allowedHostPorts").list(),
    FieldSchema::new("applicationSecurityGroups").set(),
    FieldSchema::new("nodePublicIPTags").list().forces_replacement(),
];

const NODE_POOL_FIELDS: &[FieldSchema] = &[
    FieldSchema::new("vmSize").forces_replacement(),
    FieldSchema::new("nodeCount").optional_computed(),
    FieldSchema::new("enableAutoScaling"),
    FieldSchema::new("minCount"),
    FieldSchema::new("maxCount"),
    FieldSchema::new("mode").default(user_mode),
    FieldSchema::new("nodeLabels").map(),
    FieldSchema::new("nodeTaints").list(),
    FieldSchema::new("tags").map(),
    FieldSchema::new("availabilityZones").set().forces_replacement(),
    FieldSchema::new("orchestratorVersion").optional_computed(),
    FieldSchema::new("osType").forces_replacement().default(linux),
    FieldSchema::new("osSKU")
        .replace_if(os_sku_replaces)
        .optional_computed(),
    FieldSchema::new("osDiskSizeGB")
        .forces_replacement()
        .optional_computed(),
    FieldSchema::new("maxPods").forces_replacement().optional_computed(),
    FieldSchema::new("vnetSubnetID")
        .forces_replacement()
        .case_insensitive(),
    FieldSchema::new("scaleSetPriority")
        .forces_replacement()
        .default(regular_priority),
    FieldSchema::new("spotMaxPrice").forces_replacement(),
    FieldSchema::new("upgradeSettings")
        .block(UPGRADE_SETTINGS)
        .optional_computed(),
    FieldSchema::new("networkProfile").block(NODE_NETWORK_PROFILE),
    FieldSchema::new("nodeImageVersion").computed(),
    FieldSchema::new("powerState").computed(),
    FieldSchema::new("provisioningState").computed(),
];

pub static KUBERNETES_CLUSTER_NODE_POOL: ResourceSchema = ResourceSchema {
    type_name: "kubernetes_cluster_node_pool",
    id_template: IdTemplate::new(CONTAINER_SERVICE, &["managedClusters", "agentPools"]),
    write_mode: WriteMode::Put,
    fields: NODE_POOL_FIELDS,
    validate: Some(validate_node_pool),
    timeouts: Timeouts::minutes(60, 5, 60, 60),
};

const OS_PROFILE: &[FieldSchema] = &[
    FieldSchema::new("computerNamePrefix").forces_replacement(),
    FieldSchema::new("adminUsername").forces_replacement(),
    FieldSchema::new("adminPassword").write_only(),
    FieldSchema::new("linuxConfiguration"),
    FieldSchema::new("windowsConfiguration"),
];

const BASE_VM_PROFILE: &[FieldSchema] = &[
    FieldSchema::new("osProfile").block(OS_PROFILE),
    FieldSchema::new("storageProfile").forces_replacement(),
    FieldSchema::new("networkProfile"),
    FieldSchema::new("extensionProfile"),
];

const COMPUTE_PROFILE: &[FieldSchema] = &[
    FieldSchema::new("baseVirtualMachineProfile").block(BASE_VM_PROFILE),
    FieldSchema::new("computeApiVersion").optional_computed(),
    FieldSchema::new("platformFaultDomainCount")
        .forces_replacement()
        .optional_computed(),
];

const SPOT_PRIORITY_PROFILE: &[FieldSchema] = &[
    FieldSchema::new("capacity"),
    FieldSchema::new("minCapacity"),
    FieldSchema::new("maxPricePerVM").forces_replacement(),
    FieldSchema::new("evictionPolicy")
        .forces_replacement()
        .case_insensitive(),
    FieldSchema::new("allocationStrategy")
        .forces_replacement()
        .optional_computed(),
    FieldSchema::new("maintain").forces_replacement(),
];

const REGULAR_PRIORITY_PROFILE: &[FieldSchema] = &[
    FieldSchema::new("capacity"),
    FieldSchema::new("minCapacity"),
    FieldSchema::new("allocationStrategy")
        .forces_replacement()
        .optional_computed(),
];

const FLEET_FIELDS: &[FieldSchema] = &[
    FieldSchema::new("location").location(),
    FieldSchema::new("tags").map(),
    FieldSchema::new("zones").set().forces_replacement(),
    FieldSchema::new("identity").block(IDENTITY),
    FieldSchema::new("plan").forces_replacement(),
    FieldSchema::new("spotPriorityProfile").block(SPOT_PRIORITY_PROFILE),
    FieldSchema::new("regularPriorityProfile").block(REGULAR_PRIORITY_PROFILE),
    FieldSchema::new("vmSizesProfile").list().forces_replacement(),
    FieldSchema::new("vmAttributes").forces_replacement(),
    FieldSchema::new("additionalLocationsProfile").forces_replacement(),
    FieldSchema::new("computeProfile").block(COMPUTE_PROFILE),
    FieldSchema::new("timeCreated").computed(),
    FieldSchema::new("uniqueId").computed(),
    FieldSchema::new("provisioningState").computed(),
];

pub static COMPUTE_FLEET: ResourceSchema = ResourceSchema {
    type_name: "compute_fleet",
    id_template: IdTemplate::new("Microsoft.AzureFleet", &["fleets"]),
    write_mode: WriteMode::Put,
    fields: FLEET_FIELDS,
    validate: Some(validate_fleet),
    timeouts: Timeouts::minutes(30, 5, 30, 30),
};

const REGISTRY_SKU: &[FieldSchema] = &[
    FieldSchema::new("name").case_insensitive(),
    FieldSchema::new("tier").computed(),
];

const REGISTRY_FIELDS: &[FieldSchema] = &[
    FieldSchema::new("location").location(),
    FieldSchema::new("tags").map(),
    FieldSchema::new("sku").block(REGISTRY_SKU),
    FieldSchema::new("identity").block(IDENTITY),
    FieldSchema::new("adminUserEnabled").default(disabled),
    FieldSchema::new("publicNetworkAccess")
        .case_insensitive()
        .default(enabled_str),
    FieldSchema::new("zoneRedundancy")
        .forces_replacement()
        .default(disabled_str),
    FieldSchema::new("dataEndpointEnabled").default(disabled),
    FieldSchema::new("anonymousPullEnabled").default(disabled),
    FieldSchema::new("networkRuleBypassOptions")
        .case_insensitive()
        .default(azure_services),
    FieldSchema::new("networkRuleSet"),
    FieldSchema::new("loginServer").computed(),
    FieldSchema::new("creationDate").computed(),
    FieldSchema::new("dataEndpointHostNames").computed(),
    FieldSchema::new("provisioningState").computed(),
];

pub static CONTAINER_REGISTRY: ResourceSchema = ResourceSchema {
    type_name: "container_registry",
    id_template: IdTemplate::new("Microsoft.ContainerRegistry", &["registries"]),
    write_mode: WriteMode::Patch,
    fields: REGISTRY_FIELDS,
    validate: Some(validate_registry),
    timeouts: Timeouts::minutes(30, 5, 30, 30),
};

/// Every resource type, parents before children.
pub static ALL: [&ResourceSchema; 4] = [
    &KUBERNETES_CLUSTER,
    &KUBERNETES_CLUSTER_NODE_POOL,
    &COMPUTE_FLEET,
    &CONTAINER_REGISTRY,
];

/// Look up a resource type by its deployment-document name.
pub fn lookup(type_name: &str) -> Option<&'static ResourceSchema> {
    ALL.iter().copied().find(|s| s.type_name == type_name)
}

/// Look up the resource type an identifier belongs to.
pub fn for_id(id: &ResourceIdentifier) -> Option<&'static ResourceSchema> {
    let type_path = id.type_path();
    ALL.iter()
        .copied()
        .find(|s| s.id_template.to_string().eq_ignore_ascii_case(&type_path))
}

/// The resource type of the enclosing resource, if the type is nested.
pub fn parent_of(schema: &ResourceSchema) -> Option<&'static ResourceSchema> {
    let parent = schema.id_template.parent()?;
    ALL.iter().copied().find(|s| s.id_template == parent)
}

fn enabled() -> Value {
    json!(true)
}

fn disabled() -> Value {
    json!(false)
}

fn enabled_str() -> Value {
    json!("Enabled")
}

fn disabled_str() -> Value {
    json!("Disabled")
}

fn azure_services() -> Value {
    json!("AzureServices")
}

fn user_mode() -> Value {
    json!("User")
}

fn linux() -> Value {
    json!("Linux")
}

fn regular_priority() -> Value {
    json!("Regular")
}

/// Only switching between Ubuntu and Azure Linux can happen in place.
fn os_sku_replaces(old: Option<&Value>, new: Option<&Value>) -> bool {
    let in_place = |v: Option<&Value>| {
        matches!(
            v.and_then(Value::as_str),
            Some("Ubuntu") | Some("AzureLinux")
        )
    };
    old.is_some() && !(in_place(old) && in_place(new))
}

/// A drain timeout can be changed, but not removed once set.
fn drain_timeout_cleared(old: Option<&Value>, new: Option<&Value>) -> bool {
    let minutes = |v: Option<&Value>| v.and_then(Value::as_u64).unwrap_or(0);
    minutes(old) != 0 && minutes(new) == 0
}

fn integer(properties: &Properties, name: &str) -> Result<Option<i64>, String> {
    match properties.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("{} must be an integer", name)),
    }
}

fn validate_node_pool(p: &Properties) -> Result<(), String> {
    let auto_scaling = p
        .get("enableAutoScaling")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let min = integer(p, "minCount")?;
    let max = integer(p, "maxCount")?;
    if let Some(count) = integer(p, "nodeCount")? {
        if !(0..=1000).contains(&count) {
            return Err(format!("nodeCount must be between 0 and 1000, got {}", count));
        }
    }
    if auto_scaling {
        let max = max.ok_or("maxCount must be set when enableAutoScaling is true")?;
        let min = min.ok_or("minCount must be set when enableAutoScaling is true")?;
        if min > max {
            return Err(format!(
                "minCount ({}) must be less than or equal to maxCount ({})",
                min, max
            ));
        }
    } else if min.is_some() || max.is_some() {
        return Err(
            "minCount and maxCount must not be set when enableAutoScaling is false".to_string(),
        );
    }
    let spot = p.get("scaleSetPriority").and_then(Value::as_str) == Some("Spot");
    if !spot && p.get("spotMaxPrice").map_or(false, |v| !v.is_null()) {
        return Err("spotMaxPrice can only be set when scaleSetPriority is Spot".to_string());
    }
    Ok(())
}

fn validate_fleet(p: &Properties) -> Result<(), String> {
    let spot = p.get("spotPriorityProfile").and_then(Value::as_object);
    let regular = p.get("regularPriorityProfile").and_then(Value::as_object);
    if spot.is_none() && regular.is_none() {
        return Err(
            "at least one of spotPriorityProfile and regularPriorityProfile must be set"
                .to_string(),
        );
    }
    let mut total = 0;
    for (name, profile) in [
        ("spotPriorityProfile", spot),
        ("regularPriorityProfile", regular),
    ] {
        let Some(profile) = profile else { continue };
        let capacity = integer(profile, "capacity")
            .map_err(|e| format!("{}.{}", name, e))?
            .unwrap_or(0);
        if let Some(min) = integer(profile, "minCapacity").map_err(|e| format!("{}.{}", name, e))? {
            if min > capacity {
                return Err(format!(
                    "{}.minCapacity ({}) must be less than or equal to capacity ({})",
                    name, min, capacity
                ));
            }
        }
        total += capacity;
    }
    if total > 10000 {
        return Err(format!(
            "the sum of spot and regular capacity must not exceed 10000, got {}",
            total
        ));
    }
    Ok(())
}

fn validate_registry(p: &Properties) -> Result<(), String> {
    let premium = p
        .get("sku")
        .and_then(|s| s.get("name"))
        .and_then(Value::as_str)
        .is_some_and(|name| name.eq_ignore_ascii_case("Premium"));
    if !premium {
        if p.get("zoneRedundancy").and_then(Value::as_str) == Some("Enabled") {
            return Err("zoneRedundancy can only be enabled for Premium registries".to_string());
        }
        if p.get("dataEndpointEnabled").and_then(Value::as_bool) == Some(true) {
            return Err(
                "dataEndpointEnabled can only be enabled for Premium registries".to_string(),
            );
        }
    }
    Ok(())
}
