//! Static, per-field descriptions of how a resource type may be changed.
//!
//! The differ and the payload builder walk desired and observed properties
//! along these tables; nothing about a resource type is inferred from the
//! values themselves.

use std::{borrow::Cow, collections::BTreeSet, fmt, time::Duration};

use fleetform_core::{
    normalize_location, IdTemplate, Operation, Properties, ReconcileError, ResourceIdentifier,
    WriteMode,
};
use serde_json::Value;

/// Decides whether changing a field from `old` to `new` requires replacing
/// the resource. `None` means the field is absent.
pub type ReplacePredicate = fn(old: Option<&Value>, new: Option<&Value>) -> bool;

#[derive(Clone, Copy)]
pub enum Mutability {
    /// Can be changed in place.
    Mutable,
    /// Any change, including removal, requires delete-then-create.
    ForcesReplacement,
    /// Populated by the remote. Never sent, never diffed.
    ComputedOnly,
    /// Changes in place unless the predicate says otherwise.
    ReplaceIf(ReplacePredicate),
}

impl fmt::Debug for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutability::Mutable => f.write_str("Mutable"),
            Mutability::ForcesReplacement => f.write_str("ForcesReplacement"),
            Mutability::ComputedOnly => f.write_str("ComputedOnly"),
            Mutability::ReplaceIf(_) => f.write_str("ReplaceIf(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Compared as a whole.
    Scalar,
    /// An array whose order is significant.
    List,
    /// An array whose order is not significant.
    Set,
    /// String-keyed entries, compared per key. With `merge_only`, keys
    /// missing from the desired state are left alone instead of removed.
    Map { merge_only: bool },
    /// A nested object with its own field schemas.
    Block(&'static [FieldSchema]),
}

/// How string values of a field are compared. The remote stores some values
/// in its own spelling, and reading them back must not look like a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Exact,
    /// Enumerations and resource identifiers.
    CaseInsensitive,
    /// Regions, e.g. `West Europe` is `westeurope`.
    Location,
}

impl Comparison {
    fn canonical(self, value: &str) -> String {
        match self {
            Comparison::Exact => value.to_string(),
            Comparison::CaseInsensitive => value.to_lowercase(),
            Comparison::Location => normalize_location(value),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSchema {
    /// The remote JSON property name.
    pub name: &'static str,
    pub mutability: Mutability,
    pub kind: FieldKind,
    /// When absent from the desired state, whatever the remote chose is kept.
    pub optional_computed: bool,
    /// Sent on writes, never returned by reads.
    pub write_only: bool,
    pub default: Option<fn() -> Value>,
    pub comparison: Comparison,
}

impl FieldSchema {
    pub const fn new(name: &'static str) -> Self {
        FieldSchema {
            name,
            mutability: Mutability::Mutable,
            kind: FieldKind::Scalar,
            optional_computed: false,
            write_only: false,
            default: None,
            comparison: Comparison::Exact,
        }
    }

    pub const fn forces_replacement(self) -> Self {
        FieldSchema {
            mutability: Mutability::ForcesReplacement,
            ..self
        }
    }

    pub const fn computed(self) -> Self {
        FieldSchema {
            mutability: Mutability::ComputedOnly,
            ..self
        }
    }

    pub const fn replace_if(self, predicate: ReplacePredicate) -> Self {
        FieldSchema {
            mutability: Mutability::ReplaceIf(predicate),
            ..self
        }
    }

    pub const fn list(self) -> Self {
        FieldSchema {
            kind: FieldKind::List,
            ..self
        }
    }

    pub const fn set(self) -> Self {
        FieldSchema {
            kind: FieldKind::Set,
            ..self
        }
    }

    pub const fn map(self) -> Self {
        FieldSchema {
            kind: FieldKind::Map { merge_only: false },
            ..self
        }
    }

    pub const fn merge_only_map(self) -> Self {
        FieldSchema {
            kind: FieldKind::Map { merge_only: true },
            ..self
        }
    }

    pub const fn block(self, fields: &'static [FieldSchema]) -> Self {
        FieldSchema {
            kind: FieldKind::Block(fields),
            ..self
        }
    }

    pub const fn optional_computed(self) -> Self {
        FieldSchema {
            optional_computed: true,
            ..self
        }
    }

    pub const fn write_only(self) -> Self {
        FieldSchema {
            write_only: true,
            ..self
        }
    }

    pub const fn default(self, default: fn() -> Value) -> Self {
        FieldSchema {
            default: Some(default),
            ..self
        }
    }

    /// A region. Changing it replaces the resource, respelling it doesn't.
    pub const fn location(self) -> Self {
        FieldSchema {
            mutability: Mutability::ForcesReplacement,
            comparison: Comparison::Location,
            ..self
        }
    }

    pub const fn case_insensitive(self) -> Self {
        FieldSchema {
            comparison: Comparison::CaseInsensitive,
            ..self
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self.mutability, Mutability::ComputedOnly)
    }

    /// `value` with its strings (also those directly inside an array) in the
    /// remote's spelling.
    pub fn canonical<'a>(&self, value: &'a Value) -> Cow<'a, Value> {
        if self.comparison == Comparison::Exact {
            return Cow::Borrowed(value);
        }
        let respell = |v: &Value| match v {
            Value::String(s) => Value::String(self.comparison.canonical(s)),
            v => v.clone(),
        };
        match value {
            Value::Array(items) => Cow::Owned(Value::Array(items.iter().map(respell).collect())),
            v => Cow::Owned(respell(v)),
        }
    }

    /// Whether `old` and `new` are the same value of this field, honoring
    /// its comparison and, for sets, ignoring order.
    pub fn same_value(&self, old: &Value, new: &Value) -> bool {
        let (old, new) = (self.canonical(old), self.canonical(new));
        match (self.kind, &*old, &*new) {
            (FieldKind::Set, Value::Array(old), Value::Array(new)) => same_elements(old, new),
            (_, old, new) => old == new,
        }
    }

    /// Whether the field holds nothing: absent, `null`, or an empty
    /// collection, which the remote reports for collections nobody set.
    pub fn holds_nothing(&self, value: Option<&Value>) -> bool {
        match (self.kind, value) {
            (_, None | Some(Value::Null)) => true,
            (FieldKind::Block(_) | FieldKind::Map { .. }, Some(Value::Object(m))) => m.is_empty(),
            (FieldKind::List | FieldKind::Set, Some(Value::Array(a))) => a.is_empty(),
            _ => false,
        }
    }
}

fn same_elements(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<String> = a.iter().map(Value::to_string).collect();
    let mut b: Vec<String> = b.iter().map(Value::to_string).collect();
    a.sort();
    b.sort();
    a == b
}

/// Per-operation timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub create: Duration,
    pub read: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Timeouts {
    pub const fn minutes(create: u64, read: u64, update: u64, delete: u64) -> Self {
        Timeouts {
            create: Duration::from_secs(create * 60),
            read: Duration::from_secs(read * 60),
            update: Duration::from_secs(update * 60),
            delete: Duration::from_secs(delete * 60),
        }
    }

    pub fn for_operation(&self, operation: Operation) -> Duration {
        match operation {
            Operation::Create | Operation::Replace => self.create,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
            Operation::Read | Operation::Import | Operation::Exists | Operation::Plan => {
                self.read
            }
        }
    }
}

/// Checks that need more than one field, e.g. `minCount <= maxCount`.
/// Runs on the normalized desired state.
pub type Validator = fn(&Properties) -> Result<(), String>;

#[derive(Clone, Copy)]
pub struct ResourceSchema {
    /// The name used in deployment documents, e.g. `kubernetes_cluster_node_pool`.
    pub type_name: &'static str,
    pub id_template: IdTemplate,
    /// How the remote applies updates.
    pub write_mode: WriteMode,
    pub fields: &'static [FieldSchema],
    pub validate: Option<Validator>,
    pub timeouts: Timeouts,
}

impl fmt::Debug for ResourceSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSchema")
            .field("type_name", &self.type_name)
            .field("id_template", &self.id_template)
            .field("write_mode", &self.write_mode)
            .finish_non_exhaustive()
    }
}

impl ResourceSchema {
    pub fn field(&self, name: &str) -> Option<&'static FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Prepare a desired state for diffing and writing.
    ///
    /// Rejects properties the schema does not know, silently drops computed
    /// ones, fills in defaults and runs the type's validator. No remote call
    /// is needed to decide any of this.
    pub fn normalize(
        &self,
        id: &ResourceIdentifier,
        operation: Operation,
        desired: &Properties,
    ) -> Result<Properties, ReconcileError> {
        let normalized = normalize_fields(self.fields, desired, "")
            .map_err(|message| ReconcileError::invalid_request(id, operation, message))?;
        if let Some(validate) = self.validate {
            validate(&normalized).map_err(|message| {
                ReconcileError::invalid_request(id, operation, message)
            })?;
        }
        Ok(normalized)
    }
}

fn normalize_fields(
    fields: &'static [FieldSchema],
    desired: &Properties,
    prefix: &str,
) -> Result<Properties, String> {
    let known: BTreeSet<&str> = fields.iter().map(|f| f.name).collect();
    if let Some(unknown) = desired.keys().find(|k| !known.contains(k.as_str())) {
        return Err(format!("unknown property {}{}", prefix, unknown));
    }
    let mut out = Properties::new();
    for field in fields {
        if field.is_computed() {
            continue;
        }
        let value = match (desired.get(field.name), field.default) {
            (Some(v), _) => v.clone(),
            (None, Some(default)) => default(),
            (None, None) => continue,
        };
        let value = match (field.kind, value) {
            (FieldKind::Block(children), Value::Object(block)) => Value::Object(normalize_fields(
                children,
                &block,
                &format!("{}{}.", prefix, field.name),
            )?),
            (FieldKind::Block(_), v) if !v.is_null() => {
                return Err(format!("{}{} must be an object", prefix, field.name))
            }
            (FieldKind::Map { .. }, v) if !(v.is_object() || v.is_null()) => {
                return Err(format!("{}{} must be an object", prefix, field.name))
            }
            (FieldKind::List | FieldKind::Set, v) if !(v.is_array() || v.is_null()) => {
                return Err(format!("{}{} must be an array", prefix, field.name))
            }
            (_, v) => v,
        };
        out.insert(field.name.to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SETTINGS: [FieldSchema; 2] = [
        FieldSchema::new("maxSurge"),
        FieldSchema::new("generation").computed(),
    ];

    const FIELDS: [FieldSchema; 5] = [
        FieldSchema::new("vmSize").forces_replacement(),
        FieldSchema::new("mode").default(|| json!("User")),
        FieldSchema::new("nodeLabels").map(),
        FieldSchema::new("upgradeSettings").block(&SETTINGS),
        FieldSchema::new("provisioningState").computed(),
    ];

    const SCHEMA: ResourceSchema = ResourceSchema {
        type_name: "test_pool",
        id_template: IdTemplate::new("Microsoft.ContainerService", &["managedClusters", "agentPools"]),
        write_mode: WriteMode::Put,
        fields: &FIELDS,
        validate: None,
        timeouts: Timeouts::minutes(60, 5, 60, 60),
    };

    fn id() -> ResourceIdentifier {
        SCHEMA.id_template.id("s", "g", &["c", "p"]).unwrap()
    }

    fn props(v: Value) -> Properties {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn normalize_drops_computed_and_applies_defaults() {
        let desired = props(json!({
            "vmSize": "A",
            "provisioningState": "Succeeded",
            "upgradeSettings": {"maxSurge": "10%", "generation": 3}
        }));
        let normalized = SCHEMA.normalize(&id(), Operation::Create, &desired).unwrap();
        assert_eq!(
            Value::Object(normalized),
            json!({
                "vmSize": "A",
                "mode": "User",
                "upgradeSettings": {"maxSurge": "10%"}
            })
        );
    }

    #[test]
    fn normalize_keeps_explicit_nulls() {
        let desired = props(json!({"vmSize": "A", "nodeLabels": null, "mode": null}));
        let normalized = SCHEMA.normalize(&id(), Operation::Update, &desired).unwrap();
        assert_eq!(normalized["nodeLabels"], Value::Null);
        assert_eq!(normalized["mode"], Value::Null);
    }

    #[test]
    fn normalize_rejects_unknown_properties() {
        let err = SCHEMA
            .normalize(&id(), Operation::Create, &props(json!({"vmSzie": "A"})))
            .unwrap_err();
        match err {
            ReconcileError::InvalidRequest { message, .. } => {
                assert_eq!(message, "unknown property vmSzie")
            }
            e => panic!("unexpected {:?}", e),
        }
        let err = SCHEMA
            .normalize(
                &id(),
                Operation::Create,
                &props(json!({"upgradeSettings": {"maxSurge": "1", "drain": 1}})),
            )
            .unwrap_err();
        assert!(err.to_string().contains("upgradeSettings.drain"), "{}", err);
    }

    #[test]
    fn normalize_checks_shapes() {
        assert!(SCHEMA
            .normalize(&id(), Operation::Create, &props(json!({"nodeLabels": ["a"]})))
            .is_err());
        assert!(SCHEMA
            .normalize(&id(), Operation::Create, &props(json!({"upgradeSettings": 1})))
            .is_err());
    }

    #[test]
    fn locations_and_enumerations_compare_in_the_remote_spelling() {
        let location = FieldSchema::new("location").location();
        assert!(location.same_value(&json!("westeurope"), &json!("West Europe")));
        assert!(!location.same_value(&json!("westeurope"), &json!("North Europe")));
        assert!(matches!(location.mutability, Mutability::ForcesReplacement));

        let zones = FieldSchema::new("zones").set().case_insensitive();
        assert!(zones.same_value(&json!(["A", "b"]), &json!(["B", "a"])));

        let exact = FieldSchema::new("dnsPrefix");
        assert!(!exact.same_value(&json!("aks1"), &json!("AKS1")));
        assert!(matches!(exact.canonical(&json!("AKS1")), Cow::Borrowed(_)));
    }

    #[test]
    fn empty_collections_hold_nothing() {
        let labels = FieldSchema::new("nodeLabels").map();
        assert!(labels.holds_nothing(None));
        assert!(labels.holds_nothing(Some(&Value::Null)));
        assert!(labels.holds_nothing(Some(&json!({}))));
        assert!(!labels.holds_nothing(Some(&json!({"a": "b"}))));
        assert!(FieldSchema::new("taints").list().holds_nothing(Some(&json!([]))));
        assert!(!FieldSchema::new("count").holds_nothing(Some(&json!(0))));
        assert!(!FieldSchema::new("name").holds_nothing(Some(&json!(""))));
    }

    #[test]
    fn timeouts_per_operation() {
        let t = Timeouts::minutes(60, 5, 30, 45);
        assert_eq!(t.for_operation(Operation::Replace), Duration::from_secs(3600));
        assert_eq!(t.for_operation(Operation::Exists), Duration::from_secs(300));
        assert_eq!(t.for_operation(Operation::Update), Duration::from_secs(1800));
        assert_eq!(t.for_operation(Operation::Delete), Duration::from_secs(2700));
    }
}
