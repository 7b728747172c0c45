//! Request bodies for writes.
//!
//! All bodies are derived from one schema-directed merge patch (RFC 7386)
//! that turns the observed state into the desired one:
//!
//! - a PATCH sends the merge patch itself,
//! - a PUT applies the merge patch to the writable part of the observed
//!   state, so that fields the caller doesn't manage keep their remote
//!   values,
//! - a create sends the desired state with computed fields and nulls
//!   removed.
//!
//! Write-only fields are part of every patch, since the remote never
//! returns them and a full-body write without them would clear them.

use fleetform_core::{Properties, WriteMode};
use serde_json::Value;

use crate::schema::{FieldKind, FieldSchema, ResourceSchema};

/// The body for creating a resource.
pub fn create_body(schema: &ResourceSchema, desired: &Properties) -> Properties {
    strip_nulls(merge_patch(schema.fields, desired, None))
}

/// The body for updating a resource in place.
pub fn update_body(
    schema: &ResourceSchema,
    desired: &Properties,
    observed: &Properties,
) -> Properties {
    let patch = merge_patch(schema.fields, desired, Some(observed));
    match schema.write_mode {
        WriteMode::Patch => patch,
        WriteMode::Put => {
            let mut body = Value::Object(writable(schema.fields, observed));
            json_patch::merge(&mut body, &Value::Object(patch));
            match body {
                Value::Object(body) => strip_nulls(body),
                _ => Properties::new(),
            }
        }
    }
}

/// The merge patch that brings `observed` to `desired`. With no observed
/// state, this is the desired state itself.
pub fn merge_patch(
    fields: &[FieldSchema],
    desired: &Properties,
    observed: Option<&Properties>,
) -> Properties {
    let mut patch = Properties::new();
    for field in fields {
        if field.is_computed() {
            continue;
        }
        let old = observed
            .and_then(|o| o.get(field.name))
            .filter(|v| !v.is_null());
        let new = desired.get(field.name);
        if field.write_only {
            if let Some(new) = new.filter(|v| !v.is_null()) {
                patch.insert(field.name.to_string(), new.clone());
            }
            continue;
        }
        let value = match new {
            None if field.optional_computed => continue,
            None | Some(Value::Null) => {
                if field.holds_nothing(old) {
                    continue;
                }
                Value::Null
            }
            Some(new) => match (field.kind, old, new) {
                (FieldKind::Block(children), old, Value::Object(new)) => {
                    let old = old.and_then(Value::as_object);
                    let sub = merge_patch(children, new, old);
                    if sub.is_empty() && observed.is_some() {
                        continue;
                    }
                    Value::Object(sub)
                }
                (FieldKind::Map { merge_only }, Some(Value::Object(old)), Value::Object(new)) => {
                    let mut sub = Properties::new();
                    for (k, v) in new {
                        if old.get(k) != Some(v) && !(v.is_null() && !old.contains_key(k)) {
                            sub.insert(k.clone(), v.clone());
                        }
                    }
                    if !merge_only {
                        for k in old.keys().filter(|k| !new.contains_key(*k)) {
                            sub.insert(k.clone(), Value::Null);
                        }
                    }
                    if sub.is_empty() {
                        continue;
                    }
                    Value::Object(sub)
                }
                (_, Some(old), new) if field.same_value(old, new) => continue,
                (_, None, new) if observed.is_some() && field.holds_nothing(Some(new)) => continue,
                (_, old, new) => replacement(old, new),
            },
        };
        patch.insert(field.name.to_string(), value);
    }
    patch
}

/// A merge patch that replaces `old` with `new` wholesale, even when both
/// are objects.
fn replacement(old: Option<&Value>, new: &Value) -> Value {
    match (old, new) {
        (Some(Value::Object(old)), Value::Object(new)) => {
            let mut patch = new.clone();
            for k in old.keys().filter(|k| !new.contains_key(*k)) {
                patch.insert(k.clone(), Value::Null);
            }
            Value::Object(patch)
        }
        (_, new) => new.clone(),
    }
}

/// The observed state without computed fields. Properties the schema doesn't
/// know are kept.
pub fn writable(fields: &[FieldSchema], observed: &Properties) -> Properties {
    let mut out = Properties::new();
    for (k, v) in observed {
        match fields.iter().find(|f| f.name == k) {
            Some(field) if field.is_computed() => {}
            Some(FieldSchema {
                kind: FieldKind::Block(children),
                ..
            }) => {
                let v = match v {
                    Value::Object(block) => Value::Object(writable(children, block)),
                    v => v.clone(),
                };
                out.insert(k.clone(), v);
            }
            _ => {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    out
}

fn strip_nulls(properties: Properties) -> Properties {
    properties
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::Object(m) => (k, Value::Object(strip_nulls(m))),
            v => (k, v),
        })
        .collect()
}
