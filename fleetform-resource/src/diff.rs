//! The State Differ.
//!
//! Walks a (normalized) desired state and an observed state along the
//! resource's field schemas and produces a [`ReconciliationPlan`].
//!
//! Presence is significant: a field missing from the desired state is
//! removed (unless it is optional-computed), and a field set to `null` is
//! explicitly cleared. Both produce `Unset`; they differ only for
//! optional-computed fields, where a missing field adopts the remote's value.

use std::collections::BTreeSet;

use fleetform_core::{FieldPath, PlanAction, Properties, ReconciliationPlan};
use serde_json::Value;

use crate::schema::{FieldKind, FieldSchema, Mutability, ResourceSchema};

pub fn diff(
    schema: &ResourceSchema,
    desired: &Properties,
    observed: &Properties,
) -> ReconciliationPlan {
    let mut plan = ReconciliationPlan::default();
    diff_fields(
        schema.fields,
        desired,
        observed,
        &FieldPath::root(),
        false,
        &mut plan,
    );
    plan
}

fn present(v: Option<&Value>) -> Option<&Value> {
    v.filter(|v| !v.is_null())
}

fn diff_fields(
    fields: &[FieldSchema],
    desired: &Properties,
    observed: &Properties,
    path: &FieldPath,
    forced: bool,
    plan: &mut ReconciliationPlan,
) {
    for field in fields {
        if field.is_computed() || field.write_only {
            continue;
        }
        let path = path.child(field.name);
        let forced = forced || matches!(field.mutability, Mutability::ForcesReplacement);
        let old = present(observed.get(field.name));
        match desired.get(field.name) {
            None if field.optional_computed => {}
            None | Some(Value::Null) => {
                if !field.holds_nothing(old) {
                    let replace = forced || replace_if(field, old, None);
                    push(plan, path, replace, old, None);
                }
            }
            Some(new) => diff_value(field, new, old, path, forced, plan),
        }
    }
}

fn replace_if(field: &FieldSchema, old: Option<&Value>, new: Option<&Value>) -> bool {
    match field.mutability {
        Mutability::ReplaceIf(predicate) => predicate(old, new),
        _ => false,
    }
}

fn diff_value(
    field: &FieldSchema,
    new: &Value,
    old: Option<&Value>,
    path: FieldPath,
    forced: bool,
    plan: &mut ReconciliationPlan,
) {
    let replace = forced || replace_if(field, old, Some(new));
    match (field.kind, old, new) {
        (FieldKind::Block(children), Some(Value::Object(old)), Value::Object(new)) => {
            diff_fields(children, new, old, &path, replace, plan);
        }
        (FieldKind::Map { merge_only }, Some(Value::Object(old)), Value::Object(new)) => {
            let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            for key in keys {
                let o = present(old.get(key));
                match new.get(key) {
                    None if merge_only => {}
                    None | Some(Value::Null) => {
                        if o.is_some() {
                            push(plan, path.child(key), replace, o, None);
                        }
                    }
                    Some(n) => {
                        if o != Some(n) {
                            push(plan, path.child(key), replace, o, Some(n));
                        }
                    }
                }
            }
        }
        (_, old, new) => {
            if !equal(field, old, new) {
                push(plan, path, replace, old, Some(new));
            }
        }
    }
}

/// Whole-value comparison. An empty collection equals an absent one.
fn equal(field: &FieldSchema, old: Option<&Value>, new: &Value) -> bool {
    match old {
        Some(old) => field.same_value(old, new),
        None => field.holds_nothing(Some(new)),
    }
}

fn push(
    plan: &mut ReconciliationPlan,
    path: FieldPath,
    replace: bool,
    old: Option<&Value>,
    new: Option<&Value>,
) {
    let action = if replace {
        PlanAction::Replace {
            old: old.cloned(),
            new: new.cloned(),
        }
    } else {
        match new {
            Some(value) => PlanAction::Set {
                value: value.clone(),
            },
            None => PlanAction::Unset,
        }
    };
    plan.push(path, action);
}
