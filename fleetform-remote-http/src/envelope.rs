//! Moving properties in and out of the ARM resource envelope.
//!
//! The remote nests most properties under `properties`, next to a handful of
//! envelope properties. Desired and observed states keep them side by side.

use fleetform_core::{ObservedState, Properties};
use serde_json::Value;

/// The properties a tracked resource keeps in its envelope rather than under
/// `properties`.
pub const TRACKED_RESOURCE: &[&str] = &["location", "tags", "sku", "identity", "zones", "plan"];

/// Envelope properties the remote manages. Never sent, never observed.
const READ_ONLY: &[&str] = &["id", "name", "type", "etag", "systemData", "managedBy"];

/// Wrap a request body: the `envelope` properties at the top, the rest under
/// `properties`.
pub fn wrap(body: &Properties, envelope_keys: &[&str]) -> Value {
    let mut envelope = Properties::new();
    let mut properties = Properties::new();
    for (key, value) in body {
        if envelope_keys.contains(&key.as_str()) {
            envelope.insert(key.clone(), value.clone());
        } else {
            properties.insert(key.clone(), value.clone());
        }
    }
    if !properties.is_empty() {
        envelope.insert("properties".to_string(), Value::Object(properties));
    }
    Value::Object(envelope)
}

/// Flatten a response body into an observation. `etag` is the `ETag`
/// header, which takes precedence over the body's `etag`.
pub fn unwrap(body: Value, etag: Option<String>) -> Result<ObservedState, String> {
    let Value::Object(mut envelope) = body else {
        return Err("resource body is not a JSON object".to_string());
    };
    let etag = etag.or_else(|| match envelope.get("etag") {
        Some(Value::String(etag)) => Some(etag.clone()),
        _ => None,
    });
    let mut observed = match envelope.remove("properties") {
        Some(Value::Object(properties)) => properties,
        None | Some(Value::Null) => Properties::new(),
        Some(_) => return Err("resource properties are not a JSON object".to_string()),
    };
    for (key, value) in envelope {
        if !READ_ONLY.contains(&key.as_str()) {
            observed.insert(key, value);
        }
    }
    Ok(ObservedState {
        properties: observed,
        etag,
    })
}
