//! Long-running operation status, as reported by an `Azure-AsyncOperation`
//! status document or by the resource's own `provisioningState`.

use std::time::Duration;

use fleetform_core::{ObservedState, OperationStatus};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use serde_json::Value;

use crate::envelope;

pub const AZURE_ASYNC_OPERATION: &str = "azure-asyncoperation";

/// The status document behind an `Azure-AsyncOperation` URL.
#[derive(Debug, Deserialize)]
struct StatusDocument {
    status: String,
    #[serde(default)]
    error: Option<Value>,
}

enum Terminal {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

fn classify(status: &str) -> Terminal {
    match status.to_ascii_lowercase().as_str() {
        "succeeded" => Terminal::Succeeded,
        "failed" => Terminal::Failed,
        "canceled" | "cancelled" => Terminal::Canceled,
        // InProgress, Accepted, Creating, Updating, Deleting, ...
        _ => Terminal::Running,
    }
}

/// Seconds only; HTTP dates are not used by the control plane.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// The provisioning state of a resource body, if it is still transitioning.
pub fn in_progress(body: &Value) -> bool {
    body.pointer("/properties/provisioningState")
        .and_then(Value::as_str)
        .map_or(false, |s| matches!(classify(s), Terminal::Running))
}

/// Interpret the body of a successful poll.
pub fn status(body: Value, retry_after: Option<Duration>) -> Result<OperationStatus, String> {
    if body.is_null() {
        return Ok(OperationStatus::Succeeded(None));
    }
    if body.get("status").is_some() {
        let document: StatusDocument =
            serde_json::from_value(body).map_err(|e| format!("invalid operation status: {}", e))?;
        let error = || {
            document
                .error
                .as_ref()
                .map_or_else(|| document.status.clone(), Value::to_string)
        };
        return Ok(match classify(&document.status) {
            Terminal::Running => OperationStatus::Running { retry_after },
            Terminal::Succeeded => OperationStatus::Succeeded(None),
            Terminal::Failed => OperationStatus::Failed(error()),
            Terminal::Canceled => OperationStatus::Canceled(error()),
        });
    }
    // A resource body, from polling the resource itself.
    let state = body
        .pointer("/properties/provisioningState")
        .and_then(Value::as_str)
        .map(classify);
    match state {
        Some(Terminal::Running) => Ok(OperationStatus::Running { retry_after }),
        Some(Terminal::Failed) => Ok(OperationStatus::Failed(body.to_string())),
        Some(Terminal::Canceled) => Ok(OperationStatus::Canceled(body.to_string())),
        Some(Terminal::Succeeded) | None => {
            let observed: Option<ObservedState> = match body.get("properties") {
                Some(_) => Some(envelope::unwrap(body, None)?),
                None => None,
            };
            Ok(OperationStatus::Succeeded(observed))
        }
    }
}
