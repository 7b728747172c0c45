//! [`RemoteApi`] over HTTP, for ARM-style control planes.
//!
//! - Resources live at `{endpoint}{resource id}?api-version={version}`.
//! - Writes are `PUT` or `PATCH` of a JSON resource envelope, with `If-Match`
//!   when the caller knows the ETag.
//! - Long-running operations are announced with an `Azure-AsyncOperation`
//!   or `Location` header, or by a non-terminal `provisioningState`, and
//!   polled with the suggested `Retry-After`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleetform_core::{
    ObservedState, Operation, OperationHandle, OperationStatus, RemoteApi, RemoteError,
    ResourceIdentifier, Submitted, WriteMode, WriteRequest,
};
use reqwest::{
    header::{HeaderMap, ACCEPT, ETAG, IF_MATCH, LOCATION},
    Method, RequestBuilder, Response, StatusCode,
};
use serde_json::Value;
use tracing::{debug, trace};

pub mod envelope;
pub mod operation;

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

/// How to talk to one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceType {
    /// E.g. `Microsoft.ContainerService/managedClusters/agentPools`.
    pub type_path: &'static str,
    pub api_version: &'static str,
    /// Properties that go into the envelope instead of `properties`.
    pub envelope: &'static [&'static str],
}

pub const RESOURCE_TYPES: &[ResourceType] = &[
    ResourceType {
        type_path: "Microsoft.ContainerService/managedClusters",
        api_version: "2024-09-01",
        envelope: envelope::TRACKED_RESOURCE,
    },
    ResourceType {
        type_path: "Microsoft.ContainerService/managedClusters/agentPools",
        api_version: "2024-09-01",
        envelope: &[],
    },
    ResourceType {
        type_path: "Microsoft.AzureFleet/fleets",
        api_version: "2024-11-01",
        envelope: envelope::TRACKED_RESOURCE,
    },
    ResourceType {
        type_path: "Microsoft.ContainerRegistry/registries",
        api_version: "2023-06-01-preview",
        envelope: envelope::TRACKED_RESOURCE,
    },
];

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub endpoint: String,
    /// Sent as a bearer token. Obtaining it is the caller's business.
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub resource_types: Vec<ResourceType>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: None,
            request_timeout: Duration::from_secs(60),
            resource_types: RESOURCE_TYPES.to_vec(),
        }
    }
}

impl HttpConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpConfig {
            endpoint: endpoint.into(),
            ..HttpConfig::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

pub struct HttpControlPlane {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    resource_types: Vec<ResourceType>,
}

impl HttpControlPlane {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Could not build the HTTP client")?;
        Ok(HttpControlPlane {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token,
            resource_types: config.resource_types,
        })
    }

    fn resource_type(&self, id: &ResourceIdentifier) -> Result<&ResourceType, RemoteError> {
        let type_path = id.type_path();
        self.resource_types
            .iter()
            .find(|t| t.type_path.eq_ignore_ascii_case(&type_path))
            .ok_or_else(|| RemoteError::Client {
                status: 400,
                body: format!("no API version known for resource type {}", type_path),
            })
    }

    fn url(&self, id: &ResourceIdentifier, resource_type: &ResourceType) -> String {
        format!(
            "{}{}?api-version={}",
            self.endpoint, id, resource_type.api_version
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        builder: RequestBuilder,
    ) -> Result<Response, RemoteError> {
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(format!("{} {}: {}", method, url, e)))?;
        debug!(method = %method, url = %url, status = %response.status(), "remote call");
        Ok(response)
    }

    /// Where to poll the operation a response announced, if any.
    fn operation_url(response: &Response) -> Option<String> {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        header(operation::AZURE_ASYNC_OPERATION).or_else(|| {
            if response.status() == StatusCode::ACCEPTED {
                header(LOCATION.as_str())
            } else {
                None
            }
        })
    }
}

fn etag(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// The response body as JSON; an empty body is `null`.
async fn json(response: Response) -> Result<Value, RemoteError> {
    let text = response
        .text()
        .await
        .map_err(|e| RemoteError::Transport(e.to_string()))?;
    trace!(body = %text, "response body");
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Classify an unsuccessful response.
async fn error_for(response: Response) -> RemoteError {
    let status = response.status().as_u16();
    let retry_after = operation::retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    match status {
        429 => RemoteError::Throttled { retry_after },
        412 => RemoteError::PreconditionFailed { body },
        500..=599 => RemoteError::Server { status, body },
        _ => RemoteError::Client { status, body },
    }
}

fn observed(body: Value, etag: Option<String>) -> Result<ObservedState, RemoteError> {
    envelope::unwrap(body, etag).map_err(RemoteError::Decode)
}

#[async_trait]
impl RemoteApi for HttpControlPlane {
    async fn get(&self, id: &ResourceIdentifier) -> Result<Option<ObservedState>, RemoteError> {
        let url = self.url(id, self.resource_type(id)?);
        let response = self
            .send(Method::GET, &url, self.request(Method::GET, &url))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(error_for(response).await);
        }
        let etag = etag(response.headers());
        observed(json(response).await?, etag).map(Some)
    }

    async fn create_or_update(
        &self,
        id: &ResourceIdentifier,
        request: &WriteRequest,
    ) -> Result<Submitted<ObservedState>, RemoteError> {
        let resource_type = self.resource_type(id)?;
        let url = self.url(id, resource_type);
        let method = match request.mode {
            WriteMode::Put => Method::PUT,
            WriteMode::Patch => Method::PATCH,
        };
        let mut builder = self
            .request(method.clone(), &url)
            .json(&envelope::wrap(&request.body, resource_type.envelope));
        if let Some(etag) = &request.if_match {
            builder = builder.header(IF_MATCH, etag);
        }
        let response = self.send(method, &url, builder).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(error_for(response).await);
        }
        let operation = if status == StatusCode::CREATED {
            Operation::Create
        } else {
            Operation::Update
        };
        let retry_after = operation::retry_after(response.headers());
        let handle = |status_url| OperationHandle {
            id: id.clone(),
            operation,
            status_url,
            retry_after,
        };
        if let Some(status_url) = Self::operation_url(&response) {
            return Ok(Submitted::Accepted(handle(status_url)));
        }
        let etag = etag(response.headers());
        let body = json(response).await?;
        if operation::in_progress(&body) {
            // No operation to poll; the resource reports its own progress.
            return Ok(Submitted::Accepted(handle(url)));
        }
        if body.is_null() {
            return Err(RemoteError::Decode(format!(
                "{} returned {} without a body or an operation",
                id, status
            )));
        }
        observed(body, etag).map(Submitted::Done)
    }

    async fn delete(&self, id: &ResourceIdentifier) -> Result<Submitted<()>, RemoteError> {
        let url = self.url(id, self.resource_type(id)?);
        let response = self
            .send(Method::DELETE, &url, self.request(Method::DELETE, &url))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Submitted::Done(()));
        }
        if !status.is_success() {
            return Err(error_for(response).await);
        }
        match Self::operation_url(&response) {
            Some(status_url) => Ok(Submitted::Accepted(OperationHandle {
                id: id.clone(),
                operation: Operation::Delete,
                status_url,
                retry_after: operation::retry_after(response.headers()),
            })),
            None => Ok(Submitted::Done(())),
        }
    }

    async fn poll_operation(
        &self,
        handle: &OperationHandle,
    ) -> Result<OperationStatus, RemoteError> {
        let url = &handle.status_url;
        let response = self
            .send(Method::GET, url, self.request(Method::GET, url))
            .await?;
        let status = response.status();
        let retry_after = operation::retry_after(response.headers());
        if status == StatusCode::ACCEPTED {
            return Ok(OperationStatus::Running { retry_after });
        }
        if status == StatusCode::NOT_FOUND && handle.operation == Operation::Delete {
            // Polling the resource itself during a delete.
            return Ok(OperationStatus::Succeeded(None));
        }
        if !status.is_success() {
            return Err(error_for(response).await);
        }
        operation::status(json(response).await?, retry_after).map_err(RemoteError::Decode)
    }
}
