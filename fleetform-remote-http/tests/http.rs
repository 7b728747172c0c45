//! The HTTP facade against a mock control plane.

use std::time::Duration;

use fleetform_core::{
    Operation, OperationHandle, OperationStatus, RemoteApi, RemoteError, ResourceIdentifier,
    Submitted, WriteMode, WriteRequest,
};
use fleetform_remote_http::{HttpConfig, HttpControlPlane};
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REGISTRY: &str =
    "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/rg/providers/Microsoft.ContainerRegistry/registries/acr1";
const POOL: &str = "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters/aks1/agentPools/pool1";

fn id(raw: &str) -> ResourceIdentifier {
    raw.parse().unwrap()
}

fn plane(server: &MockServer) -> HttpControlPlane {
    HttpControlPlane::new(HttpConfig::new(server.uri()).with_token("t0ken")).unwrap()
}

fn registry_body() -> Value {
    json!({
        "id": REGISTRY,
        "name": "acr1",
        "type": "Microsoft.ContainerRegistry/registries",
        "location": "westeurope",
        "sku": {"name": "Basic", "tier": "Basic"},
        "properties": {
            "loginServer": "acr1.azurecr.io",
            "adminUserEnabled": false,
            "provisioningState": "Succeeded"
        }
    })
}

fn write(mode: WriteMode, body: Value, if_match: Option<&str>) -> WriteRequest {
    WriteRequest {
        mode,
        body: body.as_object().unwrap().clone(),
        if_match: if_match.map(str::to_string),
    }
}

#[tokio::test]
async fn get_flattens_the_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(REGISTRY))
        .and(query_param("api-version", "2023-06-01-preview"))
        .and(header("authorization", "Bearer t0ken"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "W/\"1\"")
                .set_body_json(registry_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let observed = plane(&server).get(&id(REGISTRY)).await.unwrap().unwrap();

    assert_eq!(observed.etag.as_deref(), Some("W/\"1\""));
    assert_eq!(
        Value::Object(observed.properties),
        json!({
            "location": "westeurope",
            "sku": {"name": "Basic", "tier": "Basic"},
            "loginServer": "acr1.azurecr.io",
            "adminUserEnabled": false,
            "provisioningState": "Succeeded"
        })
    );
}

#[tokio::test]
async fn get_of_a_missing_resource_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(REGISTRY))
        .respond_with(ResponseTemplate::new(404).set_body_json(
            json!({"error": {"code": "ResourceNotFound", "message": "not found"}}),
        ))
        .mount(&server)
        .await;

    assert_eq!(plane(&server).get(&id(REGISTRY)).await.unwrap(), None);
}

#[tokio::test]
async fn put_with_async_operation() {
    let server = MockServer::start().await;
    let status_url = format!("{}/operations/op1?api-version=2024-09-01", server.uri());
    Mock::given(method("PUT"))
        .and(path(POOL))
        .and(query_param("api-version", "2024-09-01"))
        .and(header("if-match", "W/\"7\""))
        .and(body_json(json!({
            "properties": {"vmSize": "Standard_DS2_v2", "count": 3, "tags": {"env": "test"}}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Azure-AsyncOperation", status_url.as_str())
                .insert_header("Retry-After", "10")
                .set_body_json(json!({"properties": {"provisioningState": "Updating"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let submitted = plane(&server)
        .create_or_update(
            &id(POOL),
            &write(
                WriteMode::Put,
                json!({"vmSize": "Standard_DS2_v2", "count": 3, "tags": {"env": "test"}}),
                Some("W/\"7\""),
            ),
        )
        .await
        .unwrap();

    assert_eq!(
        submitted,
        Submitted::Accepted(OperationHandle {
            id: id(POOL),
            operation: Operation::Update,
            status_url,
            retry_after: Some(Duration::from_secs(10)),
        })
    );
}

#[tokio::test]
async fn synchronous_patch() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(REGISTRY))
        .and(body_json(json!({
            "sku": {"name": "Standard"},
            "tags": {"owner": null}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "W/\"2\"")
                .set_body_json(registry_body()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let submitted = plane(&server)
        .create_or_update(
            &id(REGISTRY),
            &write(
                WriteMode::Patch,
                json!({"sku": {"name": "Standard"}, "tags": {"owner": null}}),
                None,
            ),
        )
        .await
        .unwrap();

    match submitted {
        Submitted::Done(observed) => {
            assert_eq!(observed.etag.as_deref(), Some("W/\"2\""));
            assert_eq!(observed.properties["loginServer"], json!("acr1.azurecr.io"));
        }
        s => panic!("unexpected response: {:?}", s),
    }
}

#[tokio::test]
async fn provisioning_resources_are_polled_at_their_own_url() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(REGISTRY))
        .respond_with(ResponseTemplate::new(201).set_body_json(
            json!({"location": "westeurope", "properties": {"provisioningState": "Creating"}}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(REGISTRY))
        .respond_with(ResponseTemplate::new(200).set_body_json(registry_body()))
        .mount(&server)
        .await;

    let plane = plane(&server);
    let submitted = plane
        .create_or_update(
            &id(REGISTRY),
            &write(WriteMode::Put, json!({"location": "westeurope"}), None),
        )
        .await
        .unwrap();

    let handle = match submitted {
        Submitted::Accepted(handle) => handle,
        s => panic!("unexpected response: {:?}", s),
    };
    assert_eq!(handle.operation, Operation::Create);
    assert!(handle.status_url.ends_with("?api-version=2023-06-01-preview"));
    match plane.poll_operation(&handle).await.unwrap() {
        OperationStatus::Succeeded(Some(observed)) => {
            assert_eq!(observed.properties["provisioningState"], json!("Succeeded"));
        }
        s => panic!("unexpected status: {:?}", s),
    }
}

#[tokio::test]
async fn operation_status_until_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/operations/op1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Retry-After", "2")
                .set_body_json(json!({"status": "InProgress"})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Failed",
            "error": {"code": "QuotaExceeded", "message": "Operation results in exceeding quota limits of Core."}
        })))
        .mount(&server)
        .await;

    let plane = plane(&server);
    let handle = OperationHandle {
        id: id(POOL),
        operation: Operation::Create,
        status_url: format!("{}/operations/op1", server.uri()),
        retry_after: None,
    };

    assert_eq!(
        plane.poll_operation(&handle).await.unwrap(),
        OperationStatus::Running {
            retry_after: Some(Duration::from_secs(2))
        }
    );
    match plane.poll_operation(&handle).await.unwrap() {
        OperationStatus::Failed(body) => assert!(body.contains("QuotaExceeded")),
        s => panic!("unexpected status: {:?}", s),
    }
}

#[tokio::test]
async fn delete_with_location_polling() {
    let server = MockServer::start().await;
    let location = format!("{}/operationResults/op2", server.uri());
    Mock::given(method("DELETE"))
        .and(path(REGISTRY))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", location.as_str())
                .insert_header("Retry-After", "1"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operationResults/op2"))
        .respond_with(ResponseTemplate::new(202))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operationResults/op2"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let plane = plane(&server);
    let handle = match plane.delete(&id(REGISTRY)).await.unwrap() {
        Submitted::Accepted(handle) => handle,
        s => panic!("unexpected response: {:?}", s),
    };
    assert_eq!(handle.status_url, location);
    assert_eq!(handle.operation, Operation::Delete);
    assert!(matches!(
        plane.poll_operation(&handle).await.unwrap(),
        OperationStatus::Running { .. }
    ));
    assert_eq!(
        plane.poll_operation(&handle).await.unwrap(),
        OperationStatus::Succeeded(None)
    );
}

#[tokio::test]
async fn delete_of_a_missing_resource_is_done() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(REGISTRY))
        .respond_with(ResponseTemplate::new(204))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(REGISTRY))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let plane = plane(&server);
    assert_eq!(plane.delete(&id(REGISTRY)).await.unwrap(), Submitted::Done(()));
    assert_eq!(plane.delete(&id(REGISTRY)).await.unwrap(), Submitted::Done(()));
}

#[tokio::test]
async fn error_statuses_are_classified() {
    let server = MockServer::start().await;
    let cases = [
        (
            ResponseTemplate::new(429).insert_header("Retry-After", "7"),
            RemoteError::Throttled {
                retry_after: Some(Duration::from_secs(7)),
            },
        ),
        (
            ResponseTemplate::new(412).set_body_string("stale"),
            RemoteError::PreconditionFailed {
                body: "stale".to_string(),
            },
        ),
        (
            ResponseTemplate::new(503).set_body_string("busy"),
            RemoteError::Server {
                status: 503,
                body: "busy".to_string(),
            },
        ),
        (
            ResponseTemplate::new(400).set_body_string("InvalidParameter"),
            RemoteError::Client {
                status: 400,
                body: "InvalidParameter".to_string(),
            },
        ),
    ];
    let plane = plane(&server);
    for (response, expected) in cases {
        server.reset().await;
        Mock::given(method("GET"))
            .and(path(REGISTRY))
            .respond_with(response)
            .mount(&server)
            .await;
        let err = plane.get(&id(REGISTRY)).await.unwrap_err();
        assert_eq!(err, expected);
    }
}

#[tokio::test]
async fn unreachable_endpoints_are_transport_errors() {
    let plane = HttpControlPlane::new(HttpConfig::new("http://127.0.0.1:1")).unwrap();
    let err = plane.get(&id(REGISTRY)).await.unwrap_err();
    assert!(matches!(err, RemoteError::Transport(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn malformed_bodies_are_decode_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(REGISTRY))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = plane(&server).get(&id(REGISTRY)).await.unwrap_err();
    assert!(matches!(err, RemoteError::Decode(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn unknown_resource_types_are_rejected_locally() {
    let server = MockServer::start().await;
    let storage =
        id("/subscriptions/s/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/sa1");
    let err = plane(&server).get(&storage).await.unwrap_err();
    assert!(matches!(err, RemoteError::Client { status: 400, .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}
