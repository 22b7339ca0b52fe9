use std::collections::HashMap;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use edge_gateway::api::{create_api_routes, SharedAppState};
use edge_gateway::cloud::CloudManager;
use edge_gateway::egress::InMemoryEgressBuffer;
use edge_gateway::gateway::{Gateway, GatewayConfig};
use edge_gateway::governor::{ResourceGovernor, ResourceSample, ResourceSampler};
use edge_gateway::model::device::Device;
use edge_gateway::tags::structures::{Quality, Tag, TagMetadata, TagValue, ValueVariant};

struct FixedSampler;

impl ResourceSampler for FixedSampler {
    fn sample(&mut self, worker_count: u32) -> ResourceSample {
        ResourceSample {
            memory_used_bytes: 1024,
            cpu_percent: 1.0,
            network_bps: 0,
            worker_count,
        }
    }
}

fn test_device() -> Device {
    Device {
        id: "test_driver".to_string(),
        name: "Test Device".to_string(),
        protocol: "modbus-tcp".to_string(),
        address: "127.0.0.1".to_string(),
        port: 502,
        config: HashMap::new(),
    }
}

fn test_tag() -> Tag {
    Tag {
        path: "TestDevice/Temperature".to_string(),
        value: TagValue::new(ValueVariant::F64(23.5), Quality::Good),
        driver_id: "test_driver".to_string(),
        driver_address: "40001".to_string(),
        poll_rate_ms: 1000,
        metadata: TagMetadata::default(),
    }
}

fn test_app() -> Router {
    let buffer = std::sync::Arc::new(InMemoryEgressBuffer::new(100));
    let cloud = CloudManager::new(Default::default(), buffer);
    let governor = ResourceGovernor::new(Default::default(), Box::new(FixedSampler));
    let gateway = Gateway::new(GatewayConfig::default(), cloud, governor);

    gateway.register_device(test_device());
    gateway.register_tag(test_tag());

    let state = SharedAppState {
        gateway,
        start_time: tokio::time::Instant::now(),
    };
    create_api_routes().with_state(state)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).method(Method::GET).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_device_and_tag_counts() {
    let app = test_app();
    let response = app.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["device_count"], 1);
    assert_eq!(json["tag_count"], 1);
}

#[tokio::test]
async fn list_devices_includes_the_registered_device() {
    let app = test_app();
    let response = app.oneshot(get("/api/devices")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["id"], "test_driver");
    assert_eq!(json[0]["status"], "Disconnected");
}

#[tokio::test]
async fn unknown_device_returns_not_found() {
    let app = test_app();
    let response = app.oneshot(get("/api/devices/nonexistent")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn breaker_metrics_are_exposed_for_a_registered_device() {
    let app = test_app();
    let response = app.oneshot(get("/api/devices/test_driver/breaker")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["state"], "Closed");
}

#[tokio::test]
async fn list_and_fetch_tags() {
    let app = test_app();

    let response = app.clone().oneshot(get("/api/tags")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 1);

    let response = app.oneshot(get("/api/tags/TestDevice/Temperature")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cloud_health_and_metrics_start_empty_with_no_connectors() {
    let app = test_app();

    let response = app.clone().oneshot(get("/api/cloud/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json.as_array().unwrap().is_empty());

    let response = app.oneshot(get("/api/cloud/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
