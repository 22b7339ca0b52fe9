//! A thin, read-only `axum` HTTP surface over the gateway core. Limited
//! to device/tag/cloud-health accessors: no browse/discover endpoints,
//! no mutation routes — a full control-plane API is out of scope.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::breaker::CircuitState;
use crate::cloud::{ConnectorMetrics, HealthStatus};
use crate::gateway::Gateway;
use crate::model::device::DeviceStatus;
use crate::tags::structures::{Quality, ValueVariant};

#[derive(Clone)]
pub struct SharedAppState {
    pub gateway: Arc<Gateway>,
    pub start_time: tokio::time::Instant,
}

#[derive(Serialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub address: String,
    pub status: DeviceStatus,
    pub total_reads: u64,
    pub total_writes: u64,
    pub total_errors: u64,
    pub last_error: Option<String>,
}

#[derive(Serialize)]
pub struct TagSummary {
    pub path: String,
    pub driver_id: String,
    pub value: ValueVariant,
    pub quality: Quality,
    pub timestamp: u64,
}

#[derive(Serialize)]
pub struct BreakerSummary {
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_failures: u64,
    pub current_concurrency: u32,
}

#[derive(Serialize)]
pub struct HealthSummary {
    pub uptime_ms: u64,
    pub device_count: usize,
    pub tag_count: usize,
}

#[derive(Serialize)]
pub struct ConnectorHealthEntry {
    pub connector: String,
    pub connected: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectorMetricsEntry {
    pub connector: String,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub bytes_sent: u64,
}

pub fn create_api_routes() -> Router<SharedAppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:device_id", get(get_device))
        .route("/api/devices/:device_id/breaker", get(get_breaker))
        .route("/api/tags", get(list_tags))
        .route("/api/tags/*tag_path", get(get_tag))
        .route("/api/cloud/health", get(cloud_health))
        .route("/api/cloud/metrics", get(cloud_metrics))
}

async fn health(State(state): State<SharedAppState>) -> impl IntoResponse {
    let body = HealthSummary {
        uptime_ms: state.start_time.elapsed().as_millis() as u64,
        device_count: state.gateway.devices().list_devices().len(),
        tag_count: state.gateway.tags().get_all_tag_paths().len(),
    };
    (StatusCode::OK, Json(body))
}

async fn list_devices(State(state): State<SharedAppState>) -> impl IntoResponse {
    let devices = state
        .gateway
        .devices()
        .list_devices()
        .into_iter()
        .map(|device| {
            let runtime_state = state.gateway.devices().get_state(&device.id).unwrap_or_default();
            DeviceSummary {
                id: device.id,
                name: device.name,
                protocol: device.protocol,
                address: device.address,
                status: runtime_state.status,
                total_reads: runtime_state.total_reads,
                total_writes: runtime_state.total_writes,
                total_errors: runtime_state.total_errors,
                last_error: runtime_state.last_error,
            }
        })
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(devices))
}

async fn get_device(State(state): State<SharedAppState>, Path(device_id): Path<String>) -> impl IntoResponse {
    let Some(device) = state.gateway.devices().get_device(&device_id) else {
        return (StatusCode::NOT_FOUND, Json(None::<DeviceSummary>));
    };
    let runtime_state = state.gateway.devices().get_state(&device_id).unwrap_or_default();
    let summary = DeviceSummary {
        id: device.id,
        name: device.name,
        protocol: device.protocol,
        address: device.address,
        status: runtime_state.status,
        total_reads: runtime_state.total_reads,
        total_writes: runtime_state.total_writes,
        total_errors: runtime_state.total_errors,
        last_error: runtime_state.last_error,
    };
    (StatusCode::OK, Json(Some(summary)))
}

async fn get_breaker(State(state): State<SharedAppState>, Path(device_id): Path<String>) -> impl IntoResponse {
    match state.gateway.breaker_metrics(&device_id) {
        Some(metrics) => (
            StatusCode::OK,
            Json(Some(BreakerSummary {
                state: metrics.state,
                total_requests: metrics.total_requests,
                total_failures: metrics.total_failures,
                current_concurrency: metrics.current_concurrency,
            })),
        ),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

async fn list_tags(State(state): State<SharedAppState>) -> impl IntoResponse {
    let tags = state
        .gateway
        .tags()
        .get_all_tags()
        .await
        .into_iter()
        .map(|tag| TagSummary {
            path: tag.path,
            driver_id: tag.driver_id,
            value: tag.value.value,
            quality: tag.value.quality,
            timestamp: tag.value.timestamp,
        })
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(tags))
}

async fn get_tag(State(state): State<SharedAppState>, Path(tag_path): Path<String>) -> impl IntoResponse {
    match state.gateway.tags().get_tag_details(&tag_path) {
        Some(tag) => (
            StatusCode::OK,
            Json(Some(TagSummary {
                path: tag.path,
                driver_id: tag.driver_id,
                value: tag.value.value,
                quality: tag.value.quality,
                timestamp: tag.value.timestamp,
            })),
        ),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

async fn cloud_health(State(state): State<SharedAppState>) -> impl IntoResponse {
    let health: Vec<ConnectorHealthEntry> = state
        .gateway
        .cloud()
        .connector_health()
        .await
        .into_iter()
        .map(|(connector, status): (String, HealthStatus)| ConnectorHealthEntry {
            connector,
            connected: status.connected,
            consecutive_failures: status.consecutive_failures,
            last_error: status.last_error,
        })
        .collect();
    (StatusCode::OK, Json(health))
}

async fn cloud_metrics(State(state): State<SharedAppState>) -> impl IntoResponse {
    let metrics: Vec<ConnectorMetricsEntry> = state
        .gateway
        .cloud()
        .connector_metrics()
        .await
        .into_iter()
        .map(|(connector, m): (String, ConnectorMetrics)| ConnectorMetricsEntry {
            connector,
            messages_sent: m.messages_sent,
            messages_failed: m.messages_failed,
            bytes_sent: m.bytes_sent,
        })
        .collect();
    (StatusCode::OK, Json(metrics))
}
