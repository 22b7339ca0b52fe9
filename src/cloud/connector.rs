//! The cloud connector abstraction: a uniform contract every
//! outbound destination implementation honors so the Cloud Manager can
//! route, batch, and fan out to them polymorphically. Metrics are kept as
//! `Arc`-wrapped atomics behind a snapshot struct, the pattern
//! `ConnectorMetrics`/`ConnectorMetricsInner` use in the retrieved
//! `bare-metal-manager-core` http-connector example; the circuit-style
//! health bookkeeping follows `connector_runtime::ConnectorRuntime`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::context::{Context, ContextError};
use crate::egress::CloudData;

/// Errors a connector operation can produce.
#[derive(Debug, Error, Clone)]
pub enum ConnectorError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connector not connected")]
    NotConnected,
    #[error("invalid connector configuration: {0}")]
    ConfigError(String),
}

impl From<ContextError> for ConnectorError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::Cancelled => ConnectorError::Cancelled,
            ContextError::DeadlineExceeded => ConnectorError::Timeout,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Health snapshot a connector reports (`get_health`).
#[derive(Debug, Clone, Default)]
pub struct HealthStatus {
    pub connected: bool,
    pub last_success_at: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Point-in-time counters a connector reports (`get_metrics`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectorMetrics {
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub bytes_sent: u64,
    pub last_latency_ms: Option<u64>,
}

/// Shared atomic counters backing `ConnectorMetrics`, cheaply cloned the
/// way `ConnectorMetricsInner` is in the retrieved http-connector example.
#[derive(Default)]
struct MetricsInner {
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    bytes_sent: AtomicU64,
    last_latency_ms: AtomicU64,
    has_latency: std::sync::atomic::AtomicBool,
}

impl MetricsInner {
    fn record_success(&self, bytes: u64, latency: Duration) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.last_latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
        self.has_latency.store(true, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectorMetrics {
        ConnectorMetrics {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            last_latency_ms: if self.has_latency.load(Ordering::Relaxed) {
                Some(self.last_latency_ms.load(Ordering::Relaxed))
            } else {
                None
            },
        }
    }
}

/// Uniform destination contract. Implementations MUST honor
/// `ctx` cancellation and never block indefinitely.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, ctx: &Context) -> Result<(), ConnectorError>;

    /// Never fails; idempotent.
    async fn disconnect(&self, ctx: &Context);

    async fn is_connected(&self) -> bool;

    async fn send_data(&self, ctx: &Context, data: &CloudData) -> Result<(), ConnectorError>;

    async fn send_batch(&self, ctx: &Context, batch: &[CloudData]) -> Result<(), ConnectorError>;

    async fn ping(&self, ctx: &Context) -> Result<(), ConnectorError>;

    /// Prevents registration on failure (`ConfigError`).
    fn validate_config(&self) -> Result<(), ConnectorError>;

    async fn get_health(&self) -> HealthStatus;

    async fn get_metrics(&self) -> ConnectorMetrics;
}

/// The "HTTP-push"-shaped destination the Cloud Manager ships as its one
/// concrete connector ("implementations provide MQTT,
/// HTTP-push, and similar back-ends"). The core's dependency stack (see
/// DESIGN.md) carries no HTTP client, so this pushes newline-delimited
/// JSON `CloudData` records over a persistent TCP socket to the
/// configured endpoint instead of a real HTTP request — a deliberately
/// minimal concrete connector that still exercises the full contract
/// (lazy connect, timeouts, health/metrics) the way `OpcUaHandler`
/// exercises `DeviceHandler` for a second protocol.
pub struct HttpPushConnector {
    name: String,
    host: String,
    port: u16,
    connect_timeout: Duration,
    send_timeout: Duration,
    socket: AsyncMutex<Option<TcpStream>>,
    health: Mutex<HealthStatus>,
    metrics: MetricsInner,
}

impl HttpPushConnector {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            socket: AsyncMutex::new(None),
            health: Mutex::new(HealthStatus::default()),
            metrics: MetricsInner::default(),
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, send_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.send_timeout = send_timeout;
        self
    }

    fn note_success(&self) {
        let mut health = self.health.lock();
        health.connected = true;
        health.last_success_at = Some(now_millis());
        health.consecutive_failures = 0;
    }

    fn note_failure(&self, reason: impl Into<String>) {
        let mut health = self.health.lock();
        health.last_error = Some(reason.into());
        health.consecutive_failures += 1;
    }

    async fn write_lines(&self, ctx: &Context, lines: &[String]) -> Result<u64, ConnectorError> {
        let mut guard = self.socket.lock().await;
        let stream = guard.as_mut().ok_or(ConnectorError::NotConnected)?;
        let mut total = 0u64;
        let write = async {
            for line in lines {
                stream.write_all(line.as_bytes()).await?;
                stream.write_all(b"\n").await?;
                total += line.len() as u64 + 1;
            }
            stream.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        ctx.run(self.send_timeout, write)
            .await
            .map_err(ConnectorError::from)?
            .map_err(|e| ConnectorError::SendFailed(e.to_string()))?;
        Ok(total)
    }
}

#[async_trait]
impl CloudConnector for HttpPushConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, ctx: &Context) -> Result<(), ConnectorError> {
        let mut guard = self.socket.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let target = format!("{}:{}", self.host, self.port);
        let stream = ctx
            .run(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(ConnectorError::from)?
            .map_err(|e| ConnectorError::ConnectFailed(e.to_string()))?;
        *guard = Some(stream);
        drop(guard);
        self.note_success();
        debug!(connector = %self.name, target = %target, "cloud connector connected");
        Ok(())
    }

    async fn disconnect(&self, _ctx: &Context) {
        *self.socket.lock().await = None;
        self.health.lock().connected = false;
    }

    async fn is_connected(&self) -> bool {
        self.socket.lock().await.is_some()
    }

    async fn send_data(&self, ctx: &Context, data: &CloudData) -> Result<(), ConnectorError> {
        self.send_batch(ctx, std::slice::from_ref(data)).await
    }

    async fn send_batch(&self, ctx: &Context, batch: &[CloudData]) -> Result<(), ConnectorError> {
        if batch.is_empty() {
            return Ok(());
        }
        let start = std::time::Instant::now();
        let lines: Vec<String> = batch
            .iter()
            .map(|d| serde_json::to_string(d).unwrap_or_default())
            .collect();
        match self.write_lines(ctx, &lines).await {
            Ok(bytes) => {
                self.metrics.record_success(bytes, start.elapsed());
                self.note_success();
                Ok(())
            }
            Err(e) => {
                self.metrics.record_failure();
                self.note_failure(e.to_string());
                *self.socket.lock().await = None;
                warn!(connector = %self.name, error = %e, "cloud connector send failed");
                Err(e)
            }
        }
    }

    async fn ping(&self, ctx: &Context) -> Result<(), ConnectorError> {
        self.connect(ctx).await
    }

    fn validate_config(&self) -> Result<(), ConnectorError> {
        if self.host.is_empty() {
            return Err(ConnectorError::ConfigError("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConnectorError::ConfigError("port must be non-zero".into()));
        }
        Ok(())
    }

    async fn get_health(&self) -> HealthStatus {
        self.health.lock().clone()
    }

    async fn get_metrics(&self) -> ConnectorMetrics {
        self.metrics.snapshot()
    }
}

/// Handy alias used by the manager for the shared-ownership form every
/// registered connector is stored as.
pub type SharedConnector = Arc<dyn CloudConnector>;
