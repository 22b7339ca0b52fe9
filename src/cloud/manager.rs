//! Cloud Manager: routes, batches, and fans out `CloudData`
//! across registered connectors, falling back to the Egress Buffer on
//! failure or disconnect. Background task shape (health-check ticker,
//! abortable on shutdown) and the connect/retry/dead-lettering idioms
//! follow `connector_runtime`'s `ConnectorRuntime`/`ConnectorRegistry`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cloud::connector::{CloudConnector, ConnectorError, ConnectorMetrics, HealthStatus, SharedConnector};
use crate::context::Context;
use crate::egress::{BackoffConfig, CloudData, CloudMessage, EgressBuffer, EgressError, Priority};
use crate::tags::structures::SpecQuality;

/// Errors `send_data`/manager operations surface.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no routing rule matched and no default connector is configured")]
    NoRoute,
    #[error("connector {0:?} is not registered")]
    UnknownConnector(String),
    #[error("connector rejected its configuration: {0}")]
    ConfigError(#[from] ConnectorError),
    #[error("egress buffer error: {0}")]
    Egress(#[from] EgressError),
}

/// A simple equality predicate over `CloudData`'s routable fields
/// ("Conditions are simple equality predicates over
/// `device_id`, `tag_name`, `quality`").
#[derive(Debug, Clone, Default)]
pub struct RoutingCondition {
    pub device_id: Option<String>,
    pub tag_name: Option<String>,
    pub quality: Option<SpecQuality>,
}

impl RoutingCondition {
    fn matches(&self, data: &CloudData) -> bool {
        if let Some(device_id) = &self.device_id {
            if device_id != &data.device_id {
                return false;
            }
        }
        if let Some(tag_name) = &self.tag_name {
            if tag_name != &data.tag_name {
                return false;
            }
        }
        if let Some(quality) = &self.quality {
            if *quality != data.quality {
                return false;
            }
        }
        true
    }
}

/// One entry in the ordered routing table.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pub condition: RoutingCondition,
    pub connectors: Vec<String>,
    pub priority: i32,
}

/// Batching/health-check/buffer knobs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub default_connector: Option<String>,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub health_check_interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            default_connector: None,
            batch_size: 50,
            batch_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

/// First-match-wins routing table (an open design question, resolved in
/// favor of a single first match, not a union of all matching rules).
fn route<'a>(rules: &'a [RoutingRule], default: &'a Option<String>, data: &CloudData) -> Option<&'a [String]> {
    for rule in rules {
        if rule.condition.matches(data) {
            return Some(&rule.connectors);
        }
    }
    default.as_ref().map(std::slice::from_ref)
}

struct PendingBatch {
    items: Vec<CloudData>,
    opened_at: Option<u64>,
}

impl PendingBatch {
    fn new() -> Self {
        PendingBatch { items: Vec::new(), opened_at: None }
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Routes, batches, and fans `CloudData` out to connectors, with the
/// Egress Buffer as the fallback destination when a connector is down
///
pub struct CloudManager {
    config: RwLock<ManagerConfig>,
    rules: RwLock<Vec<RoutingRule>>,
    connectors: RwLock<HashMap<String, SharedConnector>>,
    batch: Mutex<PendingBatch>,
    buffer: Arc<dyn EgressBuffer>,
    wake_health_check: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<tokio::sync::Notify>,
    shutdown_flag: Arc<std::sync::atomic::AtomicBool>,
    flushes_in_flight: AtomicU64,
}

impl CloudManager {
    pub fn new(config: ManagerConfig, buffer: Arc<dyn EgressBuffer>) -> Arc<Self> {
        Arc::new(CloudManager {
            config: RwLock::new(config),
            rules: RwLock::new(Vec::new()),
            connectors: RwLock::new(HashMap::new()),
            batch: Mutex::new(PendingBatch::new()),
            buffer,
            wake_health_check: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            shutdown_flag: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            flushes_in_flight: AtomicU64::new(0),
        })
    }

    pub fn set_routing_rules(&self, rules: Vec<RoutingRule>) {
        *self.rules.write() = rules;
    }

    pub async fn register_connector(&self, connector: SharedConnector) -> Result<(), ManagerError> {
        connector.validate_config()?;
        self.connectors.write().insert(connector.name().to_string(), connector);
        Ok(())
    }

    pub fn unregister_connector(&self, name: &str) {
        self.connectors.write().remove(name);
    }

    /// Starts the background batch-timeout and health-check loops. Must
    /// be called once, after connectors/rules are configured.
    pub fn start(self: &Arc<Self>) {
        let timeout_task = {
            let manager = self.clone();
            tokio::spawn(async move { manager.batch_timeout_loop().await })
        };
        let health_task = {
            let manager = self.clone();
            tokio::spawn(async move { manager.health_check_loop().await })
        };
        let mut tasks = self.tasks.lock();
        tasks.push(timeout_task);
        tasks.push(health_task);
    }

    async fn batch_timeout_loop(self: Arc<Self>) {
        loop {
            let timeout = self.config.read().batch_timeout;
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(timeout) => {
                    if self.shutdown_flag.load(Ordering::Acquire) {
                        return;
                    }
                    let due = {
                        let batch = self.batch.lock();
                        match batch.opened_at {
                            Some(opened) => now_millis().saturating_sub(opened) >= timeout.as_millis() as u64,
                            None => false,
                        }
                    };
                    if due {
                        self.flush().await;
                    }
                }
            }
        }
    }

    async fn health_check_loop(self: Arc<Self>) {
        loop {
            let interval = self.config.read().health_check_interval;
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(interval) => {
                    if self.shutdown_flag.load(Ordering::Acquire) {
                        return;
                    }
                    self.run_health_checks().await;
                }
                _ = self.wake_health_check.notified() => {
                    if self.shutdown_flag.load(Ordering::Acquire) {
                        return;
                    }
                    self.run_health_checks().await;
                }
            }
        }
    }

    async fn run_health_checks(&self) {
        let connectors: Vec<SharedConnector> = self.connectors.read().values().cloned().collect();
        let ctx = Context::with_timeout(Duration::from_secs(5)).0;
        let checks = connectors.into_iter().map(|connector| {
            let ctx = ctx.clone();
            async move {
                if connector.ping(&ctx).await.is_err() && !connector.is_connected().await {
                    debug!(connector = connector.name(), "health check reconnecting");
                    if let Err(e) = connector.connect(&ctx).await {
                        warn!(connector = connector.name(), error = %e, "health check reconnect failed");
                    }
                }
            }
        });
        futures::future::join_all(checks).await;
    }

    /// Submits one `CloudData` for routing/batching. The
    /// item lands in the in-process batch buffer and is flushed when
    /// `batch_size` is reached or `batch_timeout` elapses.
    pub async fn send_data(&self, data: CloudData) -> Result<(), ManagerError> {
        let rules = self.rules.read();
        let default = self.config.read().default_connector.clone();
        if route(&rules, &default, &data).is_none() {
            return Err(ManagerError::NoRoute);
        }
        drop(rules);

        let should_flush = {
            let mut batch = self.batch.lock();
            if batch.opened_at.is_none() {
                batch.opened_at = Some(now_millis());
            }
            batch.items.push(data);
            batch.items.len() >= self.config.read().batch_size
        };
        if should_flush {
            self.flush().await;
        }
        Ok(())
    }

    /// Drains the current batch buffer and fans each connector's share
    /// out in parallel ("Fan-out"). Safe to call concurrently
    /// with itself; overlapping flushes are allowed.
    pub async fn flush(&self) {
        let items = {
            let mut batch = self.batch.lock();
            if batch.items.is_empty() {
                return;
            }
            std::mem::replace(&mut *batch, PendingBatch::new()).items
        };

        self.flushes_in_flight.fetch_add(1, Ordering::Relaxed);
        let mut grouped: HashMap<String, Vec<CloudData>> = HashMap::new();
        let mut unrouted: Vec<CloudData> = Vec::new();
        {
            let rules = self.rules.read();
            let default = self.config.read().default_connector.clone();
            for item in items {
                match route(&rules, &default, &item) {
                    Some(targets) => {
                        for target in targets {
                            grouped.entry(target.clone()).or_default().push(item.clone());
                        }
                    }
                    None => unrouted.push(item),
                }
            }
        }
        for item in unrouted {
            self.spill(item, Priority::Normal).await;
        }

        let connectors = self.connectors.read().clone();
        let ctx = Context::with_timeout(Duration::from_secs(10)).0;
        let sends = grouped.into_iter().map(|(name, batch)| {
            let connector = connectors.get(&name).cloned();
            let ctx = ctx.clone();
            async move {
                match connector {
                    Some(connector) if connector.is_connected().await || connector.connect(&ctx).await.is_ok() => {
                        if let Err(e) = connector.send_batch(&ctx, &batch).await {
                            warn!(connector = %name, error = %e, "batch send failed, spilling to egress buffer");
                            (batch, true)
                        } else {
                            (Vec::new(), false)
                        }
                    }
                    _ => {
                        warn!(connector = %name, "connector unavailable, spilling to egress buffer");
                        (batch, true)
                    }
                }
            }
        });

        let results = futures::future::join_all(sends).await;
        for (failed, spilled) in results {
            if spilled {
                for item in failed {
                    self.spill(item, Priority::Normal).await;
                }
            }
        }
        self.flushes_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    async fn spill(&self, data: CloudData, priority: Priority) {
        let message = CloudMessage::from_data(data, priority);
        if let Err(e) = self.buffer.add(message).await {
            error!(error = %e, "failed to spill cloud message to egress buffer");
        }
    }

    /// Drains the egress buffer, retrying each due message against its
    /// routed connector(s); used by a dedicated drain task driven by the
    /// gateway, since the buffer's own backoff clock decides pacing.
    pub async fn drain_once(&self, ctx: &Context) -> Result<bool, ManagerError> {
        let Some(message) = self.buffer.next_due(ctx).await? else {
            return Ok(false);
        };
        let crate::egress::MessagePayload::Data(data) = &message.payload else {
            self.buffer.ack(message.id).await;
            return Ok(true);
        };

        let rules = self.rules.read();
        let default = self.config.read().default_connector.clone();
        let targets = route(&rules, &default, data).map(|t| t.to_vec());
        drop(rules);

        let Some(targets) = targets else {
            self.buffer.ack(message.id).await;
            return Ok(true);
        };

        let connectors = self.connectors.read().clone();
        let mut all_ok = true;
        for name in &targets {
            let Some(connector) = connectors.get(name) else {
                all_ok = false;
                continue;
            };
            if connector.send_data(ctx, data).await.is_err() {
                all_ok = false;
            }
        }

        if all_ok {
            self.buffer.ack(message.id).await;
        } else {
            let backoff = self.config.read().backoff;
            let next = crate::egress::next_attempt_at(now_millis(), message.retries, &backoff);
            self.buffer.requeue(message.id, next).await;
        }
        Ok(true)
    }

    pub async fn connector_health(&self) -> HashMap<String, HealthStatus> {
        let connectors = self.connectors.read().clone();
        let mut out = HashMap::new();
        for (name, connector) in connectors {
            out.insert(name, connector.get_health().await);
        }
        out
    }

    pub async fn connector_metrics(&self) -> HashMap<String, ConnectorMetrics> {
        let connectors = self.connectors.read().clone();
        let mut out = HashMap::new();
        for (name, connector) in connectors {
            out.insert(name, connector.get_metrics().await);
        }
        out
    }

    /// Synchronous shutdown sequence: cancel background
    /// tasks, flush the batch buffer, disconnect connectors in
    /// parallel, close the egress buffer. Each step waits for the
    /// previous to finish so a late flush can't race a connector that's
    /// already been torn down.
    pub async fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }

        self.flush().await;

        let connectors: Vec<SharedConnector> = self.connectors.read().values().cloned().collect();
        let ctx = Context::background();
        let disconnects = connectors.into_iter().map(|c| {
            let ctx = ctx.clone();
            async move { c.disconnect(&ctx).await }
        });
        futures::future::join_all(disconnects).await;

        if let Err(e) = self.buffer.close().await {
            error!(error = %e, "failed to close egress buffer during shutdown");
        }
        info!("cloud manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::InMemoryEgressBuffer;
    use crate::tags::structures::ValueVariant;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct RecordingConnector {
        name: String,
        connected: std::sync::atomic::AtomicBool,
        received: Mutex<Vec<CloudData>>,
        fail_sends: std::sync::atomic::AtomicBool,
        send_count: AtomicUsize,
    }

    impl RecordingConnector {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(RecordingConnector {
                name: name.to_string(),
                connected: std::sync::atomic::AtomicBool::new(false),
                received: Mutex::new(Vec::new()),
                fail_sends: std::sync::atomic::AtomicBool::new(false),
                send_count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CloudConnector for RecordingConnector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&self, _ctx: &Context) -> Result<(), ConnectorError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self, _ctx: &Context) {
            self.connected.store(false, Ordering::SeqCst);
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn send_data(&self, ctx: &Context, data: &CloudData) -> Result<(), ConnectorError> {
            self.send_batch(ctx, std::slice::from_ref(data)).await
        }

        async fn send_batch(&self, _ctx: &Context, batch: &[CloudData]) -> Result<(), ConnectorError> {
            self.send_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ConnectorError::SendFailed("injected failure".into()));
            }
            self.received.lock().extend_from_slice(batch);
            Ok(())
        }

        async fn ping(&self, _ctx: &Context) -> Result<(), ConnectorError> {
            if self.connected.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ConnectorError::NotConnected)
            }
        }

        fn validate_config(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn get_health(&self) -> HealthStatus {
            HealthStatus { connected: self.is_connected().await, ..Default::default() }
        }

        async fn get_metrics(&self) -> ConnectorMetrics {
            ConnectorMetrics::default()
        }
    }

    fn sample(device_id: &str) -> CloudData {
        CloudData::new(device_id, "temp", ValueVariant::F64(1.0), SpecQuality::Good)
    }

    #[tokio::test]
    async fn flush_routes_by_first_matching_rule() {
        let buffer: Arc<dyn EgressBuffer> = Arc::new(InMemoryEgressBuffer::new(10));
        let manager = CloudManager::new(
            ManagerConfig { batch_size: 10, ..Default::default() },
            buffer,
        );
        let a = RecordingConnector::new("a");
        let b = RecordingConnector::new("b");
        manager.register_connector(a.clone()).await.unwrap();
        manager.register_connector(b.clone()).await.unwrap();
        manager.set_routing_rules(vec![RoutingRule {
            name: "to-a".into(),
            condition: RoutingCondition { device_id: Some("dev-1".into()), ..Default::default() },
            connectors: vec!["a".into()],
            priority: 0,
        }]);

        manager.send_data(sample("dev-1")).await.unwrap();
        manager.flush().await;

        assert_eq!(a.received.lock().len(), 1);
        assert_eq!(b.received.lock().len(), 0);
    }

    #[tokio::test]
    async fn no_matching_rule_and_no_default_is_no_route() {
        let buffer: Arc<dyn EgressBuffer> = Arc::new(InMemoryEgressBuffer::new(10));
        let manager = CloudManager::new(ManagerConfig::default(), buffer);
        let result = manager.send_data(sample("dev-1")).await;
        assert!(matches!(result, Err(ManagerError::NoRoute)));
    }

    #[tokio::test]
    async fn failed_send_spills_to_egress_buffer() {
        let buffer: Arc<dyn EgressBuffer> = Arc::new(InMemoryEgressBuffer::new(10));
        let manager = CloudManager::new(
            ManagerConfig { batch_size: 1, default_connector: Some("a".into()), ..Default::default() },
            buffer.clone(),
        );
        let a = RecordingConnector::new("a");
        a.fail_sends.store(true, Ordering::SeqCst);
        manager.register_connector(a.clone()).await.unwrap();

        manager.send_data(sample("dev-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(buffer.len().await, 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_batch_before_disconnecting() {
        let buffer: Arc<dyn EgressBuffer> = Arc::new(InMemoryEgressBuffer::new(10));
        let manager = CloudManager::new(
            ManagerConfig { batch_size: 100, default_connector: Some("a".into()), ..Default::default() },
            buffer,
        );
        let a = RecordingConnector::new("a");
        manager.register_connector(a.clone()).await.unwrap();
        manager.start();

        manager.send_data(sample("dev-1")).await.unwrap();
        manager.shutdown().await;

        assert_eq!(a.received.lock().len(), 1);
        assert!(!a.is_connected().await);
    }
}
