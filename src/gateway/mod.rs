//! Gateway composition: wires the device/tag model, per-device
//! breakers, protocol handlers, the Cloud Manager, and the Edge Resource
//! Governor into one process lifecycle, and drives the poll-group loop
//! that feeds them. The poll-group-by-`(device_id, poll_rate_ms)` ticker
//! shape follows the same ticker-plus-notify polling loop,
//! generalized from a single hardcoded OPC UA driver to the `DeviceHandler`
//! trait and routed through the breaker instead of a bare mutex lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::breaker::{BreakerConfig, BreakerError, BreakerMetrics, CircuitBreaker};
use crate::cloud::CloudManager;
use crate::context::Context;
use crate::drivers::traits::{DeviceHandler, HandlerError};
use crate::egress::CloudData;
use crate::governor::ResourceGovernor;
use crate::model::device::{Device, DeviceRegistry, DeviceStatus};
use crate::tags::engine::TagEngine;
use crate::tags::structures::{Quality, Tag, TagValue};

/// Gateway-level tuning, the bits not owned by a sub-component.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How often the poll-group scheduler wakes to check which groups are
    /// due, with a "check every 100ms" ticker.
    pub poll_tick: Duration,
    pub breaker: BreakerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            poll_tick: Duration::from_millis(100),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Wires every other component together and owns the process lifecycle
///
pub struct Gateway {
    config: GatewayConfig,
    devices: DeviceRegistry,
    tags: TagEngine,
    handlers: DashMap<String, Arc<dyn DeviceHandler>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    cloud: Arc<CloudManager>,
    governor: Arc<ResourceGovernor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, cloud: Arc<CloudManager>, governor: Arc<ResourceGovernor>) -> Arc<Self> {
        Arc::new(Gateway {
            config,
            devices: DeviceRegistry::new(),
            tags: TagEngine::new(),
            handlers: DashMap::new(),
            breakers: DashMap::new(),
            cloud,
            governor,
            tasks: Mutex::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn register_handler(&self, protocol: &str, handler: Arc<dyn DeviceHandler>) {
        self.handlers.insert(protocol.to_string(), handler);
    }

    pub fn register_device(&self, device: Device) {
        self.breakers
            .entry(device.id.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.breaker.clone())));
        self.devices.register(device);
    }

    pub fn register_tag(&self, tag: Tag) {
        self.tags.register_tag(tag);
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn tags(&self) -> &TagEngine {
        &self.tags
    }

    pub fn cloud(&self) -> &Arc<CloudManager> {
        &self.cloud
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    pub fn breaker_metrics(&self, device_id: &str) -> Option<BreakerMetrics> {
        self.breakers.get(device_id).map(|b| b.metrics())
    }

    fn breaker_for(&self, device_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.breaker.clone())))
            .clone()
    }

    /// Connects every registered device through its protocol's handler
    /// in parallel.
    pub async fn connect_all(&self) {
        let devices = self.devices.list_devices();
        let connects = devices.into_iter().map(|device| async move {
            self.connect_device(&device).await;
        });
        futures::future::join_all(connects).await;
    }

    async fn connect_device(&self, device: &Device) {
        let Some(handler) = self.handlers.get(device.protocol.as_str()).map(|h| h.clone()) else {
            warn!(device_id = %device.id, protocol = %device.protocol, "no handler registered for protocol");
            return;
        };
        self.devices.transition(&device.id, DeviceStatus::Connecting);
        let ctx = Context::with_timeout(Duration::from_secs(10)).0;
        match handler.connect(&ctx, device).await {
            Ok(()) => {
                self.devices.transition(&device.id, DeviceStatus::Connected);
                info!(device_id = %device.id, "device connected");
            }
            Err(e) => {
                self.devices.transition(&device.id, DeviceStatus::Error);
                self.devices.record_error(&device.id, e.to_string());
                warn!(device_id = %device.id, error = %e, "device connect failed");
            }
        }
    }

    /// Starts the poll-group scheduler, the egress-drain loop, and the
    /// Cloud Manager / Governor background tasks.
    pub fn start(self: &Arc<Self>) {
        self.cloud.start();
        self.governor.start();

        let poller = self.clone();
        let poll_task = tokio::spawn(async move { poller.poll_loop().await });
        let drainer = self.clone();
        let drain_task = tokio::spawn(async move { drainer.drain_loop().await });

        let mut tasks = self.tasks.lock();
        tasks.push(poll_task);
        tasks.push(drain_task);
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut poll_groups: HashMap<(String, u64), Vec<String>> = HashMap::new();
        for path in self.tags.get_all_tag_paths() {
            if let Some(tag) = self.tags.get_tag_details(&path) {
                poll_groups.entry((tag.driver_id.clone(), tag.poll_rate_ms)).or_default().push(path);
            }
        }
        debug!(groups = poll_groups.len(), "poll groups assembled");

        let mut last_poll: HashMap<(String, u64), Instant> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.poll_tick);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            for ((device_id, poll_rate_ms), tag_paths) in &poll_groups {
                let due_since = last_poll.entry((device_id.clone(), *poll_rate_ms)).or_insert(now - Duration::from_secs(3600));
                if now.duration_since(*due_since) >= Duration::from_millis(*poll_rate_ms) {
                    *due_since = now;
                    let span = info_span!("poll_group", device_id = %device_id, poll_rate_ms = *poll_rate_ms);
                    self.poll_group(device_id, tag_paths).instrument(span).await;
                }
            }
        }
    }

    async fn poll_group(&self, device_id: &str, tag_paths: &[String]) {
        let Some(device) = self.devices.get_device(device_id) else {
            return;
        };
        let Some(handler) = self.handlers.get(device.protocol.as_str()).map(|h| h.clone()) else {
            return;
        };
        let tags: Vec<Tag> = tag_paths.iter().filter_map(|p| self.tags.get_tag_details(p)).collect();
        if tags.is_empty() {
            return;
        }

        let breaker = self.breaker_for(device_id);
        let ctx = Context::with_timeout(Duration::from_secs(5)).0;
        let result = breaker
            .call(|| async {
                let results = handler.read_multiple_tags(&ctx, &device, &tags).await;
                if !results.is_empty() && results.values().all(|r| r.is_err()) {
                    Err(HandlerError::ReadFailed("all tags in group failed".into()))
                } else {
                    Ok(results)
                }
            })
            .await;

        match result {
            Ok(results) => {
                self.devices.record_read(device_id);
                for (address, value_result) in results {
                    let Some(path) = self.tags.find_path_by_address(device_id, &address) else {
                        continue;
                    };
                    match value_result {
                        Ok(value) => {
                            self.tags.update_tag_value(&path, value.clone());
                            self.submit_to_cloud(device_id, &path, &value).await;
                        }
                        Err(e) => {
                            self.tags.update_tag_value(&path, TagValue::bad(Quality::CommFailure));
                            self.devices.record_error(device_id, e.to_string());
                        }
                    }
                }
            }
            Err(BreakerError::Rejected(rejection)) => {
                debug!(device_id, %rejection, "poll skipped, breaker rejected");
            }
            Err(BreakerError::Operation(e)) => {
                self.devices.record_error(device_id, e.to_string());
                for path in tag_paths {
                    self.tags.update_tag_value(path, TagValue::bad(Quality::CommFailure));
                }
            }
        }
    }

    async fn submit_to_cloud(&self, device_id: &str, tag_path: &str, value: &TagValue) {
        let data = CloudData::new(device_id, tag_path, value.value.clone(), value.quality.as_spec_quality());
        if let Err(e) = self.cloud.send_data(data).await {
            debug!(device_id, tag_path, error = %e, "cloud manager did not accept value");
        }
    }

    /// Writes a single tag through its device's handler, gated by the
    /// same breaker the poll loop uses ("a poller or external API
    /// call invokes Handler.Read/Write through the breaker").
    pub async fn write_tag(&self, tag_path: &str, value: TagValue) -> Result<(), HandlerError> {
        let Some(tag) = self.tags.get_tag_details(tag_path) else {
            return Err(HandlerError::InvalidAddress(tag_path.to_string()));
        };
        let Some(device) = self.devices.get_device(&tag.driver_id) else {
            return Err(HandlerError::NotConnected);
        };
        let Some(handler) = self.handlers.get(device.protocol.as_str()).map(|h| h.clone()) else {
            return Err(HandlerError::Unsupported(device.protocol.clone()));
        };

        let breaker = self.breaker_for(&tag.driver_id);
        let ctx = Context::with_timeout(Duration::from_secs(5)).0;
        let result = breaker
            .call(|| async { handler.write_tag(&ctx, &device, &tag, value.clone()).await })
            .await;

        match result {
            Ok(()) => {
                self.devices.record_write(&tag.driver_id);
                self.tags.update_tag_value(tag_path, value);
                Ok(())
            }
            Err(BreakerError::Rejected(_)) => Err(HandlerError::NotConnected),
            Err(BreakerError::Operation(e)) => {
                self.devices.record_error(&tag.driver_id, e.to_string());
                Err(e)
            }
        }
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            let ctx = Context::with_cancel().0;
            tokio::select! {
                _ = self.shutdown.notified() => return,
                result = self.cloud.drain_once(&ctx) => {
                    if let Err(e) = result {
                        warn!(error = %e, "egress drain failed, backing off");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
    }

    /// Synchronous shutdown: stop the poll/drain loops, shut
    /// down the Cloud Manager (which itself flushes and disconnects),
    /// stop the governor, and disconnect every device.
    pub async fn stop(self: &Arc<Self>) {
        self.shutdown.notify_waiters();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }

        self.cloud.shutdown().await;
        self.governor.stop().await;

        let devices = self.devices.list_devices();
        let disconnects = devices.into_iter().map(|device| async move {
            if let Some(handler) = self.handlers.get(device.protocol.as_str()).map(|h| h.clone()) {
                handler.disconnect(&device).await;
                self.devices.transition(&device.id, DeviceStatus::Disconnected);
            }
        });
        futures::future::join_all(disconnects).await;
        info!("gateway shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ManagerConfig;
    use crate::drivers::traits::{Diagnostics, DeviceInfo, DriverResult};
    use crate::egress::InMemoryEgressBuffer;
    use crate::governor::{GovernorConfig, ResourceSample, ResourceSampler};
    use crate::tags::structures::{TagMetadata, ValueVariant};
    use async_trait::async_trait;
    use std::any::Any;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubSampler;
    impl ResourceSampler for StubSampler {
        fn sample(&mut self, worker_count: u32) -> ResourceSample {
            ResourceSample { memory_used_bytes: 0, cpu_percent: 0.0, network_bps: 0, worker_count }
        }
    }

    struct StubHandler {
        reads: AtomicU32,
    }

    #[async_trait]
    impl DeviceHandler for StubHandler {
        fn protocol(&self) -> &'static str {
            "stub"
        }
        async fn connect(&self, _ctx: &Context, _device: &Device) -> DriverResult<()> {
            Ok(())
        }
        async fn disconnect(&self, _device: &Device) {}
        async fn is_connected(&self, _device: &Device) -> bool {
            true
        }
        async fn ping(&self, _ctx: &Context, _device: &Device) -> DriverResult<()> {
            Ok(())
        }
        async fn read_tag(&self, _ctx: &Context, _device: &Device, _tag: &Tag) -> DriverResult<TagValue> {
            Ok(TagValue::new(ValueVariant::I32(42), Quality::Good))
        }
        async fn read_multiple_tags(
            &self,
            _ctx: &Context,
            _device: &Device,
            tags: &[Tag],
        ) -> HashMap<String, DriverResult<TagValue>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            tags.iter()
                .map(|t| (t.driver_address.clone(), Ok(TagValue::new(ValueVariant::I32(7), Quality::Good))))
                .collect()
        }
        async fn write_tag(&self, _ctx: &Context, _device: &Device, _tag: &Tag, _value: TagValue) -> DriverResult<()> {
            Ok(())
        }
        async fn get_device_info(&self, _ctx: &Context, _device: &Device) -> DriverResult<DeviceInfo> {
            Ok(DeviceInfo::default())
        }
        async fn get_diagnostics(&self, _device: &Device) -> Diagnostics {
            Diagnostics::default()
        }
        async fn discover_devices(&self, _ctx: &Context, _range: &str) -> DriverResult<Vec<Device>> {
            Ok(Vec::new())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn test_gateway() -> Arc<Gateway> {
        let buffer: Arc<dyn crate::egress::EgressBuffer> = Arc::new(InMemoryEgressBuffer::new(100));
        let cloud = CloudManager::new(ManagerConfig::default(), buffer);
        let governor = ResourceGovernor::new(GovernorConfig::default(), Box::new(StubSampler));
        Gateway::new(GatewayConfig::default(), cloud, governor)
    }

    #[tokio::test]
    async fn poll_group_updates_tag_values_from_handler() {
        let gateway = test_gateway();
        gateway.register_handler("stub", Arc::new(StubHandler { reads: AtomicU32::new(0) }));
        gateway.register_device(Device {
            id: "d1".into(),
            name: "Device 1".into(),
            protocol: "stub".into(),
            address: "127.0.0.1".into(),
            port: 0,
            config: Default::default(),
        });
        gateway.register_tag(Tag {
            path: "d1/temp".into(),
            value: TagValue::bad(Quality::Initializing),
            driver_id: "d1".into(),
            driver_address: "40001".into(),
            poll_rate_ms: 100,
            metadata: TagMetadata::default(),
        });

        gateway.poll_group("d1", &["d1/temp".to_string()]).await;

        let value = gateway.tags().read_tag("d1/temp").unwrap();
        assert_eq!(value.value, ValueVariant::I32(7));
        assert_eq!(value.quality, Quality::Good);
    }

    #[tokio::test]
    async fn unreachable_handler_protocol_is_a_no_op() {
        let gateway = test_gateway();
        gateway.register_device(Device {
            id: "d1".into(),
            name: "Device 1".into(),
            protocol: "missing".into(),
            address: "127.0.0.1".into(),
            port: 0,
            config: Default::default(),
        });
        gateway.register_tag(Tag {
            path: "d1/temp".into(),
            value: TagValue::bad(Quality::Initializing),
            driver_id: "d1".into(),
            driver_address: "40001".into(),
            poll_rate_ms: 100,
            metadata: TagMetadata::default(),
        });
        gateway.poll_group("d1", &["d1/temp".to_string()]).await;
        let value = gateway.tags().read_tag("d1/temp").unwrap();
        assert_eq!(value.quality, Quality::Initializing);
    }
}
