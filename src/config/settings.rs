//! Typed configuration surface, loaded via the `config` crate
//! via `Settings::load`, covering everything from
//! device/tag definitions to the full breaker/cloud/governor surface
//! enumerates. Each section converts into its component's runtime config
//! type rather than being consumed directly, so a bad config value is
//! caught once at load/conversion time instead of being re-parsed on
//! every poll tick (the per-device Modbus/OPC-UA knobs stay in
//! `Device.config`, which is already a duck-typed `map<string, any>` per
//! and is parsed lazily by each handler).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, ConfigError, File};
use serde::Deserialize;

use crate::breaker::BreakerConfig;
use crate::cloud::manager::{ManagerConfig, RoutingCondition, RoutingRule};
use crate::cloud::{CloudConnector, HttpPushConnector};
use crate::egress::{BackoffConfig, DiskSpillEgressBuffer, EgressBuffer, EgressError, InMemoryEgressBuffer};
use crate::governor::GovernorConfig;
use crate::model::device::{Device, DeviceConfig};
use crate::tags::structures::{SpecQuality, Tag, TagMetadata, TagValue};

fn default_true() -> bool {
    true
}

/// One device entry.
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceSettings {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub config: DeviceConfig,
}

impl DeviceSettings {
    fn to_device(&self) -> Device {
        Device {
            id: self.id.clone(),
            name: self.name.clone(),
            protocol: self.protocol.clone(),
            address: self.address.clone(),
            port: self.port,
            config: self.config.clone(),
        }
    }
}

/// One tag entry.
#[derive(Debug, Deserialize, Clone)]
pub struct TagSettings {
    pub path: String,
    pub driver_id: String,
    pub address: String,
    pub poll_rate_ms: u64,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl TagSettings {
    fn to_tag(&self) -> Tag {
        Tag {
            path: self.path.clone(),
            value: TagValue::bad(crate::tags::structures::Quality::Initializing),
            driver_id: self.driver_id.clone(),
            driver_address: self.address.clone(),
            poll_rate_ms: self.poll_rate_ms,
            metadata: TagMetadata {
                description: self.description.clone(),
                writable: self.writable,
                ..Default::default()
            },
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_breaker_timeout_ms() -> u64 {
    30_000
}
fn default_max_concurrency() -> u32 {
    16
}

/// `[breaker]` config section.
#[derive(Debug, Deserialize, Clone)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        BreakerSettings {
            failure_threshold: default_failure_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(s: &BreakerSettings) -> Self {
        BreakerConfig {
            failure_threshold: s.failure_threshold,
            timeout: Duration::from_millis(s.timeout_ms),
            max_concurrency: s.max_concurrency,
        }
    }
}

/// One destination. `kind` selects the concrete connector;
/// `http_push` is the only one this core ships, per DESIGN.md.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectorSettings {
    HttpPush { host: String, port: u16 },
}

impl ConnectorSettings {
    fn build(&self, name: &str) -> Arc<dyn CloudConnector> {
        match self {
            ConnectorSettings::HttpPush { host, port } => Arc::new(HttpPushConnector::new(name, host.clone(), *port)),
        }
    }
}

fn quality_from_str(s: &str) -> Option<SpecQuality> {
    match s.to_ascii_lowercase().as_str() {
        "good" => Some(SpecQuality::Good),
        "bad" => Some(SpecQuality::Bad),
        "uncertain" => Some(SpecQuality::Uncertain),
        _ => None,
    }
}

/// One routing rule ("ordered list `{name, condition,
/// connectors[], priority, transform}`"; `transform` is left for a future
/// connector that needs one and is not modeled here since nothing in this
/// core consumes it yet).
#[derive(Debug, Deserialize, Clone)]
pub struct RoutingRuleSettings {
    pub name: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    pub connectors: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

impl RoutingRuleSettings {
    fn to_rule(&self) -> RoutingRule {
        RoutingRule {
            name: self.name.clone(),
            condition: RoutingCondition {
                device_id: self.device_id.clone(),
                tag_name: self.tag_name.clone(),
                quality: self.quality.as_deref().and_then(quality_from_str),
            },
            connectors: self.connectors.clone(),
            priority: self.priority,
        }
    }
}

fn default_buffer_max_size() -> usize {
    10_000
}

/// `[cloud.buffer]` ("buffer {max_size, flush_interval,
/// persistent_path?}"). `flush_interval_ms` is accepted for config-surface
/// completeness; this core's buffer is pull-driven (`next_due`), so
/// nothing currently schedules a periodic flush off of it.
#[derive(Debug, Deserialize, Clone)]
pub struct BufferSettings {
    #[serde(default = "default_buffer_max_size")]
    pub max_size: usize,
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
    #[serde(default)]
    pub persistent_path: Option<String>,
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings {
            max_size: default_buffer_max_size(),
            flush_interval_ms: None,
            persistent_path: None,
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_connector_parallelism() -> u32 {
    4
}
fn default_batch_timeout_ms() -> u64 {
    5_000
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_backoff_jitter() -> f64 {
    0.2
}

/// `[cloud]` config section.
#[derive(Debug, Deserialize, Clone)]
pub struct CloudSettings {
    #[serde(default)]
    pub default_connector: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter_fraction: f64,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorSettings>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRuleSettings>,
}

impl Default for CloudSettings {
    fn default() -> Self {
        CloudSettings {
            default_connector: None,
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_fraction: default_backoff_jitter(),
            buffer: BufferSettings::default(),
            connectors: HashMap::new(),
            routing_rules: Vec::new(),
        }
    }
}

fn default_max_memory_mb() -> u64 {
    512
}
fn default_max_cpu_percent() -> f32 {
    80.0
}
fn default_max_network_mbps() -> f64 {
    10.0
}
fn default_max_workers() -> u32 {
    8
}
fn default_max_connections() -> u32 {
    256
}
fn default_monitoring_interval_ms() -> u64 {
    5_000
}
fn default_threshold_check_interval_ms() -> u64 {
    15_000
}
fn default_panic_threshold() -> f32 {
    0.9
}
fn default_worker_floor() -> u32 {
    1
}
fn default_low_power_cpu_target() -> f32 {
    0.25
}
fn default_low_power_memory_target() -> f32 {
    0.5
}

/// `[governor]` config section.
#[derive(Debug, Deserialize, Clone)]
pub struct GovernorSettings {
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,
    #[serde(default = "default_max_network_mbps")]
    pub max_network_mbps: f64,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,
    #[serde(default = "default_threshold_check_interval_ms")]
    pub threshold_check_interval_ms: u64,
    #[serde(default = "default_panic_threshold")]
    pub memory_panic_threshold: f32,
    #[serde(default = "default_panic_threshold")]
    pub cpu_panic_threshold: f32,
    #[serde(default = "default_panic_threshold")]
    pub network_panic_threshold: f32,
    #[serde(default = "default_worker_floor")]
    pub worker_floor: u32,
    #[serde(default = "default_true")]
    pub low_power_mode: bool,
    #[serde(default = "default_low_power_cpu_target")]
    pub low_power_cpu_target: f32,
    #[serde(default = "default_low_power_memory_target")]
    pub low_power_memory_target: f32,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        GovernorSettings {
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            max_network_mbps: default_max_network_mbps(),
            max_workers: default_max_workers(),
            max_connections: default_max_connections(),
            monitoring_interval_ms: default_monitoring_interval_ms(),
            threshold_check_interval_ms: default_threshold_check_interval_ms(),
            memory_panic_threshold: default_panic_threshold(),
            cpu_panic_threshold: default_panic_threshold(),
            network_panic_threshold: default_panic_threshold(),
            worker_floor: default_worker_floor(),
            low_power_mode: true,
            low_power_cpu_target: default_low_power_cpu_target(),
            low_power_memory_target: default_low_power_memory_target(),
        }
    }
}

impl From<&GovernorSettings> for GovernorConfig {
    fn from(s: &GovernorSettings) -> Self {
        GovernorConfig {
            max_memory_mb: s.max_memory_mb,
            max_cpu_percent: s.max_cpu_percent,
            max_network_mbps: s.max_network_mbps,
            max_workers: s.max_workers,
            max_connections: s.max_connections,
            monitoring_interval: Duration::from_millis(s.monitoring_interval_ms),
            threshold_check_interval: Duration::from_millis(s.threshold_check_interval_ms),
            memory_panic_threshold: s.memory_panic_threshold,
            cpu_panic_threshold: s.cpu_panic_threshold,
            network_panic_threshold: s.network_panic_threshold,
            worker_floor: s.worker_floor,
            default_batch_size: default_batch_size(),
            default_buffer_size: default_buffer_max_size(),
            default_connector_parallelism: default_connector_parallelism(),
            low_power_cpu_target: s.low_power_cpu_target,
            low_power_memory_target: s.low_power_memory_target,
        }
    }
}

/// Root configuration document.
/// Unrecognized top-level keys are rejected; operator-specific extras go
/// under `[extension]` instead, so config changes don't require a schema change.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub devices: Vec<DeviceSettings>,
    #[serde(default)]
    pub tags: Vec<TagSettings>,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub cloud: CloudSettings,
    #[serde(default)]
    pub governor: GovernorSettings,
    #[serde(default)]
    pub extension: HashMap<String, toml::Value>,
}

impl Settings {
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let built = Config::builder().add_source(File::from(config_path)).build()?;
        built.try_deserialize()
    }

    pub fn device_models(&self) -> Vec<Device> {
        self.devices.iter().map(DeviceSettings::to_device).collect()
    }

    pub fn tag_models(&self) -> Vec<Tag> {
        self.tags.iter().map(TagSettings::to_tag).collect()
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::from(&self.breaker)
    }

    pub fn governor_config(&self) -> GovernorConfig {
        GovernorConfig::from(&self.governor)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            default_connector: self.cloud.default_connector.clone(),
            batch_size: self.cloud.batch_size,
            batch_timeout: Duration::from_millis(self.cloud.batch_timeout_ms),
            health_check_interval: Duration::from_millis(self.cloud.health_check_interval_ms),
            backoff: BackoffConfig {
                base_ms: self.cloud.backoff_base_ms,
                max_backoff_ms: self.cloud.backoff_max_ms,
                jitter_fraction: self.cloud.backoff_jitter_fraction,
            },
        }
    }

    pub fn routing_rules(&self) -> Vec<RoutingRule> {
        self.cloud.routing_rules.iter().map(RoutingRuleSettings::to_rule).collect()
    }

    pub fn connectors(&self) -> Vec<(String, Arc<dyn CloudConnector>)> {
        self.cloud.connectors.iter().map(|(name, settings)| (name.clone(), settings.build(name))).collect()
    }

    pub async fn build_egress_buffer(&self) -> Result<Arc<dyn EgressBuffer>, EgressError> {
        match &self.cloud.buffer.persistent_path {
            Some(path) => {
                let buffer = DiskSpillEgressBuffer::open(Path::new(path), self.cloud.buffer.max_size).await?;
                Ok(Arc::new(buffer))
            }
            None => Ok(Arc::new(InMemoryEgressBuffer::new(self.cloud.buffer.max_size))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_document() {
        let toml = r#"
            [[devices]]
            id = "plc-1"
            name = "Line 1 PLC"
            protocol = "modbus-tcp"
            address = "10.0.0.5"
            port = 502

            [[tags]]
            path = "line1/temp"
            driver_id = "plc-1"
            address = "40001"
            poll_rate_ms = 1000
        "#;
        let built = Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap();
        let settings: Settings = built.try_deserialize().unwrap();
        assert_eq!(settings.devices.len(), 1);
        assert_eq!(settings.breaker.failure_threshold, 5);
        assert_eq!(settings.governor.max_workers, 8);
        assert_eq!(settings.device_models()[0].id, "plc-1");
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let toml = r#"
            devices = []
            totally_unknown_key = 1
        "#;
        let built = Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap();
        let result: Result<Settings, _> = built.try_deserialize();
        assert!(result.is_err());
    }

    #[test]
    fn routing_rule_quality_condition_parses() {
        let toml = r#"
            devices = []

            [[cloud.routing_rules]]
            name = "critical-to-primary"
            quality = "bad"
            connectors = ["primary"]
        "#;
        let built = Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap();
        let settings: Settings = built.try_deserialize().unwrap();
        let rules = settings.routing_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].condition.quality, Some(SpecQuality::Bad));
    }
}
