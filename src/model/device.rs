//! Device identity and state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A protocol-specific configuration value. Kept permissive (a
/// duck-typed `map<string, any>`) at the `Device` level; each concrete
/// handler is responsible for parsing the subset of keys it understands
/// and rejecting unknown non-`extension` keys at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
}

impl ConfigValue {
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            ConfigValue::UInt(u) => u8::try_from(*u).ok(),
            ConfigValue::Int(i) => u8::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::UInt(u) => Some(*u),
            ConfigValue::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }
}

pub type DeviceConfig = HashMap<String, ConfigValue>;

/// Identity of a device (immutable once registered).
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub address: String,
    pub port: u16,
    pub config: DeviceConfig,
}

/// `Device` connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl DeviceStatus {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }
}

/// Mutable runtime state for a device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub status: DeviceStatus,
    pub connection_time: Option<u64>,
    pub last_error: Option<String>,
    pub total_reads: u64,
    pub total_writes: u64,
    pub total_errors: u64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            status: DeviceStatus::Disconnected,
            connection_time: None,
            last_error: None,
            total_reads: 0,
            total_writes: 0,
            total_errors: 0,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct DeviceEntry {
    device: Device,
    state: RwLock<DeviceState>,
}

/// Thread-safe registry of devices. Device state is guarded
/// by a per-device lock; readers use a read-guard and never block a
/// concurrent reader, only a concurrent mutation.
#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Arc<DashMap<String, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(DashMap::new()),
        }
    }

    /// Register a device. A device is created once and lives until
    /// explicitly removed; re-registering the same id replaces
    /// identity but resets state to `Disconnected`.
    pub fn register(&self, device: Device) {
        let id = device.id.clone();
        self.devices.insert(
            id,
            DeviceEntry {
                device,
                state: RwLock::new(DeviceState::default()),
            },
        );
    }

    pub fn remove(&self, id: &str) -> bool {
        self.devices.remove(id).is_some()
    }

    pub fn get_device(&self, id: &str) -> Option<Device> {
        self.devices.get(id).map(|e| e.device.clone())
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.iter().map(|e| e.device.clone()).collect()
    }

    pub fn get_state(&self, id: &str) -> Option<DeviceState> {
        self.devices.get(id).map(|e| e.state.read().clone())
    }

    /// Attempt a status transition, rejecting illegal ones per the §4.3
    /// state machine. Returns `false` (no-op) on an illegal transition.
    pub fn transition(&self, id: &str, next: DeviceStatus) -> bool {
        let Some(entry) = self.devices.get(id) else {
            return false;
        };
        let mut state = entry.state.write();
        if !state.status.can_transition_to(next) {
            return false;
        }
        state.status = next;
        if next == DeviceStatus::Connected {
            state.connection_time = Some(now_millis());
        }
        if next == DeviceStatus::Disconnected {
            state.connection_time = None;
        }
        true
    }

    pub fn record_error(&self, id: &str, message: impl Into<String>) {
        if let Some(entry) = self.devices.get(id) {
            let mut state = entry.state.write();
            state.last_error = Some(message.into());
            state.total_errors += 1;
        }
    }

    pub fn record_read(&self, id: &str) {
        if let Some(entry) = self.devices.get(id) {
            entry.state.write().total_reads += 1;
        }
    }

    pub fn record_write(&self, id: &str) {
        if let Some(entry) = self.devices.get(id) {
            entry.state.write().total_writes += 1;
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            name: format!("Device {id}"),
            protocol: "modbus-tcp".to_string(),
            address: "127.0.0.1".to_string(),
            port: 502,
            config: HashMap::from([("unit_id".to_string(), ConfigValue::UInt(1))]),
        }
    }

    #[test]
    fn register_and_read_back() {
        let registry = DeviceRegistry::new();
        registry.register(sample_device("d1"));
        let device = registry.get_device("d1").expect("device");
        assert_eq!(device.port, 502);
        assert_eq!(registry.list_devices().len(), 1);
    }

    #[test]
    fn legal_transitions_succeed_illegal_are_rejected() {
        let registry = DeviceRegistry::new();
        registry.register(sample_device("d1"));

        assert!(registry.transition("d1", DeviceStatus::Connecting));
        assert!(registry.transition("d1", DeviceStatus::Connected));
        assert!(registry.get_state("d1").unwrap().connection_time.is_some());

        // Connected -> Connecting directly is not a legal edge.
        assert!(!registry.transition("d1", DeviceStatus::Connecting));
        assert_eq!(
            registry.get_state("d1").unwrap().status,
            DeviceStatus::Connected
        );

        assert!(registry.transition("d1", DeviceStatus::Error));
        assert!(registry.transition("d1", DeviceStatus::Connecting));
    }

    #[test]
    fn record_error_increments_counter_and_stores_message() {
        let registry = DeviceRegistry::new();
        registry.register(sample_device("d1"));
        registry.record_error("d1", "timeout");
        let state = registry.get_state("d1").unwrap();
        assert_eq!(state.total_errors, 1);
        assert_eq!(state.last_error.as_deref(), Some("timeout"));
    }
}
