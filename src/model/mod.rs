//! Device identity + state.

pub mod device;

pub use device::{Device, DeviceConfig, DeviceRegistry, DeviceState, DeviceStatus};
