//! The protocol handler abstraction: a uniform contract every concrete
//! protocol implementation (Modbus TCP, OPC UA, ...) honors so the rest
//! of the gateway can treat devices polymorphically.

use std::any::Any;
use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::{Context, ContextError};
use crate::model::device::Device;
use crate::tags::structures::{Tag, TagValue};

/// Errors a handler operation can produce.
#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("ping failed: {0}")]
    PingFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("tag is not writable")]
    NotWritable,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("device not connected")]
    NotConnected,
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl crate::breaker::BreakerFailure for HandlerError {
    /// Validation errors (`NotWritable`, `InvalidAddress`, ...) never
    /// reached the wire, so they don't count against the breaker;
    /// transient I/O errors do.
    fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            HandlerError::Timeout
                | HandlerError::ConnectFailed(_)
                | HandlerError::PingFailed(_)
                | HandlerError::ReadFailed(_)
                | HandlerError::WriteFailed(_)
        )
    }
}

impl From<ContextError> for HandlerError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::Cancelled => HandlerError::Cancelled,
            ContextError::DeadlineExceeded => HandlerError::Timeout,
        }
    }
}

pub type DriverResult<T> = Result<T, HandlerError>;

/// Vendor/model/firmware info (`get_device_info`).
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub vendor: String,
    pub model: String,
    pub firmware: String,
    pub capabilities: Vec<String>,
}

/// Health snapshot (`get_diagnostics`).
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub is_healthy: bool,
    pub last_communication: Option<u64>,
    pub connection_uptime_ms: Option<u64>,
    pub error_counts: u64,
}

/// The core trait every concrete device protocol handler implements.
/// Every network-bound operation accepts a `Context` and must return
/// promptly once it is cancelled.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// Protocol tag this handler serves (matches `Device::protocol`).
    fn protocol(&self) -> &'static str;

    /// Connect to the underlying device. Idempotent when already
    /// connected.
    async fn connect(&self, ctx: &Context, device: &Device) -> DriverResult<()>;

    /// Disconnect from the underlying device. Never fails; idempotent.
    async fn disconnect(&self, device: &Device);

    /// Non-blocking connection check.
    async fn is_connected(&self, device: &Device) -> bool;

    /// Liveness check.
    async fn ping(&self, ctx: &Context, device: &Device) -> DriverResult<()>;

    /// Read a single tag.
    async fn read_tag(&self, ctx: &Context, device: &Device, tag: &Tag) -> DriverResult<TagValue>;

    /// Read a batch of tags. MUST be at least as efficient as parallel
    /// `read_tag` calls and MAY coalesce adjacent addresses.
    async fn read_multiple_tags(
        &self,
        ctx: &Context,
        device: &Device,
        tags: &[Tag],
    ) -> HashMap<String, DriverResult<TagValue>>;

    /// Write a single tag.
    async fn write_tag(
        &self,
        ctx: &Context,
        device: &Device,
        tag: &Tag,
        value: TagValue,
    ) -> DriverResult<()>;

    async fn get_device_info(&self, ctx: &Context, device: &Device) -> DriverResult<DeviceInfo>;

    async fn get_diagnostics(&self, device: &Device) -> Diagnostics;

    /// Bounded by `ctx` cancellation.
    async fn discover_devices(&self, ctx: &Context, cidr_or_range: &str) -> DriverResult<Vec<Device>>;

    /// Enable downcasting to a concrete handler type, used by callers
    /// that need to expose protocol-specific operations.
    fn as_any(&self) -> &dyn Any;
}
