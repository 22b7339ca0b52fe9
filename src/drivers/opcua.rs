//! Secondary protocol handler demonstrating the `DeviceHandler` contract
//! holds for more than Modbus: a thin wrapper over `async-opcua`'s
//! client. One handler instance serves many devices, keeping a session
//! per device id the way `ModbusTcpHandler` keeps a connection per
//! device id, with `&self` methods throughout so it satisfies
//! `Send + Sync` shared-handler dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use opcua::{
    client::Client,
    types::{DataValue, NodeId, ReadValueId, Variant, WriteValue},
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::context::Context;
use crate::model::device::Device;
use crate::tags::structures::{Quality, Tag, TagValue, ValueVariant};

use super::traits::{DeviceHandler, DeviceInfo, Diagnostics, DriverResult, HandlerError};

fn parse_node_id(node_id_str: &str) -> Result<NodeId, HandlerError> {
    let parts: Vec<&str> = node_id_str.split(';').collect();
    if parts.len() != 2 {
        return Err(HandlerError::InvalidAddress(format!(
            "invalid NodeId format: {node_id_str}"
        )));
    }
    let ns = parts[0]
        .trim_start_matches("ns=")
        .parse::<u16>()
        .map_err(|_| HandlerError::InvalidAddress(format!("invalid namespace in {node_id_str}")))?;
    let identifier = parts[1];
    if let Some(s) = identifier.strip_prefix("s=") {
        Ok(NodeId::new_string(ns, s.to_string()))
    } else if let Some(i) = identifier.strip_prefix("i=") {
        let numeric = i
            .parse::<u32>()
            .map_err(|_| HandlerError::InvalidAddress(format!("invalid numeric identifier in {node_id_str}")))?;
        Ok(NodeId::new_numeric(ns, numeric))
    } else {
        Err(HandlerError::InvalidAddress(format!(
            "unsupported NodeId identifier format: {identifier}"
        )))
    }
}

/// Convert an OPC-UA `DataValue` into our tag value, matching the
/// variant the tag already carries so multi-width integers don't widen
/// or narrow unexpectedly.
fn data_value_to_tag_value(dv: &DataValue, expected: &ValueVariant) -> TagValue {
    let quality = if dv.status_code().is_good() {
        Quality::Good
    } else {
        Quality::Bad
    };
    let timestamp = dv
        .source_timestamp()
        .or_else(|| dv.server_timestamp())
        .map(|dt| dt.as_chrono().timestamp_millis() as u64)
        .unwrap_or(0);

    let variant = match dv.value() {
        Some(v) => match (v, expected) {
            (Variant::Boolean(b), _) => ValueVariant::Bool(*b),
            (Variant::SByte(i), _) => ValueVariant::I16(*i as i16),
            (Variant::Byte(u), _) => ValueVariant::U16(*u as u16),
            (Variant::Int16(i), _) => ValueVariant::I16(*i),
            (Variant::UInt16(u), _) => ValueVariant::U16(*u),
            (Variant::Int32(i), _) => ValueVariant::I32(*i),
            (Variant::UInt32(u), _) => ValueVariant::U32(*u),
            (Variant::Int64(i), _) => ValueVariant::I64(*i),
            (Variant::UInt64(u), _) => ValueVariant::I64(*u as i64),
            (Variant::Float(f), _) => ValueVariant::F32(*f),
            (Variant::Double(d), _) => ValueVariant::F64(*d),
            (Variant::String(s), _) => ValueVariant::String(s.to_string()),
            _ => ValueVariant::Null,
        },
        None => ValueVariant::Null,
    };

    TagValue {
        value: variant,
        quality,
        timestamp,
    }
}

fn tag_value_to_variant(value: &ValueVariant) -> DriverResult<Variant> {
    match value {
        ValueVariant::Bool(b) => Ok(Variant::Boolean(*b)),
        ValueVariant::I16(i) => Ok(Variant::Int16(*i)),
        ValueVariant::U16(u) => Ok(Variant::UInt16(*u)),
        ValueVariant::I32(i) => Ok(Variant::Int32(*i)),
        ValueVariant::U32(u) => Ok(Variant::UInt32(*u)),
        ValueVariant::I64(i) => Ok(Variant::Int64(*i)),
        ValueVariant::F32(f) => Ok(Variant::Float(*f)),
        ValueVariant::F64(f) => Ok(Variant::Double(*f)),
        ValueVariant::String(s) => Ok(Variant::String(s.clone().into())),
        ValueVariant::Null => Err(HandlerError::WriteFailed("cannot write a null value".into())),
    }
}

fn endpoint_url(device: &Device) -> String {
    if device.address.starts_with("opc.tcp://") {
        device.address.clone()
    } else {
        format!("opc.tcp://{}:{}", device.address, device.port)
    }
}

struct DiagnosticCounters {
    last_communication: AtomicU64,
    error_count: AtomicU64,
}

impl Default for DiagnosticCounters {
    fn default() -> Self {
        Self {
            last_communication: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// OPC UA protocol handler. Keeps one client session per device id,
/// created lazily and dropped on failure so the next call reconnects.
pub struct OpcUaHandler {
    sessions: DashMap<String, AsyncMutex<Option<Client>>>,
    diagnostics: DashMap<String, DiagnosticCounters>,
}

impl OpcUaHandler {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            diagnostics: DashMap::new(),
        }
    }

    fn note_success(&self, device_id: &str) {
        self.diagnostics.entry(device_id.to_string()).or_default();
        if let Some(counters) = self.diagnostics.get(device_id) {
            counters.last_communication.store(now_millis(), Ordering::Relaxed);
        }
    }

    fn note_failure(&self, device_id: &str) {
        self.diagnostics.entry(device_id.to_string()).or_default();
        if let Some(counters) = self.diagnostics.get(device_id) {
            counters.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn ensure_connected(&self, device: &Device) -> DriverResult<()> {
        let entry = self
            .sessions
            .entry(device.id.clone())
            .or_insert_with(|| AsyncMutex::new(None));
        let mut guard = entry.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let url = endpoint_url(device);
        let client = Client::new(&url, None, None)
            .map_err(|e| HandlerError::ConnectFailed(e.to_string()))?;
        *guard = Some(client);
        debug!(device_id = %device.id, url = %url, "opcua: session established");
        Ok(())
    }

    fn drop_session(&self, device_id: &str) {
        if let Some(entry) = self.sessions.get(device_id) {
            if let Ok(mut guard) = entry.try_lock() {
                *guard = None;
            }
        }
    }
}

impl Default for OpcUaHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceHandler for OpcUaHandler {
    fn protocol(&self) -> &'static str {
        "opc-ua"
    }

    async fn connect(&self, _ctx: &Context, device: &Device) -> DriverResult<()> {
        self.ensure_connected(device).await
    }

    async fn disconnect(&self, device: &Device) {
        self.drop_session(&device.id);
    }

    async fn is_connected(&self, device: &Device) -> bool {
        match self.sessions.get(&device.id) {
            Some(entry) => entry.lock().await.is_some(),
            None => false,
        }
    }

    async fn ping(&self, ctx: &Context, device: &Device) -> DriverResult<()> {
        self.ensure_connected(device).await?;
        let entry = self.sessions.get(&device.id).ok_or(HandlerError::NotConnected)?;
        let read = {
            let mut guard = entry.lock().await;
            let client = guard.as_mut().ok_or(HandlerError::NotConnected)?;
            let node_id = NodeId::new_numeric(0, 2256); // ServerStatus
            let request = ReadValueId {
                node_id,
                attribute_id: 13,
                index_range: None,
                data_encoding: None,
            };
            ctx.run(std::time::Duration::from_secs(5), client.read(&[request], 0.0))
                .await
                .map_err(HandlerError::from)?
        };
        match read {
            Ok(results) if results.first().map(|r| r.status_code().is_good()).unwrap_or(false) => {
                self.note_success(&device.id);
                Ok(())
            }
            Ok(_) => {
                self.note_failure(&device.id);
                Err(HandlerError::PingFailed("bad status code from ServerStatus read".into()))
            }
            Err(e) => {
                self.drop_session(&device.id);
                self.note_failure(&device.id);
                Err(HandlerError::PingFailed(e.to_string()))
            }
        }
    }

    async fn read_tag(&self, ctx: &Context, device: &Device, tag: &Tag) -> DriverResult<TagValue> {
        let mut result = self.read_multiple_tags(ctx, device, std::slice::from_ref(tag)).await;
        result
            .remove(&tag.path)
            .unwrap_or_else(|| Err(HandlerError::ReadFailed("no result for tag".into())))
    }

    async fn read_multiple_tags(
        &self,
        ctx: &Context,
        device: &Device,
        tags: &[Tag],
    ) -> HashMap<String, DriverResult<TagValue>> {
        let mut results = HashMap::with_capacity(tags.len());
        if let Err(e) = self.ensure_connected(device).await {
            for tag in tags {
                results.insert(tag.path.clone(), Err(e.clone()));
            }
            return results;
        }

        let entry = match self.sessions.get(&device.id) {
            Some(e) => e,
            None => {
                for tag in tags {
                    results.insert(tag.path.clone(), Err(HandlerError::NotConnected));
                }
                return results;
            }
        };

        let mut node_ids = Vec::with_capacity(tags.len());
        for tag in tags {
            match parse_node_id(&tag.driver_address) {
                Ok(node_id) => node_ids.push(node_id),
                Err(e) => {
                    results.insert(tag.path.clone(), Err(e));
                }
            }
        }
        if node_ids.len() != tags.len() {
            return results;
        }

        let requests: Vec<ReadValueId> = node_ids
            .iter()
            .map(|node_id| ReadValueId {
                node_id: node_id.clone(),
                attribute_id: 13,
                index_range: None,
                data_encoding: None,
            })
            .collect();

        let read_outcome = {
            let mut guard = entry.lock().await;
            let client = match guard.as_mut().ok_or(HandlerError::NotConnected) {
                Ok(c) => c,
                Err(e) => {
                    for tag in tags {
                        results.insert(tag.path.clone(), Err(e.clone()));
                    }
                    return results;
                }
            };
            ctx.run(std::time::Duration::from_secs(10), client.read(&requests, 0.0))
                .await
                .map_err(HandlerError::from)
        };

        match read_outcome {
            Ok(Ok(values)) => {
                self.note_success(&device.id);
                for (tag, value) in tags.iter().zip(values.iter()) {
                    results.insert(tag.path.clone(), Ok(data_value_to_tag_value(value, &tag.value.value)));
                }
            }
            Ok(Err(e)) => {
                self.drop_session(&device.id);
                self.note_failure(&device.id);
                for tag in tags {
                    results.insert(tag.path.clone(), Err(HandlerError::ReadFailed(e.to_string())));
                }
            }
            Err(e) => {
                self.note_failure(&device.id);
                for tag in tags {
                    results.insert(tag.path.clone(), Err(e.clone()));
                }
            }
        }
        results
    }

    async fn write_tag(
        &self,
        ctx: &Context,
        device: &Device,
        tag: &Tag,
        value: TagValue,
    ) -> DriverResult<()> {
        if !tag.metadata.writable {
            return Err(HandlerError::NotWritable);
        }
        self.ensure_connected(device).await?;
        let entry = self.sessions.get(&device.id).ok_or(HandlerError::NotConnected)?;
        let node_id = parse_node_id(&tag.driver_address)?;
        let variant = tag_value_to_variant(&value.value)?;

        let write_outcome = {
            let mut guard = entry.lock().await;
            let client = guard.as_mut().ok_or(HandlerError::NotConnected)?;
            let write_value = WriteValue {
                node_id,
                attribute_id: 13,
                index_range: None,
                value: DataValue::new_now(variant),
            };
            ctx.run(std::time::Duration::from_secs(10), client.write(&[write_value]))
                .await
                .map_err(HandlerError::from)?
        };

        match write_outcome {
            Ok(codes) if codes.first().map(|c| c.is_good()).unwrap_or(false) => {
                self.note_success(&device.id);
                Ok(())
            }
            Ok(_) => {
                self.note_failure(&device.id);
                Err(HandlerError::WriteFailed("server returned a bad status code".into()))
            }
            Err(e) => {
                self.drop_session(&device.id);
                self.note_failure(&device.id);
                Err(HandlerError::WriteFailed(e.to_string()))
            }
        }
    }

    async fn get_device_info(&self, _ctx: &Context, _device: &Device) -> DriverResult<DeviceInfo> {
        Ok(DeviceInfo {
            vendor: "unknown".into(),
            model: "unknown".into(),
            firmware: "unknown".into(),
            capabilities: vec!["opc-ua".into()],
        })
    }

    async fn get_diagnostics(&self, device: &Device) -> Diagnostics {
        let connected = self.is_connected(device).await;
        match self.diagnostics.get(&device.id) {
            Some(counters) => {
                let last = counters.last_communication.load(Ordering::Relaxed);
                Diagnostics {
                    is_healthy: connected && counters.error_count.load(Ordering::Relaxed) == 0,
                    last_communication: if last == 0 { None } else { Some(last) },
                    connection_uptime_ms: None,
                    error_counts: counters.error_count.load(Ordering::Relaxed),
                }
            }
            None => Diagnostics {
                is_healthy: connected,
                ..Default::default()
            },
        }
    }

    async fn discover_devices(&self, _ctx: &Context, _cidr_or_range: &str) -> DriverResult<Vec<Device>> {
        Err(HandlerError::Unsupported(
            "opc-ua discovery requires a local discovery server, not implemented".into(),
        ))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_numeric_node_ids() {
        let s = parse_node_id("ns=2;s=MyTag").unwrap();
        assert_eq!(s, NodeId::new_string(2, "MyTag".to_string()));
        let n = parse_node_id("ns=3;i=42").unwrap();
        assert_eq!(n, NodeId::new_numeric(3, 42));
    }

    #[test]
    fn rejects_malformed_node_ids() {
        assert!(parse_node_id("nope").is_err());
        assert!(parse_node_id("ns=x;s=Tag").is_err());
        assert!(parse_node_id("ns=2;x=Tag").is_err());
    }

    #[test]
    fn endpoint_url_defaults_to_opc_tcp_scheme() {
        let device = Device {
            id: "d1".into(),
            name: "d1".into(),
            protocol: "opc-ua".into(),
            address: "10.0.0.5".into(),
            port: 4840,
            config: HashMap::new(),
        };
        assert_eq!(endpoint_url(&device), "opc.tcp://10.0.0.5:4840");
    }
}
