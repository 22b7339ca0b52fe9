//! Concrete Modbus TCP handler. Framing, address-class
//! parsing, function-code selection and multi-register encoding follow
//! the MBAP layout directly; connection management (one TCP session per
//! device, lazily established, reconnected on failure) follows the
//! per-device session-cache pattern used for the OPC UA client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::context::Context;
use crate::model::device::Device;
use crate::tags::structures::{Quality, Tag, TagValue, ValueVariant};

use super::traits::{DeviceHandler, DeviceInfo, Diagnostics, DriverResult, HandlerError};

/// `0xxxx` / `1xxxx` / `3xxxx` / `4xxxx` addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressClass {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl AddressClass {
    fn read_function_code(self) -> u8 {
        match self {
            AddressClass::Coil => 0x01,
            AddressClass::DiscreteInput => 0x02,
            AddressClass::InputRegister => 0x04,
            AddressClass::HoldingRegister => 0x03,
        }
    }

    fn is_writable(self) -> bool {
        matches!(self, AddressClass::Coil | AddressClass::HoldingRegister)
    }

    /// Modbus per-request maximum for this area.
    fn max_request_count(self) -> u16 {
        match self {
            AddressClass::Coil | AddressClass::DiscreteInput => 2000,
            AddressClass::InputRegister | AddressClass::HoldingRegister => 125,
        }
    }
}

/// Low-word-first vs. high-word-first encoding of multi-register scalars
/// `word_order` is required per device; there is no implicit default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WordOrder {
    Big,
    Little,
}

fn word_order(device: &Device) -> Result<WordOrder, HandlerError> {
    match device.config.get("word_order").and_then(|v| v.as_str()) {
        Some("big") => Ok(WordOrder::Big),
        Some("little") => Ok(WordOrder::Little),
        Some(other) => Err(HandlerError::InvalidAddress(format!(
            "unrecognized word_order '{other}', expected 'big' or 'little'"
        ))),
        None => Err(HandlerError::InvalidAddress(
            "device config is missing required 'word_order'".into(),
        )),
    }
}

fn unit_id(device: &Device) -> u8 {
    device.config.get("unit_id").and_then(|v| v.as_u8()).unwrap_or(1)
}

fn config_millis(device: &Device, key: &str, default: u64) -> Duration {
    Duration::from_millis(device.config.get(key).and_then(|v| v.as_u64()).unwrap_or(default))
}

fn coalesce_gap(device: &Device) -> u16 {
    device
        .config
        .get("coalesce_gap")
        .and_then(|v| v.as_u64())
        .map(|v| v as u16)
        .unwrap_or(8)
}

/// Parse a decimal address string into its class and zero-based PDU
/// address. `40050` -> `(HoldingRegister, 49)`.
fn parse_address(addr: &str) -> Result<(AddressClass, u16), HandlerError> {
    let mut chars = addr.chars();
    let class_digit = chars
        .next()
        .ok_or_else(|| HandlerError::InvalidAddress("empty address".into()))?;
    let class = match class_digit {
        '0' => AddressClass::Coil,
        '1' => AddressClass::DiscreteInput,
        '3' => AddressClass::InputRegister,
        '4' => AddressClass::HoldingRegister,
        _ => {
            return Err(HandlerError::InvalidAddress(format!(
                "'{addr}' does not start with a valid area digit (0/1/3/4)"
            )))
        }
    };
    let rest = chars.as_str();
    let element: u32 = rest
        .parse()
        .map_err(|_| HandlerError::InvalidAddress(format!("'{addr}' is not numeric")))?;
    if element == 0 {
        return Err(HandlerError::InvalidAddress(format!(
            "'{addr}' has element number 0, addresses are 1-based"
        )));
    }
    let pdu = u16::try_from(element - 1)
        .map_err(|_| HandlerError::InvalidAddress(format!("'{addr}' is out of range")))?;
    Ok((class, pdu))
}

/// Registers needed to hold `variant`.
fn register_count(variant: &ValueVariant) -> Result<u16, HandlerError> {
    match variant {
        ValueVariant::Bool(_) | ValueVariant::I16(_) | ValueVariant::U16(_) => Ok(1),
        ValueVariant::I32(_) | ValueVariant::U32(_) | ValueVariant::F32(_) => Ok(2),
        ValueVariant::I64(_) | ValueVariant::F64(_) => Ok(4),
        ValueVariant::Null => Ok(1),
        ValueVariant::String(_) => Err(HandlerError::Unsupported(
            "string values are not representable over Modbus registers".into(),
        )),
    }
}

fn encode_registers(variant: &ValueVariant, order: WordOrder) -> Result<Vec<u16>, HandlerError> {
    match variant {
        ValueVariant::Bool(b) => Ok(vec![if *b { 0xFF00 } else { 0x0000 }]),
        ValueVariant::I16(v) => Ok(vec![*v as u16]),
        ValueVariant::U16(v) => Ok(vec![*v]),
        ValueVariant::I32(v) => Ok(split_words(*v as u32, order)),
        ValueVariant::U32(v) => Ok(split_words(*v, order)),
        ValueVariant::F32(v) => Ok(split_words(v.to_bits(), order)),
        ValueVariant::I64(v) => Ok(split_words64(*v as u64, order)),
        ValueVariant::F64(v) => Ok(split_words64(v.to_bits(), order)),
        ValueVariant::Null => Ok(vec![0]),
        ValueVariant::String(_) => Err(HandlerError::Unsupported(
            "string values are not representable over Modbus registers".into(),
        )),
    }
}

fn split_words(value: u32, order: WordOrder) -> Vec<u16> {
    let high = (value >> 16) as u16;
    let low = (value & 0xFFFF) as u16;
    match order {
        WordOrder::Big => vec![high, low],
        WordOrder::Little => vec![low, high],
    }
}

fn split_words64(value: u64, order: WordOrder) -> Vec<u16> {
    let words = [
        (value >> 48) as u16,
        (value >> 32) as u16,
        (value >> 16) as u16,
        value as u16,
    ];
    match order {
        WordOrder::Big => words.to_vec(),
        WordOrder::Little => words.into_iter().rev().collect(),
    }
}

fn join_words(words: &[u16], order: WordOrder) -> u64 {
    let ordered: Vec<u16> = match order {
        WordOrder::Big => words.to_vec(),
        WordOrder::Little => words.iter().rev().copied().collect(),
    };
    ordered
        .iter()
        .fold(0u64, |acc, w| (acc << 16) | (*w as u64))
}

/// Decode `count` consecutive register words (already ordered low-address
/// first as returned on the wire) into the value variant the tag expects.
fn decode_registers(
    words: &[u16],
    expected: &ValueVariant,
    order: WordOrder,
) -> Result<ValueVariant, HandlerError> {
    match expected {
        ValueVariant::Bool(_) => Ok(ValueVariant::Bool(words.first().copied().unwrap_or(0) != 0)),
        ValueVariant::I16(_) => Ok(ValueVariant::I16(words.first().copied().unwrap_or(0) as i16)),
        ValueVariant::U16(_) | ValueVariant::Null => {
            Ok(ValueVariant::U16(words.first().copied().unwrap_or(0)))
        }
        ValueVariant::I32(_) => Ok(ValueVariant::I32(join_words(words, order) as u32 as i32)),
        ValueVariant::U32(_) => Ok(ValueVariant::U32(join_words(words, order) as u32)),
        ValueVariant::F32(_) => Ok(ValueVariant::F32(f32::from_bits(join_words(words, order) as u32))),
        ValueVariant::I64(_) => Ok(ValueVariant::I64(join_words(words, order) as i64)),
        ValueVariant::F64(_) => Ok(ValueVariant::F64(f64::from_bits(join_words(words, order)))),
        ValueVariant::String(_) => Err(HandlerError::Unsupported(
            "string values are not representable over Modbus registers".into(),
        )),
    }
}

struct ModbusConnection {
    stream: TcpStream,
    next_transaction_id: u16,
}

/// Distinguishes failures that require dropping the TCP session (framing
/// desync, I/O error) from protocol-level exceptions where the session
/// itself is still good.
enum TransactFailure {
    Reconnect(String),
    Protocol(String),
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

/// One chunk of a coalesced read: a contiguous run of registers/coils
/// covering one or more tags.
struct ReadChunk {
    class: AddressClass,
    start: u16,
    count: u16,
    /// (tag index in the original request order, offset within the chunk)
    members: Vec<(usize, u16)>,
}

/// Modbus TCP protocol handler. One TCP session is kept per device,
/// created lazily on first use and torn down on I/O error so the next
/// operation reconnects.
pub struct ModbusTcpHandler {
    connections: DashMap<String, Arc<AsyncMutex<Option<ModbusConnection>>>>,
    diagnostics: DashMap<String, DiagnosticCounters>,
}

impl ModbusTcpHandler {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            diagnostics: DashMap::new(),
        }
    }

    fn diagnostics_for(&self, device_id: &str) -> dashmap::mapref::one::Ref<'_, String, DiagnosticCounters> {
        self.diagnostics.entry(device_id.to_string()).or_default();
        self.diagnostics.get(device_id).expect("just inserted")
    }

    fn note_success(&self, device_id: &str) {
        self.diagnostics_for(device_id)
            .last_communication
            .store(now_millis(), Ordering::Relaxed);
    }

    fn note_failure(&self, device_id: &str) {
        let counters = self.diagnostics_for(device_id);
        counters.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Clones the per-device connection handle out of the map and drops
    /// the DashMap shard guard before returning, so callers never hold a
    /// shard lock across an `.await` (a second device lookup on the same
    /// shard — from a concurrently-running coalesced chunk — would
    /// otherwise deadlock against it).
    fn connection_handle(&self, device_id: &str) -> Arc<AsyncMutex<Option<ModbusConnection>>> {
        self.connections
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    async fn ensure_connected(&self, ctx: &Context, device: &Device) -> DriverResult<()> {
        let handle = self.connection_handle(&device.id);
        let mut guard = handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let addr: SocketAddr = format!("{}:{}", device.address, device.port)
            .parse()
            .map_err(|e| HandlerError::ConnectFailed(format!("invalid address: {e}")))?;
        let timeout = config_millis(device, "connect_timeout_ms", 5000);
        let stream = ctx
            .run(timeout, TcpStream::connect(addr))
            .await
            .map_err(HandlerError::from)?
            .map_err(|e| HandlerError::ConnectFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| HandlerError::ConnectFailed(e.to_string()))?;
        *guard = Some(ModbusConnection {
            stream,
            next_transaction_id: 1,
        });
        debug!(device_id = %device.id, "modbus: connected");
        Ok(())
    }

    fn drop_connection(&self, device_id: &str) {
        let handle = match self.connections.get(device_id) {
            Some(entry) => entry.clone(),
            None => return,
        };
        if let Ok(mut guard) = handle.try_lock() {
            *guard = None;
        }
    }

    /// Send one PDU to `device` and return the response PDU bytes
    /// (without the MBAP header).
    async fn transact(
        &self,
        ctx: &Context,
        device: &Device,
        pdu: &[u8],
    ) -> DriverResult<Vec<u8>> {
        self.ensure_connected(ctx, device).await?;

        // Clone the connection handle and drop the DashMap shard guard
        // before taking the connection's own lock and awaiting on it.
        // `read_multiple_tags` runs one `transact` per coalesced chunk
        // concurrently via `join_all` on the same task; holding a shard
        // `Ref` across the I/O await below would deadlock the moment a
        // second chunk's `ensure_connected` needed a write lock on the
        // same shard.
        let handle = self
            .connections
            .get(&device.id)
            .map(|entry| entry.clone())
            .ok_or(HandlerError::NotConnected)?;

        let outcome: Result<Vec<u8>, TransactFailure> = {
            let mut guard = handle.lock().await;
            let conn = guard.as_mut().ok_or(HandlerError::NotConnected)?;

            let transaction_id = conn.next_transaction_id;
            conn.next_transaction_id = conn.next_transaction_id.wrapping_add(1).max(1);

            let length = (pdu.len() + 1) as u16;
            let unit = unit_id(device);
            let mut frame = Vec::with_capacity(7 + pdu.len());
            frame.push((transaction_id >> 8) as u8);
            frame.push((transaction_id & 0xFF) as u8);
            frame.push(0x00);
            frame.push(0x00);
            frame.push((length >> 8) as u8);
            frame.push((length & 0xFF) as u8);
            frame.push(unit);
            frame.extend_from_slice(pdu);

            let read_timeout = config_millis(device, "read_timeout_ms", 3000);
            let io_result = ctx
                .run(read_timeout, async {
                    conn.stream.write_all(&frame).await?;
                    let mut header = [0u8; 7];
                    conn.stream.read_exact(&mut header).await?;
                    let resp_len = ((header[4] as usize) << 8 | header[5] as usize).saturating_sub(1);
                    let mut body = vec![0u8; resp_len];
                    conn.stream.read_exact(&mut body).await?;
                    Ok::<_, std::io::Error>((transaction_id, u16::from_be_bytes([header[0], header[1]]), body))
                })
                .await
                .map_err(HandlerError::from)?;

            match io_result {
                Ok((sent_id, resp_id, body)) if sent_id != resp_id => Err(TransactFailure::Reconnect(format!(
                    "transaction id mismatch: sent {sent_id}, got {resp_id}"
                ))),
                Ok((_, _, body)) if !body.is_empty() && body[0] & 0x80 != 0 => {
                    let exception = body.get(1).copied().unwrap_or(0);
                    Err(TransactFailure::Protocol(format!("modbus exception 0x{exception:02X}")))
                }
                Ok((_, _, body)) => Ok(body),
                Err(io_err) => Err(TransactFailure::Reconnect(io_err.to_string())),
            }
        };

        match outcome {
            Ok(body) => {
                self.note_success(&device.id);
                Ok(body)
            }
            Err(TransactFailure::Reconnect(msg)) => {
                self.drop_connection(&device.id);
                self.note_failure(&device.id);
                Err(HandlerError::ReadFailed(msg))
            }
            Err(TransactFailure::Protocol(msg)) => {
                self.note_failure(&device.id);
                Err(HandlerError::ReadFailed(msg))
            }
        }
    }

    fn build_chunks(&self, device: &Device, tags: &[Tag]) -> DriverResult<Vec<ReadChunk>> {
        let gap = coalesce_gap(device);
        let mut parsed = Vec::with_capacity(tags.len());
        for (idx, tag) in tags.iter().enumerate() {
            let (class, pdu) = parse_address(&tag.driver_address)?;
            let count = register_count(&tag.value.value)?;
            parsed.push((idx, class, pdu, count));
        }
        parsed.sort_by_key(|(_, class, pdu, _)| (*class as u8, *pdu));

        let mut chunks: Vec<ReadChunk> = Vec::new();
        for (idx, class, pdu, count) in parsed {
            let end = pdu + count;
            if let Some(last) = chunks.last_mut() {
                let chunk_end = last.start + last.count;
                let extended_end = end.max(chunk_end);
                if last.class == class
                    && pdu >= last.start
                    && pdu.saturating_sub(chunk_end) <= gap
                    && extended_end - last.start <= class.max_request_count()
                {
                    last.count = extended_end - last.start;
                    last.members.push((idx, pdu - last.start));
                    continue;
                }
            }
            chunks.push(ReadChunk {
                class,
                start: pdu,
                count,
                members: vec![(idx, 0)],
            });
        }
        Ok(chunks)
    }

    async fn read_chunk(
        &self,
        ctx: &Context,
        device: &Device,
        chunk: &ReadChunk,
    ) -> DriverResult<Vec<u16>> {
        let pdu = [
            chunk.class.read_function_code(),
            (chunk.start >> 8) as u8,
            (chunk.start & 0xFF) as u8,
            (chunk.count >> 8) as u8,
            (chunk.count & 0xFF) as u8,
        ];
        let body = self.transact(ctx, device, &pdu).await?;
        if body.len() < 2 {
            return Err(HandlerError::ReadFailed("response too short".into()));
        }
        let byte_count = body[1] as usize;
        let data = &body[2..];
        if data.len() < byte_count {
            return Err(HandlerError::ReadFailed("response truncated".into()));
        }
        match chunk.class {
            AddressClass::Coil | AddressClass::DiscreteInput => {
                let mut bits = Vec::with_capacity(chunk.count as usize);
                for i in 0..chunk.count as usize {
                    let byte = data[i / 8];
                    bits.push(if byte & (1 << (i % 8)) != 0 { 1 } else { 0 });
                }
                Ok(bits)
            }
            AddressClass::InputRegister | AddressClass::HoldingRegister => {
                let mut words = Vec::with_capacity(byte_count / 2);
                for i in 0..(byte_count / 2) {
                    words.push(u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]));
                }
                Ok(words)
            }
        }
    }
}

impl Default for ModbusTcpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceHandler for ModbusTcpHandler {
    fn protocol(&self) -> &'static str {
        "modbus-tcp"
    }

    async fn connect(&self, ctx: &Context, device: &Device) -> DriverResult<()> {
        self.ensure_connected(ctx, device).await
    }

    async fn disconnect(&self, device: &Device) {
        self.drop_connection(&device.id);
    }

    async fn is_connected(&self, device: &Device) -> bool {
        let handle = match self.connections.get(&device.id) {
            Some(entry) => entry.clone(),
            None => return false,
        };
        handle.lock().await.is_some()
    }

    async fn ping(&self, ctx: &Context, device: &Device) -> DriverResult<()> {
        let pdu = [0x03, 0x00, 0x00, 0x00, 0x01];
        self.transact(ctx, device, &pdu)
            .await
            .map(|_| ())
            .map_err(|e| HandlerError::PingFailed(e.to_string()))
    }

    async fn read_tag(&self, ctx: &Context, device: &Device, tag: &Tag) -> DriverResult<TagValue> {
        let (class, pdu) = parse_address(&tag.driver_address)?;
        let count = register_count(&tag.value.value)?;
        let order = word_order(device)?;
        let chunk = ReadChunk {
            class,
            start: pdu,
            count,
            members: vec![(0, 0)],
        };
        let words = self.read_chunk(ctx, device, &chunk).await?;
        let variant = if matches!(class, AddressClass::Coil | AddressClass::DiscreteInput) {
            ValueVariant::Bool(words.first().copied().unwrap_or(0) != 0)
        } else {
            decode_registers(&words, &tag.value.value, order)?
        };
        Ok(TagValue::new(variant, Quality::Good))
    }

    async fn read_multiple_tags(
        &self,
        ctx: &Context,
        device: &Device,
        tags: &[Tag],
    ) -> HashMap<String, DriverResult<TagValue>> {
        let mut results = HashMap::with_capacity(tags.len());
        let order = match word_order(device) {
            Ok(o) => o,
            Err(e) => {
                for tag in tags {
                    results.insert(tag.path.clone(), Err(e.clone()));
                }
                return results;
            }
        };
        let chunks = match self.build_chunks(device, tags) {
            Ok(c) => c,
            Err(e) => {
                for tag in tags {
                    results.insert(tag.path.clone(), Err(e.clone()));
                }
                return results;
            }
        };

        let reads = chunks.iter().map(|chunk| self.read_chunk(ctx, device, chunk));
        let outcomes = futures::future::join_all(reads).await;

        for (chunk, outcome) in chunks.iter().zip(outcomes) {
            match outcome {
                Ok(words) => {
                    for &(tag_idx, offset) in &chunk.members {
                        let tag = &tags[tag_idx];
                        let value = if matches!(chunk.class, AddressClass::Coil | AddressClass::DiscreteInput) {
                            ValueVariant::Bool(words.get(offset as usize).copied().unwrap_or(0) != 0)
                        } else {
                            let count = register_count(&tag.value.value).unwrap_or(1) as usize;
                            let start = offset as usize;
                            match decode_registers(
                                words.get(start..start + count).unwrap_or(&[]),
                                &tag.value.value,
                                order,
                            ) {
                                Ok(v) => v,
                                Err(e) => {
                                    results.insert(tag.path.clone(), Err(e));
                                    continue;
                                }
                            }
                        };
                        results.insert(tag.path.clone(), Ok(TagValue::new(value, Quality::Good)));
                    }
                }
                Err(e) => {
                    for &(tag_idx, _) in &chunk.members {
                        results.insert(tags[tag_idx].path.clone(), Err(e.clone()));
                    }
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
        let (class, pdu) = parse_address(&tag.driver_address)?;
        if !class.is_writable() {
            return Err(HandlerError::NotWritable);
        }
        let order = word_order(device)?;
        let words = encode_registers(&value.value, order)?;

        let pdu_bytes = if words.len() == 1 {
            match class {
                AddressClass::Coil => {
                    vec![0x05, (pdu >> 8) as u8, (pdu & 0xFF) as u8, (words[0] >> 8) as u8, (words[0] & 0xFF) as u8]
                }
                AddressClass::HoldingRegister => {
                    vec![0x06, (pdu >> 8) as u8, (pdu & 0xFF) as u8, (words[0] >> 8) as u8, (words[0] & 0xFF) as u8]
                }
                _ => unreachable!("is_writable guards this"),
            }
        } else {
            let function = match class {
                AddressClass::Coil => 0x0F,
                AddressClass::HoldingRegister => 0x10,
                _ => unreachable!("is_writable guards this"),
            };
            let mut bytes = vec![
                function,
                (pdu >> 8) as u8,
                (pdu & 0xFF) as u8,
                (words.len() as u16 >> 8) as u8,
                (words.len() as u16 & 0xFF) as u8,
                (words.len() * 2) as u8,
            ];
            for w in &words {
                bytes.push((w >> 8) as u8);
                bytes.push((w & 0xFF) as u8);
            }
            bytes
        };

        self.transact(ctx, device, &pdu_bytes)
            .await
            .map(|_| ())
            .map_err(|e| HandlerError::WriteFailed(e.to_string()))
    }

    async fn get_device_info(&self, _ctx: &Context, _device: &Device) -> DriverResult<DeviceInfo> {
        // Read Device Identification (FC 0x2B/0x0E) is an optional Modbus
        // extension most field devices don't implement; report what we
        // know without probing for it.
        Ok(DeviceInfo {
            vendor: "unknown".into(),
            model: "unknown".into(),
            firmware: "unknown".into(),
            capabilities: vec!["modbus-tcp".into()],
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

    async fn discover_devices(&self, ctx: &Context, cidr_or_range: &str) -> DriverResult<Vec<Device>> {
        let candidates: Vec<&str> = cidr_or_range
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let probes = candidates.iter().map(|host| {
            let host = host.to_string();
            async move {
                let target = if host.contains(':') {
                    host.clone()
                } else {
                    format!("{host}:502")
                };
                let addr: SocketAddr = match target.parse() {
                    Ok(a) => a,
                    Err(_) => return None,
                };
                let probe = ctx.run(Duration::from_millis(500), TcpStream::connect(addr)).await;
                match probe {
                    Ok(Ok(_)) => Some((host, addr.port())),
                    _ => None,
                }
            }
        });

        let found: Vec<Device> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .map(|(host, port)| Device {
                id: format!("modbus-{host}"),
                name: format!("Discovered Modbus device at {host}"),
                protocol: "modbus-tcp".into(),
                address: host.split(':').next().unwrap_or(&host).to_string(),
                port,
                config: HashMap::new(),
            })
            .collect();

        if found.is_empty() {
            warn!(candidates = candidates.len(), "modbus discovery found no responsive hosts");
        }
        Ok(found)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_address_class() {
        assert_eq!(parse_address("00001").unwrap(), (AddressClass::Coil, 0));
        assert_eq!(parse_address("10001").unwrap(), (AddressClass::DiscreteInput, 0));
        assert_eq!(parse_address("30001").unwrap(), (AddressClass::InputRegister, 0));
        assert_eq!(parse_address("40001").unwrap(), (AddressClass::HoldingRegister, 0));
    }

    #[test]
    fn holding_register_40050_encodes_to_pdu_address_49() {
        assert_eq!(parse_address("40050").unwrap(), (AddressClass::HoldingRegister, 49));
    }

    #[test]
    fn rejects_non_numeric_and_zero_element() {
        assert!(parse_address("4abcd").is_err());
        assert!(parse_address("40000").is_err());
        assert!(parse_address("").is_err());
        assert!(parse_address("90001").is_err());
    }

    #[test]
    fn discrete_input_and_input_register_are_read_only() {
        assert!(!AddressClass::DiscreteInput.is_writable());
        assert!(!AddressClass::InputRegister.is_writable());
        assert!(AddressClass::Coil.is_writable());
        assert!(AddressClass::HoldingRegister.is_writable());
    }

    #[test]
    fn multi_register_round_trip_big_and_little_endian_words() {
        let value = ValueVariant::I32(-123456);
        for order in [WordOrder::Big, WordOrder::Little] {
            let words = encode_registers(&value, order).unwrap();
            assert_eq!(words.len(), 2);
            let decoded = decode_registers(&words, &value, order).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn f32_round_trips_through_register_pair() {
        let value = ValueVariant::F32(3.5);
        let words = encode_registers(&value, WordOrder::Big).unwrap();
        let decoded = decode_registers(&words, &value, WordOrder::Big).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn coalesces_adjacent_holding_registers_within_gap() {
        let device = Device {
            id: "d1".into(),
            name: "d1".into(),
            protocol: "modbus-tcp".into(),
            address: "127.0.0.1".into(),
            port: 502,
            config: HashMap::new(),
        };
        let handler = ModbusTcpHandler::new();
        let tags = vec![
            make_tag("t1", "40001"),
            make_tag("t2", "40003"),
            make_tag("t3", "40200"),
        ];
        let chunks = handler.build_chunks(&device, &tags).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].members.len(), 2);
        assert_eq!(chunks[1].members.len(), 1);
    }

    fn make_tag(path: &str, addr: &str) -> Tag {
        Tag {
            path: path.into(),
            value: TagValue::new(ValueVariant::U16(0), Quality::Initializing),
            driver_id: "d1".into(),
            driver_address: addr.into(),
            poll_rate_ms: 1000,
            metadata: Default::default(),
        }
    }
}
