//! Tag value types.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Quality of a tag's last observed value. `Good`/`Bad`/`Uncertain` are
/// the three states callers generally care about; the remaining variants are
/// finer-grained refinements that
/// `as_spec_quality` collapses back onto the three-state model so
/// handler/cloud-manager code that only cares about the three-state model
/// doesn't have to match on every reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    Initializing,
    CommFailure,
    ConfigError,
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Initializing
    }
}

/// The three-state quality model most callers reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecQuality {
    Good,
    Bad,
    Uncertain,
}

impl Quality {
    pub fn as_spec_quality(self) -> SpecQuality {
        match self {
            Quality::Good => SpecQuality::Good,
            Quality::Uncertain | Quality::Initializing => SpecQuality::Uncertain,
            Quality::Bad | Quality::CommFailure | Quality::ConfigError => SpecQuality::Bad,
        }
    }

    pub fn is_good(self) -> bool {
        matches!(self, Quality::Good)
    }
}

/// Data types a tag's value may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueVariant {
    Null,
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
}

impl ValueVariant {
    pub fn type_name(&self) -> &'static str {
        match self {
            ValueVariant::Null => "null",
            ValueVariant::Bool(_) => "bool",
            ValueVariant::I16(_) => "i16",
            ValueVariant::U16(_) => "u16",
            ValueVariant::I32(_) => "i32",
            ValueVariant::U32(_) => "u32",
            ValueVariant::I64(_) => "i64",
            ValueVariant::F32(_) => "f32",
            ValueVariant::F64(_) => "f64",
            ValueVariant::String(_) => "string",
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The `(value, quality, timestamp)` triple. These three fields are
/// always written together and never observed torn;
/// `TagEngine::update_tag_value` enforces this by swapping the whole
/// struct under one lock acquisition (see `tags::engine`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    pub value: ValueVariant,
    pub quality: Quality,
    pub timestamp: u64,
}

impl TagValue {
    pub fn new(value: ValueVariant, quality: Quality) -> Self {
        TagValue {
            value,
            quality,
            timestamp: now_millis(),
        }
    }

    pub fn bad(reason: Quality) -> Self {
        Self::new(ValueVariant::Null, reason)
    }
}

/// Metadata associated with a tag.
#[derive(Debug, Clone, Default)]
pub struct TagMetadata {
    pub description: Option<String>,
    pub eng_unit: Option<String>,
    pub eng_low: Option<f64>,
    pub eng_high: Option<f64>,
    pub writable: bool,
}

/// A single tag, owned by exactly one device.
#[derive(Debug, Clone)]
pub struct Tag {
    /// Unique path identifying the tag (e.g. "Folder/Device/TagName").
    pub path: String,
    pub value: TagValue,
    /// Source driver/handler id providing this tag's value.
    pub driver_id: String,
    /// Protocol-specific address on the source device (e.g. "40001").
    pub driver_address: String,
    pub poll_rate_ms: u64,
    pub metadata: TagMetadata,
}
