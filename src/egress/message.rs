//! The outbound data model (`CloudData`/`CloudMessage`).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tags::structures::{SpecQuality, ValueVariant};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An outbound sample. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudData {
    pub id: Uuid,
    pub device_id: String,
    pub tag_name: String,
    pub value: ValueVariant,
    pub quality: SpecQuality,
    pub timestamp: u64,
}

impl CloudData {
    pub fn new(device_id: impl Into<String>, tag_name: impl Into<String>, value: ValueVariant, quality: SpecQuality) -> Self {
        CloudData {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            tag_name: tag_name.into(),
            value,
            quality,
            timestamp: now_millis(),
        }
    }
}

/// Priority ordering a buffered message carries. Declared low-to-high so
/// the derived `Ord` gives `Critical` the highest rank, matching the
/// "priority desc" ordering the Egress Buffer returns messages in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// What kind of payload a `CloudMessage` carries. Kept distinct from
/// `MessagePayload`'s own variant so routing/metrics code can match on a
/// plain `Copy` tag without touching the payload body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Data,
    Event,
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePayload {
    Data(CloudData),
    Event(serde_json::Value),
    Command(serde_json::Value),
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Data(_) => MessageKind::Data,
            MessagePayload::Event(_) => MessageKind::Event,
            MessagePayload::Command(_) => MessageKind::Command,
        }
    }
}

/// The buffered envelope the Egress Buffer stores and the Cloud Manager
/// drains. `retries` is monotonically non-decreasing; `next_attempt_at`
/// is always `>= created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudMessage {
    pub id: Uuid,
    pub kind: MessageKind,
    pub payload: MessagePayload,
    pub priority: Priority,
    pub created_at: u64,
    pub retries: u32,
    pub next_attempt_at: u64,
}

impl CloudMessage {
    pub fn new(payload: MessagePayload, priority: Priority) -> Self {
        let now = now_millis();
        CloudMessage {
            id: Uuid::new_v4(),
            kind: payload.kind(),
            payload,
            priority,
            created_at: now,
            retries: 0,
            next_attempt_at: now,
        }
    }

    pub fn from_data(data: CloudData, priority: Priority) -> Self {
        Self::new(MessagePayload::Data(data), priority)
    }
}
