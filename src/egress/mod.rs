//! Cloud-egress buffering: the durable-enough queue of
//! outbound `CloudMessage`s the Cloud Manager drains, with a disk-spill
//! variant for when connectors are unreachable.

pub mod backoff;
pub mod buffer;
pub mod message;
mod ordering;

pub use backoff::{next_attempt_at, BackoffConfig};
pub use buffer::{DiskSpillEgressBuffer, EgressBuffer, EgressError, InMemoryEgressBuffer};
pub use message::{CloudData, CloudMessage, MessageKind, MessagePayload, Priority};
