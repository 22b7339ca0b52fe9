//! Industrial protocol gateway data plane.
//!
//! This crate implements the in-process core of a field-bus-to-cloud
//! gateway: a device/tag model, a per-device circuit breaker, a protocol
//! handler abstraction (with a concrete Modbus TCP handler and a secondary
//! OPC UA handler), a cloud-egress manager with routing/batching/disk
//! spill, and an edge resource governor. CLI parsing, TLS, and the full
//! HTTP/WS/gRPC transports that would wrap this core are out of scope;
//! `api` exposes only a thin read-only surface for tests and local tools.

pub mod breaker;
pub mod cloud;
pub mod config;
pub mod context;
pub mod drivers;
pub mod egress;
pub mod gateway;
pub mod governor;
pub mod logging;
pub mod model;
pub mod tags;

pub mod api;
