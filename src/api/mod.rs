//! Thin external API surface kept alongside the core for local tools and
//! tests. The gateway's own transport (HTTP/WS/gRPC, TLS termination,
//! auth) is out of scope; this is deliberately small.

pub mod rest;

pub use rest::{create_api_routes, SharedAppState};
