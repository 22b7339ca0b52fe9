//! Protocol handler abstraction and concrete implementations.

pub mod modbus;
pub mod opcua;
pub mod traits;
