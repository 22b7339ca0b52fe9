//! Typed configuration surface loaded from TOML via the `config` crate.

pub mod settings;

pub use settings::Settings;
