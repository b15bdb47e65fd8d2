//! Layered configuration (figment): built-in defaults, then
//! `.shepherd/config.yaml`, `.shepherd/local.yaml` and `SHEPHERD_*`
//! environment variables, validated once after extraction.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
