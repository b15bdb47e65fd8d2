//! Structured logging over `tracing-subscriber`.
//!
//! Console output (JSON or pretty) goes to stderr; an optional rolling JSON
//! file keeps the last `retention_days` files.

pub mod config;
pub mod logger;

pub use config::{LogConfig, LogFormat, RotationPolicy};
pub use logger::LoggerImpl;
