//! Infrastructure layer module
//!
//! - Configuration management (figment)
//! - Logging infrastructure (tracing)
//! - On-disk layout of the state directory
//! - Following agent output files

pub mod config;
pub mod layout;
pub mod log_tail;
pub mod logging;
