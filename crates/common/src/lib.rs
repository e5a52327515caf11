//! Shared types, configuration and QMP client for the ephemeral VM control plane.

pub mod config;
pub mod error;
pub mod qmp;
pub mod types;

pub use config::{QemuConfig, ServerConfig};
pub use error::{Error, Result};
pub use types::*;

/// Crate version, exposed for `/healthz` and startup logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
