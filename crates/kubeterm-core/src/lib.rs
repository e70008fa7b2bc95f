//! kubeterm Core Library
//!
//! Shared functionality for kubeterm components:
//! - Configuration resolution and hierarchy
//! - Tracing/logging initialization
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{ClusterConfig, Config, LoggingConfig, RelayConfig};
pub use error::{Error, Result};
