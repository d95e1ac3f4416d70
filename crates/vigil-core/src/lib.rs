//! Vigil Core Library
//!
//! Shared functionality for the sentinel and worker binaries:
//! - Bot configuration, load/save and environment overrides
//! - Control-channel message types and NDJSON codec
//! - Relay rendezvous address and stream types
//! - Common error types and tracing initialization

pub mod config;
pub mod control;
pub mod error;
pub mod net;
pub mod tracing_init;

pub use config::{Config, ConfigStore};
pub use control::{RelayAddress, SentinelMessage, WorkerMessage};
pub use error::{Error, Result};
