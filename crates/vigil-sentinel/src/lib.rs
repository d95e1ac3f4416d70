//! Vigil Sentinel Library
//!
//! Core functionality for the sentinel process:
//! - Persistent upstream link with keepalive and unconditional reconnect
//! - Local relay transport bridging link bytes to the current worker
//! - Worker process supervision, readiness handshake and hot reload

pub mod link;
pub mod relay;
pub mod supervisor;
pub mod transport;
