//! Vigil Worker Library
//!
//! Per-generation functionality hosted inside each worker process:
//! - Protocol engine dispatching IRC events to attached modules
//! - Module registry with the built-in `boot` and `admin` modules
//! - Bridge wiring the relay connection into the engine

pub mod bridge;
pub mod engine;
pub mod modules;
