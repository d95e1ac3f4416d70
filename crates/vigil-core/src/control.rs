//! Control-channel messages between the sentinel and the worker.
//!
//! The control channel is NDJSON over the worker's piped stdio, distinct
//! from the relay data channel. Parsing implements the tolerant reader
//! pattern: messages are keyed by marker fields (`init`, `connection`,
//! `ready`, `reload`, `save`) and unknown payloads are an error the caller
//! logs without tearing anything down.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::Config;
use crate::error::{Error, Result};

/// Rendezvous address of the relay transport.
///
/// Generated once per sentinel lifetime and immutable thereafter, so every
/// worker generation dials the same address. Serialized into the init
/// message as `{"path": ...}` or `{"port": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayAddress {
    /// Filesystem path of a Unix domain socket.
    Path(PathBuf),
    /// Loopback TCP port (portable fallback).
    Port(u16),
}

impl RelayAddress {
    /// Unix socket path derived from the owning process identity.
    pub fn socket_path_for_pid(pid: u32) -> Self {
        Self::Path(std::env::temp_dir().join(format!("vigil-{pid}.sock")))
    }
}

impl std::fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Port(port) => write!(f, "127.0.0.1:{port}"),
        }
    }
}

/// Messages sent by the sentinel to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SentinelMessage {
    /// Sent exactly once per generation, immediately after spawn.
    Init {
        config: Box<Config>,
        relay: RelayAddress,
    },
    /// The link (re-)established its upstream session.
    Connection,
}

/// Messages sent by the worker to the sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Announced once, immediately on process start.
    Ready,
    /// Request a new generation.
    Reload,
    /// Request persistence of the given config, forwarded verbatim.
    Save(Box<Config>),
}

impl SentinelMessage {
    /// Encode as one NDJSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String> {
        let value = match self {
            Self::Init { config, relay } => json!({
                "init": true,
                "config": serde_json::to_value(config)?,
                "relay": serde_json::to_value(relay)?,
            }),
            Self::Connection => json!({"connection": true}),
        };
        Ok(value.to_string())
    }

    /// Parse one control line from the sentinel.
    pub fn parse(line: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(line)?;
        if raw.get("init").and_then(Value::as_bool) == Some(true) {
            let config = raw
                .get("config")
                .cloned()
                .ok_or_else(|| Error::ControlParse("init without config".into()))?;
            let relay = raw
                .get("relay")
                .cloned()
                .ok_or_else(|| Error::ControlParse("init without relay address".into()))?;
            return Ok(Self::Init {
                config: Box::new(serde_json::from_value(config)?),
                relay: serde_json::from_value(relay)?,
            });
        }
        if raw.get("connection").and_then(Value::as_bool) == Some(true) {
            return Ok(Self::Connection);
        }
        Err(Error::ControlParse(format!(
            "Unknown sentinel message: {line}"
        )))
    }
}

impl WorkerMessage {
    /// Encode as one NDJSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String> {
        let value = match self {
            Self::Ready => json!({"ready": true}),
            Self::Reload => json!({"reload": true}),
            Self::Save(config) => json!({"save": serde_json::to_value(config)?}),
        };
        Ok(value.to_string())
    }

    /// Parse one control line from the worker.
    pub fn parse(line: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(line)?;
        if raw.get("ready").and_then(Value::as_bool) == Some(true) {
            return Ok(Self::Ready);
        }
        if raw.get("reload").and_then(Value::as_bool) == Some(true) {
            return Ok(Self::Reload);
        }
        if let Some(config) = raw.get("save") {
            return Ok(Self::Save(Box::new(serde_json::from_value(
                config.clone(),
            )?)));
        }
        Err(Error::ControlParse(format!(
            "Unknown worker message: {line}"
        )))
    }
}
