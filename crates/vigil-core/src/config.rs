//! Bot configuration: the single authoritative copy lives in the sentinel.
//!
//! The config crosses the process boundary to each worker generation by
//! value, serialized inside the init control message. Updates flow back only
//! through explicit save requests; there is no shared mutable state.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Default IRC port (plaintext).
const DEFAULT_PORT: u16 = 6667;

/// Complete bot configuration.
///
/// Unknown fields are preserved in `extra` so operator-defined module
/// settings survive a load/save round trip field-for-field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Upstream server hostname.
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connect with TLS.
    #[serde(default)]
    pub tls: bool,
    /// Skip TLS peer verification (self-signed upstream certificates).
    #[serde(default)]
    pub allow_insecure_tls: bool,
    /// Local address to bind the outgoing connection to.
    #[serde(default)]
    pub bind: Option<IpAddr>,
    /// Seconds between reconnect attempts. `None` uses the built-in default.
    #[serde(default)]
    pub reconnect_delay_secs: Option<u64>,
    /// PEM file with additional trust anchors for the upstream certificate.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub info: Identity,
    /// Regex masks matched against the full `nick!user@host` source.
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    /// Module names resolved through the worker's registry at init.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Nicks that receive forwarded server error notices.
    #[serde(default)]
    pub bcnicks: Vec<String>,

    /// Operator-defined extension fields, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// IRC identity used for registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub nick: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    /// Server password, sent as PASS before registration.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            nick: "vigil".to_string(),
            user: None,
            realname: None,
            password: None,
        }
    }
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Config {
    /// Username for registration, falling back to the nick.
    pub fn username(&self) -> &str {
        self.info.user.as_deref().unwrap_or(&self.info.nick)
    }

    /// Real name for registration, falling back to the nick.
    pub fn realname(&self) -> &str {
        self.info.realname.as_deref().unwrap_or(&self.info.nick)
    }
}

/// Persistent configuration storage backed by a JSON file.
///
/// `load` failures at startup are fatal (handled by the caller); mid-run
/// `save` failures are logged and non-fatal.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the configuration file.
    pub fn load(&self) -> Result<Config> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        apply_env_overrides(&mut config);
        debug!(path = %self.path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Persist the configuration as pretty-printed JSON.
    pub fn save(&self, config: &Config) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }
}

/// Default config file location: `vigil.json` in the working directory,
/// falling back to the platform config dir.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from("vigil.json");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("vigil").join("vigil.json"))
        .unwrap_or(local)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("VIGIL_SERVER") {
        config.server = val;
    }
    if let Ok(val) = std::env::var("VIGIL_PORT") {
        if let Ok(n) = val.parse() {
            config.port = n;
        }
    }
    if let Ok(val) = std::env::var("VIGIL_NICK") {
        config.info.nick = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r##"{
            "server": "irc.example.net",
            "port": 6697,
            "tls": true,
            "info": {"nick": "sentry", "password": "hunter2"},
            "channels": ["#ops", "#dev"],
            "modules": ["boot", "admin"],
            "admins": ["^admin!.*@trusted\\.example$"],
            "greeting": {"text": "hello"}
        }"##
    }

    #[test]
    fn parses_full_config() {
        let config: Config = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(config.server, "irc.example.net");
        assert_eq!(config.port, 6697);
        assert!(config.tls);
        assert!(!config.allow_insecure_tls);
        assert_eq!(config.info.nick, "sentry");
        assert_eq!(config.channels, vec!["#ops", "#dev"]);
        assert_eq!(config.modules, vec!["boot", "admin"]);
    }

    #[test]
    fn preserves_extension_fields() {
        let config: Config = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(
            config.extra.get("greeting").unwrap()["text"],
            serde_json::json!("hello")
        );

        let reserialized = serde_json::to_value(&config).unwrap();
        assert_eq!(reserialized["greeting"]["text"], serde_json::json!("hello"));
    }

    #[test]
    fn defaults_apply_for_missing_fields() {
        let config: Config = serde_json::from_str(r#"{"server": "irc.example.net"}"#).unwrap();
        assert_eq!(config.port, 6667);
        assert!(!config.tls);
        assert_eq!(config.info.nick, "vigil");
        assert_eq!(config.username(), "vigil");
        assert!(config.channels.is_empty());
    }

    #[test]
    fn store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.json");
        let store = ConfigStore::new(&path);

        let config: Config = serde_json::from_str(sample_json()).unwrap();
        store.save(&config).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("absent.json"));
        let err = store.load().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.json");
        std::fs::write(&path, "not json").unwrap();
        let err = ConfigStore::new(&path).load().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
