//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.tally/config.json`) and environment.

use crate::relay::RelayPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Relay server settings.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Relay bind, port, auth and fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Port for HTTP and WebSocket (default 15152).
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_relay_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: RelayAuthConfig,

    /// Deliver a client's own events back to it (default false).
    #[serde(default)]
    pub echo_to_sender: bool,

    /// Send a snapshot of cards and counts to each new subscriber (default true).
    #[serde(default = "default_true")]
    pub snapshot_on_subscribe: bool,

    /// Outbound frames queued per connection before it is dropped as too slow.
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,

    /// How long a new socket may take to send its connect request.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Seconds a session's tally is kept after its last subscriber leaves.
    #[serde(default = "default_tally_retention_secs")]
    pub tally_retention_secs: u64,
}

/// Relay auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require connect.auth.token.
    #[serde(default)]
    pub mode: RelayAuthMode,

    /// Shared secret for WebSocket connect. Overridden by TALLY_RELAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require connect.auth.token to match configured token.
    Token,
}

fn default_relay_port() -> u16 {
    15152
}

fn default_relay_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_send_queue() -> usize {
    64
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_tally_retention_secs() -> u64 {
    600
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            bind: default_relay_bind(),
            auth: RelayAuthConfig::default(),
            echo_to_sender: false,
            snapshot_on_subscribe: default_true(),
            send_queue: default_send_queue(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            tally_retention_secs: default_tally_retention_secs(),
        }
    }
}

impl RelayConfig {
    pub fn policy(&self) -> RelayPolicy {
        RelayPolicy {
            echo_to_sender: self.echo_to_sender,
            snapshot_on_subscribe: self.snapshot_on_subscribe,
            tally_retention: Duration::from_secs(self.tally_retention_secs),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Queue size with a floor of one so a zero in the config cannot stall every subscriber.
    pub fn send_queue(&self) -> usize {
        self.send_queue.max(1)
    }
}

/// Resolve the relay token: env TALLY_RELAY_TOKEN overrides config.
pub fn resolve_relay_token(config: &Config) -> Option<String> {
    std::env::var("TALLY_RELAY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .relay
                .auth
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TALLY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".tally").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, else the default path (or TALLY_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
