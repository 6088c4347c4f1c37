//! Hub configuration
//!
//! Defaults, optionally overlaid by a JSON file, then by environment:
//! - HUB_MAX_MESSAGE_SIZE: largest request/response/event in bytes
//! - HUB_UDP_BUFFER_SIZE: UDP receive buffer in bytes
//! - HUB_LOG: log level or filter directive
//! - HUB_TOKENS: comma-separated `user:token` pairs for the in-memory database

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Largest single message in bytes
    pub max_message_size: usize,
    /// Idle `SyncContext`s kept per hub
    pub max_pooled_contexts: usize,
    pub log_level: String,
    /// user id -> token. Empty disables authentication.
    pub tokens: HashMap<String, String>,
    pub websocket: WebSocketConfig,
    pub udp: UdpConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub max_frame_size: usize,
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub buffer_size: usize,
    pub session_idle_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * KIB,
            max_pooled_contexts: 32,
            log_level: "info".to_string(),
            tokens: HashMap::new(),
            websocket: WebSocketConfig::default(),
            udp: UdpConfig::default(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * MIB,
            read_buffer_size: 8 * KIB,
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * KIB,
            session_idle_secs: 300,
        }
    }
}

impl UdpConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

impl HubConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> HubResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| HubError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| HubError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn with_env(self) -> HubResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> HubResult<Self> {
        if let Some(size) = lookup("HUB_MAX_MESSAGE_SIZE") {
            self.max_message_size = parse_size("HUB_MAX_MESSAGE_SIZE", &size)?;
        }
        if let Some(size) = lookup("HUB_UDP_BUFFER_SIZE") {
            self.udp.buffer_size = parse_size("HUB_UDP_BUFFER_SIZE", &size)?;
        }
        if let Some(level) = lookup("HUB_LOG") {
            self.log_level = level;
        }
        if let Some(tokens) = lookup("HUB_TOKENS") {
            // Format: "alice:secret,bob:hunter2"
            for entry in tokens.split(',') {
                if let Some((user, token)) = entry.trim().split_once(':') {
                    self.tokens.insert(user.to_string(), token.to_string());
                }
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> HubResult<()> {
        if self.max_message_size == 0 {
            return Err(HubError::Config("max_message_size must be positive".into()));
        }
        if self.udp.buffer_size == 0 {
            return Err(HubError::Config("udp.buffer_size must be positive".into()));
        }
        if self.websocket.read_buffer_size == 0 {
            return Err(HubError::Config(
                "websocket.read_buffer_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_size(key: &str, value: &str) -> HubResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| HubError::Config(format!("{key} must be a byte count, got {value:?}")))
}
