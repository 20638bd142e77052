//! Registrar configuration.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RSERPOOL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/rserpool/config.toml
//!   3. ~/.config/rserpool/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::de::IntoDeserializer;
use serde::{Deserialize, Serialize};

use crate::transport::AddressScope;
use crate::wire::{ASAP_PORT, ENRP_PORT, UNDEFINED_REGISTRAR_IDENTIFIER};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    pub registrar: RegistrarSection,
    pub enrp: EnrpConfig,
    pub asap: AsapConfig,
    pub peers: PeersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarSection {
    /// Own registrar identifier. 0 = pick a random one at startup.
    pub identifier: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrpConfig {
    pub listen: IpAddr,
    pub port: u16,
    /// Interval between Presence messages to every known peer.
    pub announce_interval_ms: u64,
    /// A peer not heard from for this long is sent a Presence with reply required.
    pub max_time_last_heard_ms: u64,
    /// A peer that does not answer that Presence within this time is dropped.
    pub max_time_no_response_ms: u64,
    pub takeover_expiry_ms: u64,
    /// Pool elements per Handle Table Response before MORE_TO_SEND.
    pub max_elements_per_handle_table_request: usize,
    /// Addresses below this scope are not announced to peers.
    pub min_address_scope: AddressScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsapConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Statically configured ENRP peers (`ip:port`). Their identifiers are
    /// learned from their first Presence.
    #[serde(rename = "static")]
    pub static_peers: Vec<SocketAddr>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RegistrarSection {
    fn default() -> Self {
        Self {
            identifier: UNDEFINED_REGISTRAR_IDENTIFIER,
        }
    }
}

impl Default for EnrpConfig {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: ENRP_PORT,
            announce_interval_ms: 1_000,
            max_time_last_heard_ms: 5_000,
            max_time_no_response_ms: 5_000,
            takeover_expiry_ms: 5_000,
            max_elements_per_handle_table_request: 128,
            min_address_scope: AddressScope::SiteLocal,
        }
    }
}

impl Default for AsapConfig {
    fn default() -> Self {
        Self { port: ASAP_PORT }
    }
}

impl EnrpConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("rserpool")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RegistrarConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RegistrarConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RSERPOOL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RegistrarConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply RSERPOOL_* overrides looked up through `var`. Unparsable values
    /// are ignored.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parsed(var("RSERPOOL_REGISTRAR__IDENTIFIER")) {
            self.registrar.identifier = v;
        }
        if let Some(v) = parsed(var("RSERPOOL_ENRP__LISTEN")) {
            self.enrp.listen = v;
        }
        if let Some(v) = parsed(var("RSERPOOL_ENRP__PORT")) {
            self.enrp.port = v;
        }
        if let Some(v) = parsed(var("RSERPOOL_ENRP__ANNOUNCE_INTERVAL_MS")) {
            self.enrp.announce_interval_ms = v;
        }
        if let Some(v) = parsed(var("RSERPOOL_ENRP__MAX_TIME_LAST_HEARD_MS")) {
            self.enrp.max_time_last_heard_ms = v;
        }
        if let Some(v) = parsed(var("RSERPOOL_ENRP__MAX_TIME_NO_RESPONSE_MS")) {
            self.enrp.max_time_no_response_ms = v;
        }
        if let Some(v) = parsed(var("RSERPOOL_ENRP__TAKEOVER_EXPIRY_MS")) {
            self.enrp.takeover_expiry_ms = v;
        }
        if let Some(v) = parsed(var("RSERPOOL_ENRP__MAX_ELEMENTS_PER_HANDLE_TABLE_REQUEST")) {
            self.enrp.max_elements_per_handle_table_request = v;
        }
        if let Some(v) = var("RSERPOOL_ENRP__MIN_ADDRESS_SCOPE") {
            // Same kebab-case names as the config file.
            let scope: Result<AddressScope, serde::de::value::Error> =
                AddressScope::deserialize(v.trim().into_deserializer());
            if let Ok(scope) = scope {
                self.enrp.min_address_scope = scope;
            }
        }
        if let Some(v) = parsed(var("RSERPOOL_ASAP__PORT")) {
            self.asap.port = v;
        }
        if let Some(v) = var("RSERPOOL_PEERS__STATIC") {
            // Comma-separated `ip:port` list.
            self.peers.static_peers = v
                .split(',')
                .filter_map(|peer| peer.trim().parse().ok())
                .collect();
        }
    }
}
