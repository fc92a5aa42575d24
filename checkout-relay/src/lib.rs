//! Checkout Relay - Fingerprint identification relay for a demo checkout flow
//!
//! This crate provides:
//! - A thin REST relay that stores collected browser signals and forwards them
//!   to the Fingerprint `/send` API
//! - A typed bridge to the signal collector, with correlated commands and replies
//! - A checkout session that drives the identification phases and keeps
//!   latency metrics in session-scoped storage
//! - A metrics panel and mock order summary for presentation

pub mod api;
pub mod bridge;
pub mod checkout;
pub mod client;
pub mod context;
pub mod ip;
pub mod metrics;
pub mod provider;
pub mod session;

pub use bridge::{BridgeHandle, SignalCollector};
pub use client::{HttpRelayClient, RelayBackend};
pub use provider::{FingerprintProvider, IdentificationProvider};
pub use session::{CheckoutSession, ProcessingPhase, SessionRecord};

use std::path::Path;
use thiserror::Error;

/// Environment variables checked, in order, for the vendor secret key
pub const API_KEY_VARS: [&str; 2] = [
    "FINGERPRINT_API_KEY",
    "NEXT_PUBLIC_FINGERPRINT_SECRET_API_KEY",
];

/// Environment variable holding the public key used by the client agent
pub const PUBLIC_KEY_VAR: &str = "NEXT_PUBLIC_FINGERPRINT_PUBLIC_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("Invalid RELAY_PORT value: {0}")]
    InvalidPort(String),
}

/// Configuration for the relay server
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RelayConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Fingerprint server API origin
    #[serde(default = "default_vendor_url")]
    pub vendor_url: String,

    /// Log level for the server subscriber
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Public key handed to the client agent
    #[serde(default)]
    pub public_api_key: Option<String>,

    /// Vendor secret key; only ever read from the environment
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_port() -> u16 { 3000 }
fn default_vendor_url() -> String { provider::DEFAULT_VENDOR_URL.to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            vendor_url: default_vendor_url(),
            log_level: default_log_level(),
            public_api_key: None,
            api_key: None,
        }
    }
}

impl RelayConfig {
    /// Load from an optional TOML file, then overlay the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Overlay values from an environment lookup
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        self.api_key = API_KEY_VARS.iter().find_map(|key| non_empty(*key));

        if let Some(key) = non_empty(PUBLIC_KEY_VAR) {
            self.public_api_key = Some(key);
        }

        if let Some(port) = non_empty("RELAY_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidPort(port))?;
        }

        Ok(self)
    }
}
