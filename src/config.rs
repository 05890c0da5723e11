//! Multiplexer configuration.
//!
//! Everything is defaulted so embedders can run with
//! `MuxConfig::default()`; a TOML file is accepted for parity with how
//! deployments configure the rest of their stack.

use mremux_proto::PROTOCOL_VERSION;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Session multiplexer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// When true, one joined engine client is elected authoritative and
    /// only its transport statistics are forwarded upstream. When false
    /// the app is authoritative and no election happens.
    pub peer_authoritative: bool,

    /// Seconds a peer gets to answer the handshake before the
    /// connection is closed.
    pub handshake_timeout_secs: u64,

    /// Protocol version advertised during handshake. Overridable for
    /// interop testing only.
    pub protocol_version: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            peer_authoritative: true,
            handshake_timeout_secs: 30,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl MuxConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: MuxConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
