//! TOML configuration for the CLI tools.
//!
//! File values map onto `srt_proto::SrtConfig`; command-line flags win
//! over the file where both are given.

use serde::{Deserialize, Serialize};
use srt_live::proto::SrtConfig;
use std::fs;
use std::path::Path;

/// Transfer options shared by sender and receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Cipher: "off", "aes128", "aes192", "aes256".
    #[serde(default = "default_encryption")]
    pub encryption: String,
    /// Required unless `encryption = "off"`.
    pub passphrase: Option<String>,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u32,
    #[serde(default = "default_mss")]
    pub mss_bytes: usize,
    #[serde(default = "default_bandwidth")]
    pub max_bandwidth_bps: u64,
    #[serde(default = "default_stats_secs")]
    pub stats_interval_secs: u64,
}

fn default_encryption() -> String {
    "off".to_string()
}

fn default_latency_ms() -> u32 {
    120
}

fn default_mss() -> usize {
    1500
}

fn default_bandwidth() -> u64 {
    1_000_000
}

fn default_stats_secs() -> u64 {
    1
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            encryption: default_encryption(),
            passphrase: None,
            latency_ms: default_latency_ms(),
            mss_bytes: default_mss(),
            max_bandwidth_bps: default_bandwidth(),
            stats_interval_secs: default_stats_secs(),
        }
    }
}

impl TransferOptions {
    /// Builds the protocol configuration, resolving the cipher name.
    pub fn to_srt_config(&self) -> Result<SrtConfig, ConfigError> {
        let encryption = match self.encryption.as_str() {
            "off" => None,
            "aes128" => Some(srt_crypt::CipherKind::Aes128),
            "aes192" => Some(srt_crypt::CipherKind::Aes192),
            "aes256" => Some(srt_crypt::CipherKind::Aes256),
            other => return Err(ConfigError::UnknownCipher(other.to_string())),
        };
        let config = SrtConfig {
            encryption,
            passphrase: self.passphrase.clone(),
            playback_delay_ms: self.latency_ms,
            mss_bytes: self.mss_bytes,
            max_bandwidth_bps: self.max_bandwidth_bps,
            ..SrtConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// Top-level tool configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub transfer: TransferOptions,
}

impl ToolConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unknown cipher {0:?} (expected off, aes128, aes192, aes256)")]
    UnknownCipher(String),

    #[error(transparent)]
    Protocol(#[from] srt_live::proto::ConfigError),
}
