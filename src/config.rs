//! Client configuration resolved from CLI flags and an optional TOML file.
//!
//! Values from the TOML file override the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::chat::client::{
    ChatClient, DEFAULT_CHAT_ENDPOINT, MAX_RECONNECT_BACKOFF, MIN_RECONNECT_BACKOFF,
};
use crate::chat::history::DEFAULT_HISTORY_CAPACITY;
use crate::chat::session::SessionOptions;
use crate::credentials::{CredentialsStore, DEFAULT_CREDENTIALS_DIR};
use crate::crypto::{DEFAULT_KEY_BITS, MIN_KEY_BITS};
use crate::keys::DEFAULT_KEY_REQUEST_TIMEOUT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("username must be specified via --username or in config file")]
    MissingUsername,

    #[error("{field} must not be empty")]
    EmptyEndpoint { field: &'static str },

    #[error("key size {0} is below the minimum of 512 bits")]
    KeyTooSmall(usize),

    #[error("reconnect backoff min {min_ms}ms exceeds max {max_ms}ms")]
    InvalidBackoff { min_ms: u64, max_ms: u64 },

    #[error("key_request_timeout_secs must be greater than zero")]
    ZeroKeyTimeout,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub endpoint: Option<String>,
    pub registration_endpoint: Option<String>,
    pub username: Option<String>,
    pub credentials_dir: Option<String>,
    pub key_bits: Option<usize>,
    pub history_capacity: Option<usize>,
    pub key_request_timeout_secs: Option<u64>,
    pub reconnect_min_backoff_ms: Option<u64>,
    pub reconnect_max_backoff_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// CLI arguments that take part in config resolution.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub endpoint: Option<String>,
    pub registration_endpoint: Option<String>,
    pub username: Option<String>,
    pub credentials_dir: Option<PathBuf>,
    pub key_bits: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub endpoint: String,
    pub registration_endpoint: String,
    pub username: String,
    pub credentials_dir: PathBuf,
    pub key_bits: usize,
    pub history_capacity: usize,
    pub key_request_timeout: Duration,
    pub reconnect_min_backoff: Duration,
    pub reconnect_max_backoff: Duration,
}

impl ClientConfig {
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self, ConfigError> {
        let file = file_config.unwrap_or_default();

        let endpoint = file
            .endpoint
            .or_else(|| cli.endpoint.clone())
            .map(|endpoint| endpoint.trim().to_string())
            .unwrap_or_else(|| DEFAULT_CHAT_ENDPOINT.to_string());
        if endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint { field: "endpoint" });
        }

        let registration_endpoint = file
            .registration_endpoint
            .or_else(|| cli.registration_endpoint.clone())
            .map(|endpoint| endpoint.trim().to_string())
            .unwrap_or_else(|| endpoint.clone());
        if registration_endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint {
                field: "registration_endpoint",
            });
        }

        let username = file
            .username
            .or_else(|| cli.username.clone())
            .map(|username| username.trim().to_string())
            .filter(|username| !username.is_empty())
            .ok_or(ConfigError::MissingUsername)?;

        let credentials_dir = file
            .credentials_dir
            .map(PathBuf::from)
            .or_else(|| cli.credentials_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIALS_DIR));

        let key_bits = file.key_bits.or(cli.key_bits).unwrap_or(DEFAULT_KEY_BITS);
        if key_bits < MIN_KEY_BITS {
            return Err(ConfigError::KeyTooSmall(key_bits));
        }

        let history_capacity = file.history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY);

        let key_request_timeout = file
            .key_request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_KEY_REQUEST_TIMEOUT);
        if key_request_timeout.is_zero() {
            return Err(ConfigError::ZeroKeyTimeout);
        }

        let reconnect_min_backoff = file
            .reconnect_min_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(MIN_RECONNECT_BACKOFF);
        let reconnect_max_backoff = file
            .reconnect_max_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(MAX_RECONNECT_BACKOFF);
        if reconnect_min_backoff > reconnect_max_backoff {
            return Err(ConfigError::InvalidBackoff {
                min_ms: reconnect_min_backoff.as_millis() as u64,
                max_ms: reconnect_max_backoff.as_millis() as u64,
            });
        }

        Ok(Self {
            endpoint,
            registration_endpoint,
            username,
            credentials_dir,
            key_bits,
            history_capacity,
            key_request_timeout,
            reconnect_min_backoff,
            reconnect_max_backoff,
        })
    }

    pub fn chat_client(&self) -> ChatClient {
        ChatClient::new(self.endpoint.clone())
            .with_reconnect_backoff(self.reconnect_min_backoff, self.reconnect_max_backoff)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            history_capacity: self.history_capacity,
            key_request_timeout: self.key_request_timeout,
        }
    }

    pub fn credentials_store(&self) -> CredentialsStore {
        CredentialsStore::new(self.credentials_dir.clone())
    }
}
