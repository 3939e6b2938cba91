use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use nostr_sdk::Keys;
use serde::{Deserialize, Serialize};

use pushbridge_core::constants::{
    DEFAULT_AMQP_URL, DEFAULT_BACKFILL_TIMEOUT, DEFAULT_DISPATCH_CONCURRENCY,
    DEFAULT_DISPATCH_TIMEOUT, DEFAULT_QUEUE_NAME, DEFAULT_RECONNECT_DELAY, DEFAULT_RELAY_URL,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PRIVATEKEY not found in config or environment")]
    MissingPrivateKey,

    #[error("EXPOACCESSTOKEN not found in config or environment")]
    MissingExpoToken,

    #[error("private key is neither hex nor nsec: {0}")]
    InvalidPrivateKey(String),

    #[error("failed to read {path}: {reason}")]
    Dotenv { path: String, reason: String },

    #[error("{name} must be {expected}, got {value:?}")]
    InvalidValue {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Read from the working directory when present
const DOTENV_FILE: &str = ".env";

/// Daemon configuration that can be loaded from a JSON file.
///
/// Every field may also come from the environment, which wins over the file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Node secret key, hex or nsec
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expo_access_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amqp_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_concurrency: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_delay_secs: Option<u64>,

    /// Drop undecodable envelopes the broker has already redelivered once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_redelivered: Option<bool>,
}

/// Fully resolved settings the daemon runs with
pub struct Settings {
    pub keys: Keys,
    pub expo_access_token: String,
    pub relay_url: String,
    pub amqp_url: String,
    pub queue_name: String,
    pub dispatch_timeout: Duration,
    pub dispatch_concurrency: usize,
    pub backfill_timeout: Duration,
    pub reconnect_delay: Duration,
    pub dead_letter_redelivered: bool,
}

impl BridgeConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: BridgeConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Overlay values from the process environment, falling back to `.env`
    /// for variables the process leaves unset.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        let dotenv_path = Path::new(DOTENV_FILE);
        let dotenv = if dotenv_path.is_file() {
            read_dotenv(dotenv_path)?
        } else {
            HashMap::new()
        };
        self.with_env_from(|name| {
            std::env::var(name)
                .ok()
                .or_else(|| dotenv.get(name).cloned())
        })
    }

    /// Overlay values from `lookup`; empty values count as unset.
    pub fn with_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("PRIVATEKEY") {
            self.private_key = Some(v);
        }
        if let Some(v) = var("EXPOACCESSTOKEN") {
            self.expo_access_token = Some(v);
        }
        if let Some(v) = var("STRFRY_URL") {
            self.relay_url = Some(v);
        }
        if let Some(v) = var("RABBITMQ_URL") {
            self.amqp_url = Some(v);
        }
        if let Some(v) = var("RABBITMQ_QUEUE") {
            self.queue_name = Some(v);
        }
        if let Some(v) = var("PUSHBRIDGE_DISPATCH_TIMEOUT_SECS") {
            self.dispatch_timeout_secs =
                Some(parse_number("PUSHBRIDGE_DISPATCH_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("PUSHBRIDGE_DISPATCH_CONCURRENCY") {
            self.dispatch_concurrency =
                Some(parse_number("PUSHBRIDGE_DISPATCH_CONCURRENCY", &v)?);
        }
        if let Some(v) = var("PUSHBRIDGE_BACKFILL_TIMEOUT_SECS") {
            self.backfill_timeout_secs =
                Some(parse_number("PUSHBRIDGE_BACKFILL_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("PUSHBRIDGE_RECONNECT_DELAY_SECS") {
            self.reconnect_delay_secs =
                Some(parse_number("PUSHBRIDGE_RECONNECT_DELAY_SECS", &v)?);
        }
        if let Some(v) = var("PUSHBRIDGE_DEAD_LETTER_REDELIVERED") {
            self.dead_letter_redelivered =
                Some(parse_flag("PUSHBRIDGE_DEAD_LETTER_REDELIVERED", &v)?);
        }

        Ok(self)
    }

    /// Check required values and fill in defaults.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let private_key = self.private_key.ok_or(ConfigError::MissingPrivateKey)?;
        let keys = Keys::parse(private_key.trim())
            .map_err(|e| ConfigError::InvalidPrivateKey(e.to_string()))?;
        let expo_access_token = self
            .expo_access_token
            .ok_or(ConfigError::MissingExpoToken)?;

        Ok(Settings {
            keys,
            expo_access_token,
            relay_url: self
                .relay_url
                .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            amqp_url: self.amqp_url.unwrap_or_else(|| DEFAULT_AMQP_URL.to_string()),
            queue_name: self
                .queue_name
                .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            dispatch_timeout: self
                .dispatch_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DISPATCH_TIMEOUT),
            dispatch_concurrency: self
                .dispatch_concurrency
                .unwrap_or(DEFAULT_DISPATCH_CONCURRENCY)
                .max(1),
            backfill_timeout: self
                .backfill_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_BACKFILL_TIMEOUT),
            reconnect_delay: self
                .reconnect_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RECONNECT_DELAY),
            dead_letter_redelivered: self.dead_letter_redelivered.unwrap_or(false),
        })
    }
}

/// `KEY=value` pairs from a dotenv file
fn read_dotenv(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let error = |e: dotenvy::Error| ConfigError::Dotenv {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    dotenvy::from_path_iter(path)
        .map_err(error)?
        .map(|item| item.map_err(error))
        .collect()
}

fn parse_number<N: std::str::FromStr>(
    name: &'static str,
    value: &str,
) -> Result<N, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        expected: "a non-negative integer",
        value: value.to_string(),
    })
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            expected: "a boolean",
            value: value.to_string(),
        }),
    }
}
