//! Environment-backed runtime configuration for `pos-monitor`.

use std::{env, error::Error, fmt, time::Duration};

use pos_core::{RealtimeConfig, RetryPolicy};
use pos_sync::RequestClientConfig;
use url::Url;

const DEFAULT_API_BASE_URL: &str = "http://localhost:3001/api";
const DEFAULT_POLLING_INTERVAL_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;
const REQUEST_ATTEMPTS: u32 = 3;

/// Runtime configuration used by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct PosConfig {
    /// Base URL of the POS data API.
    pub api_base_url: Url,
    /// Base URL of the account service; defaults to the API base URL.
    pub auth_base_url: Url,
    pub polling_interval: Duration,
    pub enable_polling: bool,
    pub enable_focus_refresh: bool,
    pub enable_mutation_events: bool,
    /// Per-attempt request bound.
    pub request_timeout: Duration,
    pub retry_base_delay_ms: u64,
    /// Terminal whose catalog is kept in sync, if any.
    pub terminal_id: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl PosConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_base_url = parse_url("POS_API_BASE_URL", DEFAULT_API_BASE_URL, &mut lookup)?;
        let auth_base_url = match optional_trimmed_env("POS_AUTH_BASE_URL", &mut lookup) {
            Some(value) => parse_url_value("POS_AUTH_BASE_URL", value)?,
            None => api_base_url.clone(),
        };

        let polling_interval_ms = parse_optional_u64_with_default(
            "POS_POLLING_INTERVAL_MS",
            DEFAULT_POLLING_INTERVAL_MS,
            &mut lookup,
        )?;
        let request_timeout_ms = parse_optional_u64_with_default(
            "POS_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
            &mut lookup,
        )?;
        let retry_base_delay_ms = parse_optional_u64_with_default(
            "POS_RETRY_BASE_DELAY_MS",
            DEFAULT_RETRY_BASE_DELAY_MS,
            &mut lookup,
        )?;

        let enable_polling = parse_bool("POS_ENABLE_POLLING", true, &mut lookup)?;
        let enable_focus_refresh = parse_bool("POS_ENABLE_FOCUS_REFRESH", true, &mut lookup)?;
        let enable_mutation_events = parse_bool("POS_ENABLE_MUTATION_EVENTS", true, &mut lookup)?;

        if polling_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POS_POLLING_INTERVAL_MS",
                value: "0".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POS_REQUEST_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        Ok(Self {
            api_base_url,
            auth_base_url,
            polling_interval: Duration::from_millis(polling_interval_ms),
            enable_polling,
            enable_focus_refresh,
            enable_mutation_events,
            request_timeout: Duration::from_millis(request_timeout_ms),
            retry_base_delay_ms,
            terminal_id: optional_trimmed_env("POS_TERMINAL_ID", &mut lookup),
            email: optional_trimmed_env("POS_EMAIL", &mut lookup),
            password: lookup("POS_PASSWORD").filter(|value| !value.is_empty()),
        })
    }

    /// Sign-in credentials when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.email.as_deref()?, self.password.as_deref()?))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base_delay_ms, MAX_RETRY_DELAY_MS, REQUEST_ATTEMPTS)
    }

    pub fn request_client_config(&self) -> RequestClientConfig {
        let mut config = RequestClientConfig::new(self.api_base_url.clone());
        config.timeout = self.request_timeout;
        config.retry = self.retry_policy();
        config
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            enable_polling: self.enable_polling,
            polling_interval: self.polling_interval,
            enable_focus_refresh: self.enable_focus_refresh,
            enable_mutation_events: self.enable_mutation_events,
            ..RealtimeConfig::default()
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_url<F>(key: &'static str, default: &str, lookup: &mut F) -> Result<Url, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = optional_trimmed_env(key, lookup).unwrap_or_else(|| default.to_owned());
    parse_url_value(key, value)
}

fn parse_url_value(key: &'static str, value: String) -> Result<Url, ConfigError> {
    match Url::parse(&value) {
        Ok(url) if url.cannot_be_a_base() => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "must be a hierarchical URL".to_owned(),
        }),
        Ok(url) => Ok(url),
        Err(err) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        }),
    }
}

fn parse_optional_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_bool<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true/false".to_owned(),
        }),
    }
}
