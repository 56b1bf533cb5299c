use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};
use url::Url;

use crate::errors::{Error, Result};

pub const DEFAULT_APP_ID: u32 = 82349;
pub const DEFAULT_ENDPOINT: &str = "wss://ws.binaryws.com/websockets/v3";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_purchase_timeout_ms")]
    pub purchase_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Send `forget` when the last listener of a feed unsubscribes.
    #[serde(default)]
    pub forget_idle_feeds: bool,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub token_exchange: TokenExchangeConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay randomised in either direction, `0.0` disables it.
    #[serde(default)]
    pub jitter: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenExchangeConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_token_path")]
    pub path: String,
    #[serde(default)]
    pub bearer: Option<String>,
}

fn default_app_id() -> u32 {
    DEFAULT_APP_ID
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_purchase_timeout_ms() -> u64 {
    15_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    3_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_token_path() -> String {
    "/api/auth/deriv/get-token".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            endpoint: default_endpoint(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            purchase_timeout_ms: default_purchase_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            forget_idle_feeds: false,
            reconnect: ReconnectConfig::default(),
            token_exchange: TokenExchangeConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: 0.0,
        }
    }
}

impl Default for TokenExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            path: default_token_path(),
            bearer: None,
        }
    }
}

impl SessionConfig {
    /// Parse TOML, accepting either a `[deriv]` table or top-level keys.
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(data)?;
        let config = match raw.get("deriv") {
            Some(table) => Self::deserialize(table.clone())?,
            None => Self::deserialize(raw)?,
        };
        Ok(config)
    }

    /// Load from disk, apply `DERIV_*` environment overrides, then validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&data)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for setups without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(parsed) = lookup("DERIV_APP_ID").and_then(|value| value.parse().ok()) {
            self.app_id = parsed;
        }
        if let Some(value) = lookup("DERIV_WS_URL") {
            self.endpoint = value;
        }
        if let Some(value) = lookup("DERIV_TOKEN_BASE_URL") {
            self.token_exchange.base_url = value;
        }
        if let Some(value) = lookup("DERIV_TOKEN_BEARER") {
            self.token_exchange.bearer = Some(value).filter(|bearer| !bearer.is_empty());
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.connect_timeout_ms > 0, "connect_timeout_ms must be greater than zero")?;
        ensure(self.request_timeout_ms > 0, "request_timeout_ms must be greater than zero")?;
        ensure(self.purchase_timeout_ms > 0, "purchase_timeout_ms must be greater than zero")?;
        ensure(
            self.heartbeat_interval_ms > 0,
            "heartbeat_interval_ms must be greater than zero",
        )?;
        ensure(self.reconnect.multiplier >= 1.0, "reconnect.multiplier must be >= 1.0")?;
        ensure(
            self.reconnect.max_delay_ms >= self.reconnect.initial_delay_ms,
            "reconnect.max_delay_ms must be >= reconnect.initial_delay_ms",
        )?;
        ensure(
            (0.0..1.0).contains(&self.reconnect.jitter),
            "reconnect.jitter must be within [0, 1)",
        )?;

        let url = Url::parse(&self.endpoint)
            .map_err(|err| Error::Config(format!("endpoint {:?}: {err}", self.endpoint)))?;
        ensure(
            matches!(url.scheme(), "ws" | "wss"),
            "endpoint must use the ws or wss scheme",
        )?;

        if !self.token_exchange.base_url.is_empty() {
            Url::parse(&self.token_exchange.base_url).map_err(|err| {
                Error::Config(format!("token_exchange.base_url: {err}"))
            })?;
        }
        Ok(())
    }

    /// Endpoint with the `app_id` query parameter attached.
    pub fn ws_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)?;
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "app_id")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair("app_id", &self.app_id.to_string());
        Ok(url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn purchase_timeout(&self) -> Duration {
        Duration::from_millis(self.purchase_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Config(message.to_string()))
    }
}
