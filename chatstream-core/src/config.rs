use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::error::{ChatStreamError, CoreResult};
use crate::retry::{Backoff, RetryPolicy};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_TEMPERATURE: f32 = 0.0;
pub const DEFAULT_TOP_P: f32 = 1.0;
pub const DEFAULT_FREQUENCY_PENALTY: f32 = 0.2;
pub const DEFAULT_PRESENCE_PENALTY: f32 = 0.1;
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Connection and sampling settings for one client. Read-only once built;
/// numeric ranges are enforced by the remote service, not here.
#[derive(Debug)]
pub struct RequestConfig {
    api_key: SecretString,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl RequestConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        let key: String = api_key.into();
        Self {
            api_key: SecretString::from(key),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            frequency_penalty: DEFAULT_FREQUENCY_PENALTY,
            presence_penalty: DEFAULT_PRESENCE_PENALTY,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
    pub fn with_max_tokens(mut self, v: u32) -> Self {
        self.max_tokens = v;
        self
    }
    pub fn with_temperature(mut self, v: f32) -> Self {
        self.temperature = v;
        self
    }
    pub fn with_top_p(mut self, v: f32) -> Self {
        self.top_p = v;
        self
    }
    pub fn with_frequency_penalty(mut self, v: f32) -> Self {
        self.frequency_penalty = v;
        self
    }
    pub fn with_presence_penalty(mut self, v: f32) -> Self {
        self.presence_penalty = v;
        self
    }

    /// Value for the `Authorization` header.
    pub(crate) fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// Retry settings as written in the config file. Leaving everything out
/// retries forever on a 1s header timeout with no delay between attempts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RetryCfg {
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub max_elapsed_ms: Option<u64>,
    #[serde(default)]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// 0 = no delay between attempts
    #[serde(default)]
    pub backoff_max_ms: u64,
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_attempts: None,
            max_elapsed_ms: None,
            backoff_initial_ms: 0,
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: 0,
        }
    }
}

fn default_attempt_timeout_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub retry: RetryCfg,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            http: HttpCfg::default(),
            retry: RetryCfg::default(),
        }
    }
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(ChatStreamError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| ChatStreamError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| ChatStreamError::Other(e.into()))?
            }
            Some("toml") => {
                toml::from_str::<Self>(s).map_err(|e| ChatStreamError::Other(e.into()))?
            }
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| ChatStreamError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| ChatStreamError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }

    /// Resolve the API key from the environment and apply sampling overrides.
    pub fn request_config(&self) -> CoreResult<RequestConfig> {
        let key = std::env::var(&self.api_key_env).map_err(|_| {
            ChatStreamError::Validation(format!("environment variable {} is not set", self.api_key_env))
        })?;
        self.request_config_with_key(key)
    }

    pub fn request_config_with_key(&self, key: impl Into<String>) -> CoreResult<RequestConfig> {
        let key: String = key.into();
        if key.trim().is_empty() {
            return Err(ChatStreamError::Validation("api key is empty".into()));
        }
        let mut rc = RequestConfig::new(key);
        if let Some(m) = &self.model {
            rc = rc.with_model(m.clone());
        }
        if let Some(v) = self.max_tokens {
            rc = rc.with_max_tokens(v);
        }
        if let Some(v) = self.temperature {
            rc = rc.with_temperature(v);
        }
        if let Some(v) = self.top_p {
            rc = rc.with_top_p(v);
        }
        if let Some(v) = self.frequency_penalty {
            rc = rc.with_frequency_penalty(v);
        }
        if let Some(v) = self.presence_penalty {
            rc = rc.with_presence_penalty(v);
        }
        Ok(rc)
    }

    pub fn retry_policy(&self) -> CoreResult<RetryPolicy> {
        let r = &self.retry;
        if r.attempt_timeout_ms == 0 {
            return Err(ChatStreamError::Validation(
                "retry.attempt_timeout_ms must be greater than zero".into(),
            ));
        }
        if r.max_attempts == Some(0) {
            return Err(ChatStreamError::Validation(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(r.backoff_multiplier.is_finite() && r.backoff_multiplier >= 1.0) {
            return Err(ChatStreamError::Validation(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        let backoff = if r.backoff_max_ms == 0 {
            Backoff::none()
        } else {
            Backoff {
                initial: Duration::from_millis(r.backoff_initial_ms),
                multiplier: r.backoff_multiplier,
                max: Duration::from_millis(r.backoff_max_ms),
            }
        };
        Ok(RetryPolicy {
            attempt_timeout: Duration::from_millis(r.attempt_timeout_ms),
            max_attempts: r.max_attempts,
            max_elapsed: r.max_elapsed_ms.map(Duration::from_millis),
            backoff,
        })
    }

    /// Full chat-completions URL for this config.
    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}
