//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{LimitRule, RateLimitPolicy, TokenOverride, DEFAULT_STORE_TIMEOUT};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Rate state store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Take the client address from `X-Real-IP` when present.
    /// Only safe behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_proxy_headers: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests admitted per window for an IP address
    #[serde(default = "default_max_requests_ip")]
    pub max_requests_per_second_ip: u64,

    /// Requests admitted per window for a token without an override
    #[serde(default = "default_max_requests_token")]
    pub max_requests_per_second_token: u64,

    #[serde(default = "default_window", with = "duration")]
    pub window_ip: Duration,

    #[serde(default = "default_window", with = "duration")]
    pub window_token: Duration,

    #[serde(default = "default_block_duration", with = "duration")]
    pub block_duration_ip: Duration,

    #[serde(default = "default_block_duration", with = "duration")]
    pub block_duration_token: Duration,

    /// Per-token overrides, `name:rate/interval_secs` separated by commas
    #[serde(default)]
    pub tokens: String,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second_ip: default_max_requests_ip(),
            max_requests_per_second_token: default_max_requests_token(),
            window_ip: default_window(),
            window_token: default_window(),
            block_duration_ip: default_block_duration(),
            block_duration_token: default_block_duration(),
            tokens: String::new(),
        }
    }
}

fn default_max_requests_ip() -> u64 {
    5
}

fn default_max_requests_token() -> u64 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(1)
}

fn default_block_duration() -> Duration {
    Duration::from_secs(60)
}

/// Which rate state store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; state is per instance
    #[default]
    Memory,
    /// Redis server shared by all instances (requires the `redis` feature)
    Redis,
}

/// Rate state store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, password included if any
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Bound on each store call
    #[serde(default = "default_store_timeout", with = "duration")]
    pub timeout: Duration,

    /// How often the in-memory store sweeps expired records; zero disables sweeping
    #[serde(default = "default_purge_interval", with = "duration")]
    pub purge_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout: default_store_timeout(),
            purge_interval: default_purge_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_store_timeout() -> Duration {
    DEFAULT_STORE_TIMEOUT
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(30)
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load defaults, then the optional YAML file, then `TURNSTILE_*` environment
    /// variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::layered(path, None)
    }

    fn layered(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Validate the rate limiting section and build the engine policy.
    pub fn policy(&self) -> Result<RateLimitPolicy> {
        let rl = &self.rate_limiting;
        let ip = LimitRule {
            max_requests: rl.max_requests_per_second_ip,
            window: rl.window_ip,
            block_duration: rl.block_duration_ip,
        };
        let token = LimitRule {
            max_requests: rl.max_requests_per_second_token,
            window: rl.window_token,
            block_duration: rl.block_duration_token,
        };

        RateLimitPolicy::new(ip, token, parse_token_overrides(&rl.tokens)?)
    }
}

/// Parse `name:rate/interval[,name:rate/interval...]` into per-token overrides.
///
/// `rate` is the per-window threshold and `interval` the window length in seconds.
/// Token names may contain `:`; only the last one separates the values.
pub fn parse_token_overrides(raw: &str) -> Result<HashMap<String, TokenOverride>> {
    let mut overrides = HashMap::new();

    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, values) = pair
            .rsplit_once(':')
            .ok_or_else(|| TurnstileError::Config(format!("invalid token format: {}", pair)))?;
        let (rate, interval) = values.split_once('/').ok_or_else(|| {
            TurnstileError::Config(format!("invalid token values format: {}", values))
        })?;

        let max_requests: u64 = rate
            .trim()
            .parse()
            .map_err(|_| TurnstileError::Config(format!("invalid rate limit value: {}", rate)))?;
        let interval_secs: u64 = interval.trim().parse().map_err(|_| {
            TurnstileError::Config(format!("invalid rate interval value: {}", interval))
        })?;
        if max_requests == 0 || interval_secs == 0 {
            return Err(TurnstileError::Config(format!(
                "token {} must have a positive rate and interval",
                name
            )));
        }

        let name = name.trim().to_string();
        let previous = overrides.insert(
            name.clone(),
            TokenOverride {
                max_requests,
                window: Duration::from_secs(interval_secs),
            },
        );
        if previous.is_some() {
            return Err(TurnstileError::Config(format!("duplicate token: {}", name)));
        }
    }

    Ok(overrides)
}

/// Durations as integer seconds or a string with a `ms`, `s`, `m` or `h` suffix.
mod duration {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(de::Error::custom),
        }
    }

    pub(super) fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (digits, unit) = text.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {:?}", text))?;

        match unit.trim() {
            "ms" => Ok(Duration::from_millis(value)),
            "" | "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
            "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
            other => Err(format!("unknown duration unit {:?} in {:?}", other, text)),
        }
    }
}
