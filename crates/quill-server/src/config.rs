//! Configuration for the Quill Server
//!
//! Values come from, in increasing priority: built-in defaults, an optional
//! TOML file (`QUILL_CONFIG_FILE`, default `config/quill.toml`) and `QUILL__`
//! environment variables such as `QUILL__RESILIENCE__MAX_RETRIES=5`.

use std::env;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ServerError, ServerResult};
use crate::resilience::policy::{PolicyRule, PolicyTable, RateLimitPolicy};
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::resilience::ResilienceConfig;

/// Config file used when `QUILL_CONFIG_FILE` is not set
pub const DEFAULT_CONFIG_FILE: &str = "config/quill.toml";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,

    /// Log level filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,

    /// URL of the shared state service (`memory://` or `redis://`)
    #[serde(default = "default_shared_state_url")]
    pub shared_state_url: String,

    /// Retry, breaker and store tunables
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Per-route limits
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Generation service coordinates
    #[serde(default)]
    pub generation: GenerationConfig,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shared_state_url() -> String {
    "memory://local".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_host(),
            log_level: default_log_level(),
            json_logs: false,
            shared_state_url: default_shared_state_url(),
            resilience: ResilienceConfig::default(),
            rate_limits: RateLimitConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Shared state scope holding the counters
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Policy for paths no rule matches
    #[serde(default = "RateLimitPolicy::api")]
    pub default_policy: RateLimitPolicy,

    /// Path prefix rules
    #[serde(default = "default_rules")]
    pub rules: Vec<PolicyRule>,
}

fn default_scope() -> String {
    "ratelimit".to_string()
}

fn default_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule::new("/api/auth", RateLimitPolicy::auth()),
        PolicyRule::new("/api/letters/generate", RateLimitPolicy::generation()),
        PolicyRule::new("/api/admin", RateLimitPolicy::admin()),
    ]
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            default_policy: RateLimitPolicy::api(),
            rules: default_rules(),
        }
    }
}

impl RateLimitConfig {
    /// Route table described by this configuration
    pub fn policy_table(&self) -> PolicyTable {
        PolicyTable::new(self.rules.clone(), self.default_policy.clone())
    }
}

/// Generation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Base URL of the service
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key sent with every call
    #[serde(default)]
    pub api_key: Option<String>,

    /// API version header value
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Model used when a request does not name one
    #[serde(default = "default_model")]
    pub model: String,

    /// HTTP timeout for one call in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Prompt of the health canary call
    #[serde(default = "default_probe_prompt")]
    pub probe_prompt: String,
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_api_version() -> String {
    "2023-06-01".to_string()
}

fn default_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_probe_prompt() -> String {
    "Reply with OK.".to_string()
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_version: default_api_version(),
            model: default_model(),
            request_timeout_ms: default_request_timeout_ms(),
            probe_prompt: default_probe_prompt(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> ServerResult<Self> {
        let path = env::var("QUILL_CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        info!("Loading configuration (file: {})", path);

        let settings = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("QUILL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ServerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text, without consulting the environment
    pub fn from_toml(toml: &str) -> ServerResult<Self> {
        let config: ServerConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the resilience components cannot work with
    pub fn validate(&self) -> ServerResult<()> {
        let r = &self.resilience;

        if r.circuit_threshold == 0 {
            return Err(invalid("resilience.circuit_threshold must be at least 1"));
        }
        if r.circuit_reset_ms == 0 {
            return Err(invalid("resilience.circuit_reset_ms must be positive"));
        }
        if r.backoff_multiplier < 1.0 {
            return Err(invalid("resilience.backoff_multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&r.jitter_ratio) {
            return Err(invalid("resilience.jitter_ratio must be between 0 and 1"));
        }
        if r.attempt_timeout_ms == 0 || r.overall_deadline_ms == 0 {
            return Err(invalid("resilience timeouts must be positive"));
        }
        if r.base_delay_ms > r.max_delay_ms {
            return Err(invalid("resilience.base_delay_ms must not exceed max_delay_ms"));
        }

        let table = self.rate_limits.policy_table();
        if let Some(policy) = table.policies().find(|p| p.window_ms == 0) {
            return Err(invalid(&format!("rate limit policy '{}' has a zero window", policy.name)));
        }
        // ':' separates the parts of a counter key.
        if let Some(policy) = table.policies().find(|p| p.name.contains(':')) {
            return Err(invalid(&format!("rate limit policy name '{}' must not contain ':'", policy.name)));
        }

        Ok(())
    }

    /// Rate limiter settings
    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            scope: self.rate_limits.scope.clone(),
            store_timeout_ms: self.resilience.store_timeout_ms,
            fallback_max_entries: self.resilience.fallback_max_entries,
        }
    }
}

fn invalid(message: &str) -> ServerError {
    ServerError::ConfigError(message.to_string())
}
