//! Configuration types for tierguard.
//!
//! Config is loaded once at startup from a TOML file and validated before
//! the server opens any ports. Invalid configs are rejected with a clear
//! error rather than silently falling back to defaults. Secrets never live
//! in the file — only the *names* of environment variables that hold them.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 8080
//!
//! [local]
//! base_url = "http://localhost:11434"
//! model    = "qwen2.5:1.5b"
//!
//! [remote]
//! api_key_env = "OPENROUTER_API_KEY"
//!
//! [router]
//! mode = "auto"
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::routing::{RoutingMode, Tier};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.gateway.port != 0, "gateway.port must be non-zero");
        anyhow::ensure!(
            self.cache.capacity > 0,
            "cache.capacity must be at least 1"
        );
        anyhow::ensure!(
            self.remote.max_retries <= 10,
            "remote.max_retries above 10 is runaway territory"
        );
        if let Some(cap) = self.router.max_tier {
            anyhow::ensure!(
                !matches!(cap, Tier::Cache),
                "router.max_tier = \"cache\" would disable inference entirely"
            );
        }
        Ok(())
    }
}

/// HTTP server settings. The listener binds `127.0.0.1` only — exposing the
/// gateway beyond the host is a reverse proxy's job, with its own auth.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port on 127.0.0.1 (default: 8080).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Maximum requests per minute per client IP. Unset or 0 disables
    /// rate limiting. Burst allowance is half the RPM, rounded up.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Environment variable holding the Bearer token required on every
    /// request. Unset disables client auth (loopback-only deployments).
    #[serde(default)]
    pub auth_token_env: Option<String>,

    /// Optional allow-list of client IPs checked before auth.
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Force local routing for every request, regardless of grade.
    #[serde(default)]
    pub paranoid: bool,

    /// Start in offline mode: loopback-only networking, cloud disabled.
    #[serde(default)]
    pub offline: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            rate_limit_rpm: None,
            auth_token_env: None,
            allowed_ips: Vec::new(),
            paranoid: false,
            offline: false,
        }
    }
}

impl GatewayConfig {
    /// Resolve the client auth token from the environment.
    pub fn auth_token(&self) -> Option<String> {
        self.auth_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|token| !token.is_empty())
    }
}

/// Local inference daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalConfig {
    /// Daemon base URL; must be loopback when offline.
    #[serde(default = "defaults::local_base_url")]
    pub base_url: String,

    /// Default model tag, used when no hint-specific model is configured.
    #[serde(default = "defaults::local_model")]
    pub model: String,

    /// Hint-specific model tags, keyed by the router's model hint
    /// (`"fast"` | `"code"` | `"reasoning"`). A debugging query can land on
    /// a coder model while lookups stay on the small fast one.
    #[serde(default)]
    pub models: HashMap<String, String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::local_base_url(),
            model: defaults::local_model(),
            models: HashMap::new(),
        }
    }
}

impl LocalConfig {
    /// Model tag for a routing hint, falling back to the default model.
    pub fn model_for_hint(&self, hint: Option<&str>) -> &str {
        hint.and_then(|h| self.models.get(h))
            .map(String::as_str)
            .unwrap_or(&self.model)
    }
}

/// Remote inference gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// Gateway base URL.
    #[serde(default = "defaults::remote_base_url")]
    pub base_url: String,

    /// Environment variable whose value is the API key. Unset means no
    /// cloud credential: every remote recommendation degrades to Local.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Default model (the gateway's auto-router when left as-is).
    #[serde(default = "defaults::remote_model")]
    pub model: String,

    /// Unary request timeout in milliseconds (default: 60 000).
    #[serde(default = "defaults::remote_timeout_ms")]
    pub timeout_ms: u64,

    /// Retry budget for transient failures (default: 3).
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Optional `HTTP-Referer` attribution header.
    #[serde(default)]
    pub site_url: Option<String>,

    /// Optional `X-Title` attribution header.
    #[serde(default)]
    pub site_name: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::remote_base_url(),
            api_key_env: None,
            model: defaults::remote_model(),
            timeout_ms: defaults::remote_timeout_ms(),
            max_retries: defaults::max_retries(),
            site_url: None,
            site_name: None,
        }
    }
}

impl RemoteConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

/// Routing behaviour.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Routing mode (default: auto).
    #[serde(default)]
    pub mode: RoutingMode,

    /// Optional cost cap on the tier ladder.
    #[serde(default)]
    pub max_tier: Option<Tier>,
}

/// Response cache.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "defaults::cache_enabled")]
    pub enabled: bool,

    /// Maximum cached responses (default: 1000).
    #[serde(default = "defaults::cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::cache_enabled(),
            capacity: defaults::cache_capacity(),
        }
    }
}

/// Tool executor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    /// Working directory for the shell tool. Unset means the process cwd.
    #[serde(default)]
    pub workdir: Option<String>,

    /// Tool output truncation cap in bytes (default: 30 720).
    #[serde(default = "defaults::max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            workdir: None,
            max_output_bytes: defaults::max_output_bytes(),
        }
    }
}

mod defaults {
    pub fn port() -> u16 { 8080 }
    pub fn local_base_url() -> String { "http://localhost:11434".into() }
    pub fn local_model() -> String { "qwen2.5:1.5b".into() }
    pub fn remote_base_url() -> String { "https://openrouter.ai/api/v1".into() }
    pub fn remote_model() -> String { "openrouter/auto".into() }
    pub fn remote_timeout_ms() -> u64 { 60_000 }
    pub fn max_retries() -> u32 { 3 }
    pub fn cache_enabled() -> bool { true }
    pub fn cache_capacity() -> usize { 1000 }
    pub fn max_output_bytes() -> usize { 30 * 1024 }
}
