use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.venice.ai/api/v1";
pub const DEFAULT_MOUNT_PREFIX: &str = "/api/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first try.
    pub max_retries: u32,
    /// Seed for exponential backoff (seconds).
    pub base_delay_secs: f64,
    /// Fixed sleep for the "too many failed attempts" 429 variant (seconds).
    pub lockout_wait_secs: u64,
    /// Upper bound of the uniform jitter added to each backoff (seconds).
    pub jitter_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_secs: 1.0,
            lockout_wait_secs: 30,
            jitter_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
        }
    }
}

/// Process-wide settings; loaded once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub upstream_base_url: String,
    /// Path the proxy listens under, normalized to `/a/b` (or empty for root).
    pub mount_prefix: String,
    /// Outer wall-clock bound per inbound request, retries and sleeps included.
    pub request_timeout_secs: f64,
    pub retry: RetryConfig,
    pub listen: ListenConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            mount_prefix: DEFAULT_MOUNT_PREFIX.to_string(),
            request_timeout_secs: 300.0,
            retry: RetryConfig::default(),
            listen: ListenConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn upstream_base(&self) -> &str {
        self.upstream_base_url.trim_end_matches('/')
    }

    /// Apply the environment-style keys on top of whatever was loaded so far.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENAI_BASE_URL") {
            self.upstream_base_url = v.trim().to_string();
        }
        if let Some(v) = get("PROXY_PATH_PREFIX") {
            self.mount_prefix = v.trim().to_string();
        }
        if let Some(v) = get("TIMEOUT") {
            self.request_timeout_secs = parse_env("TIMEOUT", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            self.retry.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("BASE_RETRY_DELAY") {
            self.retry.base_delay_secs = parse_env("BASE_RETRY_DELAY", &v)?;
        }
        if let Some(v) = get("RATE_LIMIT_WAIT") {
            self.retry.lockout_wait_secs = parse_env("RATE_LIMIT_WAIT", &v)?;
        }
        if let Some(v) = get("RETRY_JITTER") {
            self.retry.jitter_secs = parse_env("RETRY_JITTER", &v)?;
        }
        if let Some(v) = get("HOST") {
            self.listen.host = v.trim().to_string();
        }
        if let Some(v) = get("PORT") {
            self.listen.port = parse_env("PORT", &v)?;
        }
        Ok(())
    }

    /// Normalize and check invariants the handler relies on.
    pub fn validate(mut self) -> Result<Self> {
        let base = reqwest::Url::parse(self.upstream_base())
            .with_context(|| format!("invalid upstream base url {}", self.upstream_base_url))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            bail!(
                "upstream base url must be http or https, got scheme '{}'",
                base.scheme()
            );
        }
        self.upstream_base_url = self.upstream_base().to_string();
        self.mount_prefix = normalize_mount_prefix(&self.mount_prefix);

        if !self.request_timeout_secs.is_finite() || self.request_timeout_secs <= 0.0 {
            bail!("request timeout must be a positive number of seconds");
        }
        if !self.retry.base_delay_secs.is_finite() || self.retry.base_delay_secs < 0.0 {
            bail!("base retry delay must be a non-negative number of seconds");
        }
        if !self.retry.jitter_secs.is_finite() || self.retry.jitter_secs < 0.0 {
            bail!("retry jitter must be a non-negative number of seconds");
        }
        Ok(self)
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid value for {key}: '{raw}' ({e})"))
}

fn normalize_mount_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// venice-proxy home directory (config file lives here).
pub fn proxy_home_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".venice-proxy")
}

pub fn default_config_path() -> PathBuf {
    proxy_home_dir().join("config.toml")
}

fn read_config_file(path: &Path) -> Result<ProxyConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str::<ProxyConfig>(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Defaults, then the TOML file, then the process environment.
///
/// An explicit `path` must exist; the default location is optional.
pub fn load_config(path: Option<&Path>) -> Result<ProxyConfig> {
    let mut cfg = match path {
        Some(p) => {
            info!("loading config from {}", p.display());
            read_config_file(p)?
        }
        None => {
            let p = default_config_path();
            if p.exists() {
                info!("loading config from {}", p.display());
                read_config_file(&p)?
            } else {
                ProxyConfig::default()
            }
        }
    };
    cfg.apply_env(|k| std::env::var(k).ok())?;
    cfg.validate()
}
