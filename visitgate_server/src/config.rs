//! Server configuration loaded from environment variables

use crate::abuse::RateLimitConfig;
use crate::routes::diversion::DiversionStrategy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use visitgate_core::{constants, BanPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to
    pub host: String,

    /// Public port for proxied traffic
    pub port: u16,

    /// Upstream origin that allowed traffic is forwarded to
    pub target_url: reqwest::Url,

    /// PostgreSQL connection string (in-memory ledger when unset)
    pub database_url: Option<String>,

    /// Maximum pooled database connections
    pub db_max_connections: u32,

    /// Upper bound for a single ledger operation
    pub storage_timeout: Duration,

    /// Redis connection string for shared rate-limit counters
    pub redis_url: Option<String>,

    /// Hours after first visit before an address is banned
    pub ban_duration_hours: u32,

    /// Trust crawler user agents and whitelisted addresses
    pub allow_search_bots: bool,

    /// Extra crawler user-agent tokens
    pub trusted_agent_tokens: Vec<String>,

    /// YAML whitelist source
    pub whitelist_file: Option<PathBuf>,

    /// Extra literal whitelisted addresses
    pub whitelist_addresses: Vec<String>,

    /// Honour X-Forwarded-For / X-Real-IP
    pub trust_proxy_headers: bool,

    /// Reverse proxies in front of this one; each appends one `X-Forwarded-For` entry
    pub trusted_proxy_hops: usize,

    /// How banned clients are answered
    pub diversion_strategy: DiversionStrategy,

    /// Delay before answering a banned client
    pub redirect_delay: Duration,

    /// Front-door requests per window per address (0 disables)
    pub rate_limit_max: u32,

    /// Front-door rate-limit window
    pub rate_limit_window_secs: u64,

    /// Bearer token for the admin routes (admin disabled when unset)
    pub admin_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let target_url = var("TARGET_URL").ok_or(ConfigError::MissingEnv("TARGET_URL"))?;
        let target_url = reqwest::Url::parse(&target_url)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
            .ok_or(ConfigError::InvalidTargetUrl(target_url))?;

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: var("PORT")
                .unwrap_or_else(|| "3000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            target_url,
            database_url: var("DATABASE_URL"),
            db_max_connections: parse_or(var("DB_MAX_CONNECTIONS"), "DB_MAX_CONNECTIONS", 10)?,
            storage_timeout: Duration::from_millis(parse_or(
                var("STORAGE_TIMEOUT_MS"),
                "STORAGE_TIMEOUT_MS",
                constants::DEFAULT_STORAGE_TIMEOUT_MS,
            )?),
            redis_url: var("REDIS_URL"),
            ban_duration_hours: parse_or(
                var("BAN_DURATION_HOURS"),
                "BAN_DURATION_HOURS",
                constants::DEFAULT_BAN_DURATION_HOURS,
            )?,
            // Only an explicit "false" turns crawler trust off
            allow_search_bots: var("ALLOW_SEARCH_BOTS").map_or(true, |v| !v.eq_ignore_ascii_case("false")),
            trusted_agent_tokens: split_list(var("TRUSTED_AGENT_TOKENS")),
            whitelist_file: var("WHITELIST_FILE").map(PathBuf::from),
            whitelist_addresses: split_list(var("WHITELIST_ADDRESSES")),
            trust_proxy_headers: parse_flag(var("TRUST_PROXY_HEADERS"), "TRUST_PROXY_HEADERS", true)?,
            trusted_proxy_hops: parse_or(var("TRUSTED_PROXY_HOPS"), "TRUSTED_PROXY_HOPS", 1)?,
            diversion_strategy: parse_or(
                var("DIVERSION_STRATEGY"),
                "DIVERSION_STRATEGY",
                DiversionStrategy::RedirectLoop,
            )?,
            redirect_delay: Duration::from_millis(parse_or(var("REDIRECT_DELAY_MS"), "REDIRECT_DELAY_MS", 1000)?),
            rate_limit_max: parse_or(var("RATE_LIMIT_MAX"), "RATE_LIMIT_MAX", 100)?,
            rate_limit_window_secs: parse_or(var("RATE_LIMIT_WINDOW_SECS"), "RATE_LIMIT_WINDOW_SECS", 900)?,
            admin_token: var("ADMIN_TOKEN"),
        })
    }

    /// Socket address string to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ban threshold and storage timeout for the engine
    pub fn ban_policy(&self) -> BanPolicy {
        BanPolicy {
            ban_duration_hours: self.ban_duration_hours,
            storage_timeout: self.storage_timeout,
        }
    }

    /// Proxy hops honoured when resolving the client address (0 when headers are ignored)
    pub fn forwarding_hops(&self) -> usize {
        if self.trust_proxy_headers {
            self.trusted_proxy_hops
        } else {
            0
        }
    }

    /// Front-door rate limit, `None` when disabled
    pub fn rate_limit(&self) -> Option<RateLimitConfig> {
        (self.rate_limit_max > 0 && self.rate_limit_window_secs > 0)
            .then(|| RateLimitConfig::new(self.rate_limit_max, self.rate_limit_window_secs))
    }

    /// Upstream origin, e.g. "https://example.org"
    pub fn target_origin(&self) -> String {
        self.target_url.origin().ascii_serialization()
    }
}

fn parse_or<T: FromStr>(value: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

fn parse_flag(value: Option<String>, name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let lowered = value.as_deref().map(str::to_ascii_lowercase);
    match lowered.as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(_) => Err(ConfigError::Invalid {
            name,
            value: value.unwrap_or_default(),
        }),
    }
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid TARGET_URL '{0}': expected an absolute http(s) URL")]
    InvalidTargetUrl(String),

    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("TARGET_URL", "https://example.org")]).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:3000");
        assert_eq!(config.ban_duration_hours, 4);
        assert!(config.allow_search_bots);
        assert!(config.trust_proxy_headers);
        assert_eq!(config.trusted_proxy_hops, 1);
        assert_eq!(config.diversion_strategy, DiversionStrategy::RedirectLoop);
        assert_eq!(config.redirect_delay, Duration::from_millis(1000));
        assert_eq!(config.database_url, None);
        assert_eq!(config.admin_token, None);
        assert_eq!(config.target_origin(), "https://example.org");

        let limit = config.rate_limit().unwrap();
        assert_eq!(limit.max_requests, 100);
        assert_eq!(limit.window.as_secs(), 900);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TARGET_URL", "http://upstream.internal:8081/"),
            ("PORT", "8080"),
            ("BAN_DURATION_HOURS", "12"),
            ("ALLOW_SEARCH_BOTS", "FALSE"),
            ("TRUSTED_AGENT_TOKENS", "uptimerobot, pingdom ,"),
            ("WHITELIST_ADDRESSES", "203.0.113.7"),
            ("DIVERSION_STRATEGY", "error"),
            ("REDIRECT_DELAY_MS", "0"),
            ("RATE_LIMIT_MAX", "0"),
            ("TRUSTED_PROXY_HOPS", "2"),
            ("ADMIN_TOKEN", "s3cret"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.ban_policy().ban_duration_hours, 12);
        assert!(!config.allow_search_bots);
        assert_eq!(config.trusted_agent_tokens, vec!["uptimerobot", "pingdom"]);
        assert_eq!(config.whitelist_addresses, vec!["203.0.113.7"]);
        assert_eq!(config.diversion_strategy, DiversionStrategy::GenericError);
        assert_eq!(config.redirect_delay, Duration::ZERO);
        assert!(config.rate_limit().is_none());
        assert_eq!(config.forwarding_hops(), 2);

        let untrusted = load(&[
            ("TARGET_URL", "https://example.org"),
            ("TRUST_PROXY_HEADERS", "false"),
            ("TRUSTED_PROXY_HOPS", "2"),
        ])
        .unwrap();
        assert_eq!(untrusted.forwarding_hops(), 0);
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.target_origin(), "http://upstream.internal:8081");
    }

    #[test]
    fn test_any_value_but_false_keeps_bots_allowed() {
        let config = load(&[("TARGET_URL", "https://example.org"), ("ALLOW_SEARCH_BOTS", "0")]).unwrap();
        assert!(config.allow_search_bots);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingEnv("TARGET_URL"))));
        assert!(matches!(
            load(&[("TARGET_URL", "ftp://example.org")]),
            Err(ConfigError::InvalidTargetUrl(_))
        ));
        assert!(matches!(
            load(&[("TARGET_URL", "https://example.org"), ("PORT", "http")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            load(&[("TARGET_URL", "https://example.org"), ("BAN_DURATION_HOURS", "-1")]),
            Err(ConfigError::Invalid { name: "BAN_DURATION_HOURS", .. })
        ));
        assert!(matches!(
            load(&[("TARGET_URL", "https://example.org"), ("DIVERSION_STRATEGY", "tarpit")]),
            Err(ConfigError::Invalid { name: "DIVERSION_STRATEGY", .. })
        ));
        assert!(matches!(
            load(&[("TARGET_URL", "https://example.org"), ("TRUST_PROXY_HEADERS", "maybe")]),
            Err(ConfigError::Invalid { name: "TRUST_PROXY_HEADERS", .. })
        ));
    }
}
