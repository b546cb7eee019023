use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use matching_domain::match_token::{self, TokenConfigError};
use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8788";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_PUBLIC_BASE_URL: &str = "https://tripmatch.com";
const DEFAULT_RESPOND_TOKEN_TTL_HOURS: u32 = 72;
const DEFAULT_VIEW_TOKEN_TTL_HOURS: u32 = 336;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    /// Base URL the fragment links in emails point at.
    pub public_base_url: String,
    pub match_token_secret: String,
    pub respond_token_ttl_hours: u32,
    pub view_token_ttl_hours: u32,
    pub match_store_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TM_MATCH_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid {variable} value '{value}': expected a positive number of hours")]
    InvalidTokenTtl {
        variable: &'static str,
        value: String,
    },
    #[error(transparent)]
    MatchTokenSecret(#[from] TokenConfigError),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env::var("TM_MATCH_BIND_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = env::var("TM_MATCH_LOG_FILTER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let public_base_url = env::var("TM_MATCH_PUBLIC_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());

        // The secret check runs here so a misconfigured process dies at
        // startup, not at first mint.
        let match_token_secret = env::var("TM_MATCH_TOKEN_SECRET").unwrap_or_default();
        match_token::validate_secret(&match_token_secret)?;

        let respond_token_ttl_hours = ttl_hours_from_env(
            "TM_MATCH_RESPOND_TOKEN_TTL_HOURS",
            DEFAULT_RESPOND_TOKEN_TTL_HOURS,
        )?;
        let view_token_ttl_hours =
            ttl_hours_from_env("TM_MATCH_VIEW_TOKEN_TTL_HOURS", DEFAULT_VIEW_TOKEN_TTL_HOURS)?;

        let match_store_path = env::var("TM_MATCH_STORE_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            bind_addr,
            log_filter,
            public_base_url,
            match_token_secret,
            respond_token_ttl_hours,
            view_token_ttl_hours,
            match_store_path,
        })
    }

    pub fn for_tests(match_store_path: Option<PathBuf>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            public_base_url: "https://tripmatch.test".to_string(),
            match_token_secret: "integration-test-secret-0123456789abcdef".to_string(),
            respond_token_ttl_hours: DEFAULT_RESPOND_TOKEN_TTL_HOURS,
            view_token_ttl_hours: DEFAULT_VIEW_TOKEN_TTL_HOURS,
            match_store_path,
        }
    }
}

fn ttl_hours_from_env(variable: &'static str, default: u32) -> Result<u32, ConfigError> {
    let Some(raw) = env::var(variable)
        .ok()
        .filter(|value| !value.trim().is_empty())
    else {
        return Ok(default);
    };

    match raw.trim().parse::<u32>() {
        Ok(hours) if hours > 0 => Ok(hours),
        _ => Err(ConfigError::InvalidTokenTtl {
            variable,
            value: raw,
        }),
    }
}
