//! Service configuration.
//!
//! Layered as defaults, then an optional TOML file, then `TOTEFLOW_*`
//! environment variables. [`AccrualConfig::validate`] runs last; a config that
//! fails validation must stop the process before anything is served.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::accrual::calculator::{FeeRate, BPS_DENOMINATOR};
use crate::accrual::rates::DEFAULT_VENUES;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A token deposits may be denominated in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub decimals: u8,
    /// Strategy label recorded on deposits that got the fallback rate.
    pub strategy: String,
}

impl TokenConfig {
    pub fn new(symbol: &str, decimals: u8, strategy: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            decimals,
            strategy: strategy.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccrualConfig {
    pub listen_addr: SocketAddr,
    /// redb file for the ledger. `None` keeps the ledger in memory.
    pub database_path: Option<PathBuf>,
    pub sweep_interval_secs: u64,
    pub platform_fee_bps: u32,
    pub fallback_rate_bps: u32,
    /// Base URL of the rate feed. `None` means every deposit gets the fallback rate.
    pub rate_feed_url: Option<String>,
    /// Venues quoted by the feed, in tie-break order. The best one wins.
    pub rate_venues: Vec<String>,
    /// Per-venue request timeout.
    pub rate_feed_timeout_secs: u64,
    /// Zero disables the rate cache.
    pub rate_cache_ttl_secs: u64,
    pub tokens: Vec<TokenConfig>,
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database_path: None,
            sweep_interval_secs: 3600,
            platform_fee_bps: FeeRate::DEFAULT.bps().get(),
            fallback_rate_bps: 1_000,
            rate_feed_url: None,
            rate_venues: DEFAULT_VENUES.iter().map(|v| v.to_string()).collect(),
            rate_feed_timeout_secs: 10,
            rate_cache_ttl_secs: 60,
            tokens: vec![TokenConfig::new("USDC", 6, "aave-v3")],
        }
    }
}

impl AccrualConfig {
    /// Optional TOML file, then the process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `TOTEFLOW_*` overrides read through `lookup`. Blank values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("TOTEFLOW_LISTEN_ADDR") {
            self.listen_addr = parse_var("TOTEFLOW_LISTEN_ADDR", &v)?;
        }
        if let Some(v) = get("TOTEFLOW_DB_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("TOTEFLOW_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse_var("TOTEFLOW_SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("TOTEFLOW_PLATFORM_FEE_BPS") {
            self.platform_fee_bps = parse_var("TOTEFLOW_PLATFORM_FEE_BPS", &v)?;
        }
        if let Some(v) = get("TOTEFLOW_FALLBACK_RATE_BPS") {
            self.fallback_rate_bps = parse_var("TOTEFLOW_FALLBACK_RATE_BPS", &v)?;
        }
        if let Some(v) = get("TOTEFLOW_RATE_FEED_URL") {
            self.rate_feed_url = Some(v);
        }
        if let Some(v) = get("TOTEFLOW_RATE_VENUES") {
            self.rate_venues = v
                .split(',')
                .map(str::trim)
                .filter(|venue| !venue.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("TOTEFLOW_RATE_FEED_TIMEOUT_SECS") {
            self.rate_feed_timeout_secs = parse_var("TOTEFLOW_RATE_FEED_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("TOTEFLOW_RATE_CACHE_TTL_SECS") {
            self.rate_cache_ttl_secs = parse_var("TOTEFLOW_RATE_CACHE_TTL_SECS", &v)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.platform_fee_bps > BPS_DENOMINATOR {
            return invalid(format!(
                "platform_fee_bps {} exceeds {BPS_DENOMINATOR}",
                self.platform_fee_bps
            ));
        }
        if self.sweep_interval_secs == 0 {
            return invalid("sweep_interval_secs must be positive".into());
        }
        if self.rate_feed_url.is_some() && self.rate_feed_timeout_secs == 0 {
            return invalid("rate_feed_timeout_secs must be positive when a feed is set".into());
        }
        if self.rate_feed_url.is_some() && self.rate_venues.is_empty() {
            return invalid("rate_venues must name at least one venue when a feed is set".into());
        }
        for (i, venue) in self.rate_venues.iter().enumerate() {
            if venue.trim().is_empty() || venue.contains('/') {
                return invalid(format!("rate_venues[{i}] {venue:?} is not a venue name"));
            }
        }
        if self.tokens.is_empty() {
            return invalid("at least one token must be configured".into());
        }
        for (i, token) in self.tokens.iter().enumerate() {
            if token.symbol.trim().is_empty() {
                return invalid(format!("tokens[{i}] has an empty symbol"));
            }
            // 10^38 is the largest power of ten below u128::MAX.
            if token.decimals > 38 {
                return invalid(format!("token {} has too many decimals", token.symbol));
            }
            if self.tokens[..i].iter().any(|t| t.symbol == token.symbol) {
                return invalid(format!("token {} is configured twice", token.symbol));
            }
        }
        Ok(())
    }

    pub fn fee_rate(&self) -> Result<FeeRate, ConfigError> {
        FeeRate::new(self.platform_fee_bps).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{key}={value:?}: {e}")))
}
