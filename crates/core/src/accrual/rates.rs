//! Annual supply-rate lookup for new deposits.
//!
//! ## Venue selection
//!
//! The feed quotes one supply rate per lending venue. [`RateOracle`] asks every
//! configured venue in order, skips the ones that fail or time out, and picks
//! the highest rate. The first venue wins a tie. The winning venue becomes the
//! deposit's strategy label.
//!
//! ## Fallback policy
//!
//! Accrual must never stop because a rate feed is down. When no feed is
//! configured or every venue fails, the oracle answers with the configured
//! fallback rate (1000 bps by default). Feed errors are logged and never
//! returned to the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::calculator::{BasisPoints, BPS_DENOMINATOR};
use crate::config::AccrualConfig;

/// Feeds quoting more than 100% APY are treated as malformed (most likely a
/// percentage sent where a fraction was expected).
const MAX_FEED_RATE_BPS: u32 = BPS_DENOMINATOR;

pub const DEFAULT_VENUES: [&str; 3] = ["aave", "compound", "yearn"];

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RateFeedError {
    #[error("rate feed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed rate feed response: {0}")]
    Malformed(String),
    #[error("rate feed did not answer within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

// =============================================================================
// Trait: RateSource
// =============================================================================

pub type RateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<BasisPoints, RateFeedError>> + Send + 'a>>;

/// Abstraction over the external rate feed for testability.
pub trait RateSource: Send + Sync + 'static {
    /// Current annual supply rate for `token` at `venue`.
    fn fetch_rate<'a>(&'a self, venue: &'a str, token: &'a str) -> RateFuture<'a>;
}

// =============================================================================
// FeedRateSource: HTTP JSON feed
// =============================================================================

/// `GET {base_url}/protocols/{venue}/rates/{token}` answering `{"supplyRate": 0.055}`.
pub struct FeedRateSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct FeedResponse {
    #[serde(rename = "supplyRate")]
    supply_rate: f64,
}

impl FeedRateSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RateFeedError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url_for(&self, venue: &str, token: &str) -> String {
        format!(
            "{}/protocols/{}/rates/{}",
            self.base_url.trim_end_matches('/'),
            venue,
            token
        )
    }
}

impl RateSource for FeedRateSource {
    fn fetch_rate<'a>(&'a self, venue: &'a str, token: &'a str) -> RateFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.url_for(venue, token))
                .send()
                .await?
                .error_for_status()?;
            let body = response.bytes().await?;
            let parsed: FeedResponse = serde_json::from_slice(&body)
                .map_err(|e| RateFeedError::Malformed(e.to_string()))?;

            // Rounds to the nearest bps rather than truncating, so a quoted
            // 0.0123 maps to 123 and not 122.
            match BasisPoints::from_fraction(parsed.supply_rate) {
                Some(rate) if rate.get() <= MAX_FEED_RATE_BPS => Ok(rate),
                _ => Err(RateFeedError::Malformed(format!(
                    "supplyRate {} is out of range",
                    parsed.supply_rate
                ))),
            }
        })
    }
}

// =============================================================================
// RateOracle: venue selection + timeout + fallback + short TTL cache
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateOrigin {
    Feed,
    Cached,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuote {
    pub rate: BasisPoints,
    pub origin: RateOrigin,
    /// Venue that quoted `rate`; `None` for the fallback rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
}

pub struct RateOracle {
    source: Option<Arc<dyn RateSource>>,
    venues: Vec<String>,
    fallback: BasisPoints,
    timeout: Duration,
    cache_ttl: Duration,
    cache: DashMap<String, (BasisPoints, String, Instant)>,
}

impl RateOracle {
    pub fn new(source: Option<Arc<dyn RateSource>>, fallback: BasisPoints, timeout: Duration) -> Self {
        Self {
            source,
            venues: DEFAULT_VENUES.iter().map(|v| v.to_string()).collect(),
            fallback,
            timeout,
            cache_ttl: Duration::ZERO,
            cache: DashMap::new(),
        }
    }

    /// An oracle that always answers `rate`.
    pub fn fixed(rate: BasisPoints) -> Self {
        Self::new(None, rate, Duration::ZERO)
    }

    /// Venues to compare, in tie-break order.
    pub fn with_venues<I, S>(mut self, venues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.venues = venues.into_iter().map(Into::into).collect();
        self
    }

    /// Cache the winning feed answer per token for `ttl`. Zero disables caching.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn from_config(config: &AccrualConfig) -> Result<Self, RateFeedError> {
        let timeout = Duration::from_secs(config.rate_feed_timeout_secs);
        let source: Option<Arc<dyn RateSource>> = match &config.rate_feed_url {
            Some(url) => Some(Arc::new(FeedRateSource::new(url.clone(), timeout)?)),
            None => None,
        };
        Ok(Self::new(source, BasisPoints::new(config.fallback_rate_bps), timeout)
            .with_venues(config.rate_venues.iter().cloned())
            .with_cache_ttl(Duration::from_secs(config.rate_cache_ttl_secs)))
    }

    /// Best current annual rate for `token` across venues. Never fails.
    pub async fn current_rate(&self, token: &str) -> RateQuote {
        let fallback = RateQuote {
            rate: self.fallback,
            origin: RateOrigin::Fallback,
            venue: None,
        };
        let Some(source) = &self.source else {
            return fallback;
        };

        if let Some((rate, venue)) = self.cached(token) {
            return RateQuote {
                rate,
                origin: RateOrigin::Cached,
                venue: Some(venue),
            };
        }

        let mut best: Option<(BasisPoints, &str)> = None;
        for venue in &self.venues {
            let fetched = source.fetch_rate(venue, token);
            let result = match tokio::time::timeout(self.timeout, fetched).await {
                Ok(result) => result,
                Err(_) => Err(RateFeedError::Timeout(self.timeout)),
            };
            match result {
                Ok(rate) => {
                    tracing::debug!(token, venue = venue.as_str(), rate_bps = rate.get(), "Rate oracle: venue quote");
                    if best.map_or(true, |(top, _)| rate > top) {
                        best = Some((rate, venue.as_str()));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        token,
                        venue = venue.as_str(),
                        error = %e,
                        "Rate oracle: venue unavailable, skipping"
                    );
                }
            }
        }

        match best {
            Some((rate, venue)) => {
                if !self.cache_ttl.is_zero() {
                    self.cache
                        .insert(token.to_string(), (rate, venue.to_string(), Instant::now()));
                }
                RateQuote {
                    rate,
                    origin: RateOrigin::Feed,
                    venue: Some(venue.to_string()),
                }
            }
            None => {
                tracing::warn!(
                    token,
                    fallback_bps = self.fallback.get(),
                    "Rate oracle: feed unavailable, using fallback rate"
                );
                fallback
            }
        }
    }

    fn cached(&self, token: &str) -> Option<(BasisPoints, String)> {
        let entry = self.cache.get(token)?;
        let (rate, venue, fetched_at) = entry.value();
        (fetched_at.elapsed() < self.cache_ttl).then(|| (*rate, venue.clone()))
    }
}

// =============================================================================
// Mock: MockRateSource (test / testing feature)
// =============================================================================

#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockMode {
    Respond,
    Fail,
    Hang,
}

/// Rates keyed by `(venue, token)`. Unknown pairs answer with an error.
#[cfg(any(test, feature = "testing"))]
pub struct MockRateSource {
    rates: std::collections::HashMap<(String, String), BasisPoints>,
    mode: MockMode,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "testing"))]
impl MockRateSource {
    pub fn new() -> Self {
        Self {
            rates: Default::default(),
            mode: MockMode::Respond,
            calls: Default::default(),
        }
    }

    pub fn with_rate(mut self, venue: &str, token: &str, rate: BasisPoints) -> Self {
        self.rates
            .insert((venue.to_string(), token.to_string()), rate);
        self
    }

    /// Every fetch returns an error.
    pub fn failing() -> Self {
        Self {
            mode: MockMode::Fail,
            ..Self::new()
        }
    }

    /// Every fetch never completes.
    pub fn hanging() -> Self {
        Self {
            mode: MockMode::Hang,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for MockRateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
impl RateSource for MockRateSource {
    fn fetch_rate<'a>(&'a self, venue: &'a str, token: &'a str) -> RateFuture<'a> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match self.mode {
            MockMode::Fail => Box::pin(async { Err(RateFeedError::Other("mock failure".into())) }),
            MockMode::Hang => Box::pin(std::future::pending()),
            MockMode::Respond => {
                let rate = self
                    .rates
                    .get(&(venue.to_string(), token.to_string()))
                    .copied();
                Box::pin(async move {
                    rate.ok_or_else(|| {
                        RateFeedError::Malformed(format!("no rate for {token} at {venue}"))
                    })
                })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
