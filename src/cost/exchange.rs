//! Exchange-rate providers.
//!
//! Prices are fixed in micro-USD; the local currency rate comes from an
//! external feed, cached for an hour and replaced by a constant whenever the
//! feed cannot be reached.

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a fallback value is served before the feed is tried again.
const FAILED_FETCH_RETRY: Duration = Duration::from_secs(300);

/// Source of the local-currency-per-USD rate used for cost accounting.
#[async_trait]
pub trait ExchangeRateProvider: Send + Sync {
    /// Current rate. Never fails: providers degrade to a constant.
    async fn rate(&self) -> u64;
}

/// A rate feed that can fail.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<u64>;
}

// =============================================================================
// Fixed rate
// =============================================================================

/// Constant rate, for tests and offline runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedRate(u64);

impl FixedRate {
    #[must_use]
    pub fn new(rate: u64) -> Self {
        Self(rate)
    }
}

#[async_trait]
impl ExchangeRateProvider for FixedRate {
    async fn rate(&self) -> u64 {
        self.0
    }
}

// =============================================================================
// open.er-api.com feed
// =============================================================================

#[derive(Debug, Deserialize)]
struct LatestRates {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    rates: HashMap<String, f64>,
}

/// Reads `rates.<currency>` from an open.er-api.com style endpoint.
#[derive(Debug, Clone)]
pub struct OpenErApi {
    http_client: ReqwestClient,
    url: String,
    currency: String,
}

impl OpenErApi {
    pub fn new(url: impl Into<String>, currency: impl Into<String>) -> anyhow::Result<Self> {
        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http_client,
            url: url.into(),
            currency: currency.into(),
        })
    }
}

#[async_trait]
impl RateSource for OpenErApi {
    async fn fetch(&self) -> anyhow::Result<u64> {
        let response = self
            .http_client
            .get(&self.url)
            .send()
            .await
            .context("Failed to reach exchange-rate feed")?;
        if !response.status().is_success() {
            bail!("exchange-rate feed returned HTTP {}", response.status());
        }
        let latest: LatestRates = response
            .json()
            .await
            .context("Failed to parse exchange-rate feed")?;

        if latest.result.as_deref().is_some_and(|r| r != "success") {
            bail!("exchange-rate feed reported {:?}", latest.result);
        }
        let rate = latest
            .rates
            .get(&self.currency)
            .copied()
            .with_context(|| format!("feed has no rate for {}", self.currency))?;
        if !rate.is_finite() || rate <= 0.0 {
            bail!("feed returned invalid rate {rate}");
        }
        Ok(rate.ceil() as u64)
    }
}

// =============================================================================
// Caching wrapper
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct CachedValue {
    rate: u64,
    fetched_at: Instant,
    from_fallback: bool,
    /// Most recent rate the feed actually returned; survives failed refreshes.
    last_good: Option<u64>,
}

/// TTL cache over a [`RateSource`] with a constant fallback.
///
/// A failed refresh serves the last good rate if there is one, otherwise
/// the fallback constant, and retries the feed after a short pause.
pub struct CachedExchangeRate {
    source: Arc<dyn RateSource>,
    ttl: Duration,
    fallback: u64,
    cache: Mutex<Option<CachedValue>>,
}

impl CachedExchangeRate {
    pub fn new(source: Arc<dyn RateSource>, ttl: Duration, fallback: u64) -> Self {
        Self {
            source,
            ttl,
            fallback,
            cache: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ExchangeRateProvider for CachedExchangeRate {
    async fn rate(&self) -> u64 {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = *cache {
            let max_age = if cached.from_fallback {
                self.ttl.min(FAILED_FETCH_RETRY)
            } else {
                self.ttl
            };
            if cached.fetched_at.elapsed() < max_age {
                return cached.rate;
            }
        }

        match self.source.fetch().await {
            Ok(rate) => {
                info!(rate, "Exchange rate refreshed");
                *cache = Some(CachedValue {
                    rate,
                    fetched_at: Instant::now(),
                    from_fallback: false,
                    last_good: Some(rate),
                });
                rate
            }
            Err(err) => {
                let stale = (*cache).and_then(|c| c.last_good);
                let rate = stale.unwrap_or(self.fallback);
                warn!(
                    error = %err,
                    rate,
                    stale = stale.is_some(),
                    "Exchange rate unavailable, using fallback"
                );
                *cache = Some(CachedValue {
                    rate,
                    fetched_at: Instant::now(),
                    from_fallback: true,
                    last_good: stale,
                });
                debug!(
                    retry_in_secs = self.ttl.min(FAILED_FETCH_RETRY).as_secs(),
                    "Feed retry scheduled"
                );
                rate
            }
        }
    }
}
