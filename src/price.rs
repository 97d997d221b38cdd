//! Price feed - BTC/USD from public tickers, with last-known fallback
//!
//! Sources are tried in order; the first usable number wins. When all fail,
//! the cached quote is served marked `stale`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, WalletError};
use crate::runtime::Shutdown;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSource {
    pub name: String,
    pub url: String,
    /// JSON pointer to the USD price in the response body
    pub pointer: String,
}

impl PriceSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self { name: name.into(), url: url.into(), pointer: pointer.into() }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("coingecko", "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin&vs_currencies=usd", "/bitcoin/usd"),
            Self::new("coinbase", "https://api.coinbase.com/v2/prices/BTC-USD/spot", "/data/amount"),
            Self::new("blockchain.info", "https://blockchain.info/ticker", "/USD/last"),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceQuote {
    pub usd: f64,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    /// Served from cache after every source failed
    pub stale: bool,
}

#[derive(Clone)]
pub struct PriceFeed {
    sources: Vec<PriceSource>,
    client: reqwest::Client,
    cache: Arc<RwLock<Option<PriceQuote>>>,
}

impl PriceFeed {
    pub fn new(sources: Vec<PriceSource>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("beesigner/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WalletError::Price(e.to_string()))?;
        Ok(Self { sources, client, cache: Arc::new(RwLock::new(None)) })
    }

    pub fn sources(&self) -> &[PriceSource] { &self.sources }

    pub async fn cached(&self) -> Option<PriceQuote> {
        self.cache.read().await.clone()
    }

    pub async fn current_price_usd(&self) -> Result<PriceQuote> {
        for source in &self.sources {
            match self.fetch(source).await {
                Ok(usd) => {
                    let quote = PriceQuote { usd, source: source.name.clone(), fetched_at: Utc::now(), stale: false };
                    *self.cache.write().await = Some(quote.clone());
                    debug!(source = %source.name, usd, "Price updated");
                    return Ok(quote);
                }
                Err(e) => warn!(source = %source.name, error = %e, "Price source failed"),
            }
        }

        match self.cached().await {
            Some(quote) => Ok(PriceQuote { stale: true, ..quote }),
            None => Err(WalletError::Price("all price sources failed and no cached price".into())),
        }
    }

    async fn fetch(&self, source: &PriceSource) -> Result<f64> {
        let body: Value = self
            .client
            .get(&source.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| WalletError::Price(e.to_string()))?
            .json()
            .await
            .map_err(|e| WalletError::Price(e.to_string()))?;
        extract_price(&body, &source.pointer)
            .ok_or_else(|| WalletError::Price(format!("no price at {}", source.pointer)))
    }

    /// Poll every `interval` until `shutdown` fires. Failures keep the cache.
    pub fn spawn_poller(&self, interval: Duration, shutdown: Shutdown) -> JoinHandle<()> {
        let feed = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = feed.current_price_usd().await {
                            warn!(error = %e, "Price poll failed");
                        }
                    }
                    _ = shutdown.wait() => {
                        info!("Price poller stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// Positive finite number (or numeric string) at `pointer`.
pub fn extract_price(body: &Value, pointer: &str) -> Option<f64> {
    let value = body.pointer(pointer)?;
    let price = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (price.is_finite() && price > 0.0).then_some(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_numbers_and_strings() {
        assert_eq!(extract_price(&json!({"bitcoin": {"usd": 64000.5}}), "/bitcoin/usd"), Some(64000.5));
        assert_eq!(extract_price(&json!({"data": {"amount": "63999.10"}}), "/data/amount"), Some(63999.10));
    }

    #[test]
    fn rejects_missing_or_nonsense() {
        assert_eq!(extract_price(&json!({"USD": {}}), "/USD/last"), None);
        assert_eq!(extract_price(&json!({"data": {"amount": "n/a"}}), "/data/amount"), None);
        assert_eq!(extract_price(&json!({"p": 0}), "/p"), None);
        assert_eq!(extract_price(&json!({"p": [1]}), "/p"), None);
    }

    #[test]
    fn defaults_cover_three_sources() {
        let names: Vec<_> = PriceSource::defaults().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["coingecko", "coinbase", "blockchain.info"]);
    }

    #[tokio::test]
    async fn no_sources_and_no_cache_is_error() {
        let feed = PriceFeed::new(vec![]).unwrap();
        assert!(matches!(feed.current_price_usd().await, Err(WalletError::Price(_))));
    }

    #[tokio::test]
    async fn poller_exits_when_stopped() {
        let feed = PriceFeed::new(vec![]).unwrap();
        let shutdown = Shutdown::new();
        let poller = feed.spawn_poller(Duration::from_millis(5), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), poller).await.unwrap().unwrap();
        assert!(feed.cached().await.is_none());
    }
}
