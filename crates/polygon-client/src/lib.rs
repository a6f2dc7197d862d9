//! Polygon.io REST access for the news feed and post-publication price moves.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use signal_core::SignalError;

pub mod market_data;
pub mod news_source;
mod rate_limit;

pub use market_data::PolygonMarketData;
pub use news_source::PolygonNewsSource;

use rate_limit::SlidingWindow;

const BASE_URL: &str = "https://api.polygon.io";

/// Starter plan allowance; the free tier needs `POLYGON_RATE_LIMIT=5`
const DEFAULT_REQUESTS_PER_MINUTE: usize = 500;

/// Attempts per request when Polygon answers 429
const MAX_ATTEMPTS: u32 = 3;

/// Wait after a 429 that carries no usable `Retry-After`
const DEFAULT_THROTTLE_WAIT: Duration = Duration::from_secs(15);

/// One article from `/v2/reference/news`
#[derive(Debug, Clone, Deserialize)]
pub struct PolygonArticle {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    pub published_utc: String,
    #[serde(default)]
    pub article_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(default)]
    pub publisher: Option<Publisher>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Publisher {
    pub name: String,
}

/// Aggregate bar in Polygon's abbreviated wire form
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateBar {
    /// Bar start, epoch millis
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    #[serde(default)]
    pub v: f64,
}

/// Envelope shared by the list endpoints; `results` is omitted when empty
#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

/// Which half of the crate a failure is reported against
#[derive(Debug, Clone, Copy)]
enum Feed {
    News,
    Prices,
}

impl Feed {
    fn error(self, message: String) -> SignalError {
        match self {
            Feed::News => SignalError::SourceError(message),
            Feed::Prices => SignalError::MarketDataError(message),
        }
    }
}

/// Rate-limited Polygon client. Clones share the connection pool and the request window.
#[derive(Clone)]
pub struct PolygonClient {
    api_key: String,
    client: Client,
    window: SlidingWindow,
}

impl PolygonClient {
    /// Client limited by `POLYGON_RATE_LIMIT` requests per minute.
    pub fn new(api_key: String) -> Self {
        let per_minute = std::env::var("POLYGON_RATE_LIMIT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_REQUESTS_PER_MINUTE);
        Self::with_rate_limit(api_key, per_minute)
    }

    pub fn with_rate_limit(api_key: String, requests_per_minute: usize) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            client,
            window: SlidingWindow::per_minute(requests_per_minute),
        }
    }

    /// GET `path` and decode the listing, waiting out the local window and Polygon 429s.
    async fn get_listing<T: DeserializeOwned>(
        &self,
        feed: Feed,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, SignalError> {
        let url = format!("{}{}", BASE_URL, path);

        for attempt in 1..=MAX_ATTEMPTS {
            self.window.acquire().await;

            let response = self
                .client
                .get(&url)
                .query(&[("apiKey", self.api_key.as_str())])
                .query(query)
                .send()
                .await
                .map_err(|e| feed.error(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_THROTTLE_WAIT);
                tracing::warn!(
                    path,
                    attempt,
                    wait_secs = wait.as_secs(),
                    "Polygon throttled the request"
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(wait).await;
                }
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(feed.error(format!("{} returned HTTP {}: {}", path, status, body)));
            }

            let listing: Listing<T> = response
                .json()
                .await
                .map_err(|e| feed.error(format!("{} decode failed: {}", path, e)))?;
            return Ok(listing.results);
        }

        Err(feed.error(format!("{} still throttled after {} attempts", path, MAX_ATTEMPTS)))
    }

    /// News published at or after `since`, oldest first.
    pub async fn get_news_since(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<PolygonArticle>, SignalError> {
        let mut query = vec![
            ("order", "asc".to_string()),
            ("sort", "published_utc".to_string()),
            ("limit", limit.clamp(1, 1000).to_string()),
        ];
        if let Some(since) = since {
            query.push(("published_utc.gte", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        self.get_listing(Feed::News, "/v2/reference/news", &query).await
    }

    /// One-minute bars for `symbol` in `[from, to]`, ascending.
    pub async fn get_minute_bars(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AggregateBar>, SignalError> {
        let path = format!(
            "/v2/aggs/ticker/{}/range/1/minute/{}/{}",
            symbol,
            from.timestamp_millis(),
            to.timestamp_millis()
        );
        let query = [
            ("adjusted", "true".to_string()),
            ("sort", "asc".to_string()),
            ("limit", "50000".to_string()),
        ];

        self.get_listing(Feed::Prices, &path, &query).await
    }
}
