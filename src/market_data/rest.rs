//! REST market data client
//!
//! Talks to a JSON candle service:
//! - `GET {base}/candles?symbol=..&resolution=..&from=..&to=..` -> `[Candle]`
//! - `GET {base}/quote?symbol=..` -> `{ "symbol": .., "price": .. }`

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::MarketDataProvider;
use crate::types::{Candle, Timeframe};

pub struct RestMarketData {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct QuoteResponse {
    #[allow(dead_code)]
    symbol: Option<String>,
    price: f64,
}

impl RestMarketData {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MarketDataProvider for RestMarketData {
    async fn get_historical_candles(
        &self,
        symbol: &str,
        resolution: Timeframe,
        date_from: i64,
        date_to: i64,
    ) -> Result<Vec<Candle>> {
        let url = format!("{}/candles", self.base_url);
        debug!(symbol, %resolution, date_from, date_to, "Fetching candles");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("resolution", resolution.to_string()),
                ("from", date_from.to_string()),
                ("to", date_to.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("Candle request failed for {}", symbol))?;

        if !response.status().is_success() {
            bail!("Candle request for {} returned {}", symbol, response.status());
        }

        let mut candles: Vec<Candle> = response
            .json()
            .await
            .context("Failed to parse candle response")?;
        candles.sort_by_key(|c| c.timestamp);
        candles.retain(|c| c.timestamp >= date_from && c.timestamp < date_to);
        Ok(candles)
    }

    async fn get_quote(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/quote", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .with_context(|| format!("Quote request failed for {}", symbol))?;

        if !response.status().is_success() {
            bail!("Quote request for {} returned {}", symbol, response.status());
        }

        let quote: QuoteResponse = response
            .json()
            .await
            .context("Failed to parse quote response")?;
        if !quote.price.is_finite() || quote.price <= 0.0 {
            bail!("Quote for {} is not a usable price: {}", symbol, quote.price);
        }
        Ok(quote.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = RestMarketData::new("http://localhost:9000/", 1000).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000");
    }

    #[test]
    fn quote_response_parses() {
        let quote: QuoteResponse =
            serde_json::from_str(r#"{"symbol":"BTCUSDT","price":64000.5}"#).unwrap();
        assert_eq!(quote.price, 64000.5);
    }
}
