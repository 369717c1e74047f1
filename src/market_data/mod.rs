//! Market data module - collaborator contracts and implementations
//!
//! Candles and quotes come from a `MarketDataProvider` (CSV files or a REST
//! endpoint); orders go to an `OrderGateway` (the paper gateway in dry-run
//! mode). Calls are retried at the call site with `RetryPolicy`.

pub mod candles;
mod csv_source;
mod paper_gateway;
mod rest;
mod retry;

pub use candles::CandleAggregator;
pub use csv_source::CsvMarketData;
pub use paper_gateway::{PaperOrder, PaperOrderGateway};
pub use rest::RestMarketData;
pub use retry::RetryPolicy;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Candle, OrderSide, Timeframe};

/// Source of historical candles and last prices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Candles in ascending timestamp order with `date_from <= timestamp < date_to`
    async fn get_historical_candles(
        &self,
        symbol: &str,
        resolution: Timeframe,
        date_from: i64,
        date_to: i64,
    ) -> Result<Vec<Candle>>;

    /// Last traded price
    async fn get_quote(&self, symbol: &str) -> Result<f64>;
}

/// Order placement (fire-and-confirm; fills are the gateway's concern)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(
        &self,
        side: OrderSide,
        symbol: &str,
        quantity: u64,
        price: f64,
    ) -> Result<String>;
}
