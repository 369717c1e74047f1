//! Paper order gateway - simulated order placement for dry-run mode

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::RwLock;
use tracing::info;

use super::OrderGateway;
use crate::types::OrderSide;

/// Simulated order as accepted by the paper gateway
#[derive(Debug, Clone, Serialize)]
pub struct PaperOrder {
    pub id: String,
    pub side: OrderSide,
    pub symbol: String,
    pub quantity: u64,
    pub price: f64,
    pub submitted_at: i64,
}

/// Orders kept in memory before the oldest are dropped
pub const DEFAULT_ORDER_HISTORY: usize = 1_000;

/// Accepts every well-formed order and keeps the most recent ones
#[derive(Debug)]
pub struct PaperOrderGateway {
    orders: RwLock<VecDeque<PaperOrder>>,
    history: usize,
}

impl Default for PaperOrderGateway {
    fn default() -> Self {
        Self::with_history(DEFAULT_ORDER_HISTORY)
    }
}

impl PaperOrderGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            orders: RwLock::new(VecDeque::new()),
            history: history.max(1),
        }
    }

    /// Most recent orders, oldest first
    pub fn orders(&self) -> Vec<PaperOrder> {
        self.orders
            .read()
            .map(|o| o.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Hand over and forget the recorded orders
    pub fn drain_orders(&self) -> Vec<PaperOrder> {
        self.orders
            .write()
            .map(|mut o| o.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn order_count(&self) -> usize {
        self.orders.read().map(|o| o.len()).unwrap_or(0)
    }
}

#[async_trait]
impl OrderGateway for PaperOrderGateway {
    async fn place_order(
        &self,
        side: OrderSide,
        symbol: &str,
        quantity: u64,
        price: f64,
    ) -> Result<String> {
        if quantity == 0 {
            bail!("Refusing zero-quantity order for {}", symbol);
        }
        if !price.is_finite() || price <= 0.0 {
            bail!("Refusing order for {} at invalid price {}", symbol, price);
        }

        let order = PaperOrder {
            id: format!("paper-{}", uuid::Uuid::new_v4()),
            side,
            symbol: symbol.to_string(),
            quantity,
            price,
            submitted_at: Utc::now().timestamp_millis(),
        };
        info!(
            order_id = %order.id,
            symbol,
            side = %side,
            quantity,
            price,
            "🧪 [DRY_RUN] Simulated order accepted"
        );

        let id = order.id.clone();
        if let Ok(mut orders) = self.orders.write() {
            if orders.len() >= self.history {
                orders.pop_front();
            }
            orders.push_back(order);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accepted_orders() {
        let gateway = PaperOrderGateway::new();
        let id = tokio_test::block_on(gateway.place_order(OrderSide::Buy, "ABC", 10, 101.5)).unwrap();
        assert!(id.starts_with("paper-"));
        assert_eq!(gateway.order_count(), 1);
        assert_eq!(gateway.orders()[0].quantity, 10);
    }

    #[test]
    fn history_keeps_the_latest_orders() {
        let gateway = PaperOrderGateway::with_history(2);
        for qty in 1..=3 {
            tokio_test::block_on(gateway.place_order(OrderSide::Buy, "ABC", qty, 10.0)).unwrap();
        }
        let kept: Vec<u64> = gateway.orders().iter().map(|o| o.quantity).collect();
        assert_eq!(kept, vec![2, 3]);

        assert_eq!(gateway.drain_orders().len(), 2);
        assert_eq!(gateway.order_count(), 0);
    }

    #[test]
    fn rejects_degenerate_orders() {
        let gateway = PaperOrderGateway::new();
        assert!(tokio_test::block_on(gateway.place_order(OrderSide::Sell, "ABC", 0, 10.0)).is_err());
        assert!(
            tokio_test::block_on(gateway.place_order(OrderSide::Sell, "ABC", 1, f64::NAN)).is_err()
        );
        assert_eq!(gateway.order_count(), 0);
    }
}
