//! Order execution boundary
//!
//! The engine talks to a [`Broker`] only through [`Broker::submit_order`].
//! [`PaperBroker`] fills market orders immediately at the requested price
//! adjusted for slippage, and charges a proportional fee.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Money, Side, Symbol};

pub type OrderId = u64;

/// Market order for a symbol at a reference price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    /// Price the decision was made at, normally the latest close
    pub reference_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Executed fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub commission: Money,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderResult {
    Filled(Fill),
    Rejected(String),
}

pub trait Broker: Send {
    fn submit_order(&mut self, order: &OrderRequest) -> OrderResult;
}

/// Simulated broker used by backtests and paper sessions
#[derive(Debug, Clone)]
pub struct PaperBroker {
    fee_rate: f64,
    slippage: f64,
    next_order_id: OrderId,
}

impl PaperBroker {
    /// `fee_rate` and `slippage` are fractions of price (0.001 = 0.1%)
    pub fn new(fee_rate: f64, slippage: f64) -> Self {
        Self {
            fee_rate: fee_rate.max(0.0),
            slippage: slippage.max(0.0),
            next_order_id: 1,
        }
    }

    /// Buys fill above the reference price, sells below it
    pub fn fill_price(&self, side: Side, reference_price: f64) -> f64 {
        match side {
            Side::Buy => reference_price * (1.0 + self.slippage),
            Side::Sell => reference_price * (1.0 - self.slippage),
        }
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl Broker for PaperBroker {
    fn submit_order(&mut self, order: &OrderRequest) -> OrderResult {
        if !order.quantity.is_finite() || order.quantity <= 0.0 {
            return OrderResult::Rejected(format!("invalid quantity {}", order.quantity));
        }
        if !order.reference_price.is_finite() || order.reference_price <= 0.0 {
            return OrderResult::Rejected(format!("invalid price {}", order.reference_price));
        }

        let price = self.fill_price(order.side, order.reference_price);
        if price <= 0.0 {
            return OrderResult::Rejected(format!("slippage leaves no price ({})", price));
        }
        let commission = Money::from_f64(price) * Money::from_f64(order.quantity)
            * Money::from_f64(self.fee_rate);

        let order_id = self.next_order_id;
        self.next_order_id += 1;

        debug!(
            order_id,
            symbol = %order.symbol,
            side = ?order.side,
            price,
            quantity = order.quantity,
            commission = %commission,
            "Paper fill"
        );

        OrderResult::Filled(Fill {
            order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            quantity: order.quantity,
            commission,
            timestamp: order.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn order(side: Side, quantity: f64, price: f64) -> OrderRequest {
        OrderRequest {
            symbol: Symbol::new("ETHUSDT"),
            side,
            quantity,
            reference_price: price,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_slippage_and_fees() {
        let mut broker = PaperBroker::new(0.001, 0.01);
        let OrderResult::Filled(buy) = broker.submit_order(&order(Side::Buy, 2.0, 100.0)) else {
            panic!("expected fill");
        };
        assert_relative_eq!(buy.price, 101.0);
        assert_relative_eq!(buy.commission.to_f64(), 0.202, epsilon = 1e-9);

        let OrderResult::Filled(sell) = broker.submit_order(&order(Side::Sell, 2.0, 100.0)) else {
            panic!("expected fill");
        };
        assert_relative_eq!(sell.price, 99.0);
        assert_eq!(sell.order_id, buy.order_id + 1);
    }

    #[test]
    fn test_zero_cost_fill_is_exact() {
        let mut broker = PaperBroker::default();
        let OrderResult::Filled(fill) = broker.submit_order(&order(Side::Buy, 1.5, 123.45)) else {
            panic!("expected fill");
        };
        assert_eq!(fill.price, 123.45);
        assert_eq!(fill.commission, Money::ZERO);
        assert_eq!(fill.order_id, 1);
    }

    #[test]
    fn test_rejects_invalid_orders() {
        let mut broker = PaperBroker::default();
        assert!(matches!(
            broker.submit_order(&order(Side::Buy, 0.0, 100.0)),
            OrderResult::Rejected(_)
        ));
        assert!(matches!(
            broker.submit_order(&order(Side::Sell, 1.0, f64::NAN)),
            OrderResult::Rejected(_)
        ));
    }
}
