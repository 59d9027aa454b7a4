//! Validated, immutable trade instructions.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::instrument::TradePair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
    #[serde(rename = "FLAT")]
    Flat,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Long => "LONG",
            OrderType::Short => "SHORT",
            OrderType::Flat => "FLAT",
        }
    }
}

/// Provenance tag: a participant signal, or a synthetic flatten emitted when
/// an eliminated participant's open positions are closed out.
pub const ORDER_SRC_SIGNAL: u8 = 0;
pub const ORDER_SRC_ELIMINATION_FLAT: u8 = 1;

/// A single executed instruction. Constructed through [`Order::new`] /
/// [`Order::with_src`] only; never mutated afterwards. Retroactive price
/// correction works on patched copies (see [`Order::repriced`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_uuid: String,
    pub trade_pair: TradePair,
    pub order_type: OrderType,
    pub leverage: f64,
    pub price: f64,
    pub processed_ms: i64,
    #[serde(default)]
    pub src: u8,
}

impl Order {
    pub fn new(
        order_type: OrderType,
        leverage: f64,
        price: f64,
        trade_pair: TradePair,
        processed_ms: i64,
        order_uuid: &str,
    ) -> Result<Self> {
        Self::with_src(order_type, leverage, price, trade_pair, processed_ms, order_uuid, ORDER_SRC_SIGNAL)
    }

    pub fn with_src(
        order_type: OrderType,
        leverage: f64,
        price: f64,
        trade_pair: TradePair,
        processed_ms: i64,
        order_uuid: &str,
        src: u8,
    ) -> Result<Self> {
        if price < 0.0 {
            bail!("order price must not be negative, got [{price}]");
        }
        if processed_ms < 0 {
            bail!("order processed_ms must not be negative, got [{processed_ms}]");
        }
        if order_type == OrderType::Long && leverage < 0.0 {
            bail!("leverage must be positive for LONG orders, got [{leverage}]");
        }
        // SHORT exposure is stored with a negative sign regardless of input.
        let leverage = if order_type == OrderType::Short { -leverage.abs() } else { leverage };
        Ok(Self {
            order_uuid: order_uuid.to_string(),
            trade_pair,
            order_type,
            leverage,
            price,
            processed_ms,
            src,
        })
    }

    /// Copy of this order at a corrected price.
    pub fn repriced(&self, price: f64) -> Order {
        Order { price, ..self.clone() }
    }
}
