//! Per-(participant, trade pair) position ledger.
//!
//! A position is rebuilt by replaying its full order list: the first order
//! fixes the direction, later orders shift net leverage and the weighted
//! average entry price, and the replay stops as soon as the position closes.
//! Replay is deterministic over the order list alone, which is what makes
//! retroactive price correction safe: patch the copies, replay, persist.

use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::instrument::TradePair;
use crate::logging::{self, obj, v_int, v_num, v_str, Domain};
use crate::order::{Order, OrderType};

fn one() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub participant_id: String,
    pub position_uuid: String,
    pub open_ms: i64,
    pub trade_pair: TradePair,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default = "one")]
    pub current_return: f64,
    #[serde(default)]
    pub close_ms: Option<i64>,
    #[serde(default = "one")]
    pub return_at_close: f64,
    #[serde(default)]
    pub net_leverage: f64,
    #[serde(default)]
    pub average_entry_price: f64,
    #[serde(default)]
    pub initial_entry_price: f64,
    #[serde(default)]
    pub position_type: Option<OrderType>,
    #[serde(default)]
    pub is_closed_position: bool,
}

impl Position {
    pub fn new(participant_id: &str, position_uuid: &str, trade_pair: TradePair, open_ms: i64) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            position_uuid: position_uuid.to_string(),
            open_ms,
            trade_pair,
            orders: Vec::new(),
            current_return: 1.0,
            close_ms: None,
            return_at_close: 1.0,
            net_leverage: 0.0,
            average_entry_price: 0.0,
            initial_entry_price: 0.0,
            position_type: None,
            is_closed_position: false,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed_position
    }

    pub fn newest_order_ms(&self) -> i64 {
        self.orders.last().map(|o| o.processed_ms).unwrap_or(self.open_ms)
    }

    /// Apply one order: clamp, append, full replay. Adding to a closed
    /// position is a logged no-op; an instrument mismatch is an error.
    pub fn add_order(&mut self, order: Order) -> Result<()> {
        if self.is_closed_position {
            logging::warn(
                Domain::Position,
                "order_on_closed_position",
                obj(&[
                    ("participant", v_str(&self.participant_id)),
                    ("position", v_str(&self.position_uuid)),
                    ("order", v_str(&order.order_uuid)),
                ]),
            );
            return Ok(());
        }
        if order.trade_pair != self.trade_pair {
            bail!(
                "order trade pair [{}] does not match position trade pair [{}]",
                order.trade_pair.id(),
                self.trade_pair.id()
            );
        }
        let Some(order) = self.clamp_leverage(order) else {
            return Ok(());
        };
        self.orders.push(order);
        self.rebuild()
    }

    /// Truncate the order's leverage so the position never exceeds the
    /// instrument's cap in its current direction. Returns None when the
    /// truncation leaves nothing to apply (spam orders at the cap).
    fn clamp_leverage(&self, mut order: Order) -> Option<Order> {
        let max = self.trade_pair.max_leverage();
        let proposed = self.net_leverage + order.leverage;
        match self.position_type {
            Some(OrderType::Long) if proposed > max => {
                order.leverage = max - self.net_leverage;
            }
            Some(OrderType::Short) if proposed < -max => {
                order.leverage = -max - self.net_leverage;
            }
            _ => return Some(order),
        }
        if order.leverage == 0.0 {
            logging::warn(
                Domain::Position,
                "order_dropped_at_leverage_cap",
                obj(&[
                    ("participant", v_str(&self.participant_id)),
                    ("pair", v_str(self.trade_pair.id())),
                    ("max_leverage", v_num(max)),
                ]),
            );
            return None;
        }
        logging::warn(
            Domain::Position,
            "leverage_clamped",
            obj(&[
                ("participant", v_str(&self.participant_id)),
                ("pair", v_str(self.trade_pair.id())),
                ("clamped_to", v_num(order.leverage)),
            ]),
        );
        Some(order)
    }

    /// Recompute all derived state by replaying the order list from scratch.
    pub fn rebuild(&mut self) -> Result<()> {
        self.net_leverage = 0.0;
        self.average_entry_price = 0.0;
        self.initial_entry_price = 0.0;
        self.current_return = 1.0;
        self.return_at_close = 1.0;
        self.position_type = None;
        self.is_closed_position = false;
        self.close_ms = None;

        let orders = std::mem::take(&mut self.orders);
        let result = self.replay(&orders);
        self.orders = orders;
        result
    }

    fn replay(&mut self, orders: &[Order]) -> Result<()> {
        for order in orders {
            if self.position_type.is_none() {
                self.init_from_first_order(order)?;
            }

            // An order flattens the position when it drives net leverage
            // through zero against the direction, or is an explicit FLAT.
            let crosses_zero = match self.position_type {
                Some(OrderType::Long) => self.net_leverage + order.leverage <= 0.0,
                Some(OrderType::Short) => self.net_leverage + order.leverage >= 0.0,
                _ => false,
            };
            if crosses_zero || order.order_type == OrderType::Flat {
                self.close_out(order.processed_ms);
            }

            let delta_leverage = if self.position_type == Some(OrderType::Flat) {
                0.0
            } else {
                order.leverage
            };
            self.apply_order(order, delta_leverage)?;

            if self.position_type == Some(OrderType::Flat) {
                break;
            }
        }
        Ok(())
    }

    fn init_from_first_order(&mut self, order: &Order) -> Result<()> {
        if order.price <= 0.0 {
            bail!("initial entry price must be > 0, got [{}]", order.price);
        }
        self.initial_entry_price = order.price;
        if order.leverage > 0.0 {
            self.position_type = Some(OrderType::Long);
        } else if order.leverage < 0.0 {
            self.position_type = Some(OrderType::Short);
        } else {
            bail!("leverage of 0 provided as initial order");
        }
        Ok(())
    }

    fn apply_order(&mut self, order: &Order, delta_leverage: f64) -> Result<()> {
        if self.initial_entry_price <= 0.0 {
            bail!("initial entry price must be positive, got [{}]", self.initial_entry_price);
        }
        let price = order.price;
        let new_net_leverage = self.net_leverage + delta_leverage;

        self.set_returns(price, new_net_leverage);
        if self.current_return < 0.0 {
            bail!("computed return must not be negative, got [{}]", self.current_return);
        }
        if self.current_return == 0.0 {
            logging::info(
                Domain::Position,
                "position_liquidated",
                obj(&[
                    ("participant", v_str(&self.participant_id)),
                    ("position", v_str(&self.position_uuid)),
                    ("at_ms", v_int(order.processed_ms)),
                ]),
            );
            self.close_out(order.processed_ms);
            return Ok(());
        }

        if self.position_type == Some(OrderType::Flat) {
            // Flatten: exposure drops to zero, the weighted average stays.
            self.net_leverage = 0.0;
        } else {
            self.average_entry_price = (self.average_entry_price * self.net_leverage
                + price * delta_leverage)
                / new_net_leverage;
            self.net_leverage = new_net_leverage;
        }
        Ok(())
    }

    fn set_returns(&mut self, price: f64, new_net_leverage: f64) {
        self.current_return = self.unrealized_return(price);
        self.return_at_close =
            self.current_return * (1.0 - self.trade_pair.fee_rate() * new_net_leverage.abs());
    }

    /// Unrealized return multiple at the given price. Floored at exactly 0
    /// on a full loss; never negative.
    pub fn unrealized_return(&self, price: f64) -> f64 {
        if self.initial_entry_price == 0.0 {
            return 1.0;
        }
        let gain =
            (price - self.average_entry_price) * self.net_leverage / self.initial_entry_price;
        if gain <= -1.0 {
            return 0.0;
        }
        1.0 + gain
    }

    /// Refresh returns for an open position against a live price.
    pub fn mark_to_market(&mut self, price: f64) {
        self.set_returns(price, self.net_leverage);
    }

    /// Mark a position closed at `close_ms` after its return collapsed to 0.
    pub fn liquidate(&mut self, close_ms: i64) {
        self.close_out(close_ms);
    }

    fn close_out(&mut self, close_ms: i64) {
        self.position_type = Some(OrderType::Flat);
        self.is_closed_position = true;
        self.close_ms = Some(close_ms);
    }

    /// Pure retroactive correction: replay a copy with patched order prices
    /// (keyed by order uuid) and return the resulting state. `self` is left
    /// untouched, so shared state is only ever replaced wholesale.
    pub fn rebuilt_with_patches(&self, patches: &HashMap<String, f64>) -> Result<Position> {
        let mut patched = self.clone();
        for order in &mut patched.orders {
            if let Some(&price) = patches.get(&order.order_uuid) {
                *order = order.repriced(price);
            }
        }
        patched.rebuild()?;
        Ok(patched)
    }
}
