//! Trade pair table: every instrument the competition accepts, with its
//! fee rate, leverage cap and market-hours predicate.

use chrono::{Datelike, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradePair {
    #[serde(rename = "BTCUSD")]
    BtcUsd,
    #[serde(rename = "ETHUSD")]
    EthUsd,
    #[serde(rename = "EURUSD")]
    EurUsd,
    #[serde(rename = "GBPUSD")]
    GbpUsd,
    #[serde(rename = "SPX")]
    Spx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Market {
    Crypto,
    Forex,
    Equities,
}

impl TradePair {
    pub const ALL: [TradePair; 5] = [
        TradePair::BtcUsd,
        TradePair::EthUsd,
        TradePair::EurUsd,
        TradePair::GbpUsd,
        TradePair::Spx,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            TradePair::BtcUsd => "BTCUSD",
            TradePair::EthUsd => "ETHUSD",
            TradePair::EurUsd => "EURUSD",
            TradePair::GbpUsd => "GBPUSD",
            TradePair::Spx => "SPX",
        }
    }

    pub fn from_id(id: &str) -> Option<TradePair> {
        TradePair::ALL.iter().copied().find(|p| p.id() == id)
    }

    pub fn market(&self) -> Market {
        match self {
            TradePair::BtcUsd | TradePair::EthUsd => Market::Crypto,
            TradePair::EurUsd | TradePair::GbpUsd => Market::Forex,
            TradePair::Spx => Market::Equities,
        }
    }

    pub fn fee_rate(&self) -> f64 {
        match self.market() {
            Market::Crypto => 0.003,
            Market::Forex => 0.0003,
            Market::Equities => 0.0005,
        }
    }

    pub fn max_leverage(&self) -> f64 {
        match self.market() {
            Market::Crypto => 20.0,
            Market::Forex => 500.0,
            Market::Equities => 500.0,
        }
    }

    /// Whether the instrument's market trades at the given wall-clock time.
    /// Crypto never closes; forex runs Sunday 21:00 UTC through Friday 21:00
    /// UTC; equities trade the cash session, Mon-Fri 13:30-20:00 UTC.
    pub fn is_market_open(&self, now_ms: i64) -> bool {
        let Some(dt) = Utc.timestamp_millis_opt(now_ms).single() else {
            return false;
        };
        match self.market() {
            Market::Crypto => true,
            Market::Forex => match dt.weekday() {
                Weekday::Sat => false,
                Weekday::Sun => dt.hour() >= 21,
                Weekday::Fri => dt.hour() < 21,
                _ => true,
            },
            Market::Equities => {
                if matches!(dt.weekday(), Weekday::Sat | Weekday::Sun) {
                    return false;
                }
                let minutes = dt.hour() * 60 + dt.minute();
                (810..1200).contains(&minutes)
            }
        }
    }
}
