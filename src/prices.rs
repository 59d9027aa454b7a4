//! Price sources and the provider contract consumed by the drawdown engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{now_ms, Config};
use crate::feed::RecentEventTracker;
use crate::instrument::TradePair;
use crate::logging::{self, obj, v_str, Domain};
use crate::retry::{retry_async, RetryConfig};

/// One candle-or-tick observation of an instrument's price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSource {
    pub source: String,
    pub open: f64,
    pub close: f64,
    pub start_ms: i64,
    pub timespan_ms: i64,
    pub websocket: bool,
}

impl PriceSource {
    /// Distance from the target instant to this source's covered span.
    pub fn time_lag_to(&self, target_ms: i64) -> i64 {
        let end_ms = self.start_ms + self.timespan_ms;
        if target_ms < self.start_ms {
            self.start_ms - target_ms
        } else if target_ms > end_ms {
            target_ms - end_ms
        } else {
            0
        }
    }

    /// The better of open/close for the target instant.
    pub fn price_at(&self, target_ms: i64) -> f64 {
        if target_ms >= self.start_ms + self.timespan_ms {
            self.close
        } else {
            self.open
        }
    }

    /// Smallest time lag wins; websocket sources win ties.
    pub fn closest(sources: &[PriceSource], target_ms: i64) -> Option<&PriceSource> {
        sources.iter().min_by_key(|s| (s.time_lag_to(target_ms), !s.websocket))
    }
}

/// price + the sources it was derived from, per pair.
pub type PriceMap = HashMap<TradePair, (f64, Vec<PriceSource>)>;

#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Latest known price for each pair.
    async fn latest(&self, pairs: &[TradePair]) -> Result<PriceMap>;

    /// Best-available sources around a per-pair target time. `ws_only`
    /// restricts the answer to already-streamed data (no REST calls).
    async fn fetch(
        &self,
        pairs: &[TradePair],
        target_ms: &HashMap<TradePair, i64>,
        ws_only: bool,
    ) -> Result<PriceMap>;

    fn is_market_open(&self, pair: TradePair) -> bool;
}

// ---------------------------------------------------------------------------
// Simulated provider (tests, dry runs)
// ---------------------------------------------------------------------------

/// In-memory provider: tests and dry runs push sources, engines read them.
#[derive(Default)]
pub struct SimPriceProvider {
    sources: Mutex<HashMap<TradePair, Vec<PriceSource>>>,
    markets_closed: Mutex<bool>,
}

impl SimPriceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_source(&self, pair: TradePair, source: PriceSource) {
        self.sources.lock().unwrap().entry(pair).or_default().push(source);
    }

    pub fn set_price(&self, pair: TradePair, price: f64, at_ms: i64) {
        self.push_source(
            pair,
            PriceSource {
                source: "sim".to_string(),
                open: price,
                close: price,
                start_ms: at_ms,
                timespan_ms: 1000,
                websocket: true,
            },
        );
    }

    pub fn close_markets(&self) {
        *self.markets_closed.lock().unwrap() = true;
    }
}

#[async_trait]
impl PriceProvider for SimPriceProvider {
    async fn latest(&self, pairs: &[TradePair]) -> Result<PriceMap> {
        let sources = self.sources.lock().unwrap();
        let mut out = PriceMap::new();
        for pair in pairs {
            if let Some(list) = sources.get(pair) {
                if let Some(last) = list.last() {
                    out.insert(*pair, (last.close, list.clone()));
                }
            }
        }
        Ok(out)
    }

    async fn fetch(
        &self,
        pairs: &[TradePair],
        target_ms: &HashMap<TradePair, i64>,
        _ws_only: bool,
    ) -> Result<PriceMap> {
        let sources = self.sources.lock().unwrap();
        let mut out = PriceMap::new();
        for pair in pairs {
            let Some(list) = sources.get(pair) else { continue };
            let target = target_ms.get(pair).copied().unwrap_or_else(now_ms);
            if let Some(best) = PriceSource::closest(list, target) {
                out.insert(*pair, (best.price_at(target), list.clone()));
            }
        }
        Ok(out)
    }

    fn is_market_open(&self, _pair: TradePair) -> bool {
        !*self.markets_closed.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// REST provider
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BarsResponse {
    results: Vec<Bar>,
}

#[derive(Debug, Deserialize)]
struct Bar {
    o: f64,
    c: f64,
    t: i64,
    #[serde(default = "default_span_ms")]
    span_ms: i64,
}

fn default_span_ms() -> i64 {
    60_000
}

/// Aggregate-bars REST client, consulting the websocket tracker first so the
/// REST endpoint is only hit when streamed data cannot answer.
pub struct RestPriceProvider {
    client: reqwest::Client,
    base: String,
    api_key: Option<String>,
    tracker: Option<Arc<RecentEventTracker>>,
    retry: RetryConfig,
}

impl RestPriceProvider {
    pub fn new(cfg: &Config, tracker: Option<Arc<RecentEventTracker>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: cfg.price_rest_base.clone(),
            api_key: cfg.price_api_key.clone(),
            tracker,
            retry: RetryConfig::default(),
        }
    }

    async fn rest_bar(&self, pair: TradePair, at_ms: Option<i64>) -> Result<PriceSource> {
        let mut url = format!("{}/v1/bars/{}?limit=1", self.base, pair.id());
        if let Some(ms) = at_ms {
            url.push_str(&format!("&at_ms={ms}"));
        }
        if let Some(key) = &self.api_key {
            url.push_str(&format!("&apiKey={key}"));
        }
        let client = self.client.clone();
        let resp: BarsResponse = retry_async(&self.retry, "rest_bar", || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let resp = client.get(&url).send().await?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(anyhow!("bar request failed with status {status}"));
                }
                Ok(resp.json::<BarsResponse>().await?)
            }
        })
        .await?;
        let bar = resp
            .results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no bars returned for {}", pair.id()))?;
        Ok(PriceSource {
            source: "rest".to_string(),
            open: bar.o,
            close: bar.c,
            start_ms: bar.t,
            timespan_ms: bar.span_ms,
            websocket: false,
        })
    }
}

#[async_trait]
impl PriceProvider for RestPriceProvider {
    async fn latest(&self, pairs: &[TradePair]) -> Result<PriceMap> {
        let mut out = PriceMap::new();
        for &pair in pairs {
            // Fresh streamed data answers without a round trip.
            if let Some(tracker) = &self.tracker {
                if let Some(tick) = tracker.latest(pair) {
                    if now_ms() - tick.start_ms < 5_000 {
                        out.insert(pair, (tick.close, vec![tick]));
                        continue;
                    }
                }
            }
            match self.rest_bar(pair, None).await {
                Ok(source) => {
                    out.insert(pair, (source.close, vec![source]));
                }
                Err(e) => {
                    logging::warn(
                        Domain::Prices,
                        "latest_price_unavailable",
                        obj(&[("pair", v_str(pair.id())), ("error", v_str(&e.to_string()))]),
                    );
                }
            }
        }
        Ok(out)
    }

    async fn fetch(
        &self,
        pairs: &[TradePair],
        target_ms: &HashMap<TradePair, i64>,
        ws_only: bool,
    ) -> Result<PriceMap> {
        let mut out = PriceMap::new();
        for &pair in pairs {
            let target = target_ms.get(&pair).copied().unwrap_or_else(now_ms);
            let mut sources = self
                .tracker
                .as_ref()
                .map(|t| t.sources_near(pair, target))
                .unwrap_or_default();
            if !ws_only {
                match self.rest_bar(pair, Some(target)).await {
                    Ok(source) => sources.push(source),
                    Err(e) => logging::warn(
                        Domain::Prices,
                        "bar_fetch_failed",
                        obj(&[("pair", v_str(pair.id())), ("error", v_str(&e.to_string()))]),
                    ),
                }
            }
            if let Some(best) = PriceSource::closest(&sources, target) {
                out.insert(pair, (best.price_at(target), sources.clone()));
            }
        }
        Ok(out)
    }

    fn is_market_open(&self, pair: TradePair) -> bool {
        pair.is_market_open(now_ms())
    }
}
