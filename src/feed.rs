//! Live price feed: a websocket tick stream feeding a bounded tracker of
//! recent per-pair price events.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::instrument::TradePair;
use crate::logging::{self, obj, v_int, v_str, Domain};
use crate::prices::PriceSource;

/// Events older than this (relative to the newest event for the pair) are
/// evicted; it also bounds how far back retroactive correction reaches.
pub const OLDEST_ALLOWED_RECORD_MS: i64 = 15 * 60 * 1000;

#[derive(Default)]
pub struct RecentEventTracker {
    events: Mutex<HashMap<TradePair, VecDeque<PriceSource>>>,
}

impl RecentEventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&self, pair: TradePair, source: PriceSource) {
        let mut events = self.events.lock().unwrap();
        let deque = events.entry(pair).or_default();
        deque.push_back(source);
        let newest = deque.back().map(|s| s.start_ms).unwrap_or(0);
        while let Some(front) = deque.front() {
            if newest - front.start_ms > OLDEST_ALLOWED_RECORD_MS {
                deque.pop_front();
            } else {
                break;
            }
        }
    }

    /// Recent sources within the retention horizon of `target_ms`.
    pub fn sources_near(&self, pair: TradePair, target_ms: i64) -> Vec<PriceSource> {
        let events = self.events.lock().unwrap();
        events
            .get(&pair)
            .map(|deque| {
                deque
                    .iter()
                    .filter(|s| (s.start_ms - target_ms).abs() <= OLDEST_ALLOWED_RECORD_MS)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn latest(&self, pair: TradePair) -> Option<PriceSource> {
        let events = self.events.lock().unwrap();
        events.get(&pair).and_then(|deque| deque.back().cloned())
    }
}

#[derive(Debug, Deserialize)]
struct WsTick {
    pair: String,
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "t")]
    ts_ms: i64,
}

/// Connect, subscribe, and pump ticks into the tracker until shutdown.
/// Connection loss backs off and reconnects; the feed never takes the
/// process down.
pub async fn run_ws_feed(
    ws_url: String,
    pairs: Vec<TradePair>,
    tracker: Arc<RecentEventTracker>,
    shutdown: Arc<AtomicBool>,
) {
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            logging::error(
                Domain::Feed,
                "bad_ws_url",
                obj(&[("url", v_str(&ws_url)), ("error", v_str(&e.to_string()))]),
            );
            return;
        }
    };
    let subscribe = serde_json::json!({
        "action": "subscribe",
        "params": pairs.iter().map(|p| p.id()).collect::<Vec<_>>().join(","),
    })
    .to_string();

    let mut backoff_ms: u64 = 1_000;
    while !shutdown.load(Ordering::Relaxed) {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                logging::info(Domain::Feed, "ws_connected", obj(&[("url", v_str(url.as_str()))]));
                backoff_ms = 1_000;
                let (mut write, mut read) = ws.split();
                if let Err(e) = write.send(Message::Text(subscribe.clone())).await {
                    logging::warn(Domain::Feed, "ws_subscribe_failed", obj(&[("error", v_str(&e.to_string()))]));
                    continue;
                }
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(msg)) => {
                                if let Ok(text) = msg.into_text() {
                                    handle_tick(&tracker, &text);
                                }
                            }
                            Some(Err(e)) => {
                                logging::warn(Domain::Feed, "ws_read_error", obj(&[("error", v_str(&e.to_string()))]));
                                break;
                            }
                            None => break,
                        },
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
            Err(e) => {
                logging::warn(
                    Domain::Feed,
                    "ws_connect_failed",
                    obj(&[("error", v_str(&e.to_string())), ("backoff_ms", v_int(backoff_ms as i64))]),
                );
                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(30_000);
            }
        }
    }
}

fn handle_tick(tracker: &RecentEventTracker, text: &str) {
    let Ok(tick) = serde_json::from_str::<WsTick>(text) else {
        return;
    };
    let Some(pair) = TradePair::from_id(&tick.pair) else {
        return;
    };
    if tick.price <= 0.0 {
        return;
    }
    tracker.add_event(
        pair,
        PriceSource {
            source: "ws".to_string(),
            open: tick.price,
            close: tick.price,
            start_ms: tick.ts_ms,
            timespan_ms: 0,
            websocket: true,
        },
    );
}
