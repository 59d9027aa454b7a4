//! Drawdown enforcement engine.
//!
//! Each cycle ingests the ledger producer's pending elimination verdicts,
//! re-derives prices for recent orders, rebuilds affected positions through
//! the pure patched replay, and flattens the open positions of eliminated
//! participants. Every mutation of a (participant, pair) position happens
//! under that pair's lock, against a fresh read of the authoritative store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::time::{sleep, Duration};

use crate::config::{now_ms, Config};
use crate::eliminations::{EliminationRecord, EliminationRegistry, REASON_MAX_TOTAL_DRAWDOWN};
use crate::instrument::TradePair;
use crate::ledger::LedgerStore;
use crate::logging::{self, obj, v_int, v_num, v_str, Domain};
use crate::order::{Order, OrderType, ORDER_SRC_ELIMINATION_FLAT};
use crate::position::Position;
use crate::prices::{PriceMap, PriceProvider, PriceSource};
use crate::refresh::RefreshGate;
use crate::roster::Roster;
use crate::store::{PositionLocks, PositionStore};

pub struct MddChecker {
    pub cfg: Config,
    store: Arc<PositionStore>,
    locks: Arc<PositionLocks>,
    registry: Arc<EliminationRegistry>,
    ledgers: Arc<LedgerStore>,
    prices: Arc<dyn PriceProvider>,
    gate: Arc<RefreshGate>,
    roster: Arc<Mutex<Roster>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    /// Participants whose open positions were already flattened after
    /// elimination; shrinks again when a registry entry disappears.
    flat_orders_added: HashSet<String>,
    n_eliminations_this_round: usize,
    n_orders_corrected: usize,
    participants_corrected: HashSet<String>,
}

impl MddChecker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        store: Arc<PositionStore>,
        locks: Arc<PositionLocks>,
        registry: Arc<EliminationRegistry>,
        ledgers: Arc<LedgerStore>,
        prices: Arc<dyn PriceProvider>,
        gate: Arc<RefreshGate>,
        roster: Arc<Mutex<Roster>>,
        shutdown: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            store,
            locks,
            registry,
            ledgers,
            prices,
            gate,
            roster,
            shutdown,
            flat_orders_added: HashSet::new(),
            n_eliminations_this_round: 0,
            n_orders_corrected: 0,
            participants_corrected: HashSet::new(),
        }
    }

    fn reset_counters(&mut self) {
        self.n_eliminations_this_round = 0;
        self.n_orders_corrected = 0;
        self.participants_corrected.clear();
    }

    pub async fn run_cycle(&mut self, now_ms: i64) -> Result<()> {
        if !self.gate.refresh_allowed("mdd", self.cfg.mdd_refresh_ms, now_ms) {
            return Ok(());
        }
        self.reset_counters();

        self.ingest_ledger_eliminations()?;

        // A participant deregistered and re-admitted starts clean.
        let registry = self.registry.clone();
        self.flat_orders_added.retain(|id| registry.in_eliminations(id).is_some());

        let ids = self.roster.lock().unwrap().ids().to_vec();
        let by_participant = self.store.get_all(&ids, true, &self.flat_orders_added)?;
        let candle_data = self.latest_candles(&by_participant).await;

        let mut participants: Vec<&String> = by_participant.keys().collect();
        participants.sort();
        for participant in participants {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            let positions = by_participant[participant].clone();
            if let Err(e) = self
                .refresh_participant(participant, positions, &candle_data, now_ms)
                .await
            {
                // Nothing was persisted for this participant; retried next cycle.
                logging::error(
                    Domain::Mdd,
                    "participant_update_aborted",
                    obj(&[("participant", v_str(participant)), ("error", v_str(&e.to_string()))]),
                );
            }
        }

        logging::info(
            Domain::Mdd,
            "cycle_complete",
            obj(&[
                ("eliminations", v_int(self.n_eliminations_this_round as i64)),
                ("orders_corrected", v_int(self.n_orders_corrected as i64)),
                ("participants_corrected", v_int(self.participants_corrected.len() as i64)),
            ]),
        );
        self.gate.mark_refreshed("mdd", now_ms);
        Ok(())
    }

    /// Move pending ledger verdicts into the registry. The registry write is
    /// durable before anything downstream trusts the elimination.
    fn ingest_ledger_eliminations(&mut self) -> Result<()> {
        for row in self.ledgers.pending_elimination_rows() {
            if self.registry.in_eliminations(&row.participant_id).is_some() {
                continue;
            }
            let appended = self
                .registry
                .append_row(EliminationRecord {
                    participant_id: row.participant_id.clone(),
                    reason: REASON_MAX_TOTAL_DRAWDOWN.to_string(),
                    dd: row.dd,
                    initiated_time_ms: row.elimination_initiated_time_ms,
                    price_info: row.price_info.clone(),
                })
                .with_context(|| format!("persist elimination for {}", row.participant_id))?;
            if appended {
                self.n_eliminations_this_round += 1;
            }
        }
        if self.n_eliminations_this_round > 0 {
            logging::info(
                Domain::Mdd,
                "ledger_eliminations_ingested",
                obj(&[("count", v_int(self.n_eliminations_this_round as i64))]),
            );
        }
        Ok(())
    }

    /// Latest prices for every open position's pair whose market trades now.
    async fn latest_candles(&self, by_participant: &HashMap<String, Vec<Position>>) -> PriceMap {
        let mut market_open: HashMap<TradePair, bool> = HashMap::new();
        let mut pairs: Vec<TradePair> = Vec::new();
        for positions in by_participant.values() {
            for position in positions {
                if !position.is_open() {
                    continue;
                }
                let pair = position.trade_pair;
                let open =
                    *market_open.entry(pair).or_insert_with(|| self.prices.is_market_open(pair));
                if open && !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
        }
        if pairs.is_empty() {
            return PriceMap::new();
        }
        match self.prices.latest(&pairs).await {
            Ok(map) => map,
            Err(e) => {
                logging::warn(
                    Domain::Mdd,
                    "latest_prices_unavailable",
                    obj(&[("error", v_str(&e.to_string()))]),
                );
                PriceMap::new()
            }
        }
    }

    async fn refresh_participant(
        &mut self,
        participant: &str,
        positions: Vec<Position>,
        candle_data: &PriceMap,
        now_ms: i64,
    ) -> Result<()> {
        if positions.is_empty() {
            return Ok(());
        }
        if let Some(elimination) = self.registry.in_eliminations(participant) {
            if !self.flat_orders_added.contains(participant) {
                self.flatten_eliminated(participant, &positions, &elimination).await?;
                self.flat_orders_added.insert(participant.to_string());
            }
            return Ok(());
        }
        for position in positions {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            let recent = now_ms - position.newest_order_ms() <= self.cfg.recent_order_window_ms;
            if position.is_open() || recent {
                self.update_position_returns(participant, position, candle_data, now_ms).await?;
            }
        }
        Ok(())
    }

    /// Re-derive prices for a position's recent orders and refresh its
    /// returns, all under the pair lock against a fresh store read.
    async fn update_position_returns(
        &mut self,
        participant: &str,
        position: Position,
        candle_data: &PriceMap,
        now_ms: i64,
    ) -> Result<()> {
        let pair = position.trade_pair;
        let lock = self.locks.lock_for(participant, pair);
        let _guard = lock.lock().await;

        // Another cycle may have mutated the position since it was listed.
        let Some(stored) = self.store.get_by_uuid(&position.position_uuid)? else {
            return Ok(());
        };
        let mut position = stored;
        let orig_return = position.return_at_close;

        let mut patches: HashMap<String, f64> = HashMap::new();
        for order in position.orders.iter().rev() {
            if now_ms - order.processed_ms > self.cfg.recent_order_window_ms {
                break;
            }
            let mut targets = HashMap::new();
            targets.insert(pair, order.processed_ms);
            let sources = match self.prices.fetch(&[pair], &targets, false).await {
                Ok(map) => map.get(&pair).map(|(_, s)| s.clone()).unwrap_or_default(),
                Err(e) => {
                    logging::warn(
                        Domain::Mdd,
                        "order_price_fetch_failed",
                        obj(&[
                            ("participant", v_str(participant)),
                            ("order", v_str(&order.order_uuid)),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                    continue;
                }
            };
            if sources.is_empty() {
                logging::warn(
                    Domain::Mdd,
                    "no_price_sources_for_order",
                    obj(&[
                        ("participant", v_str(participant)),
                        ("pair", v_str(pair.id())),
                        ("order", v_str(&order.order_uuid)),
                    ]),
                );
                continue;
            }
            if let Some(best) = PriceSource::closest(&sources, order.processed_ms) {
                let corrected = best.price_at(order.processed_ms);
                if corrected > 0.0 && corrected != order.price {
                    patches.insert(order.order_uuid.clone(), corrected);
                }
            }
        }

        if !patches.is_empty() {
            position = position
                .rebuilt_with_patches(&patches)
                .with_context(|| format!("patched rebuild of {}", position.position_uuid))?;
            self.n_orders_corrected += patches.len();
            self.participants_corrected.insert(participant.to_string());
            logging::info(
                Domain::Mdd,
                "order_prices_corrected",
                obj(&[
                    ("participant", v_str(participant)),
                    ("pair", v_str(pair.id())),
                    ("orders_updated", v_int(patches.len() as i64)),
                    ("return_before", v_num(orig_return)),
                    ("return_after", v_num(position.return_at_close)),
                ]),
            );
        }

        let mut return_changed = false;
        if position.is_open() {
            if let Some((price, _)) = candle_data.get(&pair) {
                let before = position.return_at_close;
                position.mark_to_market(*price);
                return_changed = before != position.return_at_close;
            }
        }

        if !patches.is_empty() || return_changed {
            if position.is_open() && position.current_return == 0.0 {
                position.liquidate(now_ms);
                logging::info(
                    Domain::Mdd,
                    "position_liquidated_on_persist",
                    obj(&[
                        ("participant", v_str(participant)),
                        ("position", v_str(&position.position_uuid)),
                    ]),
                );
            }
            self.store.save(&position)?;
        }
        Ok(())
    }

    /// Close out every open position of an eliminated participant with a
    /// synthetic FLAT order. Deterministic order uuid, priced from the
    /// elimination snapshot, timestamped monotonically.
    async fn flatten_eliminated(
        &mut self,
        participant: &str,
        positions: &[Position],
        elimination: &EliminationRecord,
    ) -> Result<()> {
        let mut any_open = false;
        for listed in positions {
            let lock = self.locks.lock_for(participant, listed.trade_pair);
            let _guard = lock.lock().await;
            let Some(mut position) = self.store.get_by_uuid(&listed.position_uuid)? else {
                continue;
            };
            if position.is_closed_position {
                continue;
            }
            any_open = true;

            let mut flat_ms = elimination.initiated_time_ms;
            if let Some(last) = position.orders.last() {
                if last.processed_ms > flat_ms {
                    logging::warn(
                        Domain::Mdd,
                        "order_newer_than_elimination",
                        obj(&[
                            ("participant", v_str(participant)),
                            ("order_ms", v_int(last.processed_ms)),
                            ("elimination_ms", v_int(flat_ms)),
                        ]),
                    );
                    flat_ms = last.processed_ms + 1;
                }
            }
            let price = elimination.price_info.get(&position.trade_pair).copied().unwrap_or(0.0);
            let order_uuid: String = position.position_uuid.chars().rev().collect();
            let flat = Order::with_src(
                OrderType::Flat,
                0.0,
                price,
                position.trade_pair,
                flat_ms,
                &order_uuid,
                ORDER_SRC_ELIMINATION_FLAT,
            )?;
            position.add_order(flat)?;
            self.store.save(&position)?;
            logging::info(
                Domain::Mdd,
                "elimination_flat_added",
                obj(&[
                    ("participant", v_str(participant)),
                    ("pair", v_str(position.trade_pair.id())),
                    ("position", v_str(&position.position_uuid)),
                    ("at_ms", v_int(flat_ms)),
                ]),
            );
        }
        if !any_open {
            logging::info(
                Domain::Mdd,
                "no_open_positions_to_flatten",
                obj(&[("participant", v_str(participant))]),
            );
        }
        Ok(())
    }
}

pub async fn run_mdd_loop(mut checker: MddChecker) {
    let sleep_ms = checker.cfg.loop_sleep_ms;
    let shutdown = checker.shutdown.clone();
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = checker.run_cycle(now_ms()).await {
            logging::error(Domain::Mdd, "cycle_failed", obj(&[("error", v_str(&e.to_string()))]));
        }
        sleep(Duration::from_millis(sleep_ms)).await;
    }
}
