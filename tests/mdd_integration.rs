//! Drawdown-engine integration: ledger-elimination ingestion, forced
//! flattening, and retroactive price correction against real stores.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use provingground::config::Config;
use provingground::eliminations::EliminationRegistry;
use provingground::instrument::TradePair;
use provingground::ledger::{LedgerElimination, LedgerStore};
use provingground::mdd::MddChecker;
use provingground::order::{Order, OrderType, ORDER_SRC_ELIMINATION_FLAT};
use provingground::position::Position;
use provingground::prices::{PriceProvider, SimPriceProvider};
use provingground::refresh::RefreshGate;
use provingground::roster::Roster;
use provingground::store::{PositionLocks, PositionStore};

const NOW: i64 = 10_000_000;
const REFRESH_MS: i64 = 1_000;

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<PositionStore>,
    registry: Arc<EliminationRegistry>,
    ledgers: Arc<LedgerStore>,
    sim: Arc<SimPriceProvider>,
    checker: MddChecker,
}

fn harness(roster_ids: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.sqlite").to_str().unwrap().to_string();
    let mut cfg = Config::from_env();
    cfg.db_path = path.clone();
    cfg.mdd_refresh_ms = REFRESH_MS;
    cfg.recent_order_window_ms = 15 * 60 * 1000;

    let store = Arc::new(PositionStore::open(&path).unwrap());
    let locks = Arc::new(PositionLocks::new());
    let registry = Arc::new(EliminationRegistry::open(&path).unwrap());
    let ledgers = Arc::new(LedgerStore::open(&path).unwrap());
    let sim = Arc::new(SimPriceProvider::new());
    let prices: Arc<dyn PriceProvider> = sim.clone();
    let roster = Arc::new(Mutex::new(Roster::new(
        roster_ids.iter().map(|s| s.to_string()).collect(),
    )));
    let checker = MddChecker::new(
        cfg,
        store.clone(),
        locks,
        registry.clone(),
        ledgers.clone(),
        prices,
        Arc::new(RefreshGate::new()),
        roster,
        Arc::new(AtomicBool::new(false)),
    );
    Harness { _dir: dir, store, registry, ledgers, sim, checker }
}

fn open_position(participant: &str, uuid: &str, price: f64, order_ms: i64) -> Position {
    let mut p = Position::new(participant, uuid, TradePair::BtcUsd, order_ms);
    p.add_order(
        Order::new(OrderType::Long, 0.1, price, TradePair::BtcUsd, order_ms, &format!("{uuid}-o1")).unwrap(),
    )
    .unwrap();
    p
}

#[tokio::test]
async fn ledger_elimination_reaches_registry_and_flattens_positions() {
    let mut h = harness(&["m1"]);
    let elim_ms = NOW - 5_000;
    h.store.save(&open_position("m1", "p1", 60_000.0, NOW - 60_000)).unwrap();
    h.ledgers.push_elimination_row(LedgerElimination {
        participant_id: "m1".to_string(),
        dd: 0.85,
        price_info: HashMap::from([(TradePair::BtcUsd, 58_000.0)]),
        elimination_initiated_time_ms: elim_ms,
    });

    h.checker.run_cycle(NOW).await.unwrap();

    // Registry, memory and disk.
    assert!(h.registry.in_eliminations("m1").is_some());
    assert_eq!(h.registry.from_disk().unwrap().len(), 1);

    // The open position was closed by a synthetic flatten priced from the
    // elimination snapshot, stamped at the elimination time.
    let position = h.store.get_by_uuid("p1").unwrap().unwrap();
    assert!(position.is_closed_position);
    let flat = position.orders.last().unwrap();
    assert_eq!(flat.order_type, OrderType::Flat);
    assert_eq!(flat.src, ORDER_SRC_ELIMINATION_FLAT);
    assert_eq!(flat.processed_ms, elim_ms);
    assert_eq!(flat.price, 58_000.0);
    assert_eq!(flat.order_uuid, "1p");
    let n_orders = position.orders.len();

    // A second cycle is idempotent: nothing is flattened twice.
    h.checker.run_cycle(NOW + REFRESH_MS).await.unwrap();
    let position = h.store.get_by_uuid("p1").unwrap().unwrap();
    assert_eq!(position.orders.len(), n_orders);
    assert_eq!(h.registry.from_memory().len(), 1);
}

#[tokio::test]
async fn flatten_timestamp_stays_monotonic() {
    let mut h = harness(&["m1"]);
    let last_order_ms = NOW - 1_000;
    let elim_ms = NOW - 5_000; // older than the position's latest order
    h.store.save(&open_position("m1", "p1", 60_000.0, last_order_ms)).unwrap();
    h.ledgers.push_elimination_row(LedgerElimination {
        participant_id: "m1".to_string(),
        dd: 0.85,
        price_info: HashMap::from([(TradePair::BtcUsd, 58_000.0)]),
        elimination_initiated_time_ms: elim_ms,
    });

    h.checker.run_cycle(NOW).await.unwrap();

    let position = h.store.get_by_uuid("p1").unwrap().unwrap();
    let flat = position.orders.last().unwrap();
    assert_eq!(flat.processed_ms, last_order_ms + 1);
}

#[tokio::test]
async fn recent_order_prices_are_corrected_and_persisted() {
    let mut h = harness(&["m1"]);
    let order_ms = NOW - 60_000;
    h.store.save(&open_position("m1", "p1", 60_000.0, order_ms)).unwrap();

    // Better source at the order's own timestamp, plus a live price.
    h.sim.set_price(TradePair::BtcUsd, 59_000.0, order_ms);
    h.sim.set_price(TradePair::BtcUsd, 61_000.0, NOW);

    h.checker.run_cycle(NOW).await.unwrap();

    let position = h.store.get_by_uuid("p1").unwrap().unwrap();
    assert_eq!(position.orders[0].price, 59_000.0);
    assert_eq!(position.initial_entry_price, 59_000.0);
    assert!(position.is_open());
    // Marked to market at the latest price after the rebuild.
    let expected = 1.0 + (61_000.0 - 59_000.0) * 0.1 / 59_000.0;
    assert!((position.current_return - expected).abs() < 1e-9);
}

#[tokio::test]
async fn orders_outside_the_recent_window_are_left_untouched() {
    let mut h = harness(&["m1"]);
    let old_ms = NOW - 30 * 60 * 1000;
    let recent_ms = NOW - 60_000;
    let mut position = open_position("m1", "p1", 60_000.0, old_ms);
    position
        .add_order(
            Order::new(OrderType::Long, 0.1, 60_500.0, TradePair::BtcUsd, recent_ms, "p1-o2").unwrap(),
        )
        .unwrap();
    h.store.save(&position).unwrap();

    h.sim.set_price(TradePair::BtcUsd, 60_400.0, recent_ms);
    h.sim.set_price(TradePair::BtcUsd, 60_450.0, NOW);

    h.checker.run_cycle(NOW).await.unwrap();

    let position = h.store.get_by_uuid("p1").unwrap().unwrap();
    assert_eq!(position.orders[0].price, 60_000.0, "old order must not be repriced");
    assert_eq!(position.orders[1].price, 60_400.0);
}

#[tokio::test]
async fn missing_price_sources_leave_the_position_unchanged() {
    let mut h = harness(&["m1"]);
    let order_ms = NOW - 60_000;
    h.store.save(&open_position("m1", "p1", 60_000.0, order_ms)).unwrap();

    // No sources at all: correction skips and retries next cycle.
    h.checker.run_cycle(NOW).await.unwrap();

    let position = h.store.get_by_uuid("p1").unwrap().unwrap();
    assert_eq!(position.orders[0].price, 60_000.0);
    assert!(position.is_open());
}

#[tokio::test]
async fn closed_markets_skip_mark_to_market() {
    let mut h = harness(&["m1"]);
    // Outside the correction window, so only mark-to-market could apply.
    let order_ms = NOW - 30 * 60 * 1000;
    h.store.save(&open_position("m1", "p1", 60_000.0, order_ms)).unwrap();
    let before = h.store.get_by_uuid("p1").unwrap().unwrap().return_at_close;

    h.sim.set_price(TradePair::BtcUsd, 65_000.0, NOW);
    h.sim.close_markets();
    h.checker.run_cycle(NOW).await.unwrap();

    let position = h.store.get_by_uuid("p1").unwrap().unwrap();
    assert_eq!(position.return_at_close, before);
}
