use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use provingground::challenge::{self, ChallengePeriodManager};
use provingground::config::Config;
use provingground::eliminations::EliminationRegistry;
use provingground::feed::{self, RecentEventTracker};
use provingground::instrument::TradePair;
use provingground::ledger::LedgerStore;
use provingground::logging::{self, obj, v_int, v_str, Domain};
use provingground::mdd::{self, MddChecker};
use provingground::prices::{PriceProvider, RestPriceProvider};
use provingground::refresh::RefreshGate;
use provingground::roster::{self, Roster, RosterProvider, StaticRosterProvider};
use provingground::store::{PositionLocks, PositionStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    logging::info(
        Domain::System,
        "startup",
        obj(&[
            ("db_path", v_str(&cfg.db_path)),
            ("roster_size", v_int(cfg.roster_ids.len() as i64)),
        ]),
    );

    // Owned persisted state; a failure to open any store is fatal.
    let store = Arc::new(PositionStore::open(&cfg.db_path)?);
    let locks = Arc::new(PositionLocks::new());
    let registry = Arc::new(EliminationRegistry::open(&cfg.db_path)?);
    let ledgers = Arc::new(LedgerStore::open(&cfg.db_path)?);
    let challenge_manager = ChallengePeriodManager::open(
        &cfg.db_path,
        store.clone(),
        ledgers.clone(),
        registry.clone(),
        &cfg,
    )?;

    let tracker = Arc::new(RecentEventTracker::new());
    let prices: Arc<dyn PriceProvider> = Arc::new(RestPriceProvider::new(&cfg, Some(tracker.clone())));
    let gate = Arc::new(RefreshGate::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let roster_provider: Arc<dyn RosterProvider> =
        Arc::new(StaticRosterProvider::new(cfg.roster_ids.clone()));
    let roster_state = Arc::new(Mutex::new(Roster::new(cfg.roster_ids.clone())));

    let checker = MddChecker::new(
        cfg.clone(),
        store.clone(),
        locks,
        registry.clone(),
        ledgers.clone(),
        prices,
        gate.clone(),
        roster_state.clone(),
        shutdown.clone(),
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(feed::run_ws_feed(
        cfg.ws_url.clone(),
        TradePair::ALL.to_vec(),
        tracker,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(mdd::run_mdd_loop(checker)));
    tasks.push(tokio::spawn(challenge::run_challenge_loop(
        challenge_manager,
        roster_state.clone(),
        gate.clone(),
        cfg.clone(),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(roster::run_roster_sync(
        roster_provider,
        roster_state,
        gate,
        cfg.clone(),
        shutdown.clone(),
    )));

    tokio::signal::ctrl_c().await?;
    logging::info(Domain::System, "shutdown_requested", obj(&[]));
    shutdown.store(true, Ordering::Relaxed);
    for task in tasks {
        let _ = task.await;
    }
    logging::info(Domain::System, "shutdown_complete", obj(&[]));
    Ok(())
}
