//! Challenge-period admission state machine.
//!
//! Two disjoint pools, `testing` and `success`, both write-through to sqlite.
//! A participant enters testing once it has a stored position, fails out of
//! the competition through the elimination registry only, and is promoted to
//! success when its ledger clears the promotion bar after a full challenge
//! window. The manager is the sole owner of its pools; the registry is the
//! sole authority on exclusion.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tokio::time::{sleep, Duration};

use crate::config::{now_ms, Config};
use crate::eliminations::{EliminationRecord, EliminationRegistry, REASON_FAILED_CHALLENGE_PERIOD};
use crate::ledger::{LedgerStore, PerfLedger};
use crate::logging::{self, obj, state_hash, v_int, v_num, v_str, Domain};
use crate::metrics;
use crate::refresh::RefreshGate;
use crate::roster::Roster;
use crate::store::PositionStore;

pub struct ChallengePeriodManager {
    conn: Mutex<Connection>,
    testing: HashMap<String, i64>,
    success: HashMap<String, i64>,
    store: Arc<PositionStore>,
    ledgers: Arc<LedgerStore>,
    registry: Arc<EliminationRegistry>,
    challenge_period_ms: i64,
    max_drawdown_pct: f64,
    promotion_min_return: f64,
}

impl ChallengePeriodManager {
    pub fn open(
        path: &str,
        store: Arc<PositionStore>,
        ledgers: Arc<LedgerStore>,
        registry: Arc<EliminationRegistry>,
        cfg: &Config,
    ) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open challenge pools at {path}"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS challenge_pools (
                participant_id TEXT PRIMARY KEY,
                pool TEXT NOT NULL,
                admitted_ms INTEGER NOT NULL
            );",
        )?;
        let mut testing = HashMap::new();
        let mut success = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT participant_id, pool, admitted_ms FROM challenge_pools")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })?;
            for row in rows {
                let (id, pool, ms) = row?;
                match pool.as_str() {
                    "testing" => {
                        testing.insert(id, ms);
                    }
                    "success" => {
                        success.insert(id, ms);
                    }
                    other => anyhow::bail!("unknown challenge pool [{other}] for {id}"),
                }
            }
        }
        Ok(Self {
            conn: Mutex::new(conn),
            testing,
            success,
            store,
            ledgers,
            registry,
            challenge_period_ms: cfg.challenge_period_ms,
            max_drawdown_pct: cfg.max_drawdown_pct,
            promotion_min_return: cfg.promotion_min_return,
        })
    }

    pub fn testing(&self) -> &HashMap<String, i64> {
        &self.testing
    }

    pub fn success(&self) -> &HashMap<String, i64> {
        &self.success
    }

    /// One admission/screening/promotion pass at `current_time`. A refresh
    /// with no intervening state change leaves pools and disk untouched.
    pub fn refresh(&mut self, roster_ids: &[String], current_time: i64) -> Result<()> {
        let with_positions = self.store.participants_with_positions()?;
        let eliminated = self.registry.eliminated_ids();
        let mut changed = self.prune(&eliminated, &with_positions);

        // Admission: a stored position and a clean record buy a testing slot.
        for id in roster_ids {
            if with_positions.contains(id)
                && !eliminated.contains(id)
                && !self.testing.contains_key(id)
                && !self.success.contains_key(id)
            {
                self.testing.insert(id.clone(), current_time);
                changed = true;
                logging::info(
                    Domain::Challenge,
                    "admitted_to_testing",
                    obj(&[("participant", v_str(id)), ("at_ms", v_int(current_time))]),
                );
            }
        }

        let ledgers = self.ledgers.load_ledgers()?;
        let (promotions, failures) = self.inspect(&ledgers, current_time);

        for (id, dd) in &failures {
            let appended = self.registry.append_row(EliminationRecord {
                participant_id: id.clone(),
                reason: REASON_FAILED_CHALLENGE_PERIOD.to_string(),
                dd: *dd,
                initiated_time_ms: current_time,
                price_info: HashMap::new(),
            })?;
            if appended {
                changed = true;
                logging::info(
                    Domain::Challenge,
                    "screening_failed",
                    obj(&[("participant", v_str(id)), ("dd", v_num(*dd))]),
                );
            }
        }

        for id in &promotions {
            if self.testing.remove(id).is_some() {
                // Stamped at evaluation time, not the original admission.
                self.success.insert(id.clone(), current_time);
                changed = true;
                logging::info(
                    Domain::Challenge,
                    "promoted_to_success",
                    obj(&[("participant", v_str(id)), ("at_ms", v_int(current_time))]),
                );
            }
        }

        // Registry feedback: freshly failed participants leave the pools
        // before the refresh returns.
        let eliminated = self.registry.eliminated_ids();
        changed |= self.prune(&eliminated, &with_positions);

        if changed {
            self.persist()?;
        }
        Ok(())
    }

    /// Pure screening/promotion pass over the testing pool: returns
    /// (promotions, failures-with-drawdown) without mutating anything.
    pub fn inspect(
        &self,
        ledgers: &HashMap<String, PerfLedger>,
        current_time: i64,
    ) -> (Vec<String>, Vec<(String, f64)>) {
        let mut promotions = Vec::new();
        let mut failures = Vec::new();
        for (id, &admitted_ms) in &self.testing {
            let ledger = ledgers.get(id);
            let (failing, dd) = self.screen_failing_criteria(ledger);
            if failing {
                failures.push((id.clone(), dd));
                continue;
            }
            if current_time - admitted_ms > self.challenge_period_ms && self.meets_promotion_bar(ledger) {
                promotions.push(id.clone());
            }
        }
        // Deterministic across nodes regardless of map iteration order.
        promotions.sort();
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        (promotions, failures)
    }

    /// A ledger fails screening when its worst drawdown exceeds the
    /// configured maximum. Absent data is not failure.
    pub fn screen_failing_criteria(&self, ledger: Option<&PerfLedger>) -> (bool, f64) {
        let Some(ledger) = ledger else {
            return (false, 1.0);
        };
        if ledger.is_empty() {
            return (false, 1.0);
        }
        let dd = ledger.max_drawdown();
        (dd < 1.0 - self.max_drawdown_pct / 100.0, dd)
    }

    fn meets_promotion_bar(&self, ledger: Option<&PerfLedger>) -> bool {
        let Some(ledger) = ledger else {
            return false;
        };
        if ledger.is_empty() {
            return false;
        }
        metrics::base_return(&ledger.checkpoint_returns()) >= self.promotion_min_return
    }

    fn prune(&mut self, eliminated: &HashSet<String>, with_positions: &HashSet<String>) -> bool {
        let before = self.testing.len() + self.success.len();
        self.testing.retain(|id, _| !eliminated.contains(id) && with_positions.contains(id));
        self.success.retain(|id, _| !eliminated.contains(id) && with_positions.contains(id));
        before != self.testing.len() + self.success.len()
    }

    /// Replace both pools wholesale (state restoration) and write through.
    /// Success wins when an id appears in both inputs.
    pub fn set_pools(&mut self, testing: HashMap<String, i64>, success: HashMap<String, i64>) -> Result<()> {
        self.testing = testing;
        self.success = success;
        let success = &self.success;
        self.testing.retain(|id, _| !success.contains_key(id));
        self.persist()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.testing.clear();
        self.success.clear();
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM challenge_pools", [])?;
        for (id, ms) in &self.testing {
            tx.execute(
                "INSERT INTO challenge_pools (participant_id, pool, admitted_ms) VALUES (?1, 'testing', ?2)",
                params![id, ms],
            )?;
        }
        for (id, ms) in &self.success {
            tx.execute(
                "INSERT INTO challenge_pools (participant_id, pool, admitted_ms) VALUES (?1, 'success', ?2)",
                params![id, ms],
            )?;
        }
        tx.commit()?;

        let mut snapshot: Vec<String> = self
            .testing
            .keys()
            .map(|id| format!("t:{id}"))
            .chain(self.success.keys().map(|id| format!("s:{id}")))
            .collect();
        snapshot.sort();
        logging::debug(
            Domain::Challenge,
            "pools_persisted",
            obj(&[
                ("testing", v_int(self.testing.len() as i64)),
                ("success", v_int(self.success.len() as i64)),
                ("pools_hash", v_str(&state_hash(&snapshot.join(",")))),
            ]),
        );
        Ok(())
    }
}

/// Polling loop: refresh on the shared gate until shutdown.
pub async fn run_challenge_loop(
    mut manager: ChallengePeriodManager,
    roster: Arc<Mutex<Roster>>,
    gate: Arc<RefreshGate>,
    cfg: Config,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let now = now_ms();
        if gate.refresh_allowed("challenge", cfg.challenge_refresh_ms, now) {
            let ids = roster.lock().unwrap().ids().to_vec();
            match manager.refresh(&ids, now) {
                Ok(()) => gate.mark_refreshed("challenge", now),
                Err(e) => logging::error(
                    Domain::Challenge,
                    "refresh_failed",
                    obj(&[("error", v_str(&e.to_string()))]),
                ),
            }
        }
        sleep(Duration::from_millis(cfg.loop_sleep_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PerfCheckpoint;

    fn ledger(mdd: f64, gain: f64, loss: f64) -> PerfLedger {
        PerfLedger {
            cps: vec![
                PerfCheckpoint { last_update_ms: 1, gain, loss, mdd: 1.0, n_updates: 1 },
                PerfCheckpoint { last_update_ms: 2, gain, loss, mdd, n_updates: 1 },
            ],
        }
    }

    fn manager(dir: &tempfile::TempDir) -> ChallengePeriodManager {
        let path = dir.path().join("node.sqlite");
        let path = path.to_str().unwrap();
        let store = Arc::new(PositionStore::open(path).unwrap());
        let ledgers = Arc::new(LedgerStore::open(path).unwrap());
        let registry = Arc::new(EliminationRegistry::open(path).unwrap());
        let mut cfg = Config::from_env();
        cfg.max_drawdown_pct = 10.0;
        cfg.promotion_min_return = 0.0;
        ChallengePeriodManager::open(path, store, ledgers, registry, &cfg).unwrap()
    }

    #[test]
    fn absent_or_empty_ledger_passes_screening() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        assert_eq!(m.screen_failing_criteria(None).0, false);
        assert_eq!(m.screen_failing_criteria(Some(&PerfLedger::default())).0, false);
    }

    #[test]
    fn drawdown_beyond_limit_fails_screening() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let (failing, dd) = m.screen_failing_criteria(Some(&ledger(0.89, 0.1, -0.2)));
        assert!(failing);
        assert_eq!(dd, 0.89);
        let (failing, _) = m.screen_failing_criteria(Some(&ledger(0.99, 0.1, -0.08)));
        assert!(!failing);
    }

    #[test]
    fn promotion_requires_ledger_history() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        assert!(!m.meets_promotion_bar(None));
        assert!(!m.meets_promotion_bar(Some(&PerfLedger::default())));
        assert!(m.meets_promotion_bar(Some(&ledger(0.99, 0.1, -0.08))));
        assert!(!m.meets_promotion_bar(Some(&ledger(0.99, 0.01, -0.08))));
    }
}
