//! Performance-ledger checkpoints and their store.
//!
//! The ledger itself is produced elsewhere; this side consumes it read-mostly
//! for screening and promotion, and drains the producer's pending elimination
//! rows into the registry.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::instrument::TradePair;

/// One time bucket of realized performance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfCheckpoint {
    pub last_update_ms: i64,
    pub gain: f64,
    pub loss: f64,
    /// Running max-drawdown as a multiplicative factor (0.95 = down 5% from
    /// the running peak).
    pub mdd: f64,
    #[serde(default)]
    pub n_updates: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfLedger {
    pub cps: Vec<PerfCheckpoint>,
}

impl PerfLedger {
    pub fn is_empty(&self) -> bool {
        self.cps.is_empty()
    }

    /// Worst recorded drawdown factor; 1.0 for an empty ledger.
    pub fn max_drawdown(&self) -> f64 {
        self.cps.iter().map(|c| c.mdd).fold(1.0, f64::min)
    }

    /// Per-checkpoint net log-returns, the series the metrics consume.
    pub fn checkpoint_returns(&self) -> Vec<f64> {
        self.cps.iter().map(|c| c.gain + c.loss).collect()
    }
}

/// Elimination verdict computed by the ledger producer, pending ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerElimination {
    pub participant_id: String,
    pub dd: f64,
    /// Per-instrument price snapshot captured when the breach was detected.
    pub price_info: HashMap<TradePair, f64>,
    pub elimination_initiated_time_ms: i64,
}

struct LedgerStoreInner {
    conn: Connection,
    pending: Vec<LedgerElimination>,
}

pub struct LedgerStore {
    inner: Mutex<LedgerStoreInner>,
}

impl LedgerStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open ledger store at {path}"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS perf_ledgers (
                participant_id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );",
        )?;
        Ok(Self { inner: Mutex::new(LedgerStoreInner { conn, pending: Vec::new() }) })
    }

    pub fn save_ledgers(&self, ledgers: &HashMap<String, PerfLedger>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let tx = inner.conn.transaction()?;
        for (id, ledger) in ledgers {
            let data = serde_json::to_string(ledger)?;
            tx.execute(
                "INSERT INTO perf_ledgers (participant_id, data) VALUES (?1, ?2)
                 ON CONFLICT(participant_id) DO UPDATE SET data = excluded.data",
                params![id, data],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_ledgers(&self) -> Result<HashMap<String, PerfLedger>> {
        let inner = self.inner.lock().unwrap();
        let mut stmt = inner.conn.prepare("SELECT participant_id, data FROM perf_ledgers")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, data) = row?;
            let ledger: PerfLedger =
                serde_json::from_str(&data).with_context(|| format!("corrupt ledger for {id}"))?;
            out.insert(id, ledger);
        }
        Ok(out)
    }

    pub fn clear(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.conn.execute("DELETE FROM perf_ledgers", [])?;
        Ok(())
    }

    /// Producer side: queue an elimination verdict for the drawdown engine.
    pub fn push_elimination_row(&self, row: LedgerElimination) {
        self.inner.lock().unwrap().pending.push(row);
    }

    pub fn pending_elimination_rows(&self) -> Vec<LedgerElimination> {
        self.inner.lock().unwrap().pending.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(ms: i64, gain: f64, loss: f64, mdd: f64) -> PerfCheckpoint {
        PerfCheckpoint { last_update_ms: ms, gain, loss, mdd, n_updates: 1 }
    }

    #[test]
    fn max_drawdown_takes_the_worst_checkpoint() {
        let ledger = PerfLedger {
            cps: vec![checkpoint(1, 0.1, -0.05, 0.99), checkpoint(2, 0.1, -0.2, 0.88)],
        };
        assert_eq!(ledger.max_drawdown(), 0.88);
        assert_eq!(PerfLedger::default().max_drawdown(), 1.0);
    }

    #[test]
    fn checkpoint_returns_sum_gain_and_loss() {
        let ledger = PerfLedger {
            cps: vec![checkpoint(1, 0.1, -0.08, 0.99), checkpoint(2, 0.2, -0.1, 0.99)],
        };
        let rs = ledger.checkpoint_returns();
        assert!((rs[0] - 0.02).abs() < 1e-12);
        assert!((rs[1] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn ledgers_round_trip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledgers.sqlite");
        let store = LedgerStore::open(path.to_str().unwrap()).unwrap();

        let mut ledgers = HashMap::new();
        ledgers.insert(
            "m1".to_string(),
            PerfLedger { cps: vec![checkpoint(1, 0.1, -0.08, 0.99)] },
        );
        store.save_ledgers(&ledgers).unwrap();

        let loaded = store.load_ledgers().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["m1"].cps.len(), 1);
        assert_eq!(loaded["m1"].cps[0].mdd, 0.99);
    }

    #[test]
    fn pending_rows_queue_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledgers.sqlite");
        let store = LedgerStore::open(path.to_str().unwrap()).unwrap();
        store.push_elimination_row(LedgerElimination {
            participant_id: "m1".to_string(),
            dd: 0.85,
            price_info: HashMap::new(),
            elimination_initiated_time_ms: 123,
        });
        let rows = store.pending_elimination_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].participant_id, "m1");
    }
}
