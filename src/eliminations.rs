//! Append-only elimination registry: the single source of truth for who is
//! out of the competition.
//!
//! The in-memory mirror and the sqlite table move together: every write
//! holds the registry lock for the whole read-modify-write and lands on disk
//! before the call returns. Presence is terminal until the roster layer
//! deregisters the participant.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::instrument::TradePair;
use crate::logging::{self, obj, state_hash, v_int, v_num, v_str, Domain};

pub const REASON_MAX_TOTAL_DRAWDOWN: &str = "MAX_TOTAL_DRAWDOWN";
pub const REASON_FAILED_CHALLENGE_PERIOD: &str = "FAILED_CHALLENGE_PERIOD";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EliminationRecord {
    pub participant_id: String,
    pub reason: String,
    pub dd: f64,
    pub initiated_time_ms: i64,
    /// Per-instrument price snapshot from the moment of elimination; used to
    /// price the synthetic flatten orders.
    #[serde(default)]
    pub price_info: HashMap<TradePair, f64>,
}

struct RegistryInner {
    conn: Connection,
    rows: Vec<EliminationRecord>,
}

pub struct EliminationRegistry {
    inner: Mutex<RegistryInner>,
}

impl EliminationRegistry {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open elimination registry at {path}"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS eliminations (
                participant_id TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                dd REAL NOT NULL,
                initiated_time_ms INTEGER NOT NULL,
                price_info TEXT NOT NULL
            );",
        )?;
        let rows = Self::read_all(&conn)?;
        Ok(Self { inner: Mutex::new(RegistryInner { conn, rows }) })
    }

    fn read_all(conn: &Connection) -> Result<Vec<EliminationRecord>> {
        let mut stmt = conn.prepare(
            "SELECT participant_id, reason, dd, initiated_time_ms, price_info
             FROM eliminations ORDER BY initiated_time_ms, participant_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (participant_id, reason, dd, initiated_time_ms, price_info) = row?;
            let price_info: HashMap<TradePair, f64> = serde_json::from_str(&price_info)
                .with_context(|| format!("corrupt price_info for {participant_id}"))?;
            out.push(EliminationRecord { participant_id, reason, dd, initiated_time_ms, price_info });
        }
        Ok(out)
    }

    /// Record an elimination. Idempotent per participant: a second append for
    /// the same id is a no-op returning false.
    pub fn append_row(&self, record: EliminationRecord) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rows.iter().any(|r| r.participant_id == record.participant_id) {
            return Ok(false);
        }
        let price_info = serde_json::to_string(&record.price_info)?;
        inner.conn.execute(
            "INSERT INTO eliminations (participant_id, reason, dd, initiated_time_ms, price_info)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![record.participant_id, record.reason, record.dd, record.initiated_time_ms, price_info],
        )?;
        inner.rows.push(record.clone());
        let snapshot: Vec<&str> = inner.rows.iter().map(|r| r.participant_id.as_str()).collect();
        logging::info(
            Domain::Eliminations,
            "elimination_appended",
            obj(&[
                ("participant", v_str(&record.participant_id)),
                ("reason", v_str(&record.reason)),
                ("dd", v_num(record.dd)),
                ("initiated_time_ms", v_int(record.initiated_time_ms)),
                ("registry_hash", v_str(&state_hash(&snapshot.join(",")))),
            ]),
        );
        Ok(true)
    }

    pub fn in_eliminations(&self, participant_id: &str) -> Option<EliminationRecord> {
        let inner = self.inner.lock().unwrap();
        inner.rows.iter().find(|r| r.participant_id == participant_id).cloned()
    }

    pub fn eliminated_ids(&self) -> HashSet<String> {
        let inner = self.inner.lock().unwrap();
        inner.rows.iter().map(|r| r.participant_id.clone()).collect()
    }

    pub fn from_memory(&self) -> Vec<EliminationRecord> {
        self.inner.lock().unwrap().rows.clone()
    }

    pub fn from_disk(&self) -> Result<Vec<EliminationRecord>> {
        let inner = self.inner.lock().unwrap();
        Self::read_all(&inner.conn)
    }

    /// Roster deregistration: forget a participant entirely so a later
    /// re-registration starts clean.
    pub fn remove(&self, participant_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner
            .conn
            .execute("DELETE FROM eliminations WHERE participant_id = ?1", params![participant_id])?;
        inner.rows.retain(|r| r.participant_id != participant_id);
        Ok(n > 0)
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.conn.execute("DELETE FROM eliminations", [])?;
        inner.rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, ms: i64) -> EliminationRecord {
        EliminationRecord {
            participant_id: id.to_string(),
            reason: REASON_MAX_TOTAL_DRAWDOWN.to_string(),
            dd: 0.85,
            initiated_time_ms: ms,
            price_info: HashMap::from([(TradePair::BtcUsd, 60_000.0)]),
        }
    }

    fn open_temp() -> (tempfile::TempDir, EliminationRegistry, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elims.sqlite").to_str().unwrap().to_string();
        let registry = EliminationRegistry::open(&path).unwrap();
        (dir, registry, path)
    }

    #[test]
    fn append_then_lookup() {
        let (_dir, registry, _) = open_temp();
        assert!(registry.append_row(record("m1", 10)).unwrap());
        let found = registry.in_eliminations("m1").unwrap();
        assert_eq!(found.reason, REASON_MAX_TOTAL_DRAWDOWN);
        assert_eq!(found.price_info[&TradePair::BtcUsd], 60_000.0);
        assert!(registry.in_eliminations("m2").is_none());
    }

    #[test]
    fn append_is_idempotent_per_participant() {
        let (_dir, registry, _) = open_temp();
        assert!(registry.append_row(record("m1", 10)).unwrap());
        assert!(!registry.append_row(record("m1", 20)).unwrap());
        assert_eq!(registry.from_memory().len(), 1);
        assert_eq!(registry.from_disk().unwrap().len(), 1);
    }

    #[test]
    fn round_trip_reload() {
        let (_dir, registry, path) = open_temp();
        for i in 0..5 {
            registry.append_row(record(&format!("m{i}"), i)).unwrap();
        }
        drop(registry);
        let reopened = EliminationRegistry::open(&path).unwrap();
        let rows = reopened.from_memory();
        assert_eq!(rows.len(), 5);
        assert_eq!(reopened.eliminated_ids().len(), 5);
        assert_eq!(reopened.from_disk().unwrap().len(), 5);
        assert_eq!(rows[0].price_info[&TradePair::BtcUsd], 60_000.0);
    }

    #[test]
    fn remove_clears_memory_and_disk() {
        let (_dir, registry, _) = open_temp();
        registry.append_row(record("m1", 10)).unwrap();
        assert!(registry.remove("m1").unwrap());
        assert!(registry.in_eliminations("m1").is_none());
        assert!(registry.from_disk().unwrap().is_empty());
        assert!(!registry.remove("m1").unwrap());
    }

    #[test]
    fn clear_empties_everything() {
        let (_dir, registry, _) = open_temp();
        registry.append_row(record("m1", 10)).unwrap();
        registry.append_row(record("m2", 11)).unwrap();
        registry.clear().unwrap();
        assert!(registry.from_memory().is_empty());
        assert!(registry.from_disk().unwrap().is_empty());
    }
}
