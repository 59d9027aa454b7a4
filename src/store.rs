//! Position persistence and the per-(participant, pair) write locks.
//!
//! The store is the authoritative copy. Engines that mutate a position take
//! the pair's lock first, re-read the row, apply the change and save, so a
//! concurrent cycle can never resurrect stale state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::instrument::TradePair;
use crate::position::Position;

pub struct PositionStore {
    conn: Mutex<Connection>,
}

impl PositionStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open position store at {path}"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS positions (
                position_uuid TEXT PRIMARY KEY,
                participant_id TEXT NOT NULL,
                trade_pair TEXT NOT NULL,
                is_open INTEGER NOT NULL,
                open_ms INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_by_key
                ON positions (participant_id, trade_pair, is_open);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Upsert a position. At most one open position may exist per
    /// (participant, pair); saving a second open uuid for the same slot is an
    /// invariant violation and nothing is written.
    pub fn save(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if position.is_open() {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT position_uuid FROM positions
                     WHERE participant_id = ?1 AND trade_pair = ?2 AND is_open = 1",
                    params![position.participant_id, position.trade_pair.id()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(uuid) = existing {
                if uuid != position.position_uuid {
                    bail!(
                        "open position already exists for ({}, {}): {} vs {}",
                        position.participant_id,
                        position.trade_pair.id(),
                        uuid,
                        position.position_uuid
                    );
                }
            }
        }
        let data = serde_json::to_string(position)?;
        conn.execute(
            "INSERT INTO positions (position_uuid, participant_id, trade_pair, is_open, open_ms, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(position_uuid) DO UPDATE SET
                 is_open = excluded.is_open,
                 open_ms = excluded.open_ms,
                 data = excluded.data",
            params![
                position.position_uuid,
                position.participant_id,
                position.trade_pair.id(),
                position.is_open() as i64,
                position.open_ms,
                data
            ],
        )?;
        Ok(())
    }

    pub fn get_by_uuid(&self, position_uuid: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM positions WHERE position_uuid = ?1",
                params![position_uuid],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).context("corrupt position row")).transpose()
    }

    pub fn get_open(&self, participant_id: &str, pair: TradePair) -> Result<Option<Position>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM positions
                 WHERE participant_id = ?1 AND trade_pair = ?2 AND is_open = 1",
                params![participant_id, pair.id()],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).context("corrupt position row")).transpose()
    }

    /// All positions for the requested participants, optionally sorted by
    /// open time, skipping any participant in `skip`. Participants without
    /// positions do not appear in the result.
    pub fn get_all(
        &self,
        ids: &[String],
        sort: bool,
        skip: &HashSet<String>,
    ) -> Result<HashMap<String, Vec<Position>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT data FROM positions WHERE participant_id = ?1 ORDER BY open_ms")?;
        let mut out: HashMap<String, Vec<Position>> = HashMap::new();
        for id in ids {
            if skip.contains(id) {
                continue;
            }
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            let mut positions = Vec::new();
            for row in rows {
                let position: Position =
                    serde_json::from_str(&row?).context("corrupt position row")?;
                positions.push(position);
            }
            if sort {
                positions.sort_by_key(|p| p.open_ms);
            }
            if !positions.is_empty() {
                out.insert(id.clone(), positions);
            }
        }
        Ok(out)
    }

    pub fn participants_with_positions(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT participant_id FROM positions")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    pub fn delete(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM positions WHERE position_uuid = ?1", params![position.position_uuid])?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM positions", [])?;
        Ok(())
    }
}

/// One async mutex per (participant, pair). Guards are held across the
/// store re-read / mutate / save sequence, including any price fetches in
/// between, so they are tokio mutexes rather than std ones.
#[derive(Default)]
pub struct PositionLocks {
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl PositionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, participant_id: &str, pair: TradePair) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.locks.lock().unwrap();
        map.entry((participant_id.to_string(), pair.id().to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{Order, OrderType};

    fn open_temp() -> (tempfile::TempDir, PositionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::open(dir.path().join("positions.sqlite").to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn open_position(participant: &str, uuid: &str, ms: i64) -> Position {
        let mut p = Position::new(participant, uuid, TradePair::BtcUsd, ms);
        p.add_order(Order::new(OrderType::Long, 1.0, 1000.0, TradePair::BtcUsd, ms, &format!("{uuid}-o1")).unwrap())
            .unwrap();
        p
    }

    #[test]
    fn save_and_reload_by_uuid() {
        let (_dir, store) = open_temp();
        let p = open_position("m1", "p1", 10);
        store.save(&p).unwrap();
        let loaded = store.get_by_uuid("p1").unwrap().unwrap();
        assert_eq!(loaded.participant_id, "m1");
        assert_eq!(loaded.net_leverage, 1.0);
    }

    #[test]
    fn one_open_position_per_slot() {
        let (_dir, store) = open_temp();
        store.save(&open_position("m1", "p1", 10)).unwrap();
        let err = store.save(&open_position("m1", "p2", 20));
        assert!(err.is_err());
        // A different pair is a different slot.
        let mut other = Position::new("m1", "p3", TradePair::EthUsd, 30);
        other
            .add_order(Order::new(OrderType::Long, 1.0, 100.0, TradePair::EthUsd, 30, "p3-o1").unwrap())
            .unwrap();
        store.save(&other).unwrap();
    }

    #[test]
    fn closing_frees_the_open_slot() {
        let (_dir, store) = open_temp();
        let mut p = open_position("m1", "p1", 10);
        store.save(&p).unwrap();
        p.add_order(Order::new(OrderType::Flat, 0.0, 1100.0, TradePair::BtcUsd, 20, "p1-o2").unwrap())
            .unwrap();
        store.save(&p).unwrap();
        assert!(store.get_open("m1", TradePair::BtcUsd).unwrap().is_none());
        store.save(&open_position("m1", "p2", 30)).unwrap();
    }

    #[test]
    fn get_all_sorts_and_skips() {
        let (_dir, store) = open_temp();
        let mut late = open_position("m1", "p-late", 50);
        late.add_order(Order::new(OrderType::Flat, 0.0, 1000.0, TradePair::BtcUsd, 60, "x").unwrap())
            .unwrap();
        store.save(&late).unwrap();
        let mut early = open_position("m1", "p-early", 10);
        early
            .add_order(Order::new(OrderType::Flat, 0.0, 1000.0, TradePair::BtcUsd, 20, "y").unwrap())
            .unwrap();
        store.save(&early).unwrap();
        store.save(&open_position("m2", "p2", 5)).unwrap();

        let ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let all = store.get_all(&ids, true, &HashSet::new()).unwrap();
        assert_eq!(all["m1"].len(), 2);
        assert_eq!(all["m1"][0].position_uuid, "p-early");
        assert!(!all.contains_key("m3"));

        let skipped = store.get_all(&ids, true, &HashSet::from(["m2".to_string()])).unwrap();
        assert!(!skipped.contains_key("m2"));
    }

    #[test]
    fn delete_removes_the_row() {
        let (_dir, store) = open_temp();
        let p = open_position("m1", "p1", 10);
        store.save(&p).unwrap();
        store.delete(&p).unwrap();
        assert!(store.get_by_uuid("p1").unwrap().is_none());
        assert!(store.participants_with_positions().unwrap().is_empty());
    }
}
