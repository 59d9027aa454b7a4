//! Roster snapshot and its consistency guard.
//!
//! Membership is synchronized elsewhere; this side holds the last accepted
//! snapshot and refuses implausible updates so a flaky upstream can never
//! dissolve most of the known participants in one step.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use crate::config::{now_ms, Config};
use crate::logging::{self, obj, v_int, v_num, v_str, Domain};
use crate::refresh::RefreshGate;

#[derive(Debug, Clone, Copy, Default)]
pub struct RosterAttributes {
    pub trust: f64,
    pub incentive: f64,
}

#[async_trait]
pub trait RosterProvider: Send + Sync {
    async fn ids(&self) -> Result<Vec<String>>;
    async fn attributes(&self, id: &str) -> Result<RosterAttributes>;
}

/// Fixed membership, from configuration. Stands in for a networked roster
/// source in tests and single-tenant deployments.
pub struct StaticRosterProvider {
    ids: Vec<String>,
}

impl StaticRosterProvider {
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }
}

#[async_trait]
impl RosterProvider for StaticRosterProvider {
    async fn ids(&self) -> Result<Vec<String>> {
        Ok(self.ids.clone())
    }

    async fn attributes(&self, _id: &str) -> Result<RosterAttributes> {
        Ok(RosterAttributes { trust: 1.0, incentive: 0.0 })
    }
}

/// Last accepted membership snapshot.
pub struct Roster {
    ids: Vec<String>,
}

impl Roster {
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Apply an update, unless it loses more than 10 participants and at
    /// least 25% of the snapshot at once; such updates are rejected and the
    /// previous snapshot stays in force.
    pub fn apply(&mut self, new_ids: Vec<String>) -> bool {
        let before: HashSet<&String> = self.ids.iter().collect();
        let after: HashSet<&String> = new_ids.iter().collect();
        let lost: Vec<&&String> = before.difference(&after).collect();
        let gained = after.difference(&before).count();
        let percent_lost = if before.is_empty() {
            0.0
        } else {
            100.0 * lost.len() as f64 / before.len() as f64
        };

        if lost.len() > 10 && percent_lost >= 25.0 {
            logging::error(
                Domain::Roster,
                "roster_update_rejected",
                obj(&[
                    ("lost", v_int(lost.len() as i64)),
                    ("percent_lost", v_num(percent_lost)),
                    ("known", v_int(before.len() as i64)),
                ]),
            );
            return false;
        }
        if !lost.is_empty() || gained > 0 {
            logging::info(
                Domain::Roster,
                "roster_updated",
                obj(&[
                    ("lost", v_int(lost.len() as i64)),
                    ("gained", v_int(gained as i64)),
                    ("size", v_int(new_ids.len() as i64)),
                ]),
            );
        }
        self.ids = new_ids;
        true
    }
}

/// Polling loop keeping the shared snapshot in sync with the provider.
pub async fn run_roster_sync(
    provider: Arc<dyn RosterProvider>,
    roster: Arc<Mutex<Roster>>,
    gate: Arc<RefreshGate>,
    cfg: Config,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let now = now_ms();
        if gate.refresh_allowed("roster", cfg.roster_refresh_ms, now) {
            match provider.ids().await {
                Ok(ids) => {
                    roster.lock().unwrap().apply(ids);
                    gate.mark_refreshed("roster", now);
                }
                Err(e) => {
                    logging::warn(
                        Domain::Roster,
                        "roster_fetch_failed",
                        obj(&[("error", v_str(&e.to_string()))]),
                    );
                }
            }
        }
        sleep(Duration::from_millis(cfg.loop_sleep_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("m{i}")).collect()
    }

    #[test]
    fn small_changes_are_accepted() {
        let mut roster = Roster::new(ids(20));
        let mut update = ids(19);
        update.push("m-new".to_string());
        assert!(roster.apply(update));
        assert_eq!(roster.ids().len(), 20);
    }

    #[test]
    fn implausible_shrink_is_rejected() {
        let mut roster = Roster::new(ids(40));
        // Losing 20 of 40 trips both the absolute and relative guards.
        assert!(!roster.apply(ids(20)));
        assert_eq!(roster.ids().len(), 40);
    }

    #[test]
    fn large_loss_below_quarter_is_accepted() {
        let mut roster = Roster::new(ids(100));
        // 12 lost but only 12% of the snapshot.
        assert!(roster.apply(ids(88)));
        assert_eq!(roster.ids().len(), 88);
    }

    #[test]
    fn small_absolute_loss_is_accepted_even_at_high_percent() {
        let mut roster = Roster::new(ids(8));
        // 50% lost, but under the 10-participant absolute bar.
        assert!(roster.apply(ids(4)));
        assert_eq!(roster.ids().len(), 4);
    }
}
