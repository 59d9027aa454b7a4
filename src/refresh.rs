//! Shared rate gate bounding how often each engine loop does real work.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct RefreshGate {
    last_run_ms: Mutex<HashMap<String, i64>>,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when at least `interval_ms` has passed since the key's last
    /// marked refresh. A key that never ran is always allowed.
    pub fn refresh_allowed(&self, key: &str, interval_ms: i64, now_ms: i64) -> bool {
        let map = self.last_run_ms.lock().unwrap();
        match map.get(key) {
            None => true,
            Some(&last) => now_ms - last >= interval_ms,
        }
    }

    pub fn mark_refreshed(&self, key: &str, now_ms: i64) {
        self.last_run_ms.lock().unwrap().insert(key.to_string(), now_ms);
    }
}
