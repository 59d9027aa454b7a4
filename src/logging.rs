//! Structured JSON logging.
//!
//! One JSON object per line on stderr. `LOG_LEVEL` sets the minimum level,
//! `LOG_DOMAINS` restricts output to a comma-separated list of domains
//! ("all" or unset enables everything).

use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Position,
    Mdd,
    Challenge,
    Eliminations,
    Roster,
    Prices,
    Feed,
    System,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Position => "position",
            Domain::Mdd => "mdd",
            Domain::Challenge => "challenge",
            Domain::Eliminations => "eliminations",
            Domain::Roster => "roster",
            Domain::Prices => "prices",
            Domain::Feed => "feed",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn log(level: Level, domain: Domain, event: &str, mut fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    fields.insert("ts".to_string(), Value::String(Utc::now().to_rfc3339()));
    fields.insert("seq".to_string(), Value::from(LOG_SEQ.fetch_add(1, Ordering::SeqCst)));
    fields.insert("level".to_string(), Value::String(level.as_str().to_string()));
    fields.insert("domain".to_string(), Value::String(domain.as_str().to_string()));
    fields.insert("event".to_string(), Value::String(event.to_string()));
    let line = serde_json::to_string(&Value::Object(fields)).unwrap_or_else(|_| "{}".to_string());
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{line}");
}

pub fn debug(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Debug, domain, event, fields);
}

pub fn info(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Info, domain, event, fields);
}

pub fn warn(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Warn, domain, event, fields);
}

pub fn error(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Error, domain, event, fields);
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

pub fn v_int(n: i64) -> Value {
    Value::from(n)
}

/// Short content hash for audit lines (registry snapshots, pool states).
pub fn state_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}
