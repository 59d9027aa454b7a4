use crate::metrics::MetricsConfig;

#[derive(Clone)]
pub struct Config {
    pub db_path: String,
    pub mdd_refresh_ms: i64,
    pub challenge_refresh_ms: i64,
    pub roster_refresh_ms: i64,
    pub loop_sleep_ms: u64,
    pub challenge_period_ms: i64,
    pub max_drawdown_pct: f64,
    pub promotion_min_return: f64,
    /// Orders younger than this are eligible for retroactive price correction.
    pub recent_order_window_ms: i64,
    pub annualization_factor: f64,
    pub volatility_floor: f64,
    pub downside_floor: f64,
    pub omega_loss_floor: f64,
    pub flat_penalty: f64,
    pub price_rest_base: String,
    pub price_api_key: Option<String>,
    pub ws_url: String,
    pub roster_ids: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "./provingground.sqlite".to_string()),
            mdd_refresh_ms: std::env::var("MDD_REFRESH_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(15_000),
            challenge_refresh_ms: std::env::var("CHALLENGE_REFRESH_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(60_000),
            roster_refresh_ms: std::env::var("ROSTER_REFRESH_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(300_000),
            loop_sleep_ms: std::env::var("LOOP_SLEEP_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(1_000),
            challenge_period_ms: std::env::var("CHALLENGE_PERIOD_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(60 * 24 * 3600 * 1000),
            max_drawdown_pct: std::env::var("MAX_DRAWDOWN_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(10.0),
            promotion_min_return: std::env::var("PROMOTION_MIN_RETURN").ok().and_then(|v| v.parse().ok()).unwrap_or(0.0),
            recent_order_window_ms: std::env::var("RECENT_ORDER_WINDOW_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(15 * 60 * 1000),
            annualization_factor: std::env::var("ANNUALIZATION_FACTOR").ok().and_then(|v| v.parse().ok()).unwrap_or(365.0),
            volatility_floor: std::env::var("VOLATILITY_FLOOR").ok().and_then(|v| v.parse().ok()).unwrap_or(0.05),
            downside_floor: std::env::var("DOWNSIDE_FLOOR").ok().and_then(|v| v.parse().ok()).unwrap_or(0.05),
            omega_loss_floor: std::env::var("OMEGA_LOSS_FLOOR").ok().and_then(|v| v.parse().ok()).unwrap_or(0.01),
            flat_penalty: std::env::var("FLAT_PENALTY").ok().and_then(|v| v.parse().ok()).unwrap_or(-1.0),
            price_rest_base: std::env::var("PRICE_REST_BASE").unwrap_or_else(|_| "https://api.polygon.io".to_string()),
            price_api_key: std::env::var("PRICE_API_KEY").ok(),
            ws_url: std::env::var("PRICE_WS_URL").unwrap_or_else(|_| "wss://socket.polygon.io/crypto".to_string()),
            roster_ids: std::env::var("ROSTER_IDS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
        }
    }

    pub fn metrics(&self) -> MetricsConfig {
        MetricsConfig {
            annualization_factor: self.annualization_factor,
            volatility_floor: self.volatility_floor,
            downside_floor: self.downside_floor,
            omega_loss_floor: self.omega_loss_floor,
            flat_penalty: self.flat_penalty,
        }
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
