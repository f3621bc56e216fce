//! Application configuration loaded from environment variables.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::orderbook::feed::FeedSettings;
use crate::sniper::scheduler::TimingSettings;
use crate::sniper::supervisor::SupervisorSettings;
use crate::trading::execution::RetryPolicy;

/// Application configuration loaded from environment variables.
///
/// Not `Clone`: the wallet key and API secrets are moved out by
/// [`crate::signing::Credentials::take_from`] and must not be duplicated first.
#[derive(Deserialize)]
pub struct Config {
    // === Polymarket Credentials ===
    /// Wallet private key (hex, starts with 0x).
    pub polymarket_private_key: String,

    /// API key for L2 request authentication.
    #[serde(default)]
    pub polymarket_api_key: Option<String>,

    /// API secret (HMAC key).
    #[serde(default)]
    pub polymarket_api_secret: Option<String>,

    /// API passphrase.
    #[serde(default)]
    pub polymarket_api_passphrase: Option<String>,

    /// Signature type: 0=EOA, 1=Magic.link, 2=Gnosis Safe.
    #[serde(default)]
    pub polymarket_signature_type: u8,

    /// Proxy wallet address (required for Magic.link).
    #[serde(default)]
    pub polymarket_funder: Option<String>,

    // === Trading Parameters ===
    /// Fire this many seconds before the resolution deadline.
    #[serde(default = "default_trigger_offset")]
    pub trigger_offset_seconds: u64,

    /// Start monitoring this many minutes before the deadline.
    #[serde(default = "default_monitor_window")]
    pub monitor_window_minutes: u64,

    /// Limit price for the FOK buy.
    #[serde(default = "default_buy_price")]
    pub buy_price: Decimal,

    /// Shares to buy.
    #[serde(default = "default_buy_size")]
    pub buy_size: Decimal,

    /// Minimum implied probability of the chosen side at the fire instant.
    #[serde(default = "default_min_win_probability")]
    pub min_win_probability: Decimal,

    /// Side to buy: "favorite", "up" or "down".
    #[serde(default = "default_side")]
    pub side: String,

    // === Operation Modes ===
    /// Simulation mode (no real orders).
    #[serde(default = "default_true")]
    pub dry_run: bool,

    // === Timing ===
    /// Arm this many milliseconds before the fire instant.
    #[serde(default = "default_arm_lead_ms")]
    pub arm_lead_ms: u64,

    /// Drift above this is corrected and logged.
    #[serde(default = "default_drift_tolerance_ms")]
    pub drift_tolerance_ms: u64,

    /// Drift above this fails the session.
    #[serde(default = "default_drift_fault_ms")]
    pub drift_fault_ms: u64,

    /// Do not fire on a book older than this.
    #[serde(default = "default_max_book_age_ms")]
    pub max_book_age_ms: u64,

    // === Feed ===
    /// WebSocket base URL.
    #[serde(default = "default_ws_url")]
    pub polymarket_ws_url: String,

    /// Time allowed for the first snapshot to arrive.
    #[serde(default = "default_feed_connect_timeout_ms")]
    pub feed_connect_timeout_ms: u64,

    /// Consecutive reconnect failures before the feed is declared lost.
    #[serde(default = "default_feed_max_reconnects")]
    pub feed_max_reconnects: u32,

    // === Orders ===
    /// CLOB API base URL.
    #[serde(default = "default_clob_url")]
    pub polymarket_clob_url: String,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Submission attempts for transient failures.
    #[serde(default = "default_order_max_attempts")]
    pub order_max_attempts: u32,

    /// Minimum time left before the deadline to try another submission.
    #[serde(default = "default_min_round_trip_ms")]
    pub order_min_round_trip_ms: u64,

    // === Supervisor ===
    /// Gamma API base URL.
    #[serde(default = "default_gamma_url")]
    pub polymarket_gamma_url: String,

    /// Comma-separated search queries for candidate markets.
    #[serde(default = "default_scan_queries")]
    pub scan_queries: String,

    /// Only consider markets resolving within this many minutes.
    #[serde(default = "default_scan_horizon")]
    pub scan_horizon_minutes: u64,

    /// Sleep between scans when nothing qualifies.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Pause after each session.
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,

    /// Extra time a session may run past its deadline.
    #[serde(default = "default_session_grace")]
    pub session_grace_seconds: u64,

    /// Delay before the first scan in live mode.
    #[serde(default = "default_live_start_delay")]
    pub live_start_delay_seconds: u64,

    // === Server Configuration ===
    /// HTTP server port for health/status endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub metrics_enabled: bool,

    /// Prometheus exporter port.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Enable verbose logging.
    #[serde(default)]
    pub verbose: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("polymarket_private_key", &"<redacted>")
            .field("polymarket_api_key", &self.polymarket_api_key.as_ref().map(|_| "<redacted>"))
            .field("polymarket_signature_type", &self.polymarket_signature_type)
            .field("trigger_offset_seconds", &self.trigger_offset_seconds)
            .field("monitor_window_minutes", &self.monitor_window_minutes)
            .field("buy_price", &self.buy_price)
            .field("buy_size", &self.buy_size)
            .field("min_win_probability", &self.min_win_probability)
            .field("side", &self.side)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

/// The trading options of a sniper session. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SniperConfig {
    /// Fire this long before the deadline.
    pub trigger_offset: Duration,
    /// Start monitoring this long before the deadline.
    pub monitor_window: Duration,
    /// FOK limit price.
    pub buy_price: Decimal,
    /// Shares to buy.
    pub buy_size: Decimal,
    /// Probability gate at the fire instant.
    pub min_win_probability: Decimal,
    /// Synthesize fills instead of submitting.
    pub dry_run: bool,
}

impl SniperConfig {
    /// Build from the six recognized options.
    pub fn new(
        trigger_offset_seconds: u64,
        monitor_window_minutes: u64,
        buy_price: Decimal,
        buy_size: Decimal,
        min_win_probability: Decimal,
        dry_run: bool,
    ) -> Self {
        Self {
            trigger_offset: Duration::from_secs(trigger_offset_seconds),
            monitor_window: Duration::from_secs(monitor_window_minutes * 60),
            buy_price,
            buy_size,
            min_win_probability,
            dry_run,
        }
    }
}

fn default_trigger_offset() -> u64 {
    1
}

fn default_monitor_window() -> u64 {
    5
}

fn default_buy_price() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

fn default_buy_size() -> Decimal {
    Decimal::new(10, 0) // 10 shares
}

fn default_min_win_probability() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_side() -> String {
    "favorite".to_string()
}

fn default_true() -> bool {
    true
}

fn default_arm_lead_ms() -> u64 {
    500
}

fn default_drift_tolerance_ms() -> u64 {
    250
}

fn default_drift_fault_ms() -> u64 {
    5_000
}

fn default_max_book_age_ms() -> u64 {
    3_000
}

fn default_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com".to_string()
}

fn default_feed_connect_timeout_ms() -> u64 {
    10_000
}

fn default_feed_max_reconnects() -> u32 {
    5
}

fn default_clob_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_http_timeout_ms() -> u64 {
    2_000
}

fn default_order_max_attempts() -> u32 {
    3
}

fn default_min_round_trip_ms() -> u64 {
    250
}

fn default_gamma_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

fn default_scan_queries() -> String {
    "Bitcoin up or down,Ethereum up or down,Solana up or down".to_string()
}

fn default_scan_horizon() -> u64 {
    20
}

fn default_poll_interval() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    5
}

fn default_session_grace() -> u64 {
    30
}

fn default_live_start_delay() -> u64 {
    5
}

fn default_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.polymarket_private_key.is_empty() {
            return Err("POLYMARKET_PRIVATE_KEY is required".to_string());
        }

        if !self.polymarket_private_key.starts_with("0x") {
            return Err("POLYMARKET_PRIVATE_KEY must start with 0x".to_string());
        }

        if self.buy_price <= Decimal::ZERO || self.buy_price >= Decimal::ONE {
            return Err("BUY_PRICE must be between 0 and 1 (exclusive)".to_string());
        }

        if self.buy_size <= Decimal::ZERO {
            return Err("BUY_SIZE must be positive".to_string());
        }

        if self.min_win_probability < Decimal::ZERO || self.min_win_probability > Decimal::ONE {
            return Err("MIN_WIN_PROBABILITY must be within [0, 1]".to_string());
        }

        if self.trigger_offset_seconds == 0 {
            return Err("TRIGGER_OFFSET_SECONDS must be at least 1".to_string());
        }

        if self.monitor_window_minutes * 60 <= self.trigger_offset_seconds {
            return Err("MONITOR_WINDOW_MINUTES must exceed the trigger offset".to_string());
        }

        if self.max_book_age_ms == 0 {
            return Err("MAX_BOOK_AGE_MS must be positive".to_string());
        }

        let submission_budget_ms = self.http_timeout_ms.saturating_mul(u64::from(self.order_max_attempts.max(1)));
        if self.session_grace_seconds.saturating_mul(1000) <= submission_budget_ms {
            return Err(format!(
                "SESSION_GRACE_SECONDS must exceed HTTP_TIMEOUT_MS x ORDER_MAX_ATTEMPTS ({}ms)",
                submission_budget_ms
            ));
        }

        for (name, value, schemes) in [
            ("POLYMARKET_CLOB_URL", &self.polymarket_clob_url, ["http", "https"]),
            ("POLYMARKET_GAMMA_URL", &self.polymarket_gamma_url, ["http", "https"]),
            ("POLYMARKET_WS_URL", &self.polymarket_ws_url, ["ws", "wss"]),
        ] {
            match url::Url::parse(value) {
                Ok(parsed) if schemes.contains(&parsed.scheme()) => {}
                _ => return Err(format!("{} must be a {} URL", name, schemes.join("/"))),
            }
        }

        if self.side.parse::<crate::market::SidePick>().is_err() {
            return Err("SIDE must be one of favorite, up, down".to_string());
        }

        if !self.dry_run && (self.polymarket_api_key.is_none() || self.polymarket_api_secret.is_none() || self.polymarket_api_passphrase.is_none()) {
            return Err("live trading requires POLYMARKET_API_KEY, POLYMARKET_API_SECRET and POLYMARKET_API_PASSPHRASE".to_string());
        }

        Ok(())
    }

    /// The trading options for sessions.
    pub fn sniper(&self) -> SniperConfig {
        SniperConfig::new(
            self.trigger_offset_seconds,
            self.monitor_window_minutes,
            self.buy_price,
            self.buy_size,
            self.min_win_probability,
            self.dry_run,
        )
    }

    /// Scheduler and state-machine timing.
    pub fn timing(&self) -> TimingSettings {
        TimingSettings {
            arm_lead: Duration::from_millis(self.arm_lead_ms),
            drift_tolerance: Duration::from_millis(self.drift_tolerance_ms),
            drift_fault: Duration::from_millis(self.drift_fault_ms),
            max_book_age: Duration::from_millis(self.max_book_age_ms),
            ..TimingSettings::default()
        }
    }

    /// Live feed settings.
    pub fn feed(&self) -> FeedSettings {
        FeedSettings {
            ws_url: self.polymarket_ws_url.clone(),
            connect_timeout: Duration::from_millis(self.feed_connect_timeout_ms),
            max_reconnects: self.feed_max_reconnects,
            ..FeedSettings::default()
        }
    }

    /// Submission retry policy.
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.order_max_attempts.max(1),
            min_round_trip: Duration::from_millis(self.order_min_round_trip_ms),
            ..RetryPolicy::default()
        }
    }

    /// Outer-loop settings.
    pub fn supervisor(&self) -> SupervisorSettings {
        SupervisorSettings {
            scan_horizon: Duration::from_secs(self.scan_horizon_minutes * 60),
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            cooldown: Duration::from_secs(self.cooldown_seconds),
            session_grace: Duration::from_secs(self.session_grace_seconds),
            live_start_delay: Duration::from_secs(self.live_start_delay_seconds),
        }
    }

    /// Search queries for the scanner.
    pub fn scan_queries(&self) -> Vec<String> {
        self.scan_queries
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Check if using Magic.link (signature_type == 1).
    pub fn is_magic_link(&self) -> bool {
        self.polymarket_signature_type == 1
    }
}
