// =============================================================================
// Configuration — environment-driven engine, risk and supervisor settings
// =============================================================================
//
// Every tunable documented in the data model has a hard default here and MAY
// be overridden from the environment (`.env` is loaded by main).  Engine
// defaults use the `RH_DEFAULT_*` namespace; venue credentials stay with the
// adapters and are never read by this module.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Side;

// -----------------------------------------------------------------------------
// Env helpers
// -----------------------------------------------------------------------------

pub fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid float in env — using default");
            default
        }),
        Err(_) => default,
    }
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid integer in env — using default");
            default
        }),
        Err(_) => default,
    }
}

pub fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Comma-separated list, upper-cased, empty entries dropped.
pub fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

// -----------------------------------------------------------------------------
// RiskConfig — per-engine risk gates
// -----------------------------------------------------------------------------

/// Risk-gate settings for one hedge engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum order-book age before a tick is rejected (seconds).
    pub max_orderbook_age_sec: f64,
    /// Maximum venue bid/ask spread tolerated on either leg.
    pub max_spread_pct: f64,
    /// Minimum directional depth on each leg (USD).
    pub min_liquidity_usd: f64,
    /// Number of book levels summed for the liquidity check.
    pub liquidity_depth_levels: usize,
    /// Minimum spread profit rate to open.
    pub min_profit_rate: f64,
    /// Minimum spread profit rate to close (may be negative).
    pub reduce_pos_min_profit_rate: f64,
    /// User floor the adaptive mechanism never breaches.
    pub user_min_profit_rate: f64,
    pub enable_dynamic_profit_rate: bool,
    /// Step applied on each adaptive adjustment.
    pub profit_rate_adjust_step: f64,
    /// Consecutive trades required before an adjustment.
    pub profit_rate_adjust_threshold: usize,
    /// Seconds without a fill before the min rate is lowered (0 = disabled).
    pub no_trade_reduce_timeout_sec: f64,
    /// Step multiplier used by the no-trade downshift.
    pub no_trade_reduce_step_multiplier: f64,
    /// Largest imbalance auto-balance is allowed to trade away (USD).
    pub auto_pos_balance_usd_value_limit: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_orderbook_age_sec: 1.0,
            max_spread_pct: 0.0015,
            min_liquidity_usd: 1000.0,
            liquidity_depth_levels: 10,
            min_profit_rate: 0.0005,
            reduce_pos_min_profit_rate: -0.001,
            user_min_profit_rate: 0.001,
            enable_dynamic_profit_rate: true,
            profit_rate_adjust_step: 0.00005,
            profit_rate_adjust_threshold: 3,
            no_trade_reduce_timeout_sec: 0.0,
            no_trade_reduce_step_multiplier: 1.5,
            auto_pos_balance_usd_value_limit: 1000.0,
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_orderbook_age_sec: env_f64("RH_DEFAULT_MAX_ORDERBOOK_AGE_SEC", d.max_orderbook_age_sec),
            max_spread_pct: env_f64("RH_DEFAULT_MAX_SPREAD_PCT", d.max_spread_pct),
            min_liquidity_usd: env_f64("RH_DEFAULT_MIN_LIQUIDITY_USD", d.min_liquidity_usd),
            liquidity_depth_levels: env_u64("RH_DEFAULT_LIQUIDITY_DEPTH_LEVELS", d.liquidity_depth_levels as u64)
                as usize,
            min_profit_rate: env_f64("RH_DEFAULT_MIN_PROFIT_RATE", d.min_profit_rate),
            reduce_pos_min_profit_rate: env_f64(
                "RH_DEFAULT_REDUCE_POS_MIN_PROFIT_RATE",
                d.reduce_pos_min_profit_rate,
            ),
            user_min_profit_rate: env_f64("RH_DEFAULT_USER_MIN_PROFIT_RATE", d.user_min_profit_rate),
            enable_dynamic_profit_rate: env_bool(
                "RH_DEFAULT_ENABLE_DYNAMIC_PROFIT_RATE",
                d.enable_dynamic_profit_rate,
            ),
            profit_rate_adjust_step: env_f64("RH_DEFAULT_PROFIT_RATE_ADJUST_STEP", d.profit_rate_adjust_step),
            profit_rate_adjust_threshold: env_u64(
                "RH_DEFAULT_PROFIT_RATE_ADJUST_THRESHOLD",
                d.profit_rate_adjust_threshold as u64,
            ) as usize,
            no_trade_reduce_timeout_sec: env_f64(
                "RH_DEFAULT_NO_TRADE_REDUCE_TIMEOUT_SEC",
                d.no_trade_reduce_timeout_sec,
            ),
            no_trade_reduce_step_multiplier: env_f64(
                "RH_DEFAULT_NO_TRADE_REDUCE_STEP_MULTIPLIER",
                d.no_trade_reduce_step_multiplier,
            ),
            auto_pos_balance_usd_value_limit: env_f64(
                "RH_DEFAULT_AUTO_POS_BALANCE_USD_VALUE_LIMIT",
                d.auto_pos_balance_usd_value_limit,
            ),
        }
    }
}

// -----------------------------------------------------------------------------
// TradeConfig — per-engine trade parameters
// -----------------------------------------------------------------------------

/// Trade parameters for one hedge engine.
///
/// In daemon mode sides are chosen by the engine from the z-score and the
/// combined snapshot; `side1`/`side2` are only the startup defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeConfig {
    pub pair1: String,
    pub pair2: String,
    pub side1: Side,
    pub side2: Side,
    /// Per-trade amount window (fixed-side mode).
    pub amount_min: f64,
    pub amount_max: f64,
    pub amount_step: f64,
    /// Total amount to execute (fixed-side mode; 0 in daemon mode).
    pub total_amount: f64,
    pub trade_interval_sec: f64,
    pub use_dynamic_amount: bool,
    /// Largest fraction of the thinner first level a single order may take.
    pub max_first_level_ratio: f64,
    /// Engine self-stops after this long without a fill (0 = disabled).
    pub no_trade_timeout_sec: f64,
    pub min_order_value_usd: f64,
    pub max_order_value_usd: f64,
    pub daemon_mode: bool,
    pub zscore_threshold: f64,
}

impl TradeConfig {
    /// Fixed-side configuration as driven by an operator.
    pub fn fixed(pair1: &str, pair2: &str, side1: Side, total_amount: f64) -> Self {
        Self {
            pair1: pair1.to_string(),
            pair2: pair2.to_string(),
            side1,
            side2: side1.opposite(),
            amount_min: 0.0,
            amount_max: 0.0,
            amount_step: 1.0,
            total_amount,
            trade_interval_sec: 0.1,
            use_dynamic_amount: true,
            max_first_level_ratio: 1.0,
            no_trade_timeout_sec: 0.0,
            min_order_value_usd: env_f64("RH_DEFAULT_MIN_ORDER_VALUE_USD", 20.0),
            max_order_value_usd: env_f64("RH_DEFAULT_MAX_ORDER_VALUE_USD", 500.0),
            daemon_mode: false,
            zscore_threshold: env_f64("RH_DEFAULT_ZSCORE_THRESHOLD", 2.0),
        }
    }

    /// Daemon configuration for one symbol: the engine decides sides itself.
    pub fn daemon(symbol: &str) -> Self {
        let pair = if symbol.ends_with("USDT") {
            symbol.to_string()
        } else {
            format!("{symbol}USDT")
        };
        Self {
            total_amount: 0.0,
            no_trade_timeout_sec: 0.0,
            daemon_mode: true,
            ..Self::fixed(&pair, &pair, Side::Buy, 0.0)
        }
    }
}

// -----------------------------------------------------------------------------
// VenueRiskLimits — per-venue risk thresholds
// -----------------------------------------------------------------------------

/// Safe / target / danger / force-reduce thresholds applied to one venue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VenueRiskLimits {
    pub safe_leverage: f64,
    pub safe_maintenance_margin_ratio: f64,
    pub safe_margin_usage: f64,
    pub target_leverage: f64,
    pub target_maintenance_margin_ratio: f64,
    pub target_margin_usage: f64,
    pub danger_leverage: f64,
    pub danger_maintenance_margin_ratio: f64,
    pub danger_margin_usage: f64,
    pub force_reduce_leverage: f64,
    pub force_reduce_maintenance_margin_ratio: f64,
}

impl Default for VenueRiskLimits {
    fn default() -> Self {
        Self {
            safe_leverage: 3.0,
            safe_maintenance_margin_ratio: 0.7,
            safe_margin_usage: 0.7,
            target_leverage: 5.0,
            target_maintenance_margin_ratio: 0.8,
            target_margin_usage: 0.8,
            danger_leverage: 8.0,
            danger_maintenance_margin_ratio: 0.9,
            danger_margin_usage: 0.9,
            force_reduce_leverage: 10.0,
            force_reduce_maintenance_margin_ratio: 0.9,
        }
    }
}

impl VenueRiskLimits {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            danger_leverage: env_f64("DANGER_LEVERAGE", d.danger_leverage),
            ..d
        }
    }
}

// -----------------------------------------------------------------------------
// ManagerConfig — supervisor settings
// -----------------------------------------------------------------------------

/// Supervisor cadence, health limits and notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Snapshot refresh / broadcast interval (minutes).
    pub risk_update_interval_min: u64,
    pub enable_notifications: bool,
    /// Digest notification interval (minutes).
    pub notify_interval_min: u64,
    /// Stagger between child launches (seconds).
    pub engine_startup_delay_sec: f64,
    pub max_restart_attempts: u32,
    /// Restart wait grows as `factor^restart_count` minutes.
    pub restart_backoff_factor: f64,
    pub memory_limit_mb: f64,
    /// A child with no activity for this long is flagged (minutes).
    pub no_trade_timeout_min: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            risk_update_interval_min: 2,
            enable_notifications: true,
            notify_interval_min: 30,
            engine_startup_delay_sec: 5.0,
            max_restart_attempts: 3,
            restart_backoff_factor: 2.0,
            memory_limit_mb: 1000.0,
            no_trade_timeout_min: 30,
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            risk_update_interval_min: env_u64("RISK_UPDATE_INTERVAL_MIN", d.risk_update_interval_min),
            enable_notifications: env_bool("ENABLE_NOTIFICATIONS", d.enable_notifications),
            notify_interval_min: env_u64("NOTIFY_INTERVAL_MIN", d.notify_interval_min),
            engine_startup_delay_sec: env_f64("ENGINE_STARTUP_DELAY_SEC", d.engine_startup_delay_sec),
            max_restart_attempts: env_u64("MAX_RESTART_ATTEMPTS", d.max_restart_attempts as u64) as u32,
            restart_backoff_factor: env_f64("RESTART_BACKOFF_FACTOR", d.restart_backoff_factor),
            memory_limit_mb: env_f64("MEMORY_LIMIT_MB", d.memory_limit_mb),
            no_trade_timeout_min: env_u64("NO_TRADE_TIMEOUT_MIN", d.no_trade_timeout_min),
        }
    }
}

// -----------------------------------------------------------------------------
// Settings — top-level process configuration
// -----------------------------------------------------------------------------

/// Everything the process reads from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Whitelist of base symbols to run engines for.
    pub symbols: Vec<String>,
    /// Venue codes to construct adapters for.
    pub venues: Vec<String>,
    pub manager: ManagerConfig,
    pub risk: RiskConfig,
    pub venue_limits: VenueRiskLimits,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            symbols: env_list("MERIDIAN_SYMBOLS", &["BTC", "ETH"]),
            venues: env_list("MERIDIAN_VENUES", &["PAPER1", "PAPER2"])
                .into_iter()
                .map(|v| v.to_lowercase())
                .collect(),
            manager: ManagerConfig::from_env(),
            risk: RiskConfig::from_env(),
            venue_limits: VenueRiskLimits::from_env(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_defaults_match_documented_values() {
        let cfg = RiskConfig::default();
        assert!((cfg.max_orderbook_age_sec - 1.0).abs() < f64::EPSILON);
        assert!((cfg.max_spread_pct - 0.0015).abs() < f64::EPSILON);
        assert!((cfg.min_profit_rate - 0.0005).abs() < f64::EPSILON);
        assert!((cfg.user_min_profit_rate - 0.001).abs() < f64::EPSILON);
        assert_eq!(cfg.liquidity_depth_levels, 10);
        assert_eq!(cfg.profit_rate_adjust_threshold, 3);
        assert!(cfg.enable_dynamic_profit_rate);
        assert!((cfg.no_trade_reduce_timeout_sec - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn daemon_config_appends_quote_and_mirrors_sides() {
        let cfg = TradeConfig::daemon("BTC");
        assert_eq!(cfg.pair1, "BTCUSDT");
        assert_eq!(cfg.pair2, "BTCUSDT");
        assert!(cfg.daemon_mode);
        assert_eq!(cfg.side2, cfg.side1.opposite());
        assert!((cfg.min_order_value_usd - 20.0).abs() < f64::EPSILON);
        assert!((cfg.max_order_value_usd - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn venue_limits_ordering_is_sane() {
        let lim = VenueRiskLimits::default();
        assert!(lim.safe_leverage < lim.target_leverage);
        assert!(lim.target_leverage < lim.danger_leverage);
        assert!(lim.danger_leverage < lim.force_reduce_leverage);
        assert!(lim.safe_maintenance_margin_ratio < lim.danger_maintenance_margin_ratio);
    }

    #[test]
    fn manager_defaults() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.risk_update_interval_min, 2);
        assert_eq!(cfg.notify_interval_min, 30);
        assert_eq!(cfg.max_restart_attempts, 3);
        assert!((cfg.engine_startup_delay_sec - 5.0).abs() < f64::EPSILON);
    }
}
