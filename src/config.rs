//! Exchange configuration with sensible defaults and environment overrides.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::replay::ReplayMode;

/// Core exchange configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Commission rate charged to the resting side of each trade.
    pub commission_rate_maker: Decimal,
    /// Commission rate charged to the incoming side of each trade.
    pub commission_rate_taker: Decimal,
    /// Cap on concurrent WebSocket clients per symbol. `None` = unlimited.
    pub max_clients_per_symbol: Option<usize>,
    /// Capacity of the per-symbol recent-trades ring buffer.
    pub recent_trades_capacity: usize,
    /// Days a completed order stays searchable in the archive.
    pub archive_retention_days: u32,
    /// Default and maximum depth-snapshot level counts.
    pub depth_default_limit: usize,
    pub depth_max_limit: usize,
    /// Allowed |server time − request timestamp| on signed requests, ms.
    pub timestamp_skew_ms: i64,
    /// Over-reservation factor for MARKET buys by base quantity.
    pub slippage_buffer: Decimal,
    pub replay: ReplayConfig,
}

/// Replay controller configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub mode: ReplayMode,
    pub speed_factor: f64,
    /// Dispatch callbacks through a worker pool instead of the emitter thread.
    pub batch_callbacks: bool,
    /// Iterate sources as streams instead of materializing them.
    pub memory_optimized: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            commission_rate_maker: dec!(0.001),
            commission_rate_taker: dec!(0.001),
            max_clients_per_symbol: None,
            recent_trades_capacity: 1000,
            archive_retention_days: 90,
            depth_default_limit: 100,
            depth_max_limit: 5000,
            timestamp_skew_ms: 10_000,
            slippage_buffer: dec!(0.05),
            replay: ReplayConfig::default(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            mode: ReplayMode::Backtest,
            speed_factor: 1.0,
            batch_callbacks: false,
            memory_optimized: true,
        }
    }
}

impl ExchangeConfig {
    /// Defaults overridden by `VEX_*` environment variables where present.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<Decimal>("VEX_COMMISSION_MAKER") {
            config.commission_rate_maker = v;
        }
        if let Some(v) = env_parse::<Decimal>("VEX_COMMISSION_TAKER") {
            config.commission_rate_taker = v;
        }
        if let Some(v) = env_parse::<usize>("VEX_MAX_CLIENTS_PER_SYMBOL") {
            config.max_clients_per_symbol = Some(v);
        }
        if let Some(v) = env_parse::<usize>("VEX_RECENT_TRADES_CAPACITY") {
            config.recent_trades_capacity = v;
        }
        if let Some(v) = env_parse::<u32>("VEX_ARCHIVE_RETENTION_DAYS") {
            config.archive_retention_days = v;
        }
        if let Some(v) = env_parse::<usize>("VEX_DEPTH_DEFAULT_LIMIT") {
            config.depth_default_limit = v;
        }
        if let Some(v) = env_parse::<i64>("VEX_TIMESTAMP_SKEW_MS") {
            config.timestamp_skew_ms = v;
        }
        if let Some(v) = env_parse::<f64>("VEX_REPLAY_SPEED") {
            config.replay.speed_factor = v;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ExchangeConfig::default();
        assert_eq!(config.commission_rate_maker, dec!(0.001));
        assert_eq!(config.commission_rate_taker, dec!(0.001));
        assert_eq!(config.max_clients_per_symbol, None);
        assert_eq!(config.recent_trades_capacity, 1000);
        assert_eq!(config.archive_retention_days, 90);
        assert_eq!(config.depth_default_limit, 100);
        assert_eq!(config.depth_max_limit, 5000);
        assert_eq!(config.timestamp_skew_ms, 10_000);
        assert!(config.replay.memory_optimized);
    }
}
