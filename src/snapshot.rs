//! Optional JSON state snapshot: user balances, symbol specs, open orders,
//! and the trade archive. Save after a session, load on startup. Not wired
//! into the request path — the core is in-memory by design.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::account::AssetBalance;
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::VirtualExchange;
use crate::types::{Order, SymbolSpec, Trade};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    pub taken_at: i64,
    pub balances: HashMap<String, Vec<AssetBalance>>,
    pub symbols: Vec<SymbolSpec>,
    pub open_orders: Vec<Order>,
    pub trades: Vec<Trade>,
}

impl ExchangeSnapshot {
    pub fn capture(exchange: &VirtualExchange) -> Self {
        let symbols = exchange.exchange_info();
        let mut trades = Vec::new();
        for spec in &symbols {
            if let Ok(recent) = exchange.recent_trades(&spec.symbol, usize::MAX) {
                trades.extend(recent);
            }
        }
        Self {
            taken_at: exchange.server_time(),
            balances: exchange.accounts().all_balances(),
            symbols,
            open_orders: exchange.engine().open_orders_snapshot(),
            trades,
        }
    }
}

/// One-file JSON persistence.
#[derive(Clone, Debug)]
pub struct FileSnapshot {
    path: std::path::PathBuf,
}

impl FileSnapshot {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Save a snapshot, overwriting any existing file.
    pub fn save(&self, snapshot: &ExchangeSnapshot) -> ExchangeResult<()> {
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| ExchangeError::Internal(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| ExchangeError::Internal(e.to_string()))
    }

    /// Load a snapshot. Returns `None` when the file does not exist.
    pub fn load(&self) -> ExchangeResult<Option<ExchangeSnapshot>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ExchangeError::Internal(e.to_string())),
        };
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| ExchangeError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeConfig;
    use crate::matching::OrderRequest;
    use crate::time_manager::TimeManager;
    use crate::types::{OrderType, Side};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[test]
    fn snapshot_roundtrips_through_file() {
        let clock = Arc::new(TimeManager::backtest(42_000));
        let exchange = VirtualExchange::with_clock(ExchangeConfig::default(), clock);
        exchange
            .register_symbol(SymbolSpec::with_defaults("BTCUSDT", "BTC", "USDT"))
            .unwrap();
        exchange.register_user("u1").unwrap();
        exchange.deposit("u1", "USDT", dec!(1000)).unwrap();
        exchange
            .submit_order(OrderRequest {
                user_id: "u1".into(),
                symbol: "BTCUSDT".into(),
                side: Some(Side::Buy),
                order_type: Some(OrderType::Limit),
                quantity: Some(dec!(1)),
                price: Some(dec!(100)),
                ..Default::default()
            })
            .unwrap();

        let snapshot = ExchangeSnapshot::capture(&exchange);
        assert_eq!(snapshot.taken_at, 42_000);
        assert_eq!(snapshot.open_orders.len(), 1);
        assert_eq!(snapshot.symbols.len(), 1);

        let file = tempfile::NamedTempFile::new().unwrap();
        let store = FileSnapshot::new(file.path());
        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap().expect("snapshot present");
        assert_eq!(loaded.taken_at, snapshot.taken_at);
        assert_eq!(loaded.open_orders.len(), 1);
        let balances = &loaded.balances["u1"];
        let usdt = balances.iter().find(|b| b.asset == "USDT").unwrap();
        assert_eq!(usdt.free + usdt.locked, dec!(1000));
    }

    #[test]
    fn load_missing_file_returns_none() {
        let store = FileSnapshot::new("/nonexistent/snapshot.json");
        assert!(store.load().unwrap().is_none());
    }
}
