//! Virtual exchange façade: wires the clock, accounts, matching engine,
//! market data, and (optionally) a replay controller into the high-level
//! operations the REST and WebSocket layers call.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

use crate::account::{AccountManager, AccountSnapshot};
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, ExchangeResult};
use crate::events::{EventBus, ExchangeEvent};
use crate::market_data::{Kline, MarketDataManager, Ticker24hr, AVG_PRICE_WINDOW_MINS, KLINE_INTERVALS};
use crate::matching::{DepthSnapshot, MatchingEngine, OrderLookup, OrderRequest};
use crate::replay::ReplayController;
use crate::time_manager::TimeManager;
use crate::types::{Order, OrderId, SymbolSpec, Trade};

pub struct VirtualExchange {
    clock: Arc<TimeManager>,
    accounts: Arc<AccountManager>,
    market_data: Arc<MarketDataManager>,
    events: Arc<EventBus>,
    engine: Arc<MatchingEngine>,
    config: ExchangeConfig,
    replay: Mutex<Option<ReplayController>>,
    /// listen key -> user id, for private WebSocket streams.
    listen_keys: RwLock<HashMap<String, String>>,
    /// Connected stream clients per symbol, for `max_clients_per_symbol`.
    stream_clients: Mutex<HashMap<String, usize>>,
}

impl VirtualExchange {
    /// Exchange on a live (wall) clock.
    pub fn new(config: ExchangeConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(TimeManager::new()))
    }

    /// Exchange on an injected clock; tests and backtests pass an isolated
    /// [`TimeManager`] per scenario.
    pub fn with_clock(config: ExchangeConfig, clock: Arc<TimeManager>) -> Arc<Self> {
        let accounts = Arc::new(AccountManager::new(
            config.commission_rate_maker,
            config.commission_rate_taker,
        ));
        let market_data = Arc::new(MarketDataManager::new(config.recent_trades_capacity));
        let events = Arc::new(EventBus::new());
        let engine = Arc::new(MatchingEngine::new(
            accounts.clone(),
            clock.clone(),
            market_data.clone(),
            events.clone(),
            config.clone(),
        ));
        Arc::new(Self {
            clock,
            accounts,
            market_data,
            events,
            engine,
            config,
            replay: Mutex::new(None),
            listen_keys: RwLock::new(HashMap::new()),
            stream_clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn clock(&self) -> &Arc<TimeManager> {
        &self.clock
    }

    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn server_time(&self) -> i64 {
        self.clock.now_ms()
    }

    // --- users and funds --------------------------------------------------

    pub fn register_user(&self, user_id: &str) -> ExchangeResult<String> {
        self.accounts.register_user(user_id)
    }

    pub fn deposit(&self, user_id: &str, asset: &str, amount: Decimal) -> ExchangeResult<()> {
        self.accounts.deposit(user_id, asset, amount)?;
        self.publish_account_update(user_id);
        Ok(())
    }

    pub fn withdraw(&self, user_id: &str, asset: &str, amount: Decimal) -> ExchangeResult<()> {
        self.accounts.withdraw(user_id, asset, amount)?;
        self.publish_account_update(user_id);
        Ok(())
    }

    pub fn account_info(&self, user_id: &str) -> ExchangeResult<AccountSnapshot> {
        self.accounts.snapshot(user_id, self.clock.now_ms())
    }

    pub fn resolve_api_key(&self, api_key: &str) -> Option<String> {
        self.accounts.resolve_api_key(api_key)
    }

    // --- symbols and orders ----------------------------------------------

    pub fn register_symbol(&self, spec: SymbolSpec) -> ExchangeResult<()> {
        self.engine.register_symbol(spec)
    }

    pub fn exchange_info(&self) -> Vec<SymbolSpec> {
        self.engine.symbol_specs()
    }

    pub fn submit_order(&self, request: OrderRequest) -> ExchangeResult<(Order, Vec<Trade>)> {
        let (order, trades) = self.engine.submit_order(request)?;
        if !trades.is_empty() {
            self.publish_market_snapshots(&order.symbol);
        }
        Ok((order, trades))
    }

    pub fn cancel_order(
        &self,
        user_id: &str,
        symbol: &str,
        lookup: OrderLookup,
    ) -> ExchangeResult<Order> {
        self.engine.cancel_order(user_id, symbol, lookup)
    }

    pub fn query_order(
        &self,
        user_id: &str,
        symbol: &str,
        lookup: OrderLookup,
    ) -> ExchangeResult<Order> {
        self.engine.query_order(user_id, symbol, lookup)
    }

    pub fn open_orders(&self, user_id: &str, symbol: Option<&str>) -> Vec<Order> {
        self.engine.open_orders(user_id, symbol)
    }

    pub fn all_orders(
        &self,
        user_id: &str,
        symbol: &str,
        from_id: Option<OrderId>,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> ExchangeResult<Vec<Order>> {
        self.engine
            .all_orders(user_id, symbol, from_id, start, end, limit)
    }

    pub fn my_trades(
        &self,
        user_id: &str,
        symbol: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Trade>> {
        self.engine.my_trades(user_id, symbol, limit)
    }

    // --- market data ------------------------------------------------------

    pub fn market_depth(&self, symbol: &str, limit: Option<usize>) -> ExchangeResult<DepthSnapshot> {
        let limit = limit.unwrap_or(self.config.depth_default_limit);
        self.engine.depth(symbol, limit)
    }

    pub fn recent_trades(&self, symbol: &str, limit: usize) -> ExchangeResult<Vec<Trade>> {
        self.engine.symbol_spec(symbol).ok_or(ExchangeError::UnknownSymbol)?;
        Ok(self.market_data.recent_trades(symbol, limit))
    }

    pub fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>> {
        self.engine.symbol_spec(symbol).ok_or(ExchangeError::UnknownSymbol)?;
        Ok(self.market_data.klines(symbol, interval, start, end, limit))
    }

    /// Last traded (or replayed) price.
    pub fn ticker_price(&self, symbol: &str) -> ExchangeResult<Option<Decimal>> {
        self.engine.symbol_spec(symbol).ok_or(ExchangeError::UnknownSymbol)?;
        Ok(self.market_data.last_price(symbol))
    }

    pub fn ticker_24hr(&self, symbol: &str) -> ExchangeResult<Option<Ticker24hr>> {
        self.engine.symbol_spec(symbol).ok_or(ExchangeError::UnknownSymbol)?;
        Ok(self.market_data.ticker_24hr(symbol, self.clock.now_ms()))
    }

    pub fn avg_price(&self, symbol: &str) -> ExchangeResult<Option<Decimal>> {
        self.engine.symbol_spec(symbol).ok_or(ExchangeError::UnknownSymbol)?;
        Ok(self.market_data.avg_price(symbol, self.clock.now_ms()))
    }

    // --- subscriptions ----------------------------------------------------

    /// Inline market-data subscription (all events for one symbol).
    pub fn subscribe_market(
        &self,
        symbol: &str,
        callback: impl Fn(&ExchangeEvent) + Send + Sync + 'static,
    ) -> u64 {
        self.events.subscribe_market(Some(symbol.to_string()), callback)
    }

    /// Inline private subscription for one user's order/account updates.
    pub fn subscribe_user(
        &self,
        user_id: &str,
        callback: impl Fn(&ExchangeEvent) + Send + Sync + 'static,
    ) -> u64 {
        self.events.subscribe_user(user_id, callback)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.events.unsubscribe(id)
    }

    /// Count one stream client against a symbol's cap. Returns false when
    /// the symbol is full; the caller must not deliver that subscription.
    pub fn add_stream_client(&self, symbol: &str) -> bool {
        let mut clients = self.stream_clients.lock().expect("stream clients lock");
        let count = clients.entry(symbol.to_string()).or_insert(0);
        if let Some(max) = self.config.max_clients_per_symbol {
            if *count >= max {
                return false;
            }
        }
        *count += 1;
        true
    }

    pub fn remove_stream_client(&self, symbol: &str) {
        let mut clients = self.stream_clients.lock().expect("stream clients lock");
        if let Some(count) = clients.get_mut(symbol) {
            *count = count.saturating_sub(1);
        }
    }

    // --- private stream listen keys --------------------------------------

    pub fn create_listen_key(&self, user_id: &str) -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = hex::encode(bytes);
        self.listen_keys
            .write()
            .expect("listen keys lock")
            .insert(key.clone(), user_id.to_string());
        key
    }

    pub fn resolve_listen_key(&self, listen_key: &str) -> Option<String> {
        self.listen_keys
            .read()
            .expect("listen keys lock")
            .get(listen_key)
            .cloned()
    }

    pub fn close_listen_key(&self, listen_key: &str) -> bool {
        self.listen_keys
            .write()
            .expect("listen keys lock")
            .remove(listen_key)
            .is_some()
    }

    // --- replay -----------------------------------------------------------

    /// Wire a replay controller into the exchange: every emitted bar advances
    /// the clock (done by the controller), feeds market data, fires parked
    /// stop orders, and goes out to market-data subscribers.
    pub fn attach_replay(self: &Arc<Self>, controller: ReplayController) {
        let exchange = Arc::downgrade(self);
        controller.register_callback(move |point| {
            let Some(exchange) = exchange.upgrade() else {
                return;
            };
            let bar = &point.bar;
            exchange.market_data.record_bar_tick(
                &bar.symbol,
                bar.close,
                bar.volume,
                point.timestamp,
            );
            exchange.engine.on_market_price(&bar.symbol, bar.close);
            exchange.publish_market_snapshots(&bar.symbol);
        });
        info!("replay controller attached");
        *self.replay.lock().expect("replay lock") = Some(controller);
    }

    pub fn replay(&self) -> Option<ReplayController> {
        self.replay.lock().expect("replay lock").clone()
    }

    // --- event publication ------------------------------------------------

    fn publish_account_update(&self, user_id: &str) {
        let now = self.clock.now_ms();
        if let Ok(snapshot) = self.accounts.snapshot(user_id, now) {
            self.events.publish_user(
                user_id,
                ExchangeEvent::AccountUpdate {
                    user_id: user_id.to_string(),
                    event_time: now,
                    balances: snapshot.balances,
                },
            );
        }
    }

    /// Push derived market-data events (kline, ticker, avg price) for a
    /// symbol after its state changed.
    fn publish_market_snapshots(&self, symbol: &str) {
        let now = self.clock.now_ms();
        if let Some((interval, _)) = KLINE_INTERVALS.first() {
            if let Some(kline) = self
                .market_data
                .klines(symbol, interval, None, None, 1)
                .pop()
            {
                self.events.publish_market(ExchangeEvent::Kline {
                    symbol: symbol.to_string(),
                    event_time: now,
                    interval: interval.to_string(),
                    kline,
                });
            }
        }
        if let Some(ticker) = self.market_data.ticker_24hr(symbol, now) {
            self.events.publish_market(ExchangeEvent::Ticker {
                event_time: now,
                ticker,
            });
        }
        if let Some(price) = self.market_data.avg_price(symbol, now) {
            self.events.publish_market(ExchangeEvent::AvgPrice {
                symbol: symbol.to_string(),
                event_time: now,
                mins: AVG_PRICE_WINDOW_MINS,
                price,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplayConfig;
    use crate::replay::{Bar, ReplayMode};
    use crate::sources::VecSource;
    use crate::types::{OrderType, Side};
    use rust_decimal_macros::dec;

    fn backtest_exchange() -> Arc<VirtualExchange> {
        let clock = Arc::new(TimeManager::backtest(1_000_000));
        let exchange = VirtualExchange::with_clock(ExchangeConfig::default(), clock);
        exchange
            .register_symbol(SymbolSpec::with_defaults("BTCUSDT", "BTC", "USDT"))
            .unwrap();
        exchange
    }

    fn limit(user: &str, side: Side, qty: Decimal, price: Decimal) -> OrderRequest {
        OrderRequest {
            user_id: user.into(),
            symbol: "BTCUSDT".into(),
            side: Some(side),
            order_type: Some(OrderType::Limit),
            quantity: Some(qty),
            price: Some(price),
            ..Default::default()
        }
    }

    #[test]
    fn end_to_end_submit_and_account_flow() {
        let exchange = backtest_exchange();
        exchange.register_user("u1").unwrap();
        exchange.register_user("u2").unwrap();
        exchange.deposit("u1", "USDT", dec!(10000)).unwrap();
        exchange.deposit("u2", "BTC", dec!(1)).unwrap();

        exchange
            .submit_order(limit("u2", Side::Sell, dec!(1), dec!(10000)))
            .unwrap();
        let (order, trades) = exchange
            .submit_order(limit("u1", Side::Buy, dec!(1), dec!(10000)))
            .unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(order.filled_quantity, dec!(1));

        let info = exchange.account_info("u1").unwrap();
        let btc = info.balances.iter().find(|b| b.asset == "BTC").unwrap();
        assert_eq!(btc.free, dec!(0.999));

        assert_eq!(exchange.ticker_price("BTCUSDT").unwrap(), Some(dec!(10000)));
        assert_eq!(exchange.recent_trades("BTCUSDT", 10).unwrap().len(), 1);
        assert_eq!(exchange.my_trades("u1", "BTCUSDT", 10).unwrap().len(), 1);
        assert_eq!(exchange.klines("BTCUSDT", "1m", None, None, 10).unwrap().len(), 1);
    }

    #[test]
    fn order_timestamps_come_from_the_virtual_clock() {
        let exchange = backtest_exchange();
        exchange.register_user("u1").unwrap();
        exchange.deposit("u1", "USDT", dec!(10000)).unwrap();
        exchange.clock().set_backtest_time(2_222_222).unwrap();
        let (order, _) = exchange
            .submit_order(limit("u1", Side::Buy, dec!(1), dec!(100)))
            .unwrap();
        assert_eq!(order.timestamp, 2_222_222);
        assert_eq!(exchange.server_time(), 2_222_222);
    }

    #[test]
    fn listen_key_lifecycle() {
        let exchange = backtest_exchange();
        let key = exchange.create_listen_key("u1");
        assert_eq!(exchange.resolve_listen_key(&key), Some("u1".to_string()));
        assert!(exchange.close_listen_key(&key));
        assert!(exchange.resolve_listen_key(&key).is_none());
        assert!(!exchange.close_listen_key(&key));
    }

    #[test]
    fn replay_bars_drive_clock_market_data_and_stops() {
        let clock = Arc::new(TimeManager::backtest(0));
        let exchange = VirtualExchange::with_clock(ExchangeConfig::default(), clock.clone());
        exchange
            .register_symbol(SymbolSpec::with_defaults("BTCUSDT", "BTC", "USDT"))
            .unwrap();
        exchange.register_user("u1").unwrap();
        exchange.deposit("u1", "BTC", dec!(1)).unwrap();
        exchange.register_user("u2").unwrap();
        exchange.deposit("u2", "USDT", dec!(100000)).unwrap();

        // Resting bid and a parked stop-loss sell triggered by a falling tape.
        exchange
            .submit_order(limit("u2", Side::Buy, dec!(1), dec!(95)))
            .unwrap();
        let stop = OrderRequest {
            user_id: "u1".into(),
            symbol: "BTCUSDT".into(),
            side: Some(Side::Sell),
            order_type: Some(OrderType::StopLossLimit),
            quantity: Some(dec!(1)),
            price: Some(dec!(95)),
            stop_price: Some(dec!(97)),
            ..Default::default()
        };
        let (parked, _) = exchange.submit_order(stop).unwrap();

        let controller = ReplayController::new(
            clock.clone(),
            ReplayConfig {
                mode: ReplayMode::Backtest,
                ..Default::default()
            },
        );
        let tape = vec![
            (1_000, bar(dec!(100))),
            (2_000, bar(dec!(98))),
            (3_000, bar(dec!(96))),
        ];
        controller.add_source("tape", Box::new(VecSource::new(tape)));
        exchange.attach_replay(controller.clone());
        controller.process_all_sync();

        assert_eq!(clock.now_ms(), 3_000);
        assert_eq!(exchange.ticker_price("BTCUSDT").unwrap(), Some(dec!(95)));
        let stop_order = exchange
            .query_order("u1", "BTCUSDT", OrderLookup::ById(parked.order_id))
            .unwrap();
        assert_eq!(stop_order.status, crate::types::OrderStatus::Filled);
    }

    fn bar(close: Decimal) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        }
    }
}
