//! # Virtual Exchange
//!
//! A virtual spot exchange with a deterministic, time-controllable
//! backtesting pipeline: Binance-compatible REST and WebSocket surfaces over
//! a price-time-priority matching core, per-user balance accounting with
//! reservation semantics, and a replay controller that drives the virtual
//! clock from historical data.
//!
//! ## Entry point
//!
//! [`VirtualExchange`] wires everything together: create with
//! [`VirtualExchange::new`] (live clock) or [`VirtualExchange::with_clock`]
//! (injected clock for backtests), register symbols and users, then submit
//! orders or serve the REST/WS API via [`api::create_router`].
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rust_decimal_macros::dec;
//! use virtual_exchange::{
//!     ExchangeConfig, OrderRequest, OrderType, Side, SymbolSpec, TimeManager, VirtualExchange,
//! };
//!
//! let clock = Arc::new(TimeManager::backtest(1_700_000_000_000));
//! let exchange = VirtualExchange::with_clock(ExchangeConfig::default(), clock);
//! exchange.register_symbol(SymbolSpec::with_defaults("BTCUSDT", "BTC", "USDT")).unwrap();
//! exchange.register_user("alice").unwrap();
//! exchange.deposit("alice", "USDT", dec!(10000)).unwrap();
//!
//! let (order, trades) = exchange
//!     .submit_order(OrderRequest {
//!         user_id: "alice".into(),
//!         symbol: "BTCUSDT".into(),
//!         side: Some(Side::Buy),
//!         order_type: Some(OrderType::Limit),
//!         quantity: Some(dec!(1)),
//!         price: Some(dec!(9500)),
//!         ..Default::default()
//!     })
//!     .unwrap();
//! assert!(trades.is_empty());
//! assert_eq!(order.timestamp, 1_700_000_000_000);
//! ```
//!
//! ## Lower-level API
//!
//! The components compose individually: [`matching::MatchingEngine`] over
//! [`order_book::OrderBook`] and [`account::AccountManager`], timed by
//! [`time_manager::TimeManager`], replayed by [`replay::ReplayController`].

pub mod account;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod market_data;
pub mod matching;
pub mod order_book;
pub mod replay;
pub mod snapshot;
pub mod sources;
pub mod synthetic;
pub mod time_manager;
pub mod types;
pub mod ws;

pub use account::{AccountManager, AccountSnapshot};
pub use config::{ExchangeConfig, ReplayConfig};
pub use error::{ExchangeError, ExchangeResult};
pub use events::{EventBus, ExchangeEvent, OrderUpdate, OrderUpdateKind};
pub use exchange::VirtualExchange;
pub use market_data::{Kline, MarketDataManager, Ticker24hr};
pub use matching::{DepthSnapshot, MatchingEngine, OrderLookup, OrderRequest};
pub use order_book::OrderBook;
pub use replay::{Bar, DataPoint, ReplayController, ReplayMode, ReplaySource, ReplayStatus};
pub use time_manager::{TimeManager, TimeMode};
pub use types::{
    Balance, Order, OrderId, OrderStatus, OrderType, PriceMatch, SelfTradePrevention, Side,
    SymbolSpec, TimeInForce, Trade, TradeId,
};
