//! Unified exchange event model and subscriber fan-out.
//!
//! One `ExchangeEvent` enum covers order updates, trades, depth diffs,
//! klines, tickers, and account updates; the REST/WS façades map it to wire
//! shapes rather than owning parallel enums.
//!
//! Fan-out is two-tier: a bounded `tokio::sync::broadcast` channel per scope
//! (one market channel, one channel per user) for the WebSocket layer, plus
//! inline callback listeners for in-process subscribers (the replay wiring
//! and tests). Lagging broadcast receivers skip missed frames — that is the
//! drop policy for slow subscribers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::account::AssetBalance;
use crate::market_data::{Kline, Ticker24hr};
use crate::order_book::DepthLevel;
use crate::types::{Order, Trade};

/// Change type attached to an order update (the `c_t` field on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderUpdateKind {
    New,
    Trade,
    Canceled,
    Expired,
    ExpiredInMatch,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order: Order,
    pub kind: OrderUpdateKind,
    /// Human-readable cause for out-of-band expiries ("STP triggered").
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ExchangeEvent {
    OrderUpdate(OrderUpdate),
    Trade(Trade),
    Depth {
        symbol: String,
        event_time: i64,
        first_update_id: u64,
        final_update_id: u64,
        bids: Vec<DepthLevel>,
        asks: Vec<DepthLevel>,
    },
    Kline {
        symbol: String,
        event_time: i64,
        interval: String,
        kline: Kline,
    },
    Ticker {
        event_time: i64,
        ticker: Ticker24hr,
    },
    AvgPrice {
        symbol: String,
        event_time: i64,
        mins: i64,
        price: Decimal,
    },
    AccountUpdate {
        user_id: String,
        event_time: i64,
        balances: Vec<AssetBalance>,
    },
}

impl ExchangeEvent {
    /// Symbol this event concerns, when it is market-scoped.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            ExchangeEvent::OrderUpdate(u) => Some(&u.order.symbol),
            ExchangeEvent::Trade(t) => Some(&t.symbol),
            ExchangeEvent::Depth { symbol, .. }
            | ExchangeEvent::Kline { symbol, .. }
            | ExchangeEvent::AvgPrice { symbol, .. } => Some(symbol),
            ExchangeEvent::Ticker { ticker, .. } => Some(&ticker.symbol),
            ExchangeEvent::AccountUpdate { .. } => None,
        }
    }
}

type Callback = Box<dyn Fn(&ExchangeEvent) + Send + Sync>;

enum ListenerScope {
    Market { symbol: Option<String> },
    User { user_id: String },
}

struct Listener {
    scope: ListenerScope,
    callback: Callback,
}

/// Capacity of the shared market broadcast channel.
const MARKET_CHANNEL_CAPACITY: usize = 1024;
/// Capacity of each private per-user channel. Order/trade updates are the
/// only traffic here, so a smaller buffer still survives slow readers.
const USER_CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    market_tx: broadcast::Sender<ExchangeEvent>,
    user_txs: RwLock<HashMap<String, broadcast::Sender<ExchangeEvent>>>,
    listeners: RwLock<HashMap<u64, Listener>>,
    next_listener_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (market_tx, _) = broadcast::channel(MARKET_CHANNEL_CAPACITY);
        Self {
            market_tx,
            user_txs: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Broadcast receiver for all public market events.
    pub fn subscribe_market_stream(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.market_tx.subscribe()
    }

    /// Broadcast receiver for one user's private events.
    pub fn subscribe_user_stream(&self, user_id: &str) -> broadcast::Receiver<ExchangeEvent> {
        let mut user_txs = self.user_txs.write().expect("user channels lock");
        user_txs
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(USER_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Register an inline market listener; `symbol = None` receives every
    /// symbol. Returns an id for [`EventBus::unsubscribe`].
    pub fn subscribe_market(
        &self,
        symbol: Option<String>,
        callback: impl Fn(&ExchangeEvent) + Send + Sync + 'static,
    ) -> u64 {
        self.add_listener(Listener {
            scope: ListenerScope::Market { symbol },
            callback: Box::new(callback),
        })
    }

    /// Register an inline listener for one user's private events.
    pub fn subscribe_user(
        &self,
        user_id: &str,
        callback: impl Fn(&ExchangeEvent) + Send + Sync + 'static,
    ) -> u64 {
        self.add_listener(Listener {
            scope: ListenerScope::User {
                user_id: user_id.to_string(),
            },
            callback: Box::new(callback),
        })
    }

    fn add_listener(&self, listener: Listener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .expect("listeners lock")
            .insert(id, listener);
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.listeners
            .write()
            .expect("listeners lock")
            .remove(&id)
            .is_some()
    }

    /// Publish a public market event. Send failures mean no receiver is
    /// connected; that is not an error.
    pub fn publish_market(&self, event: ExchangeEvent) {
        let listeners = self.listeners.read().expect("listeners lock");
        for listener in listeners.values() {
            if let ListenerScope::Market { symbol } = &listener.scope {
                let wanted = symbol
                    .as_deref()
                    .map_or(true, |s| event.symbol() == Some(s));
                if wanted {
                    (listener.callback)(&event);
                }
            }
        }
        drop(listeners);
        if self.market_tx.send(event).is_err() {
            debug!("no market stream subscribers");
        }
    }

    /// Publish a private event to one user's stream.
    pub fn publish_user(&self, user_id: &str, event: ExchangeEvent) {
        let listeners = self.listeners.read().expect("listeners lock");
        for listener in listeners.values() {
            if let ListenerScope::User { user_id: wanted } = &listener.scope {
                if wanted == user_id {
                    (listener.callback)(&event);
                }
            }
        }
        drop(listeners);
        let user_txs = self.user_txs.read().expect("user channels lock");
        if let Some(tx) = user_txs.get(user_id) {
            let _ = tx.send(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
