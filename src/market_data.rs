//! Market data aggregation: last price, rolling 24h statistics, klines,
//! average price, and the bounded recent-trades ring.
//!
//! Fed from two directions: trades emitted by the matching engine, and bars
//! emitted by the replay controller. Both reduce to ticks
//! `(price, quantity, timestamp)` internally.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::{Trade, TradeId};

/// Kline intervals served by `/klines` and the kline streams.
pub const KLINE_INTERVALS: &[(&str, i64)] = &[
    ("1m", 60_000),
    ("5m", 300_000),
    ("15m", 900_000),
    ("1h", 3_600_000),
    ("4h", 14_400_000),
    ("1d", 86_400_000),
];

/// Window for `/avgPrice`, minutes. Fixed at 5: nothing configures it.
pub const AVG_PRICE_WINDOW_MINS: i64 = 5;

/// One OHLCV bar.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trade_count: u64,
}

/// 24-hour rolling statistics for `/ticker/24hr` and the ticker stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ticker24hr {
    pub symbol: String,
    pub price_change: Decimal,
    pub price_change_percent: Decimal,
    pub weighted_avg_price: Decimal,
    pub last_price: Decimal,
    pub last_qty: Decimal,
    pub open_price: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub open_time: i64,
    pub close_time: i64,
    pub trade_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct Tick {
    timestamp: i64,
    price: Decimal,
    quantity: Decimal,
}

#[derive(Debug, Default)]
struct SymbolMarket {
    recent_trades: VecDeque<Trade>,
    last_price: Option<Decimal>,
    last_qty: Decimal,
    /// Rolling tick window, pruned to 24h behind the newest tick.
    ticks: VecDeque<Tick>,
    /// interval-ms -> open-time -> kline.
    klines: HashMap<i64, BTreeMap<i64, Kline>>,
    last_trade_id: Option<TradeId>,
}

const KLINES_RETAINED_PER_INTERVAL: usize = 1000;

impl SymbolMarket {
    fn record_tick(&mut self, tick: Tick) {
        self.last_price = Some(tick.price);
        self.last_qty = tick.quantity;
        self.ticks.push_back(tick);
        let horizon = tick.timestamp - 86_400_000;
        while self
            .ticks
            .front()
            .map(|t| t.timestamp < horizon)
            .unwrap_or(false)
        {
            self.ticks.pop_front();
        }

        for &(_, interval_ms) in KLINE_INTERVALS {
            let open_time = tick.timestamp - tick.timestamp.rem_euclid(interval_ms);
            let by_open = self.klines.entry(interval_ms).or_default();
            let kline = by_open.entry(open_time).or_insert_with(|| Kline {
                open_time,
                close_time: open_time + interval_ms - 1,
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume: Decimal::ZERO,
                quote_volume: Decimal::ZERO,
                trade_count: 0,
            });
            kline.high = kline.high.max(tick.price);
            kline.low = kline.low.min(tick.price);
            kline.close = tick.price;
            kline.volume += tick.quantity;
            kline.quote_volume += tick.quantity * tick.price;
            kline.trade_count += 1;
            while by_open.len() > KLINES_RETAINED_PER_INTERVAL {
                let oldest = *by_open.keys().next().expect("non-empty");
                by_open.remove(&oldest);
            }
        }
    }
}

pub struct MarketDataManager {
    symbols: Mutex<HashMap<String, SymbolMarket>>,
    recent_trades_capacity: usize,
}

impl MarketDataManager {
    pub fn new(recent_trades_capacity: usize) -> Self {
        Self {
            symbols: Mutex::new(HashMap::new()),
            recent_trades_capacity,
        }
    }

    /// Record an executed trade: updates the ring, ticks, and klines.
    pub fn record_trade(&self, trade: &Trade) {
        let mut symbols = self.symbols.lock().expect("market lock");
        let market = symbols.entry(trade.symbol.clone()).or_default();
        market.record_tick(Tick {
            timestamp: trade.timestamp,
            price: trade.price,
            quantity: trade.quantity,
        });
        market.last_trade_id = Some(trade.trade_id);
        market.recent_trades.push_back(trade.clone());
        while market.recent_trades.len() > self.recent_trades_capacity {
            market.recent_trades.pop_front();
        }
    }

    /// Record a replayed bar as a tick at its close price.
    pub fn record_bar_tick(
        &self,
        symbol: &str,
        price: Decimal,
        volume: Decimal,
        timestamp: i64,
    ) {
        let mut symbols = self.symbols.lock().expect("market lock");
        let market = symbols.entry(symbol.to_string()).or_default();
        market.record_tick(Tick {
            timestamp,
            price,
            quantity: volume,
        });
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        let symbols = self.symbols.lock().expect("market lock");
        symbols.get(symbol).and_then(|m| m.last_price)
    }

    pub fn recent_trades(&self, symbol: &str, limit: usize) -> Vec<Trade> {
        let symbols = self.symbols.lock().expect("market lock");
        match symbols.get(symbol) {
            Some(market) => market
                .recent_trades
                .iter()
                .rev()
                .take(limit)
                .rev()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Volume-weighted average price over the last 5 minutes; falls back to
    /// the last price when the window is empty.
    pub fn avg_price(&self, symbol: &str, now_ms: i64) -> Option<Decimal> {
        let symbols = self.symbols.lock().expect("market lock");
        let market = symbols.get(symbol)?;
        let horizon = now_ms - AVG_PRICE_WINDOW_MINS * 60_000;
        let mut volume = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        for tick in market.ticks.iter().rev() {
            if tick.timestamp < horizon {
                break;
            }
            volume += tick.quantity;
            notional += tick.quantity * tick.price;
        }
        if volume.is_zero() {
            market.last_price
        } else {
            Some(notional / volume)
        }
    }

    pub fn ticker_24hr(&self, symbol: &str, now_ms: i64) -> Option<Ticker24hr> {
        let symbols = self.symbols.lock().expect("market lock");
        let market = symbols.get(symbol)?;
        let last_price = market.last_price?;
        let horizon = now_ms - 86_400_000;
        let window: Vec<&Tick> = market
            .ticks
            .iter()
            .filter(|t| t.timestamp >= horizon)
            .collect();
        if window.is_empty() {
            return Some(Ticker24hr {
                symbol: symbol.to_string(),
                price_change: Decimal::ZERO,
                price_change_percent: Decimal::ZERO,
                weighted_avg_price: last_price,
                last_price,
                last_qty: market.last_qty,
                open_price: last_price,
                high_price: last_price,
                low_price: last_price,
                volume: Decimal::ZERO,
                quote_volume: Decimal::ZERO,
                open_time: horizon,
                close_time: now_ms,
                trade_count: 0,
            });
        }
        let open_price = window.first().expect("non-empty").price;
        let mut high = open_price;
        let mut low = open_price;
        let mut volume = Decimal::ZERO;
        let mut quote_volume = Decimal::ZERO;
        for tick in &window {
            high = high.max(tick.price);
            low = low.min(tick.price);
            volume += tick.quantity;
            quote_volume += tick.quantity * tick.price;
        }
        let price_change = last_price - open_price;
        let price_change_percent = if open_price.is_zero() {
            Decimal::ZERO
        } else {
            price_change / open_price * Decimal::from(100)
        };
        let weighted_avg_price = if volume.is_zero() {
            last_price
        } else {
            quote_volume / volume
        };
        Some(Ticker24hr {
            symbol: symbol.to_string(),
            price_change,
            price_change_percent,
            weighted_avg_price,
            last_price,
            last_qty: market.last_qty,
            open_price,
            high_price: high,
            low_price: low,
            volume,
            quote_volume,
            open_time: horizon,
            close_time: now_ms,
            trade_count: window.len() as u64,
        })
    }

    /// Klines for `interval` (e.g. "1m"), oldest first, bounded by `limit`
    /// and the optional `[start, end]` open-time range (ms).
    pub fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> Vec<Kline> {
        let Some(&(_, interval_ms)) = KLINE_INTERVALS.iter().find(|(name, _)| *name == interval)
        else {
            return Vec::new();
        };
        let symbols = self.symbols.lock().expect("market lock");
        let Some(market) = symbols.get(symbol) else {
            return Vec::new();
        };
        let Some(by_open) = market.klines.get(&interval_ms) else {
            return Vec::new();
        };
        let mut out: Vec<Kline> = by_open
            .values()
            .filter(|k| start.map_or(true, |s| k.open_time >= s))
            .filter(|k| end.map_or(true, |e| k.open_time <= e))
            .cloned()
            .collect();
        if out.len() > limit {
            out.drain(..out.len() - limit);
        }
        out
    }

    pub fn symbols_with_data(&self) -> Vec<String> {
        let symbols = self.symbols.lock().expect("market lock");
        let mut names: Vec<String> = symbols.keys().cloned().collect();
        names.sort();
        names
    }
}
