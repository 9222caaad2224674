//! Core types for the virtual exchange (orders, trades, symbols, balances).
//!
//! All monetary values are [`rust_decimal::Decimal`]. Enum variants serialize
//! in Binance wire form (`SCREAMING_SNAKE_CASE`), so these types can be used
//! directly in REST/WS payloads.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned order identifier (uuid v4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Trade identifier, monotonically increasing per symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeId(pub u64);

/// Order side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side a taker on this side matches against.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Order type. Stop/take-profit variants are parked until their trigger price
/// is touched, then re-enter as the corresponding plain type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    StopLoss,
    StopLossLimit,
    TakeProfit,
    TakeProfitLimit,
    LimitMaker,
}

impl OrderType {
    pub fn is_stop(self) -> bool {
        matches!(
            self,
            OrderType::StopLoss
                | OrderType::StopLossLimit
                | OrderType::TakeProfit
                | OrderType::TakeProfitLimit
        )
    }

    /// Whether orders of this type carry a limit price.
    pub fn has_limit_price(self) -> bool {
        matches!(
            self,
            OrderType::Limit
                | OrderType::StopLossLimit
                | OrderType::TakeProfitLimit
                | OrderType::LimitMaker
        )
    }

    /// The type a parked stop order converts to once triggered.
    pub fn triggered_type(self) -> OrderType {
        match self {
            OrderType::StopLoss | OrderType::TakeProfit => OrderType::Market,
            OrderType::StopLossLimit | OrderType::TakeProfitLimit => OrderType::Limit,
            other => other,
        }
    }
}

/// Time-in-force: how long the order stays active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good-Till-Cancel: rest on book until filled or canceled.
    GTC,
    /// Immediate-or-Cancel: fill what you can immediately; cancel the rest.
    IOC,
    /// Fill-or-Kill: fill entirely immediately or not at all.
    FOK,
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::GTC
    }
}

/// Order lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    /// Expired by self-trade prevention. Distinct from Canceled on purpose:
    /// downstream consumers tell them apart.
    ExpiredInMatch,
}

impl OrderStatus {
    /// Terminal statuses are immutable except for archival.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::ExpiredInMatch
        )
    }
}

/// Self-trade prevention mode: what happens when an order would match one of
/// the same user's resting orders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelfTradePrevention {
    None,
    ExpireTaker,
    ExpireMaker,
    ExpireBoth,
}

impl Default for SelfTradePrevention {
    fn default() -> Self {
        SelfTradePrevention::None
    }
}

/// Price-match mode for limit orders priced off the current book instead of
/// an absolute price.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceMatch {
    None,
    /// Best price of the opposite side (best ask for a buy).
    Opponent,
    /// Best price of the same side.
    Queue,
}

impl Default for PriceMatch {
    fn default() -> Self {
        PriceMatch::None
    }
}

/// An order as owned by the matching engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub user_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quote_order_qty: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub filled_quote_quantity: Decimal,
    pub status: OrderStatus,
    pub self_trade_prevention: SelfTradePrevention,
    pub price_match: PriceMatch,
    /// Creation time, ms, from the exchange clock.
    pub timestamp: i64,
    pub update_time: i64,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_limit(&self) -> bool {
        matches!(self.order_type, OrderType::Limit | OrderType::LimitMaker)
    }

    pub fn is_market(&self) -> bool {
        matches!(self.order_type, OrderType::Market)
    }

    /// Apply a fill. Caller guarantees `qty <= remaining()`.
    pub fn fill(&mut self, qty: Decimal, price: Decimal, now_ms: i64) {
        self.filled_quantity += qty;
        self.filled_quote_quantity += qty * price;
        self.status = if self.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.update_time = now_ms;
    }
}

/// One executed match between a buy and a sell order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub quote_quantity: Decimal,
    pub timestamp: i64,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub buy_user_id: String,
    pub sell_user_id: String,
    /// Side of the resting (maker) order; the trade executed at its price.
    pub maker_side: Side,
    /// Commission charged to the buyer, in the base asset.
    pub buyer_commission: Decimal,
    /// Commission charged to the seller, in the quote asset.
    pub seller_commission: Decimal,
}

/// Price filter: bounds and tick granularity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PriceFilter {
    pub min: Decimal,
    pub max: Decimal,
    pub tick: Decimal,
}

/// Lot filter: quantity bounds and step granularity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LotFilter {
    pub min: Decimal,
    pub max: Decimal,
    pub step: Decimal,
}

/// Tradable symbol specification and filter rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub base_precision: u32,
    pub quote_precision: u32,
    pub price_filter: PriceFilter,
    pub lot_filter: LotFilter,
    pub min_notional: Decimal,
}

impl SymbolSpec {
    /// A permissive spec for tests and demos: 8/8 precision, wide bounds.
    pub fn with_defaults(symbol: &str, base: &str, quote: &str) -> Self {
        use rust_decimal_macros::dec;
        Self {
            symbol: symbol.to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            base_precision: 8,
            quote_precision: 8,
            price_filter: PriceFilter {
                min: dec!(0.00000001),
                max: dec!(1000000000),
                tick: dec!(0.00000001),
            },
            lot_filter: LotFilter {
                min: dec!(0.00000001),
                max: dec!(1000000000),
                step: dec!(0.00000001),
            },
            min_notional: dec!(0),
        }
    }
}

/// Per-asset balance: spendable and reservation-locked amounts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}
