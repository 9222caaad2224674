//! Deterministic synthetic data: seeded order streams and bar tapes for
//! replay tests, demos, and benchmarks. Same seed ⇒ same sequence.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::matching::OrderRequest;
use crate::replay::Bar;
use crate::types::{OrderType, Side, TimeInForce};

/// Configuration for the synthetic order generator. All ranges inclusive.
#[derive(Clone, Debug)]
pub struct OrderStreamConfig {
    /// RNG seed. Same seed ⇒ same stream.
    pub seed: u64,
    pub symbol: String,
    pub num_orders: usize,
    /// Probability of Buy (0.0..=1.0). Sell otherwise.
    pub buy_ratio: f64,
    /// Probability of a Limit order. Market otherwise.
    pub limit_ratio: f64,
    /// Price range for limit orders, whole ticks.
    pub price_min: i64,
    pub price_max: i64,
    pub quantity_min: u64,
    pub quantity_max: u64,
    /// Probability of GTC, then IOC; the rest are FOK.
    pub tif_gtc_ratio: f64,
    pub tif_ioc_ratio: f64,
    /// Users are named `trader-1..=trader-N`.
    pub num_users: u64,
}

impl Default for OrderStreamConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            symbol: "BTCUSDT".into(),
            num_orders: 1000,
            buy_ratio: 0.5,
            limit_ratio: 0.9,
            price_min: 95,
            price_max: 105,
            quantity_min: 1,
            quantity_max: 100,
            tif_gtc_ratio: 0.8,
            tif_ioc_ratio: 0.1,
            num_users: 5,
        }
    }
}

/// Deterministic order-request stream.
pub struct OrderStream {
    rng: StdRng,
    config: OrderStreamConfig,
    next_seq: u64,
}

impl OrderStream {
    pub fn new(config: OrderStreamConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            rng,
            config,
            next_seq: 1,
        }
    }

    /// Generate the next request. Advances RNG and sequence state.
    pub fn next_request(&mut self) -> OrderRequest {
        let seq = self.next_seq;
        self.next_seq += 1;
        let side = if self.rng.gen::<f64>() < self.config.buy_ratio {
            Side::Buy
        } else {
            Side::Sell
        };
        let is_limit = self.rng.gen::<f64>() < self.config.limit_ratio;
        let quantity = Decimal::from(
            self.rng
                .gen_range(self.config.quantity_min..=self.config.quantity_max),
        );
        let price = is_limit.then(|| {
            Decimal::from(
                self.rng
                    .gen_range(self.config.price_min..=self.config.price_max),
            )
        });
        let r = self.rng.gen::<f64>();
        let time_in_force = if r < self.config.tif_gtc_ratio {
            TimeInForce::GTC
        } else if r < self.config.tif_gtc_ratio + self.config.tif_ioc_ratio {
            TimeInForce::IOC
        } else {
            TimeInForce::FOK
        };
        let user = self.rng.gen_range(1..=self.config.num_users.max(1));
        OrderRequest {
            user_id: format!("trader-{user}"),
            symbol: self.config.symbol.clone(),
            side: Some(side),
            order_type: Some(if is_limit {
                OrderType::Limit
            } else {
                OrderType::Market
            }),
            time_in_force: Some(if is_limit { time_in_force } else { TimeInForce::GTC }),
            quantity: Some(quantity),
            quote_order_qty: None,
            price,
            stop_price: None,
            client_order_id: Some(format!("gen-{seq}")),
            self_trade_prevention: None,
            price_match: None,
        }
    }

    pub fn take_requests(&mut self, n: usize) -> Vec<OrderRequest> {
        (0..n).map(|_| self.next_request()).collect()
    }

    pub fn all_requests(&mut self) -> Vec<OrderRequest> {
        self.take_requests(self.config.num_orders)
    }
}

/// Deterministic random-walk bar tape for replay tests.
#[derive(Clone, Debug)]
pub struct BarTapeConfig {
    pub seed: u64,
    pub symbol: String,
    pub num_bars: usize,
    pub start_ts: i64,
    pub interval_ms: i64,
    pub start_price: i64,
    /// Maximum absolute per-bar move, whole ticks.
    pub max_move: i64,
}

impl Default for BarTapeConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            symbol: "BTCUSDT".into(),
            num_bars: 100,
            start_ts: 1_600_000_000_000,
            interval_ms: 60_000,
            start_price: 100,
            max_move: 2,
        }
    }
}

/// Generate a full tape of `(timestamp, bar)` items for a `VecSource`.
pub fn generate_bar_tape(config: &BarTapeConfig) -> Vec<(i64, Bar)> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut price = config.start_price;
    let mut out = Vec::with_capacity(config.num_bars);
    for i in 0..config.num_bars {
        let open = price;
        let step = rng.gen_range(-config.max_move..=config.max_move);
        price = (price + step).max(1);
        let close = price;
        let high = open.max(close) + rng.gen_range(0..=config.max_move);
        let low = (open.min(close) - rng.gen_range(0..=config.max_move)).max(1);
        let volume = rng.gen_range(1..=1000);
        out.push((
            config.start_ts + i as i64 * config.interval_ms,
            Bar {
                symbol: config.symbol.clone(),
                open: Decimal::from(open),
                high: Decimal::from(high),
                low: Decimal::from(low),
                close: Decimal::from(close),
                volume: Decimal::from(volume),
            },
        ));
    }
    out
}
