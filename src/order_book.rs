//! Per-symbol order book: bid/ask ladders with price-time priority.
//!
//! Each ladder is a price-keyed `BTreeMap`; each level is a FIFO of resting
//! entries. The book never exposes an empty price level, and every mutation
//! bumps `last_update_id` so depth snapshots can be sequenced against diff
//! streams.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{Order, OrderId, SelfTradePrevention, Side};

/// One resting order in a price level queue.
#[derive(Clone, Debug)]
pub struct BookEntry {
    pub order_id: OrderId,
    pub user_id: String,
    pub remaining: Decimal,
}

type Ladder = BTreeMap<Decimal, VecDeque<BookEntry>>;

/// One side's aggregated depth level: `(price, total remaining quantity)`.
pub type DepthLevel = (Decimal, Decimal);

#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    bids: Ladder,
    asks: Ladder,
    /// Order id -> (side, price) for O(log P) cancellation.
    index: HashMap<OrderId, (Side, Decimal)>,
    last_update_id: u64,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            last_update_id: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Sequence number of the latest mutation.
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    fn ladder(&self, side: Side) -> &Ladder {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn ladder_mut(&mut self, side: Side) -> &mut Ladder {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Rest a limit order at the back of its price level's queue.
    pub fn insert(&mut self, order: &Order) -> ExchangeResult<()> {
        let price = order.price.ok_or_else(|| {
            ExchangeError::InvalidParam("resting order must have a price".into())
        })?;
        let entry = BookEntry {
            order_id: order.order_id,
            user_id: order.user_id.clone(),
            remaining: order.remaining(),
        };
        self.ladder_mut(order.side)
            .entry(price)
            .or_default()
            .push_back(entry);
        self.index.insert(order.order_id, (order.side, price));
        self.last_update_id += 1;
        Ok(())
    }

    /// Remove a resting order. Returns the removed entry, or `None` if the
    /// order is not on the book.
    pub fn remove(&mut self, order_id: OrderId) -> Option<BookEntry> {
        let (side, price) = self.index.remove(&order_id)?;
        let ladder = self.ladder_mut(side);
        let queue = ladder.get_mut(&price)?;
        let pos = queue.iter().position(|e| e.order_id == order_id)?;
        let entry = queue.remove(pos);
        if queue.is_empty() {
            ladder.remove(&price);
        }
        self.last_update_id += 1;
        entry
    }

    /// Best price on a side: highest bid / lowest ask.
    pub fn best_price(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Buy => self.bids.keys().next_back().copied(),
            Side::Sell => self.asks.keys().next().copied(),
        }
    }

    /// Price and front-of-queue entry at the best level of a side.
    pub fn front(&self, side: Side) -> Option<(Decimal, BookEntry)> {
        let price = self.best_price(side)?;
        let entry = self.ladder(side).get(&price)?.front()?.clone();
        Some((price, entry))
    }

    /// Reduce the front entry at the best level of `side` by `qty`; pops the
    /// entry when exhausted and drops the level when empty. Caller guarantees
    /// `qty` does not exceed the entry's remaining quantity.
    pub fn reduce_front(&mut self, side: Side, qty: Decimal) {
        let Some(price) = self.best_price(side) else {
            return;
        };
        let mut popped = None;
        let ladder = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let Some(queue) = ladder.get_mut(&price) else {
            return;
        };
        if let Some(front) = queue.front_mut() {
            front.remaining -= qty;
            if front.remaining <= Decimal::ZERO {
                popped = queue.pop_front().map(|e| e.order_id);
            }
        }
        if queue.is_empty() {
            ladder.remove(&price);
        }
        if let Some(order_id) = popped {
            self.index.remove(&order_id);
        }
        self.last_update_id += 1;
    }

    /// Quantity fillable by a taker on `taker_side` up to `price_limit`
    /// (`None` = market), honoring the taker's self-trade prevention mode.
    /// Walks levels best-first, FIFO within each level, exactly as the
    /// matching loop would.
    pub fn simulate_available(
        &self,
        taker_side: Side,
        price_limit: Option<Decimal>,
        user_id: &str,
        stp: SelfTradePrevention,
    ) -> Decimal {
        let mut total = Decimal::ZERO;
        let opposite = taker_side.opposite();
        let levels: Vec<(&Decimal, &VecDeque<BookEntry>)> = match opposite {
            Side::Sell => self.asks.iter().collect(),
            Side::Buy => self.bids.iter().rev().collect(),
        };
        for (price, queue) in levels {
            if let Some(limit) = price_limit {
                let crossed = match taker_side {
                    Side::Buy => *price <= limit,
                    Side::Sell => *price >= limit,
                };
                if !crossed {
                    break;
                }
            }
            for entry in queue {
                if entry.user_id == user_id {
                    match stp {
                        SelfTradePrevention::None => total += entry.remaining,
                        SelfTradePrevention::ExpireMaker => {}
                        SelfTradePrevention::ExpireTaker | SelfTradePrevention::ExpireBoth => {
                            return total
                        }
                    }
                } else {
                    total += entry.remaining;
                }
            }
        }
        total
    }

    /// Aggregated depth: bids descending, asks ascending, at most `limit`
    /// levels per side. Each level sums the remaining quantity of its queue.
    pub fn depth(&self, limit: usize) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        let sum = |queue: &VecDeque<BookEntry>| queue.iter().map(|e| e.remaining).sum();
        let bids = self
            .bids
            .iter()
            .rev()
            .take(limit)
            .map(|(p, q)| (*p, sum(q)))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(limit)
            .map(|(p, q)| (*p, sum(q)))
            .collect();
        (bids, asks)
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.index.contains_key(&order_id)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}
