//! Matching engine: authoritative owner of order lifecycles for all symbols.
//!
//! Every submission, cancellation, and query goes through [`MatchingEngine`].
//! A submission validates against the symbol filters, resolves price-match
//! modes, reserves funds, runs the price-time-priority loop (with self-trade
//! prevention), and disposes the remainder by type and time-in-force. The
//! engine never touches balance fields directly — all movement happens via
//! [`AccountManager`] reserve/release/settle calls.
//!
//! Each symbol's state (book, live orders, archive, parked stops) sits behind
//! its own lock, held for the duration of one submit/cancel. Events are
//! collected during the operation and published after the lock drops, so
//! subscriber callbacks can never deadlock the engine.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::account::AccountManager;
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, ExchangeResult};
use crate::events::{EventBus, ExchangeEvent, OrderUpdate, OrderUpdateKind};
use crate::market_data::MarketDataManager;
use crate::order_book::{DepthLevel, OrderBook};
use crate::time_manager::TimeManager;
use crate::types::{
    Order, OrderId, OrderStatus, OrderType, PriceMatch, SelfTradePrevention, Side, SymbolSpec,
    TimeInForce, Trade, TradeId,
};

/// Submission request; the engine assigns id, timestamps, and status.
#[derive(Clone, Debug, Default)]
pub struct OrderRequest {
    pub user_id: String,
    pub symbol: String,
    pub side: Option<Side>,
    pub order_type: Option<OrderType>,
    pub time_in_force: Option<TimeInForce>,
    pub quantity: Option<Decimal>,
    pub quote_order_qty: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub client_order_id: Option<String>,
    pub self_trade_prevention: Option<SelfTradePrevention>,
    pub price_match: Option<PriceMatch>,
}

/// Order reference for cancel/query.
#[derive(Clone, Debug)]
pub enum OrderLookup {
    ById(OrderId),
    ByClientId(String),
}

/// Depth snapshot with its book sequence number.
#[derive(Clone, Debug, serde::Serialize)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// Funds currently locked on behalf of one live order.
#[derive(Clone, Debug)]
struct Reservation {
    asset: String,
    amount: Decimal,
}

struct SymbolState {
    spec: SymbolSpec,
    book: OrderBook,
    /// Open orders: resting on the book or parked stops.
    live: HashMap<OrderId, Order>,
    /// Completed orders, retained per the archive policy.
    archive: HashMap<OrderId, Order>,
    /// Submission order of every accepted order, for `all_orders`.
    history: Vec<OrderId>,
    /// Active (user, client id) pairs; entries leave when the order completes.
    client_ids: HashMap<(String, String), OrderId>,
    /// Parked stop/take-profit orders waiting on their trigger price.
    parked: Vec<OrderId>,
    reservations: HashMap<OrderId, Reservation>,
    trades: Vec<Trade>,
    next_trade_id: u64,
    last_trade_price: Option<Decimal>,
}

impl SymbolState {
    fn new(spec: SymbolSpec) -> Self {
        let symbol = spec.symbol.clone();
        Self {
            spec,
            book: OrderBook::new(symbol),
            live: HashMap::new(),
            archive: HashMap::new(),
            history: Vec::new(),
            client_ids: HashMap::new(),
            parked: Vec::new(),
            reservations: HashMap::new(),
            trades: Vec::new(),
            next_trade_id: 1,
            last_trade_price: None,
        }
    }

    fn find_order_id(&self, user_id: &str, lookup: &OrderLookup) -> Option<OrderId> {
        match lookup {
            OrderLookup::ById(id) => Some(*id),
            OrderLookup::ByClientId(cid) => {
                let key = (user_id.to_string(), cid.clone());
                self.client_ids.get(&key).copied().or_else(|| {
                    // Completed orders are still queryable by client id.
                    self.archive
                        .values()
                        .chain(self.live.values())
                        .find(|o| {
                            o.user_id == user_id && o.client_order_id.as_deref() == Some(cid)
                        })
                        .map(|o| o.order_id)
                })
            }
        }
    }

    /// Move a terminal order out of the live set.
    fn archive_order(&mut self, order: Order) {
        if let Some(cid) = &order.client_order_id {
            self.client_ids
                .remove(&(order.user_id.clone(), cid.clone()));
        }
        self.parked.retain(|id| *id != order.order_id);
        self.archive.insert(order.order_id, order);
    }

    fn prune_archive(&mut self, now_ms: i64, retention_days: u32) {
        let horizon = now_ms - i64::from(retention_days) * 86_400_000;
        self.archive.retain(|_, o| o.update_time >= horizon);
        self.trades.retain(|t| t.timestamp >= horizon);
    }
}

/// Event staged during an operation, published after the symbol lock drops.
enum PendingEvent {
    Market(ExchangeEvent),
    User(String, ExchangeEvent),
}

/// Remaining budget of the matching loop: base quantity for ordinary orders,
/// quote budget for MARKET buys by `quote_order_qty`.
#[derive(Clone, Copy, Debug)]
enum MatchBudget {
    Base(Decimal),
    Quote(Decimal),
}

pub struct MatchingEngine {
    accounts: Arc<AccountManager>,
    clock: Arc<TimeManager>,
    market_data: Arc<MarketDataManager>,
    events: Arc<EventBus>,
    config: ExchangeConfig,
    symbols: RwLock<HashMap<String, Arc<Mutex<SymbolState>>>>,
}

impl MatchingEngine {
    pub fn new(
        accounts: Arc<AccountManager>,
        clock: Arc<TimeManager>,
        market_data: Arc<MarketDataManager>,
        events: Arc<EventBus>,
        config: ExchangeConfig,
    ) -> Self {
        Self {
            accounts,
            clock,
            market_data,
            events,
            config,
            symbols: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_symbol(&self, spec: SymbolSpec) -> ExchangeResult<()> {
        let mut symbols = self.symbols.write().expect("symbols lock");
        if symbols.contains_key(&spec.symbol) {
            return Err(ExchangeError::InvalidParam(format!(
                "symbol {} already registered",
                spec.symbol
            )));
        }
        info!(symbol = %spec.symbol, "symbol registered");
        symbols.insert(spec.symbol.clone(), Arc::new(Mutex::new(SymbolState::new(spec))));
        Ok(())
    }

    pub fn symbol_specs(&self) -> Vec<SymbolSpec> {
        let symbols = self.symbols.read().expect("symbols lock");
        let mut specs: Vec<SymbolSpec> = symbols
            .values()
            .map(|s| s.lock().expect("symbol lock").spec.clone())
            .collect();
        specs.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        specs
    }

    pub fn symbol_spec(&self, symbol: &str) -> Option<SymbolSpec> {
        let symbols = self.symbols.read().expect("symbols lock");
        symbols
            .get(symbol)
            .map(|s| s.lock().expect("symbol lock").spec.clone())
    }

    fn state(&self, symbol: &str) -> ExchangeResult<Arc<Mutex<SymbolState>>> {
        self.symbols
            .read()
            .expect("symbols lock")
            .get(symbol)
            .cloned()
            .ok_or(ExchangeError::UnknownSymbol)
    }

    /// Submit an order: validate, reserve, match, dispose. Returns the final
    /// order record and the trades it produced.
    pub fn submit_order(&self, request: OrderRequest) -> ExchangeResult<(Order, Vec<Trade>)> {
        let state = self.state(&request.symbol)?;
        let mut pending = Vec::new();
        let result = {
            let mut guard = state.lock().expect("symbol lock");
            self.submit_locked(&mut guard, request, &mut pending)
        };
        self.publish(pending);
        let (order, trades) = result?;
        if let Some(last) = trades.last() {
            self.run_stop_triggers(&order.symbol, last.price);
        }
        Ok((order, trades))
    }

    fn submit_locked(
        &self,
        state: &mut SymbolState,
        request: OrderRequest,
        pending: &mut Vec<PendingEvent>,
    ) -> ExchangeResult<(Order, Vec<Trade>)> {
        let now = self.clock.now_ms();
        state.prune_archive(now, self.config.archive_retention_days);

        let mut order = self.validate(state, &request, now)?;

        // Price-match overwrites the price before any reservation.
        if order.is_limit() && order.price_match != PriceMatch::None {
            let reference = match order.price_match {
                PriceMatch::Opponent => state.book.best_price(order.side.opposite()),
                PriceMatch::Queue => state.book.best_price(order.side),
                PriceMatch::None => unreachable!(),
            };
            let price = reference.ok_or(ExchangeError::NoReferencePrice)?;
            order.price = Some(price);
            self.check_price_filters(&state.spec, price)?;
            self.check_notional(&state.spec, price, order.quantity)?;
        }

        // LIMIT_MAKER must not take liquidity; rejecting before reservation
        // leaves no state to unwind.
        if order.order_type == OrderType::LimitMaker {
            let price = order.price.expect("limit maker has price");
            let crosses = state
                .book
                .best_price(order.side.opposite())
                .map(|best| match order.side {
                    Side::Buy => best <= price,
                    Side::Sell => best >= price,
                })
                .unwrap_or(false);
            if crosses {
                return Err(ExchangeError::WouldTakeLiquidity);
            }
        }

        let reservation = self.reserve_for(state, &order)?;
        state.reservations.insert(order.order_id, reservation);
        state.history.push(order.order_id);
        if let Some(cid) = &order.client_order_id {
            state
                .client_ids
                .insert((order.user_id.clone(), cid.clone()), order.order_id);
        }

        pending.push(PendingEvent::User(
            order.user_id.clone(),
            ExchangeEvent::OrderUpdate(OrderUpdate {
                order: order.clone(),
                kind: OrderUpdateKind::New,
                reason: None,
            }),
        ));

        // Stop orders are parked until the trigger price is touched.
        if order.order_type.is_stop() {
            state.live.insert(order.order_id, order.clone());
            state.parked.push(order.order_id);
            debug!(order_id = %order.order_id, "stop order parked");
            return Ok((order, Vec::new()));
        }

        let trades = self.match_and_dispose(state, &mut order, pending, now)?;
        Ok((order, trades))
    }

    /// Core of submission once funds are reserved: FOK pre-check, the match
    /// loop, and post-match disposition. Also used for triggered stops.
    fn match_and_dispose(
        &self,
        state: &mut SymbolState,
        order: &mut Order,
        pending: &mut Vec<PendingEvent>,
        now: i64,
    ) -> ExchangeResult<Vec<Trade>> {
        // FOK: simulate against the untouched book; all or nothing.
        if order.is_limit() && order.time_in_force == TimeInForce::FOK {
            let available = state.book.simulate_available(
                order.side,
                order.price,
                &order.user_id,
                order.self_trade_prevention,
            );
            if available < order.quantity {
                order.status = OrderStatus::Expired;
                order.update_time = now;
                self.finish_terminal(
                    state,
                    order,
                    pending,
                    Some((OrderUpdateKind::Expired, None)),
                );
                return Ok(Vec::new());
            }
        }

        // LIMIT_MAKER passed its cross check at validation; it only rests.
        if order.order_type == OrderType::LimitMaker {
            state.book.insert(order)?;
            state.live.insert(order.order_id, order.clone());
            self.push_depth_event(state, pending, now);
            return Ok(Vec::new());
        }

        let trades = self.run_match_loop(state, order, pending, now)?;

        // Post-match disposition by type and time-in-force.
        if order.status != OrderStatus::ExpiredInMatch {
            if order.is_market() {
                let done = if order.quote_order_qty.is_some() {
                    order.status == OrderStatus::Filled
                } else {
                    order.remaining().is_zero()
                };
                if !done {
                    // Liquidity ran out.
                    order.status = OrderStatus::Expired;
                    order.update_time = now;
                }
            } else if order.remaining() > Decimal::ZERO {
                match order.time_in_force {
                    TimeInForce::GTC => {
                        order.update_time = now;
                        state.book.insert(order)?;
                        state.live.insert(order.order_id, order.clone());
                    }
                    TimeInForce::IOC => {
                        order.status = OrderStatus::Canceled;
                        order.update_time = now;
                    }
                    // FOK that passed the pre-check always fills in full.
                    TimeInForce::FOK => {}
                }
            }
        }

        if order.status.is_terminal() {
            // A fully filled taker already announced FILLED with its last
            // fill; other terminal statuses get their own update.
            let emit = match order.status {
                OrderStatus::Canceled => Some((OrderUpdateKind::Canceled, None)),
                OrderStatus::Expired => Some((OrderUpdateKind::Expired, None)),
                OrderStatus::ExpiredInMatch => Some((
                    OrderUpdateKind::ExpiredInMatch,
                    Some("STP triggered".to_string()),
                )),
                _ => None,
            };
            self.finish_terminal(state, order, pending, emit);
        }

        self.push_depth_event(state, pending, now);
        Ok(trades)
    }

    /// Price-time-priority loop. Trades execute at the resting (maker) price.
    fn run_match_loop(
        &self,
        state: &mut SymbolState,
        order: &mut Order,
        pending: &mut Vec<PendingEvent>,
        now: i64,
    ) -> ExchangeResult<Vec<Trade>> {
        let mut trades = Vec::new();
        let mut budget = match (order.is_market(), order.quote_order_qty) {
            (true, Some(quote)) => MatchBudget::Quote(quote),
            _ => MatchBudget::Base(order.remaining()),
        };
        let opposite = order.side.opposite();

        loop {
            let exhausted = match budget {
                MatchBudget::Base(r) => r <= Decimal::ZERO,
                MatchBudget::Quote(q) => q <= Decimal::ZERO,
            };
            if exhausted {
                break;
            }
            let Some((level_price, entry)) = state.book.front(opposite) else {
                break;
            };
            if order.is_limit() {
                let limit = order.price.expect("limit order has price");
                let crossed = match order.side {
                    Side::Buy => level_price <= limit,
                    Side::Sell => level_price >= limit,
                };
                if !crossed {
                    break;
                }
            }

            // Self-trade prevention.
            if entry.user_id == order.user_id
                && order.self_trade_prevention != SelfTradePrevention::None
            {
                match order.self_trade_prevention {
                    SelfTradePrevention::ExpireTaker => {
                        self.expire_in_match_taker(order, now);
                        break;
                    }
                    SelfTradePrevention::ExpireMaker => {
                        self.expire_in_match_maker(state, entry.order_id, pending, now)?;
                        continue;
                    }
                    SelfTradePrevention::ExpireBoth => {
                        self.expire_in_match_maker(state, entry.order_id, pending, now)?;
                        self.expire_in_match_taker(order, now);
                        break;
                    }
                    SelfTradePrevention::None => unreachable!(),
                }
            }

            let mut trade_qty = match budget {
                MatchBudget::Base(r) => r.min(entry.remaining),
                MatchBudget::Quote(q) => {
                    let affordable = floor_to_step(q / level_price, state.spec.lot_filter.step);
                    affordable.min(entry.remaining)
                }
            };
            // A buyer never settles beyond what is actually locked: the
            // slippage-buffered reservation of a MARKET-by-base buy is an
            // estimate, not a guarantee, and a thin book can walk past it.
            if order.side == Side::Buy {
                let locked = state
                    .reservations
                    .get(&order.order_id)
                    .map(|r| r.amount)
                    .unwrap_or(Decimal::ZERO);
                let affordable = floor_to_step(locked / level_price, state.spec.lot_filter.step);
                trade_qty = trade_qty.min(affordable);
            }
            if trade_qty <= Decimal::ZERO {
                // Budget (or locked funds) too small for one lot step here.
                if matches!(budget, MatchBudget::Quote(_)) {
                    order.status = if order.filled_quantity > Decimal::ZERO {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::Expired
                    };
                }
                break;
            }

            let trade =
                self.execute_fill(state, order, entry.order_id, level_price, trade_qty, now)?;
            state.book.reduce_front(opposite, trade_qty);

            budget = match budget {
                MatchBudget::Base(r) => MatchBudget::Base(r - trade_qty),
                MatchBudget::Quote(q) => {
                    let q = q - trade_qty * level_price;
                    if floor_to_step(q / level_price, state.spec.lot_filter.step)
                        <= Decimal::ZERO
                    {
                        // Budget spent: a quote-qty market order ends Filled.
                        order.status = OrderStatus::Filled;
                    }
                    MatchBudget::Quote(q)
                }
            };

            self.stage_fill_events(state, order, &trade, pending);

            // A fully filled maker leaves the live set for the archive; its
            // reservation is exactly consumed by now.
            let maker_id = if trade.maker_side == Side::Buy {
                trade.buy_order_id
            } else {
                trade.sell_order_id
            };
            let maker_filled = state
                .live
                .get(&maker_id)
                .map(|m| m.status == OrderStatus::Filled)
                .unwrap_or(false);
            if maker_filled {
                let maker = state.live.remove(&maker_id).expect("checked above");
                if let Err(e) = self.release_reservation(state, maker_id, &maker.user_id) {
                    warn!(order_id = %maker_id, error = %e, "maker residual release failed");
                }
                state.archive_order(maker);
            }
            trades.push(trade);
        }
        Ok(trades)
    }

    /// Settle one fill: balances, order records, trade log, market data.
    fn execute_fill(
        &self,
        state: &mut SymbolState,
        taker: &mut Order,
        maker_id: OrderId,
        price: Decimal,
        qty: Decimal,
        now: i64,
    ) -> ExchangeResult<Trade> {
        let maker = state
            .live
            .get_mut(&maker_id)
            .ok_or_else(|| ExchangeError::Internal("maker missing from live set".into()))?;
        let maker_side = maker.side;

        let (buy_order_id, sell_order_id, buy_user, sell_user) = match taker.side {
            Side::Buy => (
                taker.order_id,
                maker.order_id,
                taker.user_id.clone(),
                maker.user_id.clone(),
            ),
            Side::Sell => (
                maker.order_id,
                taker.order_id,
                maker.user_id.clone(),
                taker.user_id.clone(),
            ),
        };
        // Maker rate applies to the resting side, taker rate to the incoming.
        let (buyer_rate, seller_rate) = match maker_side {
            Side::Buy => (
                self.accounts.maker_commission(),
                self.accounts.taker_commission(),
            ),
            Side::Sell => (
                self.accounts.taker_commission(),
                self.accounts.maker_commission(),
            ),
        };

        let (buyer_commission, seller_commission) = self.accounts.settle_fill(
            &buy_user,
            &sell_user,
            &state.spec.base_asset,
            &state.spec.quote_asset,
            price,
            qty,
            buyer_rate,
            seller_rate,
        )?;

        maker.fill(qty, price, now);
        taker.fill(qty, price, now);

        // Reservation bookkeeping. The buyer's lock shrinks by the settled
        // quote plus any price improvement over their limit; the seller's by
        // the base quantity.
        let buy_is_taker = taker.side == Side::Buy;
        let buyer_limit = if buy_is_taker { taker.price } else { Some(price) };
        self.consume_buyer_reservation(
            state,
            buy_order_id,
            &buy_user,
            price,
            qty,
            buyer_limit,
            buy_is_taker && taker.is_limit(),
        )?;
        if let Some(res) = state.reservations.get_mut(&sell_order_id) {
            res.amount -= qty;
        }

        let trade = Trade {
            trade_id: TradeId(state.next_trade_id),
            symbol: state.spec.symbol.clone(),
            price,
            quantity: qty,
            quote_quantity: price * qty,
            timestamp: now,
            buy_order_id,
            sell_order_id,
            buy_user_id: buy_user,
            sell_user_id: sell_user,
            maker_side,
            buyer_commission,
            seller_commission,
        };
        state.next_trade_id += 1;
        state.last_trade_price = Some(price);
        state.trades.push(trade.clone());
        self.market_data.record_trade(&trade);
        Ok(trade)
    }

    /// Reduce the buyer's quote reservation after a settle, releasing the
    /// price-improvement surplus for limit buys filled below their limit.
    #[allow(clippy::too_many_arguments)]
    fn consume_buyer_reservation(
        &self,
        state: &mut SymbolState,
        buy_order_id: OrderId,
        buy_user: &str,
        price: Decimal,
        qty: Decimal,
        buyer_limit: Option<Decimal>,
        release_improvement: bool,
    ) -> ExchangeResult<()> {
        let Some(res) = state.reservations.get_mut(&buy_order_id) else {
            return Ok(());
        };
        res.amount -= price * qty;
        if release_improvement {
            if let Some(limit) = buyer_limit {
                let improvement = (limit - price) * qty;
                if improvement > Decimal::ZERO {
                    res.amount -= improvement;
                    let asset = res.asset.clone();
                    self.accounts.release(buy_user, &asset, improvement)?;
                }
            }
        }
        Ok(())
    }

    fn stage_fill_events(
        &self,
        state: &SymbolState,
        taker: &Order,
        trade: &Trade,
        pending: &mut Vec<PendingEvent>,
    ) {
        pending.push(PendingEvent::Market(ExchangeEvent::Trade(trade.clone())));
        let maker_id = if trade.maker_side == Side::Buy {
            trade.buy_order_id
        } else {
            trade.sell_order_id
        };
        if let Some(maker) = state.live.get(&maker_id) {
            pending.push(PendingEvent::User(
                maker.user_id.clone(),
                ExchangeEvent::OrderUpdate(OrderUpdate {
                    order: maker.clone(),
                    kind: OrderUpdateKind::Trade,
                    reason: None,
                }),
            ));
        }
        pending.push(PendingEvent::User(
            taker.user_id.clone(),
            ExchangeEvent::OrderUpdate(OrderUpdate {
                order: taker.clone(),
                kind: OrderUpdateKind::Trade,
                reason: None,
            }),
        ));
        for user in [&trade.buy_user_id, &trade.sell_user_id] {
            if let Ok(snapshot) = self.accounts.snapshot(user, trade.timestamp) {
                pending.push(PendingEvent::User(
                    user.clone(),
                    ExchangeEvent::AccountUpdate {
                        user_id: user.clone(),
                        event_time: trade.timestamp,
                        balances: snapshot.balances,
                    },
                ));
            }
        }
    }

    fn expire_in_match_taker(&self, order: &mut Order, now: i64) {
        order.status = OrderStatus::ExpiredInMatch;
        order.update_time = now;
    }

    fn expire_in_match_maker(
        &self,
        state: &mut SymbolState,
        maker_id: OrderId,
        pending: &mut Vec<PendingEvent>,
        now: i64,
    ) -> ExchangeResult<()> {
        state.book.remove(maker_id);
        let Some(mut maker) = state.live.remove(&maker_id) else {
            return Ok(());
        };
        maker.status = OrderStatus::ExpiredInMatch;
        maker.update_time = now;
        self.release_reservation(state, maker_id, &maker.user_id)?;
        pending.push(PendingEvent::User(
            maker.user_id.clone(),
            ExchangeEvent::OrderUpdate(OrderUpdate {
                order: maker.clone(),
                kind: OrderUpdateKind::ExpiredInMatch,
                reason: Some("STP triggered".to_string()),
            }),
        ));
        warn!(order_id = %maker_id, "maker expired by self-trade prevention");
        state.archive_order(maker);
        Ok(())
    }

    /// Archive a terminal order, release its residual reservation, and stage
    /// the terminal order update (when one is still owed).
    fn finish_terminal(
        &self,
        state: &mut SymbolState,
        order: &Order,
        pending: &mut Vec<PendingEvent>,
        emit: Option<(OrderUpdateKind, Option<String>)>,
    ) {
        if let Err(e) = self.release_reservation(state, order.order_id, &order.user_id) {
            warn!(order_id = %order.order_id, error = %e, "residual release failed");
        }
        state.live.remove(&order.order_id);
        if let Some((kind, reason)) = emit {
            pending.push(PendingEvent::User(
                order.user_id.clone(),
                ExchangeEvent::OrderUpdate(OrderUpdate {
                    order: order.clone(),
                    kind,
                    reason,
                }),
            ));
        }
        state.archive_order(order.clone());
    }

    /// Release whatever remains of an order's reservation and drop it.
    fn release_reservation(
        &self,
        state: &mut SymbolState,
        order_id: OrderId,
        user_id: &str,
    ) -> ExchangeResult<()> {
        if let Some(res) = state.reservations.remove(&order_id) {
            if res.amount > Decimal::ZERO {
                self.accounts.release(user_id, &res.asset, res.amount)?;
            }
        }
        Ok(())
    }

    fn push_depth_event(&self, state: &SymbolState, pending: &mut Vec<PendingEvent>, now: i64) {
        let (bids, asks) = state.book.depth(self.config.depth_default_limit);
        let final_update_id = state.book.last_update_id();
        pending.push(PendingEvent::Market(ExchangeEvent::Depth {
            symbol: state.spec.symbol.clone(),
            event_time: now,
            first_update_id: final_update_id,
            final_update_id,
            bids,
            asks,
        }));
    }

    fn publish(&self, pending: Vec<PendingEvent>) {
        for event in pending {
            match event {
                PendingEvent::Market(e) => self.events.publish_market(e),
                PendingEvent::User(user, e) => self.events.publish_user(&user, e),
            }
        }
    }

    // --- validation -------------------------------------------------------

    fn validate(
        &self,
        state: &SymbolState,
        request: &OrderRequest,
        now: i64,
    ) -> ExchangeResult<Order> {
        let side = request
            .side
            .ok_or_else(|| ExchangeError::InvalidParam("side is required".into()))?;
        let order_type = request
            .order_type
            .ok_or_else(|| ExchangeError::InvalidParam("type is required".into()))?;
        if request.user_id.is_empty() {
            return Err(ExchangeError::UnknownAccount);
        }

        let by_quote = order_type == OrderType::Market
            && side == Side::Buy
            && request.quote_order_qty.is_some();
        let quantity = match (request.quantity, by_quote) {
            (Some(q), _) => {
                if q <= Decimal::ZERO {
                    return Err(ExchangeError::FilterFailure(
                        "quantity must be positive".into(),
                    ));
                }
                self.check_lot_filters(&state.spec, q)?;
                q
            }
            (None, true) => Decimal::ZERO,
            (None, false) => {
                return Err(ExchangeError::InvalidParam("quantity is required".into()))
            }
        };
        if by_quote {
            let quote = request.quote_order_qty.expect("checked");
            if quote <= Decimal::ZERO {
                return Err(ExchangeError::FilterFailure(
                    "quoteOrderQty must be positive".into(),
                ));
            }
        }

        let price_match = request.price_match.unwrap_or_default();
        let price = match (order_type.has_limit_price(), request.price) {
            (true, Some(p)) => {
                self.check_price_filters(&state.spec, p)?;
                self.check_notional(&state.spec, p, quantity)?;
                Some(p)
            }
            (true, None) if price_match != PriceMatch::None => None,
            (true, None) => {
                return Err(ExchangeError::InvalidParam(
                    "price is required for limit orders".into(),
                ))
            }
            (false, _) => None,
        };

        let stop_price = if order_type.is_stop() {
            let sp = request.stop_price.ok_or_else(|| {
                ExchangeError::InvalidParam("stopPrice is required for stop orders".into())
            })?;
            if sp <= Decimal::ZERO {
                return Err(ExchangeError::FilterFailure(
                    "stopPrice must be positive".into(),
                ));
            }
            self.check_price_filters(&state.spec, sp)?;
            Some(sp)
        } else {
            None
        };

        if let Some(cid) = &request.client_order_id {
            let key = (request.user_id.clone(), cid.clone());
            if state.client_ids.contains_key(&key) {
                return Err(ExchangeError::DuplicateClientOrderId);
            }
        }

        Ok(Order {
            order_id: OrderId::new(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            user_id: request.user_id.clone(),
            side,
            order_type,
            time_in_force: request.time_in_force.unwrap_or_default(),
            price,
            stop_price,
            quote_order_qty: if by_quote { request.quote_order_qty } else { None },
            quantity,
            filled_quantity: Decimal::ZERO,
            filled_quote_quantity: Decimal::ZERO,
            status: OrderStatus::New,
            self_trade_prevention: request.self_trade_prevention.unwrap_or_default(),
            price_match,
            timestamp: now,
            update_time: now,
        })
    }

    fn check_price_filters(&self, spec: &SymbolSpec, price: Decimal) -> ExchangeResult<()> {
        let f = &spec.price_filter;
        if price <= Decimal::ZERO {
            return Err(ExchangeError::FilterFailure("price must be positive".into()));
        }
        if price < f.min || price > f.max {
            return Err(ExchangeError::FilterFailure(format!(
                "price {price} outside [{}, {}]",
                f.min, f.max
            )));
        }
        if !f.tick.is_zero() && !(price % f.tick).is_zero() {
            return Err(ExchangeError::FilterFailure(format!(
                "price {price} not a multiple of tick {}",
                f.tick
            )));
        }
        Ok(())
    }

    fn check_lot_filters(&self, spec: &SymbolSpec, qty: Decimal) -> ExchangeResult<()> {
        let f = &spec.lot_filter;
        if qty < f.min || qty > f.max {
            return Err(ExchangeError::FilterFailure(format!(
                "quantity {qty} outside [{}, {}]",
                f.min, f.max
            )));
        }
        if !f.step.is_zero() && !(qty % f.step).is_zero() {
            return Err(ExchangeError::FilterFailure(format!(
                "quantity {qty} not a multiple of step {}",
                f.step
            )));
        }
        Ok(())
    }

    fn check_notional(
        &self,
        spec: &SymbolSpec,
        price: Decimal,
        qty: Decimal,
    ) -> ExchangeResult<()> {
        if price * qty < spec.min_notional {
            return Err(ExchangeError::FilterFailure(format!(
                "notional {} below minimum {}",
                price * qty,
                spec.min_notional
            )));
        }
        Ok(())
    }

    // --- reservation ------------------------------------------------------

    /// Lock the funds backing an order. Sells lock the base quantity; buys
    /// lock quote — the exact notional for limits, the quote budget for
    /// MARKET-by-quote, and a slippage-buffered estimate for MARKET-by-base.
    fn reserve_for(&self, state: &SymbolState, order: &Order) -> ExchangeResult<Reservation> {
        let spec = &state.spec;
        let (asset, amount) = match order.side {
            Side::Sell => (spec.base_asset.clone(), order.quantity),
            Side::Buy => {
                let amount = if let Some(price) = order.price {
                    price * order.quantity
                } else if let Some(quote) = order.quote_order_qty {
                    quote
                } else {
                    // MARKET by base quantity: upper-bound estimate off the
                    // best ask (or the stop price for parked stop-markets).
                    let reference = state
                        .book
                        .best_price(Side::Sell)
                        .or(order.stop_price)
                        .ok_or(ExchangeError::NoReferencePrice)?;
                    reference * order.quantity * (Decimal::ONE + self.config.slippage_buffer)
                };
                (spec.quote_asset.clone(), amount)
            }
        };
        if !self.accounts.reserve(&order.user_id, &asset, amount)? {
            return Err(ExchangeError::InsufficientBalance);
        }
        Ok(Reservation { asset, amount })
    }

    // --- stop triggers ----------------------------------------------------

    /// Re-inject parked stop orders whose trigger price has been touched.
    /// Called with the latest traded (or replayed) price; loops because a
    /// triggered order's own trades can touch further stops.
    pub fn on_market_price(&self, symbol: &str, price: Decimal) {
        self.run_stop_triggers(symbol, price);
    }

    fn run_stop_triggers(&self, symbol: &str, mut price: Decimal) {
        let Ok(state) = self.state(symbol) else {
            return;
        };
        loop {
            let mut pending = Vec::new();
            let next_price = {
                let mut guard = state.lock().expect("symbol lock");
                let Some(order_id) = Self::pop_triggered(&mut guard, price) else {
                    break;
                };
                let Some(mut order) = guard.live.remove(&order_id) else {
                    continue;
                };
                let now = self.clock.now_ms();
                order.order_type = order.order_type.triggered_type();
                order.update_time = now;
                info!(order_id = %order_id, symbol, trigger_price = %price, "stop order triggered");
                match self.match_and_dispose(&mut guard, &mut order, &mut pending, now) {
                    Ok(trades) => trades.last().map(|t| t.price),
                    Err(e) => {
                        warn!(order_id = %order_id, error = %e, "triggered stop failed");
                        None
                    }
                }
            };
            self.publish(pending);
            if let Some(p) = next_price {
                price = p;
            }
        }
    }

    fn pop_triggered(state: &mut SymbolState, price: Decimal) -> Option<OrderId> {
        let position = state.parked.iter().position(|id| {
            state
                .live
                .get(id)
                .map(|o| Self::stop_triggered(o, price))
                .unwrap_or(false)
        })?;
        Some(state.parked.remove(position))
    }

    fn stop_triggered(order: &Order, price: Decimal) -> bool {
        let Some(stop) = order.stop_price else {
            return false;
        };
        match (order.order_type, order.side) {
            (OrderType::StopLoss | OrderType::StopLossLimit, Side::Buy) => price >= stop,
            (OrderType::StopLoss | OrderType::StopLossLimit, Side::Sell) => price <= stop,
            (OrderType::TakeProfit | OrderType::TakeProfitLimit, Side::Buy) => price <= stop,
            (OrderType::TakeProfit | OrderType::TakeProfitLimit, Side::Sell) => price >= stop,
            _ => false,
        }
    }

    // --- cancel and queries ----------------------------------------------

    pub fn cancel_order(
        &self,
        user_id: &str,
        symbol: &str,
        lookup: OrderLookup,
    ) -> ExchangeResult<Order> {
        let state = self.state(symbol)?;
        let mut pending = Vec::new();
        let result = {
            let mut guard = state.lock().expect("symbol lock");
            let order_id = guard
                .find_order_id(user_id, &lookup)
                .ok_or(ExchangeError::UnknownOrder)?;
            let Some(order) = guard.live.get(&order_id) else {
                // Terminal orders cannot be cancelled.
                return Err(ExchangeError::UnknownOrder);
            };
            if order.user_id != user_id {
                return Err(ExchangeError::Unauthorized);
            }
            let mut order = guard.live.remove(&order_id).expect("checked above");
            guard.book.remove(order_id);
            order.status = OrderStatus::Canceled;
            let now = self.clock.now_ms();
            order.update_time = now;
            self.finish_terminal(
                &mut guard,
                &order,
                &mut pending,
                Some((OrderUpdateKind::Canceled, None)),
            );
            self.push_depth_event(&guard, &mut pending, now);
            Ok(order)
        };
        self.publish(pending);
        result
    }

    /// Look up an order across the live set and the archive.
    pub fn query_order(
        &self,
        user_id: &str,
        symbol: &str,
        lookup: OrderLookup,
    ) -> ExchangeResult<Order> {
        let state = self.state(symbol)?;
        let guard = state.lock().expect("symbol lock");
        let order_id = guard
            .find_order_id(user_id, &lookup)
            .ok_or(ExchangeError::UnknownOrder)?;
        let order = guard
            .live
            .get(&order_id)
            .or_else(|| guard.archive.get(&order_id))
            .ok_or(ExchangeError::UnknownOrder)?;
        if order.user_id != user_id {
            return Err(ExchangeError::UnknownOrder);
        }
        Ok(order.clone())
    }

    pub fn open_orders(&self, user_id: &str, symbol: Option<&str>) -> Vec<Order> {
        let states: Vec<Arc<Mutex<SymbolState>>> = {
            let symbols = self.symbols.read().expect("symbols lock");
            match symbol {
                Some(s) => symbols.get(s).cloned().into_iter().collect(),
                None => symbols.values().cloned().collect(),
            }
        };
        let mut orders = Vec::new();
        for state in states {
            let guard = state.lock().expect("symbol lock");
            orders.extend(
                guard
                    .live
                    .values()
                    .filter(|o| o.user_id == user_id)
                    .cloned(),
            );
        }
        orders.sort_by_key(|o| o.timestamp);
        orders
    }

    /// Historical orders for one user and symbol, oldest first.
    pub fn all_orders(
        &self,
        user_id: &str,
        symbol: &str,
        from_id: Option<OrderId>,
        start: Option<i64>,
        end: Option<i64>,
        limit: usize,
    ) -> ExchangeResult<Vec<Order>> {
        let state = self.state(symbol)?;
        let guard = state.lock().expect("symbol lock");
        let mut seen_from = from_id.is_none();
        let mut out = Vec::new();
        for id in &guard.history {
            if !seen_from {
                if Some(*id) == from_id {
                    seen_from = true;
                } else {
                    continue;
                }
            }
            let Some(order) = guard.live.get(id).or_else(|| guard.archive.get(id)) else {
                continue;
            };
            if order.user_id != user_id {
                continue;
            }
            if start.map_or(false, |s| order.timestamp < s)
                || end.map_or(false, |e| order.timestamp > e)
            {
                continue;
            }
            out.push(order.clone());
            if out.len() >= limit.min(1000) {
                break;
            }
        }
        Ok(out)
    }

    /// Trades a user participated in, oldest first.
    pub fn my_trades(
        &self,
        user_id: &str,
        symbol: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Trade>> {
        let state = self.state(symbol)?;
        let guard = state.lock().expect("symbol lock");
        let mut out: Vec<Trade> = guard
            .trades
            .iter()
            .filter(|t| t.buy_user_id == user_id || t.sell_user_id == user_id)
            .cloned()
            .collect();
        if out.len() > limit {
            out.drain(..out.len() - limit);
        }
        Ok(out)
    }

    pub fn depth(&self, symbol: &str, limit: usize) -> ExchangeResult<DepthSnapshot> {
        let state = self.state(symbol)?;
        let guard = state.lock().expect("symbol lock");
        let capped = limit.min(self.config.depth_max_limit);
        let (bids, asks) = guard.book.depth(capped);
        Ok(DepthSnapshot {
            last_update_id: guard.book.last_update_id(),
            bids,
            asks,
        })
    }

    pub fn last_trade_price(&self, symbol: &str) -> ExchangeResult<Option<Decimal>> {
        let state = self.state(symbol)?;
        let guard = state.lock().expect("symbol lock");
        Ok(guard.last_trade_price)
    }

    /// All open orders across symbols (snapshot support).
    pub fn open_orders_snapshot(&self) -> Vec<Order> {
        let states: Vec<Arc<Mutex<SymbolState>>> = {
            let symbols = self.symbols.read().expect("symbols lock");
            symbols.values().cloned().collect()
        };
        let mut orders = Vec::new();
        for state in states {
            let guard = state.lock().expect("symbol lock");
            orders.extend(guard.live.values().cloned());
        }
        orders.sort_by_key(|o| o.timestamp);
        orders
    }
}

fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}
