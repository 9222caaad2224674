//! Property-based invariant tests: replay seeded synthetic order streams
//! into the exchange and assert the balance/book invariants hold, plus
//! deterministic-replay equality.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use virtual_exchange::config::ExchangeConfig;
use virtual_exchange::matching::OrderRequest;
use virtual_exchange::synthetic::{OrderStream, OrderStreamConfig};
use virtual_exchange::time_manager::TimeManager;
use virtual_exchange::types::{Side, SymbolSpec, Trade};
use virtual_exchange::VirtualExchange;

const NUM_USERS: u64 = 5;
const START_USDT: Decimal = dec!(1000000);
const START_BTC: Decimal = dec!(10000);

fn build_exchange() -> Arc<VirtualExchange> {
    let clock = Arc::new(TimeManager::backtest(1_000_000));
    let exchange = VirtualExchange::with_clock(ExchangeConfig::default(), clock);
    exchange
        .register_symbol(SymbolSpec::with_defaults("BTCUSDT", "BTC", "USDT"))
        .unwrap();
    for n in 1..=NUM_USERS {
        let user = format!("trader-{n}");
        exchange.register_user(&user).unwrap();
        exchange.deposit(&user, "USDT", START_USDT).unwrap();
        exchange.deposit(&user, "BTC", START_BTC).unwrap();
    }
    exchange
}

/// Run a stream; business rejections (insufficient balance etc.) are allowed.
fn replay_stream(exchange: &VirtualExchange, requests: Vec<OrderRequest>) -> Vec<Trade> {
    let mut trades = Vec::new();
    for request in requests {
        if let Ok((_, mut t)) = exchange.submit_order(request) {
            trades.append(&mut t);
        }
    }
    trades
}

fn assert_invariants(exchange: &VirtualExchange, trades: &[Trade]) {
    // 1. No negative balances, free or locked.
    for n in 1..=NUM_USERS {
        let user = format!("trader-{n}");
        for asset in ["USDT", "BTC"] {
            let balance = exchange.accounts().balance(&user, asset).unwrap();
            assert!(balance.free >= Decimal::ZERO, "{user} {asset} free");
            assert!(balance.locked >= Decimal::ZERO, "{user} {asset} locked");
        }
    }

    // 2. Book not crossed.
    let depth = exchange.market_depth("BTCUSDT", None).unwrap();
    if let (Some((bid, _)), Some((ask, _))) = (depth.bids.first(), depth.asks.first()) {
        assert!(bid < ask, "crossed book: {bid} >= {ask}");
    }

    // 5. Conservation: per asset, totals (including the fee account) equal
    // the initial deposits.
    let totals = exchange.accounts().total_balances();
    assert_eq!(totals["USDT"], START_USDT * Decimal::from(NUM_USERS));
    assert_eq!(totals["BTC"], START_BTC * Decimal::from(NUM_USERS));

    // 4. filled <= quantity on every order, and FILLED iff fully filled.
    for n in 1..=NUM_USERS {
        let user = format!("trader-{n}");
        let orders = exchange
            .all_orders(&user, "BTCUSDT", None, None, None, 1000)
            .unwrap();
        for order in orders {
            assert!(order.filled_quantity <= order.quantity, "overfill");
            if order.status == virtual_exchange::types::OrderStatus::Filled {
                assert_eq!(order.filled_quantity, order.quantity);
            }
        }
    }

    // 7. Depth totals equal the sum of open-order remainders per side.
    let mut open_by_side: HashMap<Side, Decimal> = HashMap::new();
    for n in 1..=NUM_USERS {
        let user = format!("trader-{n}");
        for order in exchange.open_orders(&user, Some("BTCUSDT")) {
            if !order.order_type.is_stop() {
                *open_by_side.entry(order.side).or_default() += order.remaining();
            }
        }
    }
    let full_depth = exchange.market_depth("BTCUSDT", Some(5000)).unwrap();
    let bid_total: Decimal = full_depth.bids.iter().map(|(_, q)| *q).sum();
    let ask_total: Decimal = full_depth.asks.iter().map(|(_, q)| *q).sum();
    assert_eq!(
        bid_total,
        open_by_side.get(&Side::Buy).copied().unwrap_or_default()
    );
    assert_eq!(
        ask_total,
        open_by_side.get(&Side::Sell).copied().unwrap_or_default()
    );

    // 6. Trade quantities/prices are positive.
    for trade in trades {
        assert!(trade.quantity > Decimal::ZERO);
        assert!(trade.price > Decimal::ZERO);
        assert_eq!(trade.quote_quantity, trade.price * trade.quantity);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After replaying any seeded stream, every balance/book invariant holds.
    #[test]
    fn invariants_hold_after_replay(seed in 0u64..100_000u64, num_orders in 10usize..120usize) {
        let config = OrderStreamConfig {
            seed,
            num_orders,
            num_users: NUM_USERS,
            ..Default::default()
        };
        let exchange = build_exchange();
        let requests = OrderStream::new(config).all_requests();
        let trades = replay_stream(&exchange, requests);
        assert_invariants(&exchange, &trades);
    }

    /// Trade ids are strictly increasing per symbol.
    #[test]
    fn trade_ids_strictly_increase(seed in 0u64..10_000u64) {
        let config = OrderStreamConfig {
            seed,
            num_orders: 80,
            num_users: NUM_USERS,
            ..Default::default()
        };
        let exchange = build_exchange();
        let trades = replay_stream(&exchange, OrderStream::new(config).all_requests());
        for pair in trades.windows(2) {
            prop_assert!(pair[0].trade_id < pair[1].trade_id);
        }
    }
}

/// Deterministic replay: same seed ⇒ identical trade sequence.
#[test]
fn deterministic_replay_same_seed_same_trades() {
    let config = OrderStreamConfig {
        seed: 999,
        num_orders: 150,
        num_users: NUM_USERS,
        ..Default::default()
    };

    let exchange1 = build_exchange();
    let trades1 = replay_stream(&exchange1, OrderStream::new(config.clone()).all_requests());
    let exchange2 = build_exchange();
    let trades2 = replay_stream(&exchange2, OrderStream::new(config).all_requests());

    assert_eq!(trades1.len(), trades2.len());
    for (a, b) in trades1.iter().zip(trades2.iter()) {
        assert_eq!(a.trade_id, b.trade_id);
        assert_eq!(a.price, b.price);
        assert_eq!(a.quantity, b.quantity);
        assert_eq!(a.buy_user_id, b.buy_user_id);
        assert_eq!(a.sell_user_id, b.sell_user_id);
        assert_eq!(a.maker_side, b.maker_side);
    }
}

/// Reserve/release round-trip leaves the account unchanged (law from the
/// account contract, checked at the exchange level).
#[test]
fn reserve_release_roundtrip_is_identity() {
    let exchange = build_exchange();
    let accounts = exchange.accounts();
    let before = accounts.balance("trader-1", "USDT").unwrap();
    assert!(accounts.reserve("trader-1", "USDT", dec!(1234.5)).unwrap());
    accounts.release("trader-1", "USDT", dec!(1234.5)).unwrap();
    let after = accounts.balance("trader-1", "USDT").unwrap();
    assert_eq!(before, after);
}
