//! WebSocket stream integration tests: subscribe over /ws, drive the engine,
//! and assert Binance-shaped events arrive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use tokio_tungstenite::tungstenite::Message;
use virtual_exchange::api;
use virtual_exchange::config::ExchangeConfig;
use virtual_exchange::matching::OrderRequest;
use virtual_exchange::time_manager::TimeManager;
use virtual_exchange::types::{OrderType, Side, SymbolSpec};
use virtual_exchange::VirtualExchange;

async fn spawn_app() -> (SocketAddr, Arc<VirtualExchange>) {
    let clock = Arc::new(TimeManager::backtest(1_700_000_000_000));
    let exchange = VirtualExchange::with_clock(ExchangeConfig::default(), clock);
    exchange
        .register_symbol(SymbolSpec::with_defaults("BTCUSDT", "BTC", "USDT"))
        .unwrap();
    let app = api::create_router(exchange.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, exchange)
}

fn fund(exchange: &VirtualExchange, user: &str, asset: &str, amount: rust_decimal::Decimal) {
    let _ = exchange.register_user(user);
    exchange.deposit(user, asset, amount).unwrap();
}

fn limit(user: &str, side: Side, qty: rust_decimal::Decimal, price: rust_decimal::Decimal) -> OrderRequest {
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

/// Read frames until one satisfies the predicate, with an overall deadline.
async fn wait_for_event<F>(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    predicate: F,
) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if predicate(&value) {
                return value;
            }
        }
    }
}

#[tokio::test]
async fn trade_stream_delivers_executed_trades() {
    let (addr, exchange) = spawn_app().await;
    fund(&exchange, "seller", "BTC", dec!(1));
    fund(&exchange, "buyer", "USDT", dec!(100000));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    ws.send(Message::Text(
        serde_json::json!({"method": "SUBSCRIBE", "params": ["btcusdt@trade"], "id": 1})
            .to_string(),
    ))
    .await
    .unwrap();
    let ack = wait_for_event(&mut ws, |v| v.get("id") == Some(&serde_json::json!(1))).await;
    assert_eq!(ack["result"], serde_json::Value::Null);

    exchange
        .submit_order(limit("seller", Side::Sell, dec!(1), dec!(50000)))
        .unwrap();
    exchange
        .submit_order(limit("buyer", Side::Buy, dec!(1), dec!(50000)))
        .unwrap();

    let event = wait_for_event(&mut ws, |v| v.get("e") == Some(&serde_json::json!("trade"))).await;
    assert_eq!(event["s"], "BTCUSDT");
    assert_eq!(event["p"], "50000");
    assert_eq!(event["q"], "1");
    assert_eq!(event["m"], false, "maker was the sell side");
    assert_eq!(event["E"], 1_700_000_000_000i64);
}

#[tokio::test]
async fn depth_stream_carries_update_ids() {
    let (addr, exchange) = spawn_app().await;
    fund(&exchange, "buyer", "USDT", dec!(100000));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    ws.send(Message::Text(
        serde_json::json!({"method": "SUBSCRIBE", "params": ["btcusdt@depth"], "id": 2})
            .to_string(),
    ))
    .await
    .unwrap();
    wait_for_event(&mut ws, |v| v.get("id") == Some(&serde_json::json!(2))).await;

    exchange
        .submit_order(limit("buyer", Side::Buy, dec!(2), dec!(49000)))
        .unwrap();

    let event =
        wait_for_event(&mut ws, |v| v.get("e") == Some(&serde_json::json!("depthUpdate"))).await;
    assert_eq!(event["s"], "BTCUSDT");
    let first = event["U"].as_u64().unwrap();
    let last = event["u"].as_u64().unwrap();
    assert!(first <= last);
    assert_eq!(event["b"][0], serde_json::json!(["49000", "2"]));

    // The depth snapshot endpoint sequences against the same id space.
    let depth: serde_json::Value = reqwest::get(format!(
        "http://{addr}/api/v3/depth?symbol=BTCUSDT&limit=5"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert!(depth["lastUpdateId"].as_u64().unwrap() >= last);
}

#[tokio::test]
async fn unsubscribe_stops_the_stream() {
    let (addr, exchange) = spawn_app().await;
    fund(&exchange, "buyer", "USDT", dec!(100000));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    ws.send(Message::Text(
        serde_json::json!({"method": "SUBSCRIBE", "params": ["btcusdt@depth"], "id": 1})
            .to_string(),
    ))
    .await
    .unwrap();
    wait_for_event(&mut ws, |v| v.get("id") == Some(&serde_json::json!(1))).await;
    ws.send(Message::Text(
        serde_json::json!({"method": "UNSUBSCRIBE", "params": ["btcusdt@depth"], "id": 2})
            .to_string(),
    ))
    .await
    .unwrap();
    wait_for_event(&mut ws, |v| v.get("id") == Some(&serde_json::json!(2))).await;

    exchange
        .submit_order(limit("buyer", Side::Buy, dec!(1), dec!(48000)))
        .unwrap();

    // No depth event should arrive; expect a timeout.
    let got_event = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(got_event.is_err(), "unsubscribed stream must stay silent");
}

#[tokio::test]
async fn user_stream_delivers_execution_reports() {
    let (addr, exchange) = spawn_app().await;
    fund(&exchange, "alice", "USDT", dec!(100000));
    let listen_key = exchange.create_listen_key("alice");

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/{listen_key}"))
        .await
        .expect("connect");
    // Let the server-side handler subscribe before the first event fires.
    tokio::time::sleep(Duration::from_millis(100)).await;

    exchange
        .submit_order(limit("alice", Side::Buy, dec!(1), dec!(45000)))
        .unwrap();

    let report = wait_for_event(&mut ws, |v| {
        v.get("e") == Some(&serde_json::json!("executionReport"))
    })
    .await;
    assert_eq!(report["s"], "BTCUSDT");
    assert_eq!(report["S"], "BUY");
    assert_eq!(report["X"], "NEW");
    assert_eq!(report["c_t"], "NEW");
    assert_eq!(report["q"], "1");
    assert_eq!(report["p"], "45000");
}

#[tokio::test]
async fn user_stream_reports_stp_expiry_with_reason() {
    let (addr, exchange) = spawn_app().await;
    fund(&exchange, "alice", "USDT", dec!(100000));
    fund(&exchange, "alice", "BTC", dec!(1));
    let listen_key = exchange.create_listen_key("alice");

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/{listen_key}"))
        .await
        .expect("connect");
    tokio::time::sleep(Duration::from_millis(100)).await;

    exchange
        .submit_order(limit("alice", Side::Sell, dec!(1), dec!(50000)))
        .unwrap();
    let mut request = limit("alice", Side::Buy, dec!(0.5), dec!(50000));
    request.self_trade_prevention = Some(virtual_exchange::types::SelfTradePrevention::ExpireTaker);
    exchange.submit_order(request).unwrap();

    let report = wait_for_event(&mut ws, |v| v.get("X") == Some(&serde_json::json!("EXPIRED_IN_MATCH"))).await;
    assert_eq!(report["c_t"], "EXPIRED_IN_MATCH");
    assert_eq!(report["r"], "STP triggered");
}

#[tokio::test]
async fn symbol_client_cap_rejects_excess_subscribers() {
    let clock = Arc::new(TimeManager::backtest(1_700_000_000_000));
    let mut config = ExchangeConfig::default();
    config.max_clients_per_symbol = Some(1);
    let exchange = VirtualExchange::with_clock(config, clock);
    exchange
        .register_symbol(SymbolSpec::with_defaults("BTCUSDT", "BTC", "USDT"))
        .unwrap();
    let app = api::create_router(exchange.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let subscribe = serde_json::json!({
        "method": "SUBSCRIBE", "params": ["btcusdt@trade"], "id": 1
    })
    .to_string();

    let (mut first, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    first.send(Message::Text(subscribe.clone())).await.unwrap();
    let ack = wait_for_event(&mut first, |v| v.get("id") == Some(&serde_json::json!(1))).await;
    assert_eq!(ack["result"], serde_json::Value::Null);

    let (mut second, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    second.send(Message::Text(subscribe)).await.unwrap();
    let reply = wait_for_event(&mut second, |v| v.get("id") == Some(&serde_json::json!(1))).await;
    assert_eq!(reply["error"], "too many clients for symbol");
}

#[tokio::test]
async fn unknown_listen_key_is_rejected() {
    let (addr, _exchange) = spawn_app().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/not-a-key")).await;
    assert!(result.is_err(), "upgrade must fail for unknown listen key");
}
