//! WebSocket streams: Binance-shaped market and user data.
//!
//! `GET /ws` is a multiplex public socket: clients send
//! `{"method": "SUBSCRIBE", "params": ["btcusdt@trade", ...], "id": 1}`
//! frames and receive events for the streams they subscribed to. Payloads
//! carry the `e` event-type and `E` event-time fields.
//!
//! `GET /ws/:listenKey` is the private stream: `executionReport` order
//! updates and `outboundAccountPosition` account updates for the listen key's
//! user (keys come from `POST /api/v3/userDataStream`).
//!
//! Each connection drains its own bounded broadcast receiver; a consumer too
//! slow to keep up skips the frames it lagged past and continues.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::events::{ExchangeEvent, OrderUpdate, OrderUpdateKind};
use crate::exchange::VirtualExchange;
use crate::types::Side;

pub fn routes() -> Router<()> {
    Router::new()
        .route("/ws", get(public_stream))
        .route("/ws/:listen_key", get(user_stream))
}

async fn public_stream(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_public_socket(exchange, socket))
}

async fn user_stream(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    Path(listen_key): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    match exchange.resolve_listen_key(&listen_key) {
        Some(user_id) => {
            upgrade.on_upgrade(move |socket| handle_user_socket(exchange, socket, user_id))
        }
        None => (
            axum::http::StatusCode::UNAUTHORIZED,
            "unknown listen key",
        )
            .into_response(),
    }
}

/// Stream name an event publishes under, e.g. `btcusdt@trade`.
fn stream_name(event: &ExchangeEvent) -> Option<String> {
    let symbol = event.symbol()?.to_lowercase();
    let suffix = match event {
        ExchangeEvent::Trade(_) => "trade".to_string(),
        ExchangeEvent::Depth { .. } => "depth".to_string(),
        ExchangeEvent::Kline { interval, .. } => format!("kline_{interval}"),
        ExchangeEvent::Ticker { .. } => "ticker".to_string(),
        ExchangeEvent::AvgPrice { .. } => "avgPrice".to_string(),
        _ => return None,
    };
    Some(format!("{symbol}@{suffix}"))
}

fn market_payload(event: &ExchangeEvent) -> Option<Value> {
    let value = match event {
        ExchangeEvent::Trade(t) => json!({
            "e": "trade",
            "E": t.timestamp,
            "s": t.symbol,
            "t": t.trade_id.0,
            "p": t.price.to_string(),
            "q": t.quantity.to_string(),
            "T": t.timestamp,
            "m": t.maker_side == Side::Buy,
        }),
        ExchangeEvent::Depth {
            symbol,
            event_time,
            first_update_id,
            final_update_id,
            bids,
            asks,
        } => {
            let levels = |side: &[(rust_decimal::Decimal, rust_decimal::Decimal)]| -> Vec<Value> {
                side.iter()
                    .map(|(p, q)| json!([p.to_string(), q.to_string()]))
                    .collect()
            };
            json!({
                "e": "depthUpdate",
                "E": event_time,
                "s": symbol,
                "U": first_update_id,
                "u": final_update_id,
                "b": levels(bids),
                "a": levels(asks),
            })
        }
        ExchangeEvent::Kline {
            symbol,
            event_time,
            interval,
            kline,
        } => json!({
            "e": "kline",
            "E": event_time,
            "s": symbol,
            "k": {
                "t": kline.open_time,
                "T": kline.close_time,
                "s": symbol,
                "i": interval,
                "o": kline.open.to_string(),
                "h": kline.high.to_string(),
                "l": kline.low.to_string(),
                "c": kline.close.to_string(),
                "v": kline.volume.to_string(),
                "q": kline.quote_volume.to_string(),
                "n": kline.trade_count,
            },
        }),
        ExchangeEvent::Ticker { event_time, ticker } => json!({
            "e": "24hrTicker",
            "E": event_time,
            "s": ticker.symbol,
            "p": ticker.price_change.to_string(),
            "P": ticker.price_change_percent.to_string(),
            "w": ticker.weighted_avg_price.to_string(),
            "c": ticker.last_price.to_string(),
            "Q": ticker.last_qty.to_string(),
            "o": ticker.open_price.to_string(),
            "h": ticker.high_price.to_string(),
            "l": ticker.low_price.to_string(),
            "v": ticker.volume.to_string(),
            "q": ticker.quote_volume.to_string(),
            "O": ticker.open_time,
            "C": ticker.close_time,
            "n": ticker.trade_count,
        }),
        ExchangeEvent::AvgPrice {
            symbol,
            event_time,
            mins,
            price,
        } => json!({
            "e": "avgPrice",
            "E": event_time,
            "s": symbol,
            "i": format!("{mins}m"),
            "w": price.to_string(),
        }),
        _ => return None,
    };
    Some(value)
}

fn update_kind_str(kind: OrderUpdateKind) -> &'static str {
    match kind {
        OrderUpdateKind::New => "NEW",
        OrderUpdateKind::Trade => "TRADE",
        OrderUpdateKind::Canceled => "CANCELED",
        OrderUpdateKind::Expired => "EXPIRED",
        OrderUpdateKind::ExpiredInMatch => "EXPIRED_IN_MATCH",
        OrderUpdateKind::Rejected => "REJECTED",
    }
}

fn user_payload(event: &ExchangeEvent) -> Option<Value> {
    let value = match event {
        ExchangeEvent::OrderUpdate(OrderUpdate { order, kind, reason }) => {
            let mut value = json!({
                "e": "executionReport",
                "E": order.update_time,
                "s": order.symbol,
                "c": order.client_order_id.clone().unwrap_or_default(),
                "S": serde_json::to_value(order.side).expect("side"),
                "o": serde_json::to_value(order.order_type).expect("type"),
                "f": serde_json::to_value(order.time_in_force).expect("tif"),
                "q": order.quantity.to_string(),
                "p": order.price.unwrap_or_default().to_string(),
                "P": order.stop_price.unwrap_or_default().to_string(),
                "x": update_kind_str(*kind),
                "X": serde_json::to_value(order.status).expect("status"),
                "c_t": update_kind_str(*kind),
                "i": order.order_id.to_string(),
                "z": order.filled_quantity.to_string(),
                "Z": order.filled_quote_quantity.to_string(),
                "O": order.timestamp,
                "T": order.update_time,
                "V": serde_json::to_value(order.self_trade_prevention).expect("stp"),
            });
            if let Some(reason) = reason {
                value["r"] = Value::String(reason.clone());
            }
            value
        }
        ExchangeEvent::AccountUpdate {
            event_time,
            balances,
            ..
        } => json!({
            "e": "outboundAccountPosition",
            "E": event_time,
            "u": event_time,
            "B": balances
                .iter()
                .map(|b| json!({
                    "a": b.asset,
                    "f": b.free.to_string(),
                    "l": b.locked.to_string(),
                }))
                .collect::<Vec<Value>>(),
        }),
        _ => return None,
    };
    Some(value)
}

#[derive(serde::Deserialize)]
struct StreamCommand {
    method: String,
    #[serde(default)]
    params: Vec<String>,
    #[serde(default)]
    id: Value,
}

fn stream_symbol(stream: &str) -> Option<&str> {
    stream.split('@').next().filter(|s| !s.is_empty())
}

async fn handle_public_socket(exchange: Arc<VirtualExchange>, mut socket: WebSocket) {
    let mut rx = exchange.events().subscribe_market_stream();
    let mut subscriptions: HashSet<String> = HashSet::new();
    // Symbols this connection counts against `max_clients_per_symbol`.
    let mut counted_symbols: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(command) = serde_json::from_str::<StreamCommand>(&text) else {
                            let _ = socket
                                .send(Message::Text(
                                    json!({"error": "invalid request"}).to_string().into(),
                                ))
                                .await;
                            continue;
                        };
                        match command.method.as_str() {
                            "SUBSCRIBE" => {
                                let mut rejected = Vec::new();
                                for stream in command.params {
                                    let stream = stream.to_lowercase();
                                    let Some(symbol) = stream_symbol(&stream) else {
                                        continue;
                                    };
                                    if !counted_symbols.contains(symbol)
                                        && !exchange.add_stream_client(symbol)
                                    {
                                        rejected.push(stream.clone());
                                        continue;
                                    }
                                    counted_symbols.insert(symbol.to_string());
                                    subscriptions.insert(stream);
                                }
                                if !rejected.is_empty() {
                                    let _ = socket
                                        .send(Message::Text(
                                            json!({
                                                "error": "too many clients for symbol",
                                                "streams": rejected,
                                                "id": command.id,
                                            })
                                            .to_string()
                                            .into(),
                                        ))
                                        .await;
                                    continue;
                                }
                            }
                            "UNSUBSCRIBE" => {
                                for stream in command.params {
                                    subscriptions.remove(&stream.to_lowercase());
                                }
                            }
                            "LIST_SUBSCRIPTIONS" => {
                                let mut list: Vec<&String> = subscriptions.iter().collect();
                                list.sort();
                                let _ = socket
                                    .send(Message::Text(
                                        json!({"result": list, "id": command.id})
                                            .to_string()
                                            .into(),
                                    ))
                                    .await;
                                continue;
                            }
                            _ => {
                                let _ = socket
                                    .send(Message::Text(
                                        json!({"error": "unknown method", "id": command.id})
                                            .to_string()
                                            .into(),
                                    ))
                                    .await;
                                continue;
                            }
                        }
                        let _ = socket
                            .send(Message::Text(
                                json!({"result": null, "id": command.id}).to_string().into(),
                            ))
                            .await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "public stream socket error");
                        break;
                    }
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Some(stream) = stream_name(&event) else { continue };
                        if !subscriptions.contains(&stream) {
                            continue;
                        }
                        let Some(payload) = market_payload(&event) else { continue };
                        if socket
                            .send(Message::Text(payload.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    // Slow consumer: skip what was missed and continue.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "public stream lagged; frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    for symbol in counted_symbols {
        exchange.remove_stream_client(&symbol);
    }
}

async fn handle_user_socket(
    exchange: Arc<VirtualExchange>,
    mut socket: WebSocket,
    user_id: String,
) {
    let mut rx = exchange.events().subscribe_user_stream(&user_id);
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, user_id, "user stream socket error");
                        break;
                    }
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Some(payload) = user_payload(&event) else { continue };
                        if socket
                            .send(Message::Text(payload.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, user_id, "user stream lagged; frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderId, Trade, TradeId};
    use rust_decimal_macros::dec;

    fn trade_event() -> ExchangeEvent {
        ExchangeEvent::Trade(Trade {
            trade_id: TradeId(7),
            symbol: "BTCUSDT".into(),
            price: dec!(50000),
            quantity: dec!(0.5),
            quote_quantity: dec!(25000),
            timestamp: 1234,
            buy_order_id: OrderId::new(),
            sell_order_id: OrderId::new(),
            buy_user_id: "b".into(),
            sell_user_id: "s".into(),
            maker_side: Side::Sell,
            buyer_commission: dec!(0.0005),
            seller_commission: dec!(25),
        })
    }

    #[test]
    fn stream_names_are_lowercased_binance_style() {
        assert_eq!(stream_name(&trade_event()).unwrap(), "btcusdt@trade");
    }

    #[test]
    fn stream_symbol_extraction() {
        assert_eq!(stream_symbol("btcusdt@kline_1m"), Some("btcusdt"));
        assert_eq!(stream_symbol("ethusdt@trade"), Some("ethusdt"));
        assert_eq!(stream_symbol("@trade"), None);
    }

    #[test]
    fn trade_payload_has_event_fields() {
        let payload = market_payload(&trade_event()).unwrap();
        assert_eq!(payload["e"], "trade");
        assert_eq!(payload["E"], 1234);
        assert_eq!(payload["s"], "BTCUSDT");
        assert_eq!(payload["p"], "50000");
        assert_eq!(payload["q"], "0.5");
        assert_eq!(payload["m"], false, "maker was the sell side");
    }

    #[test]
    fn depth_payload_carries_update_ids() {
        let event = ExchangeEvent::Depth {
            symbol: "BTCUSDT".into(),
            event_time: 5,
            first_update_id: 10,
            final_update_id: 12,
            bids: vec![(dec!(100), dec!(1))],
            asks: vec![(dec!(101), dec!(2))],
        };
        let payload = market_payload(&event).unwrap();
        assert_eq!(payload["e"], "depthUpdate");
        assert_eq!(payload["U"], 10);
        assert_eq!(payload["u"], 12);
        assert_eq!(payload["b"][0][0], "100");
        assert_eq!(payload["a"][0][1], "2");
    }
}
