//! Binance Spot REST v3 router.
//!
//! Public market-data endpoints plus signed trading/account endpoints under
//! `/api/v3`. Numeric response fields are strings, errors are
//! `{"code": <neg>, "msg": "..."}` with a 4xx status, and field names follow
//! the Binance wire format. Built with [`create_router`]; used by the binary
//! and by the integration tests.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{self, API_KEY_HEADER};
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::VirtualExchange;
use crate::matching::{OrderLookup, OrderRequest};
use crate::types::{
    Order, OrderId, OrderType, PriceMatch, SelfTradePrevention, Side, SymbolSpec, TimeInForce,
    Trade,
};
use crate::ws;

/// Build the full REST + WebSocket router for an exchange instance.
pub fn create_router(exchange: Arc<VirtualExchange>) -> Router<()> {
    Router::new()
        .route("/api/v3/ping", get(ping))
        .route("/api/v3/time", get(server_time))
        .route("/api/v3/exchangeInfo", get(exchange_info))
        .route("/api/v3/ticker/price", get(ticker_price))
        .route("/api/v3/ticker/24hr", get(ticker_24hr))
        .route("/api/v3/depth", get(depth))
        .route("/api/v3/trades", get(recent_trades))
        .route("/api/v3/klines", get(klines))
        .route("/api/v3/avgPrice", get(avg_price))
        .route("/api/v3/account", get(account))
        .route(
            "/api/v3/order",
            post(create_order).get(query_order).delete(cancel_order),
        )
        .route("/api/v3/openOrders", get(open_orders))
        .route("/api/v3/allOrders", get(all_orders))
        .route("/api/v3/myTrades", get(my_trades))
        .route(
            "/api/v3/userDataStream",
            post(create_listen_key).delete(close_listen_key),
        )
        .route("/api/v3/register", post(register_user))
        .route("/api/v3/deposit", post(deposit))
        .route("/api/v3/withdraw", post(withdraw))
        .merge(ws::routes())
        .layer(Extension(exchange))
}

fn error_response(err: ExchangeError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({ "code": err.code(), "msg": err.to_string() })),
    )
        .into_response()
}

fn ok_json(value: Value) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

fn api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

/// Parse the raw query string into a map (public endpoints).
fn query_map(raw: &Option<String>) -> HashMap<String, String> {
    raw.as_deref()
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (p.to_string(), String::new()),
        })
        .collect()
}

fn require_param<'a>(
    params: &'a HashMap<String, String>,
    name: &str,
) -> ExchangeResult<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ExchangeError::InvalidParam(format!("Mandatory parameter '{name}' was not sent.")))
}

fn parse_decimal(
    params: &HashMap<String, String>,
    name: &str,
) -> ExchangeResult<Option<Decimal>> {
    match params.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ExchangeError::InvalidParam(format!("Invalid value for '{name}'."))),
    }
}

fn parse_int(params: &HashMap<String, String>, name: &str) -> ExchangeResult<Option<i64>> {
    match params.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ExchangeError::InvalidParam(format!("Invalid value for '{name}'."))),
    }
}

fn parse_side(raw: &str) -> ExchangeResult<Side> {
    match raw {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        _ => Err(ExchangeError::InvalidParam("Invalid side.".into())),
    }
}

fn parse_order_type(raw: &str) -> ExchangeResult<OrderType> {
    match raw {
        "LIMIT" => Ok(OrderType::Limit),
        "MARKET" => Ok(OrderType::Market),
        "STOP_LOSS" => Ok(OrderType::StopLoss),
        "STOP_LOSS_LIMIT" => Ok(OrderType::StopLossLimit),
        "TAKE_PROFIT" => Ok(OrderType::TakeProfit),
        "TAKE_PROFIT_LIMIT" => Ok(OrderType::TakeProfitLimit),
        "LIMIT_MAKER" => Ok(OrderType::LimitMaker),
        _ => Err(ExchangeError::InvalidParam("Invalid order type.".into())),
    }
}

fn parse_tif(raw: &str) -> ExchangeResult<TimeInForce> {
    match raw {
        "GTC" => Ok(TimeInForce::GTC),
        "IOC" => Ok(TimeInForce::IOC),
        "FOK" => Ok(TimeInForce::FOK),
        _ => Err(ExchangeError::InvalidParam("Invalid timeInForce.".into())),
    }
}

fn parse_stp(raw: &str) -> ExchangeResult<SelfTradePrevention> {
    match raw {
        "NONE" => Ok(SelfTradePrevention::None),
        "EXPIRE_TAKER" => Ok(SelfTradePrevention::ExpireTaker),
        "EXPIRE_MAKER" => Ok(SelfTradePrevention::ExpireMaker),
        "EXPIRE_BOTH" => Ok(SelfTradePrevention::ExpireBoth),
        _ => Err(ExchangeError::InvalidParam(
            "Invalid selfTradePreventionMode.".into(),
        )),
    }
}

fn parse_price_match(raw: &str) -> ExchangeResult<PriceMatch> {
    match raw {
        "NONE" => Ok(PriceMatch::None),
        "OPPONENT" => Ok(PriceMatch::Opponent),
        "QUEUE" => Ok(PriceMatch::Queue),
        _ => Err(ExchangeError::InvalidParam("Invalid priceMatch.".into())),
    }
}

fn parse_order_lookup(params: &HashMap<String, String>) -> ExchangeResult<OrderLookup> {
    if let Some(raw) = params.get("orderId") {
        let id = Uuid::parse_str(raw)
            .map_err(|_| ExchangeError::InvalidParam("Invalid orderId.".into()))?;
        return Ok(OrderLookup::ById(OrderId(id)));
    }
    if let Some(cid) = params.get("origClientOrderId") {
        return Ok(OrderLookup::ByClientId(cid.clone()));
    }
    Err(ExchangeError::InvalidParam(
        "Either orderId or origClientOrderId must be sent.".into(),
    ))
}

fn dec_str(value: Decimal) -> Value {
    Value::String(value.to_string())
}

fn status_str(order: &Order) -> Value {
    serde_json::to_value(order.status).expect("status serializes")
}

/// Order in Binance wire form. `fills` appears (possibly empty) on the
/// POST /order acknowledgement.
fn order_json(order: &Order, spec: &SymbolSpec, fills: Option<&[Trade]>) -> Value {
    let mut out = json!({
        "symbol": order.symbol,
        "orderId": order.order_id.to_string(),
        "orderListId": -1,
        "clientOrderId": order.client_order_id.clone().unwrap_or_default(),
        "price": dec_str(order.price.unwrap_or_default()),
        "origQty": dec_str(order.quantity),
        "executedQty": dec_str(order.filled_quantity),
        "cummulativeQuoteQty": dec_str(order.filled_quote_quantity),
        "origQuoteOrderQty": dec_str(order.quote_order_qty.unwrap_or_default()),
        "status": status_str(order),
        "timeInForce": serde_json::to_value(order.time_in_force).expect("tif"),
        "type": serde_json::to_value(order.order_type).expect("type"),
        "side": serde_json::to_value(order.side).expect("side"),
        "stopPrice": dec_str(order.stop_price.unwrap_or_default()),
        "time": order.timestamp,
        "updateTime": order.update_time,
        "isWorking": !order.status.is_terminal(),
        "selfTradePreventionMode": serde_json::to_value(order.self_trade_prevention).expect("stp"),
    });
    if let Some(fills) = fills {
        let taker_is_buyer = order.side == Side::Buy;
        let entries: Vec<Value> = fills
            .iter()
            .map(|t| {
                let (commission, commission_asset) = if taker_is_buyer {
                    (t.buyer_commission, spec.base_asset.as_str())
                } else {
                    (t.seller_commission, spec.quote_asset.as_str())
                };
                json!({
                    "price": dec_str(t.price),
                    "qty": dec_str(t.quantity),
                    "commission": dec_str(commission),
                    "commissionAsset": commission_asset,
                    "tradeId": t.trade_id.0,
                })
            })
            .collect();
        out["fills"] = Value::Array(entries);
    }
    out
}

fn trade_json(trade: &Trade) -> Value {
    json!({
        "id": trade.trade_id.0,
        "price": dec_str(trade.price),
        "qty": dec_str(trade.quantity),
        "quoteQty": dec_str(trade.quote_quantity),
        "time": trade.timestamp,
        "isBuyerMaker": trade.maker_side == Side::Buy,
        "isBestMatch": true,
    })
}

fn symbol_json(spec: &SymbolSpec) -> Value {
    json!({
        "symbol": spec.symbol,
        "status": "TRADING",
        "baseAsset": spec.base_asset,
        "baseAssetPrecision": spec.base_precision,
        "quoteAsset": spec.quote_asset,
        "quoteAssetPrecision": spec.quote_precision,
        "orderTypes": [
            "LIMIT", "MARKET", "STOP_LOSS", "STOP_LOSS_LIMIT",
            "TAKE_PROFIT", "TAKE_PROFIT_LIMIT", "LIMIT_MAKER"
        ],
        "icebergAllowed": false,
        "ocoAllowed": false,
        "isSpotTradingAllowed": true,
        "isMarginTradingAllowed": false,
        "filters": [
            {
                "filterType": "PRICE_FILTER",
                "minPrice": dec_str(spec.price_filter.min),
                "maxPrice": dec_str(spec.price_filter.max),
                "tickSize": dec_str(spec.price_filter.tick),
            },
            {
                "filterType": "LOT_SIZE",
                "minQty": dec_str(spec.lot_filter.min),
                "maxQty": dec_str(spec.lot_filter.max),
                "stepSize": dec_str(spec.lot_filter.step),
            },
            {
                "filterType": "MIN_NOTIONAL",
                "minNotional": dec_str(spec.min_notional),
            },
        ],
    })
}

// --- public endpoints -----------------------------------------------------

async fn ping() -> Response {
    ok_json(json!({}))
}

async fn server_time(Extension(exchange): Extension<Arc<VirtualExchange>>) -> Response {
    ok_json(json!({ "serverTime": exchange.server_time() }))
}

async fn exchange_info(Extension(exchange): Extension<Arc<VirtualExchange>>) -> Response {
    let symbols: Vec<Value> = exchange.exchange_info().iter().map(symbol_json).collect();
    ok_json(json!({
        "timezone": "UTC",
        "serverTime": exchange.server_time(),
        "rateLimits": [],
        "symbols": symbols,
    }))
}

async fn ticker_price(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let params = query_map(&raw);
    match params.get("symbol") {
        Some(symbol) => match exchange.ticker_price(symbol) {
            Ok(Some(price)) => ok_json(json!({ "symbol": symbol, "price": dec_str(price) })),
            Ok(None) => ok_json(json!({ "symbol": symbol, "price": "0" })),
            Err(e) => error_response(e),
        },
        None => {
            let out: Vec<Value> = exchange
                .exchange_info()
                .iter()
                .map(|spec| {
                    let price = exchange
                        .ticker_price(&spec.symbol)
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    json!({ "symbol": spec.symbol, "price": dec_str(price) })
                })
                .collect();
            ok_json(Value::Array(out))
        }
    }
}

async fn ticker_24hr(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let params = query_map(&raw);
    let symbol = match require_param(&params, "symbol") {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    match exchange.ticker_24hr(symbol) {
        Ok(Some(t)) => ok_json(json!({
            "symbol": t.symbol,
            "priceChange": dec_str(t.price_change),
            "priceChangePercent": dec_str(t.price_change_percent),
            "weightedAvgPrice": dec_str(t.weighted_avg_price),
            "lastPrice": dec_str(t.last_price),
            "lastQty": dec_str(t.last_qty),
            "openPrice": dec_str(t.open_price),
            "highPrice": dec_str(t.high_price),
            "lowPrice": dec_str(t.low_price),
            "volume": dec_str(t.volume),
            "quoteVolume": dec_str(t.quote_volume),
            "openTime": t.open_time,
            "closeTime": t.close_time,
            "count": t.trade_count,
        })),
        Ok(None) => ok_json(json!({
            "symbol": symbol,
            "priceChange": "0",
            "priceChangePercent": "0",
            "weightedAvgPrice": "0",
            "lastPrice": "0",
            "lastQty": "0",
            "openPrice": "0",
            "highPrice": "0",
            "lowPrice": "0",
            "volume": "0",
            "quoteVolume": "0",
            "openTime": 0,
            "closeTime": 0,
            "count": 0,
        })),
        Err(e) => error_response(e),
    }
}

async fn depth(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let params = query_map(&raw);
    let symbol = match require_param(&params, "symbol") {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    let limit = params.get("limit").and_then(|l| l.parse().ok());
    match exchange.market_depth(symbol, limit) {
        Ok(snapshot) => {
            let levels = |side: &[(Decimal, Decimal)]| -> Vec<Value> {
                side.iter()
                    .map(|(p, q)| json!([p.to_string(), q.to_string()]))
                    .collect()
            };
            ok_json(json!({
                "lastUpdateId": snapshot.last_update_id,
                "bids": levels(&snapshot.bids),
                "asks": levels(&snapshot.asks),
            }))
        }
        Err(e) => error_response(e),
    }
}

async fn recent_trades(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let params = query_map(&raw);
    let symbol = match require_param(&params, "symbol") {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    let limit: usize = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(500);
    match exchange.recent_trades(symbol, limit.min(1000)) {
        Ok(trades) => ok_json(Value::Array(trades.iter().map(trade_json).collect())),
        Err(e) => error_response(e),
    }
}

async fn klines(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let params = query_map(&raw);
    let symbol = match require_param(&params, "symbol") {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    let interval = match require_param(&params, "interval") {
        Ok(i) => i,
        Err(e) => return error_response(e),
    };
    let start = match parse_int(&params, "startTime") {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let end = match parse_int(&params, "endTime") {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let limit: usize = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(500);
    match exchange.klines(symbol, interval, start, end, limit.min(1000)) {
        Ok(klines) => {
            // Standard 12-field kline array, decimals as strings.
            let rows: Vec<Value> = klines
                .iter()
                .map(|k| {
                    json!([
                        k.open_time,
                        k.open.to_string(),
                        k.high.to_string(),
                        k.low.to_string(),
                        k.close.to_string(),
                        k.volume.to_string(),
                        k.close_time,
                        k.quote_volume.to_string(),
                        k.trade_count,
                        "0",
                        "0",
                        "0",
                    ])
                })
                .collect();
            ok_json(Value::Array(rows))
        }
        Err(e) => error_response(e),
    }
}

async fn avg_price(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let params = query_map(&raw);
    let symbol = match require_param(&params, "symbol") {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };
    match exchange.avg_price(symbol) {
        Ok(price) => ok_json(json!({
            "mins": crate::market_data::AVG_PRICE_WINDOW_MINS,
            "price": dec_str(price.unwrap_or_default()),
        })),
        Err(e) => error_response(e),
    }
}

// --- signed endpoints -----------------------------------------------------

fn authed(
    exchange: &VirtualExchange,
    headers: &HeaderMap,
    raw: &Option<String>,
) -> ExchangeResult<(String, HashMap<String, String>)> {
    let authed = auth::verify_signed(
        exchange.accounts(),
        api_key_header(headers),
        raw.as_deref().unwrap_or(""),
        exchange.server_time(),
        exchange.config().timestamp_skew_ms,
    )?;
    Ok((authed.user_id, authed.params))
}

async fn account(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let (user_id, _) = match authed(&exchange, &headers, &raw) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    match exchange.account_info(&user_id) {
        Ok(info) => {
            let balances: Vec<Value> = info
                .balances
                .iter()
                .map(|b| {
                    json!({
                        "asset": b.asset,
                        "free": dec_str(b.free),
                        "locked": dec_str(b.locked),
                    })
                })
                .collect();
            let basis_points = |rate: Decimal| -> i64 {
                use rust_decimal::prelude::ToPrimitive;
                (rate * Decimal::from(10000)).to_i64().unwrap_or(0)
            };
            ok_json(json!({
                "makerCommission": basis_points(info.maker_commission),
                "takerCommission": basis_points(info.taker_commission),
                "canTrade": info.can_trade,
                "canWithdraw": info.can_withdraw,
                "canDeposit": info.can_deposit,
                "updateTime": info.update_time,
                "accountType": "SPOT",
                "balances": balances,
                "permissions": ["SPOT"],
            }))
        }
        Err(e) => error_response(e),
    }
}

async fn create_order(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let (user_id, params) = match authed(&exchange, &headers, &raw) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let request = match build_order_request(&user_id, &params) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let symbol = request.symbol.clone();
    match exchange.submit_order(request) {
        Ok((order, trades)) => {
            let spec = exchange
                .engine()
                .symbol_spec(&symbol)
                .expect("symbol exists after submit");
            ok_json(order_json(&order, &spec, Some(&trades)))
        }
        Err(e) => error_response(e),
    }
}

fn build_order_request(
    user_id: &str,
    params: &HashMap<String, String>,
) -> ExchangeResult<OrderRequest> {
    let symbol = require_param(params, "symbol")?.to_string();
    let side = parse_side(require_param(params, "side")?)?;
    let order_type = parse_order_type(require_param(params, "type")?)?;
    let time_in_force = params.get("timeInForce").map(|s| parse_tif(s)).transpose()?;
    let stp = params
        .get("selfTradePreventionMode")
        .map(|s| parse_stp(s))
        .transpose()?;
    let price_match = params
        .get("priceMatch")
        .map(|s| parse_price_match(s))
        .transpose()?;
    Ok(OrderRequest {
        user_id: user_id.to_string(),
        symbol,
        side: Some(side),
        order_type: Some(order_type),
        time_in_force,
        quantity: parse_decimal(params, "quantity")?,
        quote_order_qty: parse_decimal(params, "quoteOrderQty")?,
        price: parse_decimal(params, "price")?,
        stop_price: parse_decimal(params, "stopPrice")?,
        client_order_id: params.get("newClientOrderId").cloned(),
        self_trade_prevention: stp,
        price_match,
    })
}

async fn query_order(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let (user_id, params) = match authed(&exchange, &headers, &raw) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let symbol = match require_param(&params, "symbol") {
        Ok(s) => s.to_string(),
        Err(e) => return error_response(e),
    };
    let lookup = match parse_order_lookup(&params) {
        Ok(l) => l,
        Err(e) => return error_response(e),
    };
    match exchange.query_order(&user_id, &symbol, lookup) {
        Ok(order) => {
            let spec = exchange.engine().symbol_spec(&symbol).expect("symbol exists");
            ok_json(order_json(&order, &spec, None))
        }
        Err(e) => error_response(e),
    }
}

async fn cancel_order(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let (user_id, params) = match authed(&exchange, &headers, &raw) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let symbol = match require_param(&params, "symbol") {
        Ok(s) => s.to_string(),
        Err(e) => return error_response(e),
    };
    let lookup = match parse_order_lookup(&params) {
        Ok(l) => l,
        Err(e) => return error_response(e),
    };
    match exchange.cancel_order(&user_id, &symbol, lookup) {
        Ok(order) => {
            let spec = exchange.engine().symbol_spec(&symbol).expect("symbol exists");
            ok_json(order_json(&order, &spec, None))
        }
        Err(e) => error_response(e),
    }
}

async fn open_orders(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let (user_id, params) = match authed(&exchange, &headers, &raw) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let symbol = params.get("symbol").map(String::as_str);
    let orders = exchange.open_orders(&user_id, symbol);
    let out: Vec<Value> = orders
        .iter()
        .filter_map(|o| {
            exchange
                .engine()
                .symbol_spec(&o.symbol)
                .map(|spec| order_json(o, &spec, None))
        })
        .collect();
    ok_json(Value::Array(out))
}

async fn all_orders(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let (user_id, params) = match authed(&exchange, &headers, &raw) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let symbol = match require_param(&params, "symbol") {
        Ok(s) => s.to_string(),
        Err(e) => return error_response(e),
    };
    let from_id = match params.get("orderId") {
        Some(raw) => match Uuid::parse_str(raw) {
            Ok(id) => Some(OrderId(id)),
            Err(_) => return error_response(ExchangeError::InvalidParam("Invalid orderId.".into())),
        },
        None => None,
    };
    let start = match parse_int(&params, "startTime") {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let end = match parse_int(&params, "endTime") {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let limit: usize = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(500);
    match exchange.all_orders(&user_id, &symbol, from_id, start, end, limit.min(1000)) {
        Ok(orders) => {
            let spec = exchange.engine().symbol_spec(&symbol).expect("symbol exists");
            ok_json(Value::Array(
                orders.iter().map(|o| order_json(o, &spec, None)).collect(),
            ))
        }
        Err(e) => error_response(e),
    }
}

async fn my_trades(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    let (user_id, params) = match authed(&exchange, &headers, &raw) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let symbol = match require_param(&params, "symbol") {
        Ok(s) => s.to_string(),
        Err(e) => return error_response(e),
    };
    let limit: usize = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(500);
    let spec = match exchange.engine().symbol_spec(&symbol) {
        Some(s) => s,
        None => return error_response(ExchangeError::UnknownSymbol),
    };
    match exchange.my_trades(&user_id, &symbol, limit.min(1000)) {
        Ok(trades) => {
            let out: Vec<Value> = trades
                .iter()
                .map(|t| {
                    let is_buyer = t.buy_user_id == user_id;
                    let (commission, commission_asset) = if is_buyer {
                        (t.buyer_commission, spec.base_asset.as_str())
                    } else {
                        (t.seller_commission, spec.quote_asset.as_str())
                    };
                    json!({
                        "symbol": t.symbol,
                        "id": t.trade_id.0,
                        "orderId": if is_buyer { t.buy_order_id.to_string() } else { t.sell_order_id.to_string() },
                        "orderListId": -1,
                        "price": dec_str(t.price),
                        "qty": dec_str(t.quantity),
                        "quoteQty": dec_str(t.quote_quantity),
                        "commission": dec_str(commission),
                        "commissionAsset": commission_asset,
                        "time": t.timestamp,
                        "isBuyer": is_buyer,
                        "isMaker": (t.maker_side == Side::Buy) == is_buyer,
                        "isBestMatch": true,
                    })
                })
                .collect();
            ok_json(Value::Array(out))
        }
        Err(e) => error_response(e),
    }
}

// --- listen keys and test-rig endpoints ------------------------------------

async fn create_listen_key(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
) -> Response {
    match auth::verify_api_key(exchange.accounts(), api_key_header(&headers)) {
        Ok(user_id) => ok_json(json!({ "listenKey": exchange.create_listen_key(&user_id) })),
        Err(e) => error_response(e),
    }
}

async fn close_listen_key(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    if let Err(e) = auth::verify_api_key(exchange.accounts(), api_key_header(&headers)) {
        return error_response(e);
    }
    let params = query_map(&raw);
    match params.get("listenKey") {
        Some(key) => {
            exchange.close_listen_key(key);
            ok_json(json!({}))
        }
        None => error_response(ExchangeError::InvalidParam(
            "Mandatory parameter 'listenKey' was not sent.".into(),
        )),
    }
}

#[derive(serde::Deserialize)]
struct RegisterBody {
    #[serde(rename = "userId")]
    user_id: String,
}

/// Test-rig endpoint: create a user and return their api key.
async fn register_user(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    Json(body): Json<RegisterBody>,
) -> Response {
    match exchange.register_user(&body.user_id) {
        Ok(api_key) => ok_json(json!({ "userId": body.user_id, "apiKey": api_key })),
        Err(e) => error_response(e),
    }
}

async fn deposit(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    fund_endpoint(&exchange, &headers, &raw, true)
}

async fn withdraw(
    Extension(exchange): Extension<Arc<VirtualExchange>>,
    headers: HeaderMap,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Response {
    fund_endpoint(&exchange, &headers, &raw, false)
}

/// Shared deposit/withdraw handler (test-rig funding endpoints).
fn fund_endpoint(
    exchange: &VirtualExchange,
    headers: &HeaderMap,
    raw: &Option<String>,
    is_deposit: bool,
) -> Response {
    let (user_id, params) = match authed(exchange, headers, raw) {
        Ok(v) => v,
        Err(e) => return error_response(e),
    };
    let asset = match require_param(&params, "asset") {
        Ok(a) => a.to_string(),
        Err(e) => return error_response(e),
    };
    let amount = match parse_decimal(&params, "amount") {
        Ok(Some(a)) => a,
        Ok(None) => {
            return error_response(ExchangeError::InvalidParam(
                "Mandatory parameter 'amount' was not sent.".into(),
            ))
        }
        Err(e) => return error_response(e),
    };
    let result = if is_deposit {
        exchange.deposit(&user_id, &asset, amount)
    } else {
        exchange.withdraw(&user_id, &asset, amount)
    };
    match result {
        Ok(()) => ok_json(json!({ "success": true, "asset": asset, "amount": amount.to_string() })),
        Err(e) => error_response(e),
    }
}
