//! Exchange server binary: config from env, tracing to stderr, REST + WS on
//! one listener. `SYMBOLS` seeds the tradable pairs (comma-separated
//! `SYMBOL:BASE:QUOTE` triples); `CSV_TAPE`/`CSV_SYMBOL` optionally start a
//! replay from a bar file on the virtual clock.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use virtual_exchange::api;
use virtual_exchange::config::ExchangeConfig;
use virtual_exchange::replay::ReplayController;
use virtual_exchange::sources::CsvBarSource;
use virtual_exchange::time_manager::TimeManager;
use virtual_exchange::types::SymbolSpec;
use virtual_exchange::VirtualExchange;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let config = ExchangeConfig::from_env();
    let replaying = std::env::var("CSV_TAPE").is_ok();
    let clock = if replaying {
        Arc::new(TimeManager::backtest(0))
    } else {
        Arc::new(TimeManager::new())
    };
    let exchange = VirtualExchange::with_clock(config.clone(), clock.clone());

    let symbols = std::env::var("SYMBOLS").unwrap_or_else(|_| "BTCUSDT:BTC:USDT".to_string());
    for entry in symbols.split(',').filter(|s| !s.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let (Some(symbol), Some(base), Some(quote)) = (parts.next(), parts.next(), parts.next())
        else {
            eprintln!("invalid SYMBOLS entry: {entry} (expected SYMBOL:BASE:QUOTE)");
            std::process::exit(2);
        };
        exchange
            .register_symbol(SymbolSpec::with_defaults(symbol, base, quote))
            .expect("register symbol");
    }

    if let Ok(tape) = std::env::var("CSV_TAPE") {
        let controller = ReplayController::new(clock, config.replay);
        let source = match std::env::var("CSV_SYMBOL") {
            Ok(symbol) => CsvBarSource::with_symbol(&tape, symbol),
            Err(_) => CsvBarSource::new(&tape),
        };
        controller.add_source("csv", Box::new(source));
        exchange.attach_replay(controller.clone());
        controller.start();
        info!(tape, "replay running");
    }

    let app = api::create_router(exchange);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await.expect("bind");
    info!(%addr, "listening");
    axum::serve(listener, app.into_make_service())
        .await
        .expect("serve");
}
