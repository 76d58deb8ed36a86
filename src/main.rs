// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/fno_bot_rust

 # jalan dengan watchlist contoh (paper broker + mock feed)
 RUST_LOG=info cargo run -- --watchlist demos/watchlist.json

 # hanya rebuild state dari event log lalu keluar
 cargo run -- --state-dir state --replay-only

 # aktivitas pipeline
curl -s localhost:9898/metrics | egrep '^(decisions_total|orders_total|admission_denied_total)'

*/
/*
=============================================================================
Project : fno_bot_rust — intraday derivatives trading core in Rust
Module  : main.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Caches live ticks per instrument, turns strategy signals into
          sized and risk-checked decisions, submits idempotent orders through
          a token-bucket limiter, journals every order/position mutation to a
          JSONL event log and reconciles local state against the broker.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::{
    select,
    sync::watch,
    time::{interval, Duration},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fno_bot_rust::bars::BarCache;
use fno_bot_rust::broker::{Broker, PaperBroker};
use fno_bot_rust::config::{self, load_watchlist};
use fno_bot_rust::error::ConfigError;
use fno_bot_rust::executor::Executor;
use fno_bot_rust::feed::{FeedHub, TickCache};
use fno_bot_rust::metrics;
use fno_bot_rust::pipeline::Pipeline;
use fno_bot_rust::ratelimit::{BrokerGuard, TokenBucket};
use fno_bot_rust::reconcile::Reconciler;
use fno_bot_rust::risk::RiskGuard;
use fno_bot_rust::runner::Runner;
use fno_bot_rust::signal::{MovingAverageCrossover, SignalSource};
use fno_bot_rust::store::StateStore;

#[derive(Parser, Debug)]
#[command(name = "fno_bot_rust", version, about = "Intraday F&O trading core (paper broker)")]
struct Cli {
    /// JSON watchlist (array of instruments with optional overrides)
    #[arg(long, env = "WATCHLIST_FILE")]
    watchlist: Option<PathBuf>,

    /// Directory for orders.json / positions.json / events.jsonl
    #[arg(long, env = "STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Rebuild state from the event log, print it and exit
    #[arg(long)]
    replay_only: bool,
}

#[tokio::main]
async fn main() {
    // .env dulu supaya clap juga melihat WATCHLIST_FILE / STATE_DIR
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    // ---- Config ----
    let mut settings = config::load()?;
    if let Some(dir) = cli.state_dir {
        if std::env::var("EVENT_LOG").is_err() {
            settings.event_log = dir.join("events.jsonl");
        }
        settings.state_dir = dir;
    }

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(settings.metrics_port);

    // ---- State (replay event log / seed dari snapshot) ----
    let store = Arc::new(StateStore::open(&settings.state_dir, &settings.event_log));
    info!(
        state_dir = %settings.state_dir.display(),
        event_log = %settings.event_log.display(),
        orders = store.orders().len(),
        positions = store.positions().len(),
        "state recovered"
    );

    if cli.replay_only {
        for o in store.orders() {
            info!(client_ref = %o.client_ref, status = o.status.as_str(), symbol = %o.trading_symbol, qty = o.quantity, "order");
        }
        for p in store.positions() {
            info!(position = %p.key(), net = p.net_qty, realized = p.realized, unrealized = p.unrealized, external = p.external_flag, "position");
        }
        return Ok(());
    }

    let watchlist_path = cli
        .watchlist
        .or_else(|| settings.watchlist_file.clone())
        .ok_or_else(|| ConfigError::invalid("WATCHLIST_FILE", "no watchlist given (use --watchlist)"))?;
    let watchlist = load_watchlist(&watchlist_path, &settings.defaults)?;

    // ---- Market data ----
    let ticks = Arc::new(TickCache::new());
    let hub = Arc::new(FeedHub::new(ticks.clone()));
    let bars = Arc::new(BarCache::from_cfg(&settings.signal));
    hub.on_tick("bars", bars.handler());
    for e in &watchlist {
        hub.subscribe(e.segment, &e.security_id);
    }

    // ---- Broker + rate limiter ----
    let broker: Arc<dyn Broker> = Arc::new(PaperBroker::default());
    let guard = Arc::new(BrokerGuard::new(TokenBucket::from_cfg(&settings.rate), settings.backoff.clone()));

    let feed_rx = broker.subscribe_feed(hub.subscriptions()).await?;
    let feed_task = tokio::spawn({
        let hub = hub.clone();
        async move { hub.run(feed_rx).await }
    });

    // ---- Pipeline + runner ----
    let signals: Arc<dyn SignalSource> = Arc::new(MovingAverageCrossover::from_cfg(bars.clone(), &settings.signal));
    let risk = Arc::new(RiskGuard::new(settings.risk.clone(), ticks.clone()));
    let executor = Executor::new(store.clone(), broker.clone(), guard.clone());
    let pipeline = Arc::new(Pipeline::new(
        ticks.clone(),
        signals.clone(),
        risk,
        executor,
        store.clone(),
        settings.capital,
    ));

    info!(
        broker = broker.name(),
        signal = signals.name(),
        instruments = watchlist.len(),
        capital = settings.capital,
        poll_ms = settings.runner.poll_interval.as_millis() as u64,
        rate_capacity = settings.rate.capacity,
        rate_per_sec = settings.rate.refill_per_sec,
        trading_enabled = settings.risk.trading_enabled,
        "startup config"
    );

    let runner = Runner::new(pipeline, watchlist, settings.runner.clone());

    // ---- Reconciliation ----
    let (stop_tx, stop_rx) = watch::channel(false);
    let reconciler = Arc::new(Reconciler::new(store.clone(), broker.clone(), guard.clone(), ticks.clone()));
    let recon_task = reconciler.spawn(settings.reconcile_interval, stop_rx);

    runner.start();

    // ---- Heartbeat sampai Ctrl-C ----
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut heartbeat = interval(Duration::from_secs(30));
    loop {
        select! {
            _ = &mut shutdown => break,
            _ = heartbeat.tick() => {
                info!(
                    cached_ticks = ticks.len(),
                    orders = store.orders().len(),
                    positions = store.positions().len(),
                    cycles = runner.cycles(),
                    available_tokens = guard.bucket().available(),
                    "heartbeat"
                );
            }
        }
    }

    info!("shutdown requested");
    runner.stop().await;
    stop_tx.send_replace(true);
    hub.stop();
    let _ = recon_task.await;
    let _ = feed_task.await;
    info!("bye");
    Ok(())
}
