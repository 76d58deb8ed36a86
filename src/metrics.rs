// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data ticks").unwrap());

pub static TICKS_BY_SEGMENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_segment", "market data ticks per exchange segment"),
        &["segment"],
    )
    .unwrap()
});

pub static TICK_HANDLER_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("tick_handler_failures_total", "tick listeners that errored or panicked").unwrap()
});

// -------- Pipeline --------
pub static SIGNALS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("signals_total", "strategy signals").unwrap());

pub static DECISIONS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("decisions_total", "policy decisions emitted").unwrap());

pub static ADMISSION_DENIED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("admission_denied_total", "risk guard denials (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static ORDERS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_total", "orders placed with the broker").unwrap());

pub static ORDERS_DEDUPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("orders_deduped_total", "submissions answered from an existing client_ref").unwrap()
});

pub static CYCLE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cycle_failures_total", "per-instrument cycles aborted (label: stage)"),
        &["stage"],
    )
    .unwrap()
});

// -------- Broker guard --------
pub static RATE_LIMIT_WAITS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("rate_limit_waits_total", "token bucket consumers that had to sleep").unwrap()
});

pub static RATE_LIMIT_DENIED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("rate_limit_denied_total", "token bucket consumers turned away").unwrap()
});

pub static BROKER_RETRIES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("broker_retries_total", "transient broker failures retried").unwrap());

// -------- Event log / store --------
pub static EVENTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("events_total", "events appended to the log").unwrap());

pub static EVENT_LOG_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("event_log_errors_total", "event log writes that failed").unwrap());

pub static REPLAY_SKIPPED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("replay_skipped_total", "malformed log lines skipped on replay").unwrap());

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "positions held in the state store").unwrap());

pub static RECONCILE_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reconcile_runs_total", "reconciliation passes (label: result)"),
        &["result"],
    )
    .unwrap()
});

/// Register every metric into [`REGISTRY`]. Returns how many registrations
/// failed (a second call fails them all as duplicates).
pub fn init() -> usize {
    let results = [
        register("ticks_total", TICKS.clone()),
        register("ticks_total_by_segment", TICKS_BY_SEGMENT.clone()),
        register("tick_handler_failures_total", TICK_HANDLER_FAILURES.clone()),
        register("signals_total", SIGNALS.clone()),
        register("decisions_total", DECISIONS.clone()),
        register("admission_denied_total", ADMISSION_DENIED.clone()),
        register("orders_total", ORDERS.clone()),
        register("orders_deduped_total", ORDERS_DEDUPED.clone()),
        register("cycle_failures_total", CYCLE_FAILURES.clone()),
        register("rate_limit_waits_total", RATE_LIMIT_WAITS.clone()),
        register("rate_limit_denied_total", RATE_LIMIT_DENIED.clone()),
        register("broker_retries_total", BROKER_RETRIES.clone()),
        register("events_total", EVENTS.clone()),
        register("event_log_errors_total", EVENT_LOG_ERRORS.clone()),
        register("replay_skipped_total", REPLAY_SKIPPED.clone()),
        register("open_positions", OPEN_POSITIONS.clone()),
        register("reconcile_runs_total", RECONCILE_RUNS.clone()),
    ];
    results.iter().filter(|ok| !**ok).count()
}

fn register<C: Collector + 'static>(name: &str, c: C) -> bool {
    match REGISTRY.register(Box::new(c)) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(?e, metric = name, "metric registration failed");
            false
        }
    }
}

// Prometheus text format of everything registered
fn encode_metrics() -> Result<Vec<u8>, prometheus::Error> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf)?;
    Ok(buf)
}

fn respond(stream: &mut TcpStream, status: &str, body: &[u8]) -> std::io::Result<()> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

// GET / atau /metrics -> text exposition, path lain 404
fn handle_client(mut stream: TcpStream) {
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req).unwrap_or(0);
    let line = String::from_utf8_lossy(&req[..n]);
    let path = line.split_whitespace().nth(1).unwrap_or("/");

    let res = match path {
        "/" | "/metrics" => match encode_metrics() {
            Ok(body) => respond(&mut stream, "200 OK", &body),
            Err(e) => {
                tracing::warn!(?e, "metrics encode failed");
                respond(&mut stream, "500 Internal Server Error", b"encode failed\n")
            }
        },
        _ => respond(&mut stream, "404 Not Found", b"not found\n"),
    };
    if let Err(e) = res {
        tracing::debug!(?e, "metrics client went away");
    }
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        tracing::info!(%addr, "metrics listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_duplicates() {
        // registry is process-wide, another test may have registered first
        let first = init();
        assert!(first == 0 || first == 17, "first {first}");
        assert_eq!(init(), 17);
        ORDERS.inc();
        let text = String::from_utf8(encode_metrics().unwrap()).unwrap();
        assert!(text.contains("orders_total"));
    }
}
