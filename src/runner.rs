// ===============================
// src/runner.rs
// ===============================
//
// Background loop: tiap poll_interval jalankan pipeline untuk setiap
// instrumen di watchlist, dengan jeda kecil (stagger) antar instrumen.
//
// Lifecycle: Stopped -> Running -> Stopping -> Stopped
// - start() idempotent selama Running
// - stop() menunggu loop selesai, paling lama stop_timeout, lalu abort
// - panic di dalam cycle ditangkap, dicatat, loop lanjut (kecuali sedang stop)
//
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{RunnerCfg, WatchlistEntry};
use crate::metrics::CYCLE_FAILURES;
use crate::pipeline::{CycleOutcome, Pipeline};

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Stopped,
    Running,
    Stopping,
}

/// Shared between the handle and the spawned loop.
struct Shared {
    pipeline: Arc<Pipeline>,
    watchlist: Vec<WatchlistEntry>,
    cfg: RunnerCfg,
    state: AtomicU8,
    wake: Notify,
    cycles: AtomicU64,
}

impl Shared {
    fn running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }
}

pub struct Runner {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn panic_msg(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Runner {
    pub fn new(pipeline: Arc<Pipeline>, watchlist: Vec<WatchlistEntry>, cfg: RunnerCfg) -> Self {
        Self {
            shared: Arc::new(Shared {
                pipeline,
                watchlist,
                cfg,
                state: AtomicU8::new(STOPPED),
                wake: Notify::new(),
                cycles: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunnerState {
        match self.shared.state.load(Ordering::SeqCst) {
            RUNNING => RunnerState::Running,
            STOPPING => RunnerState::Stopping,
            _ => RunnerState::Stopped,
        }
    }

    /// Completed watchlist passes since construction.
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::SeqCst)
    }

    /// Spawn the loop. No-op (returns false) unless currently stopped.
    pub fn start(&self) -> bool {
        if self
            .shared
            .state
            .compare_exchange(STOPPED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("runner: start ignored, not stopped");
            return false;
        }
        let shared = self.shared.clone();
        *self.handle.lock() = Some(tokio::spawn(run_loop(shared)));
        info!(instruments = self.shared.watchlist.len(), "runner: started");
        true
    }

    /// Ask the loop to finish and wait for it, bounded by `stop_timeout`.
    pub async fn stop(&self) -> bool {
        if self
            .shared
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.shared.wake.notify_one();
        let handle = self.handle.lock().take();
        if let Some(h) = handle {
            let abort = h.abort_handle();
            match timeout(self.shared.cfg.stop_timeout, h).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "runner: loop task ended abnormally"),
                Err(_) => {
                    warn!(timeout_ms = self.shared.cfg.stop_timeout.as_millis() as u64, "runner: stop timed out, aborting loop");
                    abort.abort();
                }
            }
        }
        self.shared.state.store(STOPPED, Ordering::SeqCst);
        info!(cycles = self.cycles(), "runner: stopped");
        true
    }
}

async fn run_loop(shared: Arc<Shared>) {
    loop {
        if !shared.running() {
            break;
        }
        let pass = AssertUnwindSafe(run_pass(&shared)).catch_unwind().await;
        if let Err(p) = pass {
            CYCLE_FAILURES.with_label_values(&["runner"]).inc();
            error!(component = "runner", panic = %panic_msg(p.as_ref()), "runner: cycle panicked, resuming");
        }
        shared.cycles.fetch_add(1, Ordering::SeqCst);

        if !shared.running() {
            break;
        }
        tokio::select! {
            _ = sleep(shared.cfg.poll_interval) => {}
            _ = shared.wake.notified() => {}
        }
    }
    debug!("runner: loop exited");
}

async fn run_pass(shared: &Shared) {
    for (i, entry) in shared.watchlist.iter().enumerate() {
        if !shared.running() {
            return;
        }
        if i > 0 && !shared.cfg.stagger.is_zero() {
            sleep(shared.cfg.stagger).await;
        }
        match AssertUnwindSafe(shared.pipeline.run_cycle(entry)).catch_unwind().await {
            Ok(CycleOutcome::Executed(rec)) => {
                debug!(symbol = %entry.trading_symbol, client_ref = %rec.client_ref, "runner: entry placed");
            }
            Ok(outcome) => debug!(symbol = %entry.trading_symbol, ?outcome, "runner: cycle done"),
            Err(p) => {
                CYCLE_FAILURES.with_label_values(&["runner"]).inc();
                error!(component = "runner", symbol = %entry.trading_symbol, panic = %panic_msg(p.as_ref()), "instrument cycle panicked");
            }
        }
    }
}
