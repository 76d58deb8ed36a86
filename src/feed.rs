// ===============================
// src/feed.rs
// ===============================
//
// Market data:
// - TickCache : latest tick per (segment, security_id), last-write-wins
// - FeedHub   : subscriptions + listeners, write-then-notify on every tick
// - run_mock  : random-walk generator used by the paper broker
//
// Notes:
// - Staleness = age since the cache last wrote the key, not a heartbeat.
// - The hub never reconnects on its own; a stopped hub stays stopped.
//
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::domain::{InstrumentKey, Segment, Tick};
use crate::metrics::{TICKS, TICKS_BY_SEGMENT, TICK_HANDLER_FAILURES};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type TickHandler = Arc<dyn Fn(&Tick) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone)]
struct CachedTick {
    tick: Tick,
    written_at: Instant,
}

#[derive(Debug)]
pub struct TickCache {
    ticks: DashMap<InstrumentKey, CachedTick, RandomState>,
}

impl Default for TickCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TickCache {
    pub fn new() -> Self {
        Self { ticks: DashMap::with_hasher(RandomState::new()) }
    }

    pub fn put(&self, tick: Tick) {
        let key = tick.key();
        self.ticks.insert(key, CachedTick { tick, written_at: Instant::now() });
    }

    pub fn get(&self, key: &InstrumentKey) -> Option<Tick> {
        self.ticks.get(key).map(|c| c.tick.clone())
    }

    pub fn ltp(&self, key: &InstrumentKey) -> Option<f64> {
        self.ticks.get(key).map(|c| c.tick.ltp)
    }

    pub fn age(&self, key: &InstrumentKey) -> Option<Duration> {
        self.ticks.get(key).map(|c| c.written_at.elapsed())
    }

    /// A key that was never written counts as stale.
    pub fn is_stale(&self, key: &InstrumentKey, max_age: Duration) -> bool {
        self.age(key).map_or(true, |age| age > max_age)
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}

pub struct FeedHub {
    cache: Arc<TickCache>,
    subscriptions: DashMap<InstrumentKey, (), RandomState>,
    handlers: RwLock<Vec<(String, TickHandler)>>,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl FeedHub {
    pub fn new(cache: Arc<TickCache>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            cache,
            subscriptions: DashMap::with_hasher(RandomState::new()),
            handlers: RwLock::new(Vec::new()),
            stopped: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn cache(&self) -> &Arc<TickCache> {
        &self.cache
    }

    /// Idempotent. Returns true only the first time a key is added.
    pub fn subscribe(&self, segment: Segment, security_id: &str) -> bool {
        let key = InstrumentKey::new(segment, security_id);
        let fresh = self.subscriptions.insert(key.clone(), ()).is_none();
        if fresh {
            info!(instrument = %key, "subscribed");
        }
        fresh
    }

    pub fn is_subscribed(&self, key: &InstrumentKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn subscriptions(&self) -> Vec<InstrumentKey> {
        let mut keys: Vec<InstrumentKey> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn on_tick(&self, name: &str, handler: TickHandler) {
        self.handlers.write().push((name.to_string(), handler));
    }

    /// Cache first, listeners after. Returns false for unsubscribed keys.
    pub fn ingest(&self, tick: Tick) -> bool {
        let key = tick.key();
        if !self.is_subscribed(&key) {
            debug!(instrument = %key, "tick for unsubscribed instrument dropped");
            return false;
        }
        TICKS.inc();
        TICKS_BY_SEGMENT.with_label_values(&[tick.segment.as_str()]).inc();

        self.cache.put(tick.clone());
        self.notify(&tick);
        true
    }

    fn notify(&self, tick: &Tick) {
        // clone daftar handler supaya lock tidak ditahan selama callback
        let handlers: Vec<(String, TickHandler)> = self.handlers.read().clone();
        for (name, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(tick))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    TICK_HANDLER_FAILURES.inc();
                    warn!(handler = %name, error = %e, "tick handler failed");
                }
                Err(_) => {
                    TICK_HANDLER_FAILURES.inc();
                    error!(handler = %name, "tick handler panicked");
                }
            }
        }
    }

    /// Drain a broker tick stream until `stop` or the stream ends. A closed
    /// stream stops the hub for good.
    pub async fn run(&self, mut rx: mpsc::Receiver<Tick>) {
        let mut stop_rx = self.stop_tx.subscribe();
        if self.is_stopped() {
            return;
        }
        info!(subscriptions = self.subscriptions.len(), "feed hub: started");
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                msg = rx.recv() => match msg {
                    Some(tick) => { self.ingest(tick); }
                    None => {
                        // hub ikut berhenti, run() berikutnya langsung pulang
                        warn!("feed hub: stream closed, not reconnecting");
                        self.stop();
                        break;
                    }
                },
            }
        }
        info!("feed hub: stopped");
    }

    /// Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_tx.send_replace(true);
            info!("feed hub: stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Random-walk generator per instrument, one round every `every`.
/// Returns when the receiving side goes away.
pub async fn run_mock(tx: mpsc::Sender<Tick>, keys: Vec<InstrumentKey>, start_px: f64, every: Duration) {
    let mut px: Vec<f64> = vec![start_px; keys.len()];
    loop {
        for (i, key) in keys.iter().enumerate() {
            // jangan simpan ThreadRng melewati .await
            let step: f64 = rand::thread_rng().gen_range(-0.5..=0.5);
            px[i] = ((px[i] + step) * 20.0).round() / 20.0;
            px[i] = px[i].max(0.05);
            let tick = Tick {
                segment: key.segment,
                security_id: key.security_id.clone(),
                ltp: px[i],
                bid: (px[i] - 0.05).max(0.05),
                ask: px[i] + 0.05,
                timestamp: Utc::now(),
            };
            if tx.send(tick).await.is_err() {
                debug!("mock feed: receiver dropped");
                return;
            }
        }
        sleep(every).await;
    }
}
