// ===============================
// src/bars.rs
// ===============================
//
// Short-lived OHLC bars built from the tick stream. Fed by a FeedHub
// listener; a series nobody has written to for `max_age` reads as stale.
//
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::SignalCfg;
use crate::domain::{InstrumentKey, Tick};
use crate::feed::{HandlerError, TickHandler};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bar {
    pub start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub ticks: u32,
}

impl Bar {
    fn open_at(start: DateTime<Utc>, px: f64) -> Self {
        Self { start, open: px, high: px, low: px, close: px, ticks: 1 }
    }

    fn update(&mut self, px: f64) {
        self.high = self.high.max(px);
        self.low = self.low.min(px);
        self.close = px;
        self.ticks += 1;
    }
}

#[derive(Debug)]
struct Series {
    bars: VecDeque<Bar>,
    written_at: Instant,
}

#[derive(Debug)]
pub struct BarCache {
    width_secs: i64,
    max_bars: usize,
    series: DashMap<InstrumentKey, Series, RandomState>,
}

impl BarCache {
    pub fn new(width_secs: i64, max_bars: usize) -> Self {
        Self {
            width_secs: width_secs.max(1),
            max_bars: max_bars.max(1),
            series: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn from_cfg(cfg: &SignalCfg) -> Self {
        Self::new(cfg.bar_secs, cfg.max_bars)
    }

    fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let start = secs - secs.rem_euclid(self.width_secs);
        Utc.timestamp_opt(start, 0).single().unwrap_or(ts)
    }

    pub fn on_tick(&self, tick: &Tick) {
        if !tick.ltp.is_finite() || tick.ltp <= 0.0 {
            return;
        }
        let start = self.bucket_start(tick.timestamp);
        let mut series = self
            .series
            .entry(tick.key())
            .or_insert_with(|| Series { bars: VecDeque::with_capacity(self.max_bars), written_at: Instant::now() });

        let last_start = series.bars.back().map(|b| b.start);
        match last_start {
            Some(s) if s == start => {
                if let Some(last) = series.bars.back_mut() {
                    last.update(tick.ltp);
                }
            }
            // tick terlambat (bucket sudah lewat) -> abaikan
            Some(s) if s > start => return,
            _ => {
                if series.bars.len() == self.max_bars {
                    series.bars.pop_front();
                }
                series.bars.push_back(Bar::open_at(start, tick.ltp));
            }
        }
        series.written_at = Instant::now();
    }

    /// Listener to register on the FeedHub.
    pub fn handler(self: &Arc<Self>) -> TickHandler {
        let cache = Arc::clone(self);
        Arc::new(move |tick: &Tick| -> Result<(), HandlerError> {
            cache.on_tick(tick);
            Ok(())
        })
    }

    pub fn age(&self, key: &InstrumentKey) -> Option<Duration> {
        self.series.get(key).map(|s| s.written_at.elapsed())
    }

    /// Closing prices oldest first, or `None` when the series is stale.
    pub fn closes(&self, key: &InstrumentKey, max_age: Duration) -> Option<Vec<f64>> {
        let series = self.series.get(key)?;
        if series.written_at.elapsed() > max_age {
            return None;
        }
        Some(series.bars.iter().map(|b| b.close).collect())
    }

    pub fn bars(&self, key: &InstrumentKey) -> Vec<Bar> {
        self.series.get(key).map(|s| s.bars.iter().cloned().collect()).unwrap_or_default()
    }
}
