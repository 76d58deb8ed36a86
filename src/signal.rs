// ===============================
// src/signal.rs
// ===============================
//
// Seam to the strategy collaborator. Indicator maths proper lives outside
// this crate; the built-in MovingAverageCrossover is the simple
// trend-following source the binary runs with.
//
// MA crossover:
//   MA cepat menembus ke atas MA lambat  -> Long  (golden cross)
//   MA cepat menembus ke bawah MA lambat -> Short (dead cross)
//   Dihitung dari close bar (BarCache), bukan per tick; series stale -> tidak ada sinyal.
//
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use chrono::Utc;
use dashmap::DashMap;

use crate::bars::BarCache;
use crate::config::{SignalCfg, WatchlistEntry};
use crate::domain::{Bias, InstrumentKey, Signal};
use crate::metrics::SIGNALS;

pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    /// Polled once per cycle per instrument.
    fn signal(&self, entry: &WatchlistEntry) -> Option<Signal>;
}

pub struct MovingAverageCrossover {
    bars: Arc<BarCache>,
    fast: usize,
    slow: usize,
    max_bar_age: Duration,
    prev_sign: DashMap<InstrumentKey, i8, RandomState>,
}

fn sma(closes: &[f64], w: usize) -> Option<f64> {
    if w == 0 || closes.len() < w {
        return None;
    }
    let tail = &closes[closes.len() - w..];
    Some(tail.iter().sum::<f64>() / w as f64)
}

impl MovingAverageCrossover {
    pub fn new(bars: Arc<BarCache>, fast: usize, slow: usize, max_bar_age: Duration) -> Self {
        Self { bars, fast, slow, max_bar_age, prev_sign: DashMap::with_hasher(RandomState::new()) }
    }

    pub fn from_cfg(bars: Arc<BarCache>, cfg: &SignalCfg) -> Self {
        Self::new(bars, cfg.fast, cfg.slow, cfg.max_bar_age)
    }
}

impl SignalSource for MovingAverageCrossover {
    fn name(&self) -> &str {
        "ma_crossover"
    }

    fn signal(&self, entry: &WatchlistEntry) -> Option<Signal> {
        let key = entry.instrument();
        let closes = self.bars.closes(&key, self.max_bar_age)?;
        let fast = sma(&closes, self.fast)?;
        let slow = sma(&closes, self.slow)?;
        let diff = fast - slow;
        let cur_sign: i8 = if diff > 0.0 {
            1
        } else if diff < 0.0 {
            -1
        } else {
            0
        };
        if cur_sign == 0 {
            return None;
        }

        // sinyal hanya saat sign berubah; observasi pertama hanya mengisi state
        let prev = self.prev_sign.insert(key.clone(), cur_sign);
        match prev {
            Some(p) if p != 0 && p != cur_sign => {
                let confidence = if slow > 0.0 { (diff.abs() / slow * 100.0).min(1.0) } else { 0.0 };
                SIGNALS.inc();
                Some(Signal {
                    instrument: key,
                    bias: if cur_sign > 0 { Bias::Long } else { Bias::Short },
                    confidence,
                    source: self.name().to_string(),
                    ts: Utc::now(),
                })
            }
            _ => None,
        }
    }
}
