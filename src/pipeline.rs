// ===============================
// src/pipeline.rs
// ===============================
//
// Satu cycle per instrument:
//   tick -> signal -> Policy -> Sizer -> RiskGuard -> Executor
// Error dari stage mana pun berhenti di sini: dicatat dengan nama komponennya
// dan dianggap "tidak ada decision cycle ini".
//
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::config::WatchlistEntry;
use crate::domain::OrderRecord;
use crate::error::StageError;
use crate::executor::Executor;
use crate::feed::TickCache;
use crate::metrics::CYCLE_FAILURES;
use crate::positions::{day_pnl, deployed_capital};
use crate::risk::RiskGuard;
use crate::signal::SignalSource;
use crate::store::StateStore;
use crate::{policy, sizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Policy,
    Sizer,
    Executor,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Policy => "policy",
            Stage::Sizer => "sizer",
            Stage::Executor => "executor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Disabled,
    NoTick,
    NoSignal,
    NoDecision,
    ZeroQuantity,
    Denied(&'static str),
    Executed(OrderRecord),
    Failed { stage: Stage, error: String },
}

pub struct Pipeline {
    ticks: Arc<TickCache>,
    signals: Arc<dyn SignalSource>,
    risk: Arc<RiskGuard>,
    executor: Executor,
    store: Arc<StateStore>,
    capital: f64,
}

impl Pipeline {
    pub fn new(
        ticks: Arc<TickCache>,
        signals: Arc<dyn SignalSource>,
        risk: Arc<RiskGuard>,
        executor: Executor,
        store: Arc<StateStore>,
        capital: f64,
    ) -> Self {
        Self { ticks, signals, risk, executor, store, capital }
    }

    pub fn risk(&self) -> &Arc<RiskGuard> {
        &self.risk
    }

    /// Capital not tied up in open positions.
    pub fn available_cash(&self) -> f64 {
        let deployed: f64 = self.store.positions().iter().map(deployed_capital).sum();
        self.capital - deployed
    }

    pub async fn run_cycle(&self, entry: &WatchlistEntry) -> CycleOutcome {
        if !entry.params.enabled {
            return CycleOutcome::Disabled;
        }
        let key = entry.instrument();
        let Some(tick) = self.ticks.get(&key) else {
            return CycleOutcome::NoTick;
        };
        let Some(signal) = self.signals.signal(entry) else {
            return CycleOutcome::NoSignal;
        };

        let mut decision = match policy::decide(&signal, tick.ltp, entry) {
            Ok(Some(d)) => d,
            Ok(None) => return CycleOutcome::NoDecision,
            Err(e) => return fail(Stage::Policy, entry, e),
        };

        let qty = match sizer::quantity(self.available_cash(), decision.entry_price, entry) {
            Ok(q) => q,
            Err(e) => return fail(Stage::Sizer, entry, e),
        };
        if qty <= 0 {
            debug!(symbol = %entry.trading_symbol, "pipeline: sized to zero, skip");
            return CycleOutcome::ZeroQuantity;
        }
        decision.quantity = qty;

        let pnl = day_pnl(&self.store.positions(), Utc::now().date_naive());
        if let Err(denial) = self.risk.allow_entry(&decision, pnl) {
            return CycleOutcome::Denied(denial.code());
        }

        match self.executor.execute(&decision, entry).await {
            Ok(rec) => {
                self.risk.record_trade();
                info!(
                    symbol = %entry.trading_symbol,
                    kind = decision.kind_label(),
                    qty,
                    client_ref = %rec.client_ref,
                    "pipeline: executed"
                );
                CycleOutcome::Executed(rec)
            }
            Err(e) => fail(Stage::Executor, entry, e),
        }
    }
}

fn fail(stage: Stage, entry: &WatchlistEntry, e: StageError) -> CycleOutcome {
    CYCLE_FAILURES.with_label_values(&[stage.as_str()]).inc();
    error!(component = stage.as_str(), symbol = %entry.trading_symbol, error = %e, "cycle aborted");
    CycleOutcome::Failed { stage, error: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::config::{parse_watchlist, BackoffCfg, RiskCfg, StrategyParams};
    use crate::domain::{Bias, Segment, Signal, Tick};
    use crate::error::BrokerError;
    use crate::ratelimit::{BrokerGuard, TokenBucket};
    use crate::domain::{PositionKey, ProductType};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Hands out whatever was queued last.
    struct Scripted(Mutex<Option<Signal>>);

    impl SignalSource for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn signal(&self, _entry: &WatchlistEntry) -> Option<Signal> {
            self.0.lock().take()
        }
    }

    struct Rig {
        _dir: TempDir,
        pipeline: Pipeline,
        signals: Arc<Scripted>,
        ticks: Arc<TickCache>,
        broker: Arc<PaperBroker>,
        store: Arc<StateStore>,
    }

    fn rig(capital: f64) -> Rig {
        rig_with(capital, 1e9)
    }

    fn rig_with(capital: f64, max_daily_loss: f64) -> Rig {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path(), &dir.path().join("events.jsonl")));
        let ticks = Arc::new(TickCache::new());
        let broker = Arc::new(PaperBroker::default());
        let guard = Arc::new(BrokerGuard::new(
            TokenBucket::new(5, 100.0),
            BackoffCfg { base: Duration::from_millis(1), multiplier: 2.0, max: Duration::from_millis(2), jitter: 0.0, max_attempts: 1 },
        ));
        let risk = Arc::new(RiskGuard::new(
            RiskCfg { trading_enabled: true, max_tick_age: Duration::from_secs(30), max_daily_loss, max_trades_per_day: 100 },
            ticks.clone(),
        ));
        let signals = Arc::new(Scripted(Mutex::new(None)));
        let executor = Executor::new(store.clone(), broker.clone(), guard);
        let pipeline = Pipeline::new(ticks.clone(), signals.clone(), risk, executor, store.clone(), capital);
        Rig { _dir: dir, pipeline, signals, ticks, broker, store }
    }

    fn entry() -> WatchlistEntry {
        let raw = r#"[{"segment": "NSE_FNO", "security_id": "1", "trading_symbol": "NIFTY-CE",
            "lot_size": 75, "tick_size": 0.05}]"#;
        parse_watchlist(raw, &StrategyParams::default()).unwrap().remove(0)
    }

    fn tick(ltp: f64) -> Tick {
        Tick { segment: Segment::NseFno, security_id: "1".into(), ltp, bid: ltp, ask: ltp, timestamp: Utc::now() }
    }

    fn long() -> Signal {
        Signal { instrument: entry().instrument(), bias: Bias::Long, confidence: 1.0, source: "scripted".into(), ts: Utc::now() }
    }

    #[tokio::test]
    async fn full_cycle_executes() {
        let r = rig(100_000.0);
        r.ticks.put(tick(100.0));
        *r.signals.0.lock() = Some(long());
        match r.pipeline.run_cycle(&entry()).await {
            // 25% of 100k = 25k / 7.5k per lot = 3 lots
            CycleOutcome::Executed(rec) => assert_eq!(rec.quantity, 225),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(r.broker.placed(), 1);
        assert_eq!(r.pipeline.risk().trades_today(), 1);
        assert_eq!(r.pipeline.available_cash(), 100_000.0 - 225.0 * 100.0);
    }

    #[tokio::test]
    async fn missing_inputs_short_circuit() {
        let r = rig(100_000.0);
        assert_eq!(r.pipeline.run_cycle(&entry()).await, CycleOutcome::NoTick);
        r.ticks.put(tick(100.0));
        assert_eq!(r.pipeline.run_cycle(&entry()).await, CycleOutcome::NoSignal);
    }

    #[tokio::test]
    async fn too_little_cash_sizes_to_zero() {
        let r = rig(1_000.0);
        r.ticks.put(tick(100.0));
        *r.signals.0.lock() = Some(long());
        assert_eq!(r.pipeline.run_cycle(&entry()).await, CycleOutcome::ZeroQuantity);
    }

    #[tokio::test]
    async fn denial_carries_reason_code() {
        let r = rig(100_000.0);
        r.pipeline.risk().set_trading_enabled(false);
        r.ticks.put(tick(100.0));
        *r.signals.0.lock() = Some(long());
        assert_eq!(r.pipeline.run_cycle(&entry()).await, CycleOutcome::Denied("trading_disabled"));
        assert_eq!(r.broker.placed(), 0);
    }

    #[tokio::test]
    async fn broker_failure_is_contained() {
        let r = rig(100_000.0);
        r.broker.inject_failures([BrokerError::Rejected("no margin".into())]);
        r.ticks.put(tick(100.0));
        *r.signals.0.lock() = Some(long());
        match r.pipeline.run_cycle(&entry()).await {
            CycleOutcome::Failed { stage, .. } => assert_eq!(stage, Stage::Executor),
            other => panic!("unexpected {other:?}"),
        }
        assert!(r.store.orders().is_empty());
        assert_eq!(r.pipeline.risk().trades_today(), 0);
    }

    #[tokio::test]
    async fn bad_price_fails_in_policy() {
        let r = rig(100_000.0);
        r.ticks.put(tick(0.0));
        *r.signals.0.lock() = Some(long());
        match r.pipeline.run_cycle(&entry()).await {
            CycleOutcome::Failed { stage, .. } => assert_eq!(stage, Stage::Policy),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn yesterdays_loss_does_not_block_today() {
        let r = rig_with(100_000.0, 10_000.0);
        let key = PositionKey { segment: Segment::NseFno, security_id: "9".into(), product_type: ProductType::Intraday };
        let mut flat = crate::domain::PositionRecord::empty(&key, "BANKNIFTY-PE");
        flat.realized = -9_000.0;
        flat.updated_at = Utc::now() - chrono::Duration::days(1);
        r.store.upsert_position(flat.clone());

        r.ticks.put(tick(100.0));
        *r.signals.0.lock() = Some(long());
        // entry risks 30 * 225 = 6750, under the cap on its own
        assert!(matches!(r.pipeline.run_cycle(&entry()).await, CycleOutcome::Executed(_)));

        // the same loss booked today trips the cap
        flat.updated_at = Utc::now();
        r.store.upsert_position(flat);
        *r.signals.0.lock() = Some(long());
        assert_eq!(r.pipeline.run_cycle(&entry()).await, CycleOutcome::Denied("daily_loss_cap"));
    }
}
