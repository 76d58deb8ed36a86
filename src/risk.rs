// ===============================
// src/risk.rs
// ===============================
//
// Pre-trade gates, dicek berurutan; gagal pertama langsung return:
//   1) trading_enabled flag
//   2) tick freshness (tick terakhir instrumen tidak lebih tua dari max_tick_age)
//   3) projected daily loss cap
//   4) max trades per hari (counter di-reset saat tanggal berganti)
//
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RiskCfg;
use crate::domain::Decision;
use crate::feed::TickCache;
use crate::metrics::ADMISSION_DENIED;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Denial {
    #[error("trading disabled")]
    TradingDisabled,
    #[error("tick stale or missing")]
    StaleTick,
    #[error("projected loss {projected:.2} exceeds cap {cap:.2}")]
    DailyLossCap { projected: f64, cap: f64 },
    #[error("{limit} trades already placed today")]
    MaxTradesPerDay { limit: u32 },
}

impl Denial {
    pub fn code(&self) -> &'static str {
        match self {
            Denial::TradingDisabled => "trading_disabled",
            Denial::StaleTick => "stale_tick",
            Denial::DailyLossCap { .. } => "daily_loss_cap",
            Denial::MaxTradesPerDay { .. } => "max_trades_per_day",
        }
    }
}

#[derive(Debug)]
struct DayCounters {
    date: NaiveDate,
    trades: u32,
}

impl DayCounters {
    fn roll(&mut self, today: NaiveDate) {
        if today != self.date {
            self.date = today;
            self.trades = 0;
        }
    }
}

#[derive(Debug)]
pub struct RiskGuard {
    cfg: RiskCfg,
    trading_enabled: AtomicBool,
    ticks: Arc<TickCache>,
    day: Mutex<DayCounters>,
}

impl RiskGuard {
    pub fn new(cfg: RiskCfg, ticks: Arc<TickCache>) -> Self {
        let enabled = cfg.trading_enabled;
        Self {
            cfg,
            trading_enabled: AtomicBool::new(enabled),
            ticks,
            day: Mutex::new(DayCounters { date: Utc::now().date_naive(), trades: 0 }),
        }
    }

    pub fn set_trading_enabled(&self, on: bool) {
        let was = self.trading_enabled.swap(on, Ordering::SeqCst);
        if was != on {
            info!(enabled = on, "risk guard: trading flag changed");
        }
    }

    pub fn trading_enabled(&self) -> bool {
        self.trading_enabled.load(Ordering::SeqCst)
    }

    /// `day_pnl` is today's P&L from [`crate::positions::day_pnl`] (negative = loss).
    pub fn allow_entry(&self, decision: &Decision, day_pnl: f64) -> Result<(), Denial> {
        let res = self.check(decision, day_pnl);
        if let Err(d) = &res {
            ADMISSION_DENIED.with_label_values(&[d.code()]).inc();
            warn!(symbol = %decision.symbol, reason = d.code(), detail = %d, "risk guard: entry denied");
        }
        res
    }

    fn check(&self, decision: &Decision, day_pnl: f64) -> Result<(), Denial> {
        // 1) master switch
        if !self.trading_enabled() {
            return Err(Denial::TradingDisabled);
        }

        // 2) tick freshness
        if self.ticks.is_stale(&decision.instrument, self.cfg.max_tick_age) {
            return Err(Denial::StaleTick);
        }

        // 3) projected loss = loss so far + worst case of this entry
        let worst = decision.risk_per_unit.abs() * decision.quantity.max(0) as f64;
        let projected = -day_pnl + worst;
        if self.cfg.max_daily_loss > 0.0 && projected > self.cfg.max_daily_loss {
            return Err(Denial::DailyLossCap { projected, cap: self.cfg.max_daily_loss });
        }

        // 4) trade count
        let mut day = self.day.lock();
        day.roll(Utc::now().date_naive());
        if day.trades >= self.cfg.max_trades_per_day {
            return Err(Denial::MaxTradesPerDay { limit: self.cfg.max_trades_per_day });
        }
        Ok(())
    }

    /// Count one placed entry against today's limit.
    pub fn record_trade(&self) {
        let mut day = self.day.lock();
        day.roll(Utc::now().date_naive());
        day.trades = day.trades.saturating_add(1);
    }

    pub fn trades_today(&self) -> u32 {
        let mut day = self.day.lock();
        day.roll(Utc::now().date_naive());
        day.trades
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, Bias, InstrumentKey, Segment, Tick};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn cfg() -> RiskCfg {
        RiskCfg {
            trading_enabled: true,
            max_tick_age: Duration::from_secs(5),
            max_daily_loss: 1_000.0,
            max_trades_per_day: 2,
        }
    }

    fn decision(qty: i64, risk: f64) -> Decision {
        Decision {
            instrument: InstrumentKey::new(Segment::NseFno, "1"),
            symbol: "NIFTY-CE".into(),
            direction: Bias::Long,
            action: Action::Enter,
            risk_per_unit: risk,
            entry_price: 100.0,
            stop_loss: 100.0 - risk,
            take_profit: 100.0 + 2.0 * risk,
            quantity: qty,
            metadata: BTreeMap::new(),
        }
    }

    fn fresh_cache() -> Arc<TickCache> {
        let cache = Arc::new(TickCache::new());
        cache.put(Tick {
            segment: Segment::NseFno,
            security_id: "1".into(),
            ltp: 100.0,
            bid: 99.95,
            ask: 100.05,
            timestamp: Utc::now(),
        });
        cache
    }

    #[test]
    fn passes_when_all_gates_pass() {
        let g = RiskGuard::new(cfg(), fresh_cache());
        assert_eq!(g.allow_entry(&decision(10, 5.0), 0.0), Ok(()));
    }

    #[test]
    fn disabled_flag_short_circuits() {
        // tick missing and loss over cap too, but the flag is reported first
        let g = RiskGuard::new(cfg(), Arc::new(TickCache::new()));
        g.set_trading_enabled(false);
        let d = g.allow_entry(&decision(1_000, 50.0), -5_000.0).unwrap_err();
        assert_eq!(d.code(), "trading_disabled");

        let ok = RiskGuard::new(cfg(), fresh_cache());
        ok.set_trading_enabled(false);
        assert_eq!(ok.allow_entry(&decision(1, 1.0), 0.0), Err(Denial::TradingDisabled));
    }

    #[test]
    fn missing_tick_is_stale() {
        let g = RiskGuard::new(cfg(), Arc::new(TickCache::new()));
        assert_eq!(g.allow_entry(&decision(1, 1.0), 0.0).unwrap_err().code(), "stale_tick");
    }

    #[test]
    fn projected_loss_includes_new_entry() {
        let g = RiskGuard::new(cfg(), fresh_cache());
        // 600 already lost + 10*50 at risk = 1100 > 1000
        let d = g.allow_entry(&decision(10, 50.0), -600.0).unwrap_err();
        assert_eq!(d.code(), "daily_loss_cap");
        assert!(g.allow_entry(&decision(10, 30.0), -600.0).is_ok());
    }

    #[test]
    fn trade_count_caps_entries() {
        let g = RiskGuard::new(cfg(), fresh_cache());
        g.record_trade();
        assert!(g.allow_entry(&decision(1, 1.0), 0.0).is_ok());
        g.record_trade();
        assert_eq!(g.trades_today(), 2);
        assert_eq!(g.allow_entry(&decision(1, 1.0), 0.0).unwrap_err().code(), "max_trades_per_day");
    }
}
