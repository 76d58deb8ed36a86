// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : fno_bot_rust — intraday derivatives trading core in Rust
Module  : config.rs
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
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use serde::Deserialize;

use crate::domain::{InstrumentKey, ProductType, Segment};
use crate::error::ConfigError;

/// Hard ceiling on stop distance as a fraction of price.
pub const MAX_STOP_FRACTION: f64 = 0.95;

#[derive(Clone, Debug)]
pub struct RunnerCfg {
    pub poll_interval: Duration,
    /// Jeda antar instrumen dalam satu cycle (hindari burst ke broker)
    pub stagger: Duration,
    pub stop_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct RateCfg {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

#[derive(Clone, Debug)]
pub struct BackoffCfg {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Fraction of the un-jittered delay added at most as jitter.
    pub jitter: f64,
    pub max_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct RiskCfg {
    pub trading_enabled: bool,
    pub max_tick_age: Duration,
    pub max_daily_loss: f64,
    pub max_trades_per_day: u32,
}

#[derive(Clone, Debug)]
pub struct SignalCfg {
    pub bar_secs: i64,
    pub max_bars: usize,
    pub fast: usize,
    pub slow: usize,
    pub max_bar_age: Duration,
}

/// Per-instrument strategy knobs. Global defaults come from env, the
/// watchlist may override any of them.
#[derive(Clone, Debug, PartialEq)]
pub struct StrategyParams {
    pub stop_loss_pct: f64,
    pub min_stop_loss_pct: f64,
    pub risk_reward: f64,
    pub target_pct: f64,
    pub min_confidence: f64,
    pub allocation_pct: f64,
    pub min_lots: i64,
    pub max_lots: Option<i64>,
    pub trailing_jump: f64,
    pub enabled: bool,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.30,
            min_stop_loss_pct: 0.10,
            risk_reward: 2.0,
            target_pct: 0.20,
            min_confidence: 0.0,
            allocation_pct: 0.25,
            min_lots: 1,
            max_lots: None,
            trailing_jump: 0.0,
            enabled: true,
        }
    }
}

impl StrategyParams {
    pub fn merged(&self, o: &InstrumentOverrides) -> StrategyParams {
        StrategyParams {
            stop_loss_pct: o.stop_loss_pct.unwrap_or(self.stop_loss_pct),
            min_stop_loss_pct: o.min_stop_loss_pct.unwrap_or(self.min_stop_loss_pct),
            risk_reward: o.risk_reward.unwrap_or(self.risk_reward),
            target_pct: o.target_pct.unwrap_or(self.target_pct),
            min_confidence: o.min_confidence.unwrap_or(self.min_confidence),
            allocation_pct: o.allocation_pct.unwrap_or(self.allocation_pct),
            min_lots: o.min_lots.unwrap_or(self.min_lots),
            max_lots: o.max_lots.or(self.max_lots),
            trailing_jump: o.trailing_jump.unwrap_or(self.trailing_jump),
            enabled: o.enabled.unwrap_or(self.enabled),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fraction("stop_loss_pct", self.stop_loss_pct)?;
        fraction("min_stop_loss_pct", self.min_stop_loss_pct)?;
        fraction("allocation_pct", self.allocation_pct)?;
        if self.min_stop_loss_pct > MAX_STOP_FRACTION {
            return Err(ConfigError::invalid("min_stop_loss_pct", "must not exceed 0.95"));
        }
        if !(self.risk_reward.is_finite() && self.risk_reward > 0.0) {
            return Err(ConfigError::invalid("risk_reward", "must be > 0"));
        }
        if !(self.target_pct.is_finite() && self.target_pct >= 0.0) {
            return Err(ConfigError::invalid("target_pct", "must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::invalid("min_confidence", "must be within [0, 1]"));
        }
        if self.min_lots < 0 {
            return Err(ConfigError::invalid("min_lots", "must be >= 0"));
        }
        if let Some(max) = self.max_lots {
            if max < 1 || max < self.min_lots {
                return Err(ConfigError::invalid("max_lots", "must be >= 1 and >= min_lots"));
            }
        }
        if !(self.trailing_jump.is_finite() && self.trailing_jump >= 0.0) {
            return Err(ConfigError::invalid("trailing_jump", "must be >= 0"));
        }
        Ok(())
    }
}

fn fraction(key: &str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && v > 0.0 && v <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(key, format!("{v} is not within (0, 1]")))
    }
}

/// Enumerated override set. Unknown keys are rejected at load time.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentOverrides {
    pub stop_loss_pct: Option<f64>,
    pub min_stop_loss_pct: Option<f64>,
    pub risk_reward: Option<f64>,
    pub target_pct: Option<f64>,
    pub min_confidence: Option<f64>,
    pub allocation_pct: Option<f64>,
    pub min_lots: Option<i64>,
    pub max_lots: Option<i64>,
    pub trailing_jump: Option<f64>,
    pub enabled: Option<bool>,
}

fn default_product() -> ProductType {
    ProductType::Intraday
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchlistEntry {
    pub segment: Segment,
    pub security_id: String,
    pub trading_symbol: String,
    pub lot_size: i64,
    pub tick_size: f64,
    #[serde(default = "default_product")]
    pub product_type: ProductType,
    #[serde(default)]
    pub overrides: InstrumentOverrides,
    /// Resolved at load time from defaults + overrides.
    #[serde(skip)]
    pub params: StrategyParams,
}

impl WatchlistEntry {
    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(self.segment, self.security_id.clone())
    }

    /// Merge overrides into `defaults` and check the entry is usable.
    pub fn resolve(&mut self, defaults: &StrategyParams) -> Result<(), ConfigError> {
        if self.security_id.trim().is_empty() {
            return Err(ConfigError::invalid("security_id", "must not be empty"));
        }
        if self.lot_size <= 0 {
            return Err(ConfigError::invalid(
                format!("{}.lot_size", self.trading_symbol),
                "must be > 0",
            ));
        }
        if !(self.tick_size.is_finite() && self.tick_size > 0.0) {
            return Err(ConfigError::invalid(
                format!("{}.tick_size", self.trading_symbol),
                "must be > 0",
            ));
        }
        let params = defaults.merged(&self.overrides);
        params.validate().map_err(|e| match e {
            ConfigError::Invalid { key, reason } => {
                ConfigError::invalid(format!("{}.{}", self.trading_symbol, key), reason)
            }
            other => other,
        })?;
        self.params = params;
        Ok(())
    }
}

/// Parse a JSON watchlist (array of entries) and resolve every entry.
pub fn parse_watchlist(raw: &str, defaults: &StrategyParams) -> Result<Vec<WatchlistEntry>, ConfigError> {
    let mut entries: Vec<WatchlistEntry> = serde_json::from_str(raw)?;
    let mut seen = std::collections::HashSet::new();
    for e in entries.iter_mut() {
        e.resolve(defaults)?;
        if !seen.insert(e.instrument()) {
            return Err(ConfigError::invalid(
                "watchlist",
                format!("duplicate instrument {}", e.instrument()),
            ));
        }
    }
    Ok(entries)
}

pub fn load_watchlist(path: &Path, defaults: &StrategyParams) -> Result<Vec<WatchlistEntry>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_watchlist(&raw, defaults)
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub event_log: PathBuf,
    pub watchlist_file: Option<PathBuf>,
    pub metrics_port: u16,
    pub capital: f64,
    pub reconcile_interval: Duration,
    pub runner: RunnerCfg,
    pub rate: RateCfg,
    pub backoff: BackoffCfg,
    pub risk: RiskCfg,
    pub signal: SignalCfg,
    pub defaults: StrategyParams,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(key, default_ms))
}

pub fn load() -> Result<Settings, ConfigError> {
    // Pastikan .env dibaca (STATE_DIR, WATCHLIST_FILE, dll)
    let _ = dotenv();

    let state_dir: PathBuf = env_or("STATE_DIR", PathBuf::from("state"));
    let event_log = env::var("EVENT_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| state_dir.join("events.jsonl"));
    let watchlist_file = env::var("WATCHLIST_FILE").ok().map(PathBuf::from);

    let runner = RunnerCfg {
        poll_interval: env_ms("POLL_INTERVAL_MS", 5_000),
        stagger: env_ms("STAGGER_MS", 250),
        stop_timeout: env_ms("STOP_TIMEOUT_MS", 10_000),
    };

    let rate = RateCfg {
        capacity: env_or("RATE_CAPACITY", 10),
        refill_per_sec: env_or("RATE_PER_SEC", 10.0),
    };
    if rate.capacity == 0 || !(rate.refill_per_sec > 0.0) {
        return Err(ConfigError::invalid("RATE_CAPACITY/RATE_PER_SEC", "must be > 0"));
    }

    let backoff = BackoffCfg {
        base: env_ms("BACKOFF_BASE_MS", 500),
        multiplier: env_or("BACKOFF_MULTIPLIER", 2.0),
        max: env_ms("BACKOFF_MAX_MS", 30_000),
        jitter: env_or("BACKOFF_JITTER", 0.1),
        max_attempts: env_or("BACKOFF_MAX_ATTEMPTS", 3),
    };
    if backoff.multiplier < 1.0 || !(0.0..=1.0).contains(&backoff.jitter) {
        return Err(ConfigError::invalid("BACKOFF_*", "multiplier >= 1 and jitter in [0, 1]"));
    }

    let risk = RiskCfg {
        trading_enabled: env_or("TRADING_ENABLED", true),
        max_tick_age: env_ms("MAX_TICK_AGE_MS", 10_000),
        max_daily_loss: env_or("MAX_DAILY_LOSS", 5_000.0),
        max_trades_per_day: env_or("MAX_TRADES_PER_DAY", 10),
    };

    let signal = SignalCfg {
        bar_secs: env_or("BAR_SECS", 60),
        max_bars: env_or("MAX_BARS", 200),
        fast: env_or("MA_FAST", 9),
        slow: env_or("MA_SLOW", 21),
        max_bar_age: env_ms("MAX_BAR_AGE_MS", 120_000),
    };
    if signal.bar_secs <= 0 || signal.fast == 0 || signal.fast >= signal.slow || signal.max_bars < signal.slow + 1 {
        return Err(ConfigError::invalid("BAR_SECS/MA_*", "need bar_secs > 0, 0 < fast < slow < max_bars"));
    }

    let base = StrategyParams::default();
    let defaults = StrategyParams {
        stop_loss_pct: env_or("STOP_LOSS_PCT", base.stop_loss_pct),
        min_stop_loss_pct: env_or("MIN_STOP_LOSS_PCT", base.min_stop_loss_pct),
        risk_reward: env_or("RISK_REWARD", base.risk_reward),
        target_pct: env_or("TARGET_PCT", base.target_pct),
        min_confidence: env_or("MIN_CONFIDENCE", base.min_confidence),
        allocation_pct: env_or("ALLOCATION_PCT", base.allocation_pct),
        min_lots: env_or("MIN_LOTS", base.min_lots),
        max_lots: env::var("MAX_LOTS").ok().and_then(|s| s.parse().ok()),
        trailing_jump: env_or("TRAILING_JUMP", base.trailing_jump),
        enabled: true,
    };
    defaults.validate()?;

    Ok(Settings {
        state_dir,
        event_log,
        watchlist_file,
        metrics_port: env_or("METRICS_PORT", 9898),
        capital: env_or("CAPITAL", 100_000.0),
        reconcile_interval: env_ms("RECONCILE_INTERVAL_MS", 30_000),
        runner,
        rate,
        backoff,
        risk,
        signal,
        defaults,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WATCHLIST: &str = r#"[
        {"segment": "NSE_FNO", "security_id": "35001", "trading_symbol": "NIFTY-CE",
         "lot_size": 75, "tick_size": 0.05,
         "overrides": {"stop_loss_pct": 0.25, "min_lots": 2}},
        {"segment": "BSE_FNO", "security_id": "8812", "trading_symbol": "SENSEX-PE",
         "lot_size": 20, "tick_size": 0.05, "product_type": "MARGIN"}
    ]"#;

    #[test]
    fn overrides_merge_over_defaults() {
        let list = parse_watchlist(WATCHLIST, &StrategyParams::default()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].params.stop_loss_pct, 0.25);
        assert_eq!(list[0].params.min_lots, 2);
        assert_eq!(list[0].params.risk_reward, 2.0);
        assert_eq!(list[1].product_type, ProductType::Margin);
        assert_eq!(list[1].params, StrategyParams::default());
    }

    #[test]
    fn unknown_override_key_is_rejected() {
        let raw = r#"[{"segment": "NSE_FNO", "security_id": "1", "trading_symbol": "X",
            "lot_size": 1, "tick_size": 0.05, "overrides": {"stop_pct": 0.2}}]"#;
        let err = parse_watchlist(raw, &StrategyParams::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn out_of_range_override_is_rejected() {
        let raw = r#"[{"segment": "NSE_FNO", "security_id": "1", "trading_symbol": "X",
            "lot_size": 1, "tick_size": 0.05, "overrides": {"allocation_pct": 1.5}}]"#;
        let err = parse_watchlist(raw, &StrategyParams::default()).unwrap_err();
        match err {
            ConfigError::Invalid { key, .. } => assert_eq!(key, "X.allocation_pct"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_positive_lot_size_is_rejected() {
        let raw = r#"[{"segment": "NSE_FNO", "security_id": "1", "trading_symbol": "X",
            "lot_size": 0, "tick_size": 0.05}]"#;
        assert!(parse_watchlist(raw, &StrategyParams::default()).is_err());
    }

    #[test]
    fn duplicate_instruments_are_rejected() {
        let raw = r#"[
            {"segment": "NSE_FNO", "security_id": "1", "trading_symbol": "X", "lot_size": 1, "tick_size": 0.05},
            {"segment": "NSE_FNO", "security_id": "1", "trading_symbol": "Y", "lot_size": 1, "tick_size": 0.05}
        ]"#;
        assert!(parse_watchlist(raw, &StrategyParams::default()).is_err());
    }
}
