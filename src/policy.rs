// ===============================
// src/policy.rs
// ===============================
//
// Signal + harga terakhir + config -> Decision (atau tidak ada).
//
//   risk_per_unit = clamp(price*stop_pct, price*min_stop_pct, price*0.95)
//   long : stop = max(price - risk, price*0.05), target = price + max(rr*risk, price*target_pct)
//   short: stop = min(price + risk, price*1.95), target = price - max(rr*risk, price*target_pct)
//   Semua harga dibulatkan ke tick size instrumen.
//
use std::collections::BTreeMap;

use crate::config::{WatchlistEntry, MAX_STOP_FRACTION};
use crate::domain::{Action, Bias, Decision, Signal};
use crate::error::StageError;
use crate::metrics::DECISIONS;

const MIN_PRICE_FRACTION: f64 = 0.05;

/// Nearest multiple of `tick`, with float noise trimmed.
pub fn round_to_tick(px: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return px;
    }
    let v = (px / tick).round() * tick;
    (v * 1e8).round() / 1e8
}

pub fn decide(signal: &Signal, price: f64, entry: &WatchlistEntry) -> Result<Option<Decision>, StageError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(StageError::Contract(format!("non-positive price {price} for {}", entry.trading_symbol)));
    }
    let p = &entry.params;
    if !p.enabled || signal.bias == Bias::Neutral || signal.confidence < p.min_confidence {
        return Ok(None);
    }
    let tick = entry.tick_size;

    let risk = (price * p.stop_loss_pct)
        .max(price * p.min_stop_loss_pct)
        .min(price * MAX_STOP_FRACTION);
    let reward = (p.risk_reward * risk).max(price * p.target_pct);

    let entry_price = round_to_tick(price, tick);
    let (stop_loss, take_profit) = match signal.bias {
        Bias::Long => {
            let sl = round_to_tick((price - risk).max(price * MIN_PRICE_FRACTION), tick);
            let mut tp = round_to_tick(price + reward, tick);
            if tp <= entry_price {
                tp = round_to_tick(entry_price + tick, tick);
            }
            (sl, tp)
        }
        Bias::Short => {
            let sl = round_to_tick((price + risk).min(price * (2.0 - MIN_PRICE_FRACTION)), tick);
            let mut tp = round_to_tick((price - reward).max(tick), tick);
            if tp >= entry_price {
                tp = round_to_tick((entry_price - tick).max(tick), tick);
            }
            (sl, tp)
        }
        Bias::Neutral => return Ok(None),
    };

    let mut metadata = BTreeMap::new();
    metadata.insert("source".to_string(), signal.source.clone());
    metadata.insert("confidence".to_string(), format!("{:.4}", signal.confidence));
    metadata.insert("signal_ts".to_string(), signal.ts.to_rfc3339());

    DECISIONS.inc();
    Ok(Some(Decision {
        instrument: entry.instrument(),
        symbol: entry.trading_symbol.clone(),
        direction: signal.bias,
        action: Action::Enter,
        risk_per_unit: round_to_tick(risk, tick),
        entry_price,
        stop_loss,
        take_profit,
        quantity: 0,
        metadata,
    }))
}
