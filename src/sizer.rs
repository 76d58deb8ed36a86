// ===============================
// src/sizer.rs
// ===============================
//
// Lot sizing dari cash yang tersedia:
//   lots = floor(cash * allocation_pct / (premium * lot_size))
//   lots < min_lots tapi cash cukup untuk min_lots -> pakai min_lots
//   max_lots (opsional) sebagai batas atas
//
use crate::config::WatchlistEntry;
use crate::error::StageError;

/// Whole lots affordable for one entry. Zero means "skip".
pub fn lots(cash: f64, premium: f64, entry: &WatchlistEntry) -> Result<i64, StageError> {
    if entry.lot_size <= 0 {
        return Err(StageError::Contract(format!("lot_size {} for {}", entry.lot_size, entry.trading_symbol)));
    }
    if !premium.is_finite() || premium <= 0.0 {
        return Err(StageError::Contract(format!("premium {premium} for {}", entry.trading_symbol)));
    }
    if !cash.is_finite() || cash <= 0.0 {
        return Ok(0);
    }
    let p = &entry.params;
    let lot_cost = premium * entry.lot_size as f64;
    let budget = cash * p.allocation_pct;
    let mut n = (budget / lot_cost).floor() as i64;

    if n < p.min_lots && p.min_lots > 0 && cash >= p.min_lots as f64 * lot_cost {
        n = p.min_lots;
    }
    if let Some(cap) = p.max_lots {
        n = n.min(cap);
    }
    Ok(n.max(0))
}

/// Quantity in units (lots * lot_size).
pub fn quantity(cash: f64, premium: f64, entry: &WatchlistEntry) -> Result<i64, StageError> {
    let n = lots(cash, premium, entry)?;
    n.checked_mul(entry.lot_size).ok_or_else(|| {
        StageError::Contract(format!("{n} lots x {} overflows for {}", entry.lot_size, entry.trading_symbol))
    })
}
