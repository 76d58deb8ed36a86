// ===============================
// src/positions.rs (PnL & Inventory arithmetic)
// ===============================
//
// Intraday book per position key: day buy/sell quantities with their
// average prices. Realized = matched qty * (sell_avg - buy_avg), unrealized
// marks the open remainder against the last traded price.
//
use chrono::{NaiveDate, Utc};

use crate::domain::{PositionRecord, Side};

pub fn apply_fill(pos: &mut PositionRecord, side: Side, qty: i64, px: f64) {
    if qty <= 0 || !px.is_finite() {
        return;
    }
    match side {
        Side::Buy => {
            pos.buy_avg = weighted_avg(pos.buy_avg, pos.buy_qty, px, qty);
            pos.buy_qty += qty;
        }
        Side::Sell => {
            pos.sell_avg = weighted_avg(pos.sell_avg, pos.sell_qty, px, qty);
            pos.sell_qty += qty;
        }
    }
    pos.net_qty = pos.buy_qty - pos.sell_qty;
    let matched = pos.buy_qty.min(pos.sell_qty);
    pos.realized = matched as f64 * (pos.sell_avg - pos.buy_avg);
    pos.updated_at = Utc::now();
}

fn weighted_avg(avg: f64, qty: i64, px: f64, add: i64) -> f64 {
    let total = qty + add;
    if total == 0 {
        0.0
    } else {
        (avg * qty as f64 + px * add as f64) / total as f64
    }
}

/// Re-mark the open remainder. Returns true if the value changed.
pub fn mark_to_market(pos: &mut PositionRecord, ltp: f64) -> bool {
    if !ltp.is_finite() || ltp <= 0.0 {
        return false;
    }
    let u = if pos.net_qty > 0 {
        pos.net_qty as f64 * (ltp - pos.buy_avg)
    } else if pos.net_qty < 0 {
        (-pos.net_qty) as f64 * (pos.sell_avg - ltp)
    } else {
        0.0
    };
    if (u - pos.unrealized).abs() < 1e-9 {
        return false;
    }
    pos.unrealized = u;
    pos.updated_at = Utc::now();
    true
}

/// P&L counted against `today` (UTC): realized of books touched today plus
/// unrealized of every open remainder.
pub fn day_pnl<'a>(positions: impl IntoIterator<Item = &'a PositionRecord>, today: NaiveDate) -> f64 {
    positions
        .into_iter()
        .map(|p| {
            let realized = if p.updated_at.date_naive() == today { p.realized } else { 0.0 };
            realized + p.unrealized
        })
        .sum()
}

/// Capital tied up in the open remainder, at entry prices.
pub fn deployed_capital(pos: &PositionRecord) -> f64 {
    if pos.net_qty > 0 {
        pos.net_qty as f64 * pos.buy_avg
    } else if pos.net_qty < 0 {
        (-pos.net_qty) as f64 * pos.sell_avg
    } else {
        0.0
    }
}
