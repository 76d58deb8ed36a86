// ===============================
// src/executor.rs
// ===============================
//
// Decision (sudah di-size & lolos risk) -> order di broker.
// - client_ref = symbol + jenis decision + timestamp nanodetik
// - client_ref yang sudah dikenal store -> kembalikan record lama, tidak submit ulang
// - reservasi dicatat dulu (PENDING), lalu submit lewat BrokerGuard
// - gagal submit -> reservasi dihapus supaya cycle berikutnya bisa coba lagi
//
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::broker::{Broker, ModifyRequest, PlaceRequest};
use crate::config::WatchlistEntry;
use crate::domain::{Decision, OrderRecord, OrderStatus};
use crate::error::StageError;
use crate::metrics::{ORDERS, ORDERS_DEDUPED};
use crate::positions::apply_fill;
use crate::ratelimit::BrokerGuard;
use crate::store::{Reservation, Settlement, StateStore};

pub fn client_ref(decision: &Decision) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    format!("{}-{}-{}", decision.symbol, decision.kind_label(), nanos)
}

pub struct Executor {
    store: Arc<StateStore>,
    broker: Arc<dyn Broker>,
    guard: Arc<BrokerGuard>,
}

impl Executor {
    pub fn new(store: Arc<StateStore>, broker: Arc<dyn Broker>, guard: Arc<BrokerGuard>) -> Self {
        Self { store, broker, guard }
    }

    /// Submit under a fresh client reference.
    pub async fn execute(&self, decision: &Decision, entry: &WatchlistEntry) -> Result<OrderRecord, StageError> {
        self.submit(client_ref(decision), decision, entry).await
    }

    /// Submit under `client_ref`. A reference the store already knows
    /// returns the stored record and nothing reaches the broker.
    pub async fn submit(
        &self,
        client_ref: String,
        decision: &Decision,
        entry: &WatchlistEntry,
    ) -> Result<OrderRecord, StageError> {
        if decision.quantity <= 0 {
            return Err(StageError::Contract(format!("quantity {} for {}", decision.quantity, decision.symbol)));
        }
        let now = Utc::now();
        let side = decision.side();
        let mut rec = OrderRecord {
            client_ref: client_ref.clone(),
            broker_order_id: None,
            status: OrderStatus::Pending,
            segment: decision.instrument.segment,
            security_id: decision.instrument.security_id.clone(),
            trading_symbol: decision.symbol.clone(),
            side,
            product_type: entry.product_type,
            quantity: decision.quantity,
            filled_qty: 0,
            remaining_qty: decision.quantity,
            entry_price: decision.entry_price,
            target_price: decision.take_profit,
            stop_loss_price: decision.stop_loss,
            trailing_jump: entry.params.trailing_jump,
            created_at: now,
            updated_at: now,
        };

        if let Reservation::Existing(existing) = self.store.reserve_order(rec.clone()) {
            ORDERS_DEDUPED.inc();
            info!(client_ref = %client_ref, status = existing.status.as_str(), "executor: duplicate submission, returning existing order");
            return Ok(existing);
        }

        let req = PlaceRequest {
            client_ref: client_ref.clone(),
            segment: rec.segment,
            security_id: rec.security_id.clone(),
            trading_symbol: rec.trading_symbol.clone(),
            side,
            product_type: rec.product_type,
            quantity: rec.quantity,
            price: rec.entry_price,
            profit_value: (decision.take_profit - decision.entry_price).abs(),
            stop_loss_value: (decision.entry_price - decision.stop_loss).abs(),
            trailing_jump: rec.trailing_jump,
        };

        let broker = &self.broker;
        let req_ref = &req;
        let ack = match self.guard.call("place_order", || broker.place_order(req_ref)).await {
            Ok(ack) => ack,
            Err(e) => {
                self.store.delete_order(&client_ref);
                warn!(client_ref = %client_ref, error = %e, "executor: placement failed, reservation released");
                return Err(e.into());
            }
        };

        rec.broker_order_id = Some(ack.broker_order_id.clone());
        rec.status = ack.status;
        rec.filled_qty = ack.filled_qty.clamp(0, rec.quantity);
        rec.remaining_qty = rec.quantity - rec.filled_qty;
        rec.updated_at = Utc::now();

        let px = if ack.avg_price.is_finite() && ack.avg_price > 0.0 { ack.avg_price } else { rec.entry_price };
        let filled = rec.filled_qty;
        ORDERS.inc();
        let settled = self.store.settle_order(rec.clone(), |p| apply_fill(p, side, filled, px));
        if let Settlement::Superseded(current) = settled {
            // reconcile sudah melihat order ini di broker, posisi ikut angka broker
            info!(
                client_ref = %client_ref,
                order_id = %ack.broker_order_id,
                tracked = current.is_some(),
                "executor: order settled by reconcile before ack, fill not booked"
            );
            return Ok(current.unwrap_or(rec));
        }

        info!(
            client_ref = %client_ref,
            order_id = %ack.broker_order_id,
            symbol = %rec.trading_symbol,
            side = ?side,
            qty = rec.quantity,
            px = rec.entry_price,
            sl = rec.stop_loss_price,
            tp = rec.target_price,
            status = rec.status.as_str(),
            "executor: order placed"
        );
        Ok(rec)
    }

    /// Amend the bracket of a live order. `None` keeps a leg unchanged.
    pub async fn modify(
        &self,
        client_ref: &str,
        stop_loss: Option<f64>,
        target: Option<f64>,
        trailing_jump: Option<f64>,
    ) -> Result<OrderRecord, StageError> {
        let mut rec = self
            .store
            .get_order(client_ref)
            .ok_or_else(|| StageError::Contract(format!("unknown client_ref {client_ref}")))?;
        let broker_order_id = rec.broker_order_id.clone().ok_or(StageError::MissingField("broker_order_id"))?;

        let req = ModifyRequest { broker_order_id, stop_loss, target, trailing_jump };
        if req.is_empty() {
            return Err(StageError::Contract(format!("empty modification for {client_ref}")));
        }
        let prices_ok = [req.stop_loss, req.target].into_iter().flatten().all(|v| v.is_finite() && v > 0.0);
        let jump_ok = req.trailing_jump.map_or(true, |v| v.is_finite() && v >= 0.0);
        if !(prices_ok && jump_ok) {
            return Err(StageError::Contract(format!("bad modification {req:?} for {client_ref}")));
        }

        let broker = &self.broker;
        let req_ref = &req;
        let status = self.guard.call("modify_order", || broker.modify_order(req_ref)).await?;

        if let Some(v) = req.stop_loss {
            rec.stop_loss_price = v;
        }
        if let Some(v) = req.target {
            rec.target_price = v;
        }
        if let Some(v) = req.trailing_jump {
            rec.trailing_jump = v;
        }
        rec.status = status;
        rec.updated_at = Utc::now();
        self.store.put_order(rec.clone());
        info!(
            client_ref = %client_ref,
            sl = rec.stop_loss_price,
            tp = rec.target_price,
            trail = rec.trailing_jump,
            "executor: order modified"
        );
        Ok(rec)
    }
}
