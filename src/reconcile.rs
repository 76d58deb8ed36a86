// ===============================
// src/reconcile.rs
// ===============================
//
// Sinkronisasi state lokal dengan broker (broker = sumber kebenaran):
// 1) orders   : cocokkan via client_ref (fallback broker_order_id), update
//               status/filled; status terminal yang sudah dikonfirmasi -> hapus
// 2) positions: upsert dari snapshot broker; posisi baru tanpa order lokal
//               ditandai external; net 0 dan tidak direferensikan -> hapus.
//               Posisi lokal yang tidak dilaporkan broker dianggap net 0.
//               Key dengan order yang belum di-ack ditunda ke pass berikutnya.
// 3) mark-to-market semua posisi lokal dari TickCache
// Entry snapshot yang rusak di-skip dengan warning.
//
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet as HashSet;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::{Broker, OrderSnapshot, PositionSnapshot};
use crate::domain::{PositionKey, PositionRecord};
use crate::error::BrokerError;
use crate::feed::TickCache;
use crate::metrics::RECONCILE_RUNS;
use crate::positions::mark_to_market;
use crate::ratelimit::BrokerGuard;
use crate::store::StateStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orders_updated: usize,
    pub orders_deleted: usize,
    pub orders_untracked: usize,
    pub positions_upserted: usize,
    pub positions_deleted: usize,
    pub positions_deferred: usize,
    pub positions_marked: usize,
    pub garbled: usize,
}

pub struct Reconciler {
    store: Arc<StateStore>,
    broker: Arc<dyn Broker>,
    guard: Arc<BrokerGuard>,
    ticks: Arc<TickCache>,
}

impl Reconciler {
    pub fn new(store: Arc<StateStore>, broker: Arc<dyn Broker>, guard: Arc<BrokerGuard>, ticks: Arc<TickCache>) -> Self {
        Self { store, broker, guard, ticks }
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileReport, BrokerError> {
        let res = self.run().await;
        let label = if res.is_ok() { "ok" } else { "error" };
        RECONCILE_RUNS.with_label_values(&[label]).inc();
        res
    }

    async fn run(&self) -> Result<ReconcileReport, BrokerError> {
        let broker = &self.broker;
        let orders = self.guard.call("fetch_orders", || broker.fetch_orders()).await?;
        let positions = self.guard.call("fetch_positions", || broker.fetch_positions()).await?;

        let mut report = ReconcileReport::default();
        for snap in &orders {
            self.sync_order(snap, &mut report);
        }
        for snap in &positions {
            self.sync_position(snap, &mut report);
        }
        // entry rusak tetap dihitung "dilaporkan" supaya key-nya tidak ikut terhapus
        let reported: HashSet<_> = positions.iter().map(PositionSnapshot::key).collect();
        self.drop_unreported(&reported, &mut report);
        self.mark_all(&mut report);

        if report != ReconcileReport::default() {
            info!(?report, "reconcile: pass applied changes");
        }
        Ok(report)
    }

    fn sync_order(&self, snap: &OrderSnapshot, report: &mut ReconcileReport) {
        if !snap.is_sane() {
            report.garbled += 1;
            warn!(?snap, "reconcile: garbled order entry skipped");
            return;
        }
        let local = snap
            .client_ref
            .as_deref()
            .and_then(|r| self.store.get_order(r))
            .or_else(|| self.store.find_order_by_broker_id(&snap.broker_order_id));
        let Some(mut rec) = local else {
            report.orders_untracked += 1;
            debug!(order_id = %snap.broker_order_id, "reconcile: broker order not tracked locally");
            return;
        };

        if snap.status.is_terminal() {
            if self.store.delete_order(&rec.client_ref).is_some() {
                report.orders_deleted += 1;
                info!(client_ref = %rec.client_ref, status = snap.status.as_str(), "reconcile: terminal order removed");
            }
            return;
        }

        let filled = snap.filled_qty.min(rec.quantity);
        let changed = rec.status != snap.status
            || rec.filled_qty != filled
            || rec.broker_order_id.as_deref() != Some(snap.broker_order_id.as_str());
        if changed {
            rec.status = snap.status;
            rec.filled_qty = filled;
            rec.remaining_qty = rec.quantity - filled;
            rec.broker_order_id = Some(snap.broker_order_id.clone());
            rec.updated_at = Utc::now();
            self.store.put_order(rec);
            report.orders_updated += 1;
        }
    }

    fn sync_position(&self, snap: &PositionSnapshot, report: &mut ReconcileReport) {
        if !snap.is_sane() {
            report.garbled += 1;
            warn!(?snap, "reconcile: garbled position entry skipped");
            return;
        }
        let key = snap.key();
        if self.store.has_unacked_order(&key) {
            report.positions_deferred += 1;
            debug!(position = %key, "reconcile: placement in flight, position deferred");
            return;
        }
        let referenced = self.store.is_position_referenced(&key);
        let existing = self.store.get_position(&key);

        if snap.net_qty == 0 && !referenced {
            if self.store.delete_position(&key).is_some() {
                report.positions_deleted += 1;
                info!(position = %key, "reconcile: flat position removed");
            }
            return;
        }

        let mut rec = existing.clone().unwrap_or_else(|| PositionRecord::empty(&key, &snap.trading_symbol));
        rec.trading_symbol = snap.trading_symbol.clone();
        rec.net_qty = snap.net_qty;
        rec.buy_qty = snap.buy_qty;
        rec.sell_qty = snap.sell_qty;
        rec.buy_avg = snap.buy_avg;
        rec.sell_avg = snap.sell_avg;
        rec.realized = snap.realized;
        if existing.is_none() && !referenced {
            rec.external_flag = true;
            info!(position = %key, net = snap.net_qty, "reconcile: external position adopted");
        }

        if let Some(prev) = &existing {
            rec.updated_at = prev.updated_at;
            if &rec == prev {
                return;
            }
        }
        rec.updated_at = Utc::now();
        self.store.upsert_position(rec);
        report.positions_upserted += 1;
    }

    fn drop_unreported(&self, reported: &HashSet<PositionKey>, report: &mut ReconcileReport) {
        for p in self.store.positions() {
            let key = p.key();
            if reported.contains(&key) || self.store.is_position_referenced(&key) {
                continue;
            }
            if self.store.delete_position(&key).is_some() {
                report.positions_deleted += 1;
                info!(position = %key, realized = p.realized, "reconcile: position no longer reported by broker, removed");
            }
        }
    }

    fn mark_all(&self, report: &mut ReconcileReport) {
        for mut p in self.store.positions() {
            let Some(ltp) = self.ticks.ltp(&p.instrument()) else {
                continue;
            };
            if mark_to_market(&mut p, ltp) {
                self.store.upsert_position(p);
                report.positions_marked += 1;
            }
        }
    }

    /// Reconcile every `every` until `stop` flips to true or its sender is gone.
    pub fn spawn(self: Arc<Self>, every: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.reconcile_once().await {
                            warn!(error = %e, "reconcile: pass failed, will retry next interval");
                        }
                    }
                }
            }
            debug!("reconcile: worker stopped");
        })
    }
}
