// ===============================
// src/store.rs
// ===============================
//
// Event-sourced order/position state.
//
// Every write goes through `commit`: (a) mutate the in-memory map,
// (b) append one event, then (c) persist the whole touched map as a JSON
// snapshot. Replay decodes each event back into the same `Mutation` and
// runs it through `apply`, so live and replayed writes share one path.
//
// `write_lock` orders map mutation with log append across writers; readers
// go straight to the DashMaps and never take it.
//
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{Event, EventKind, OrderDeleteData, OrderRecord, PositionKey, PositionRecord};
use crate::journal::EventLog;
use crate::metrics::{OPEN_POSITIONS, REPLAY_SKIPPED};

#[derive(Debug, Clone)]
enum Mutation {
    UpsertOrder(OrderRecord),
    DeleteOrder(String),
    UpsertPosition(PositionRecord),
    DeletePosition(PositionKey),
}

impl Mutation {
    fn from_event(ev: &Event) -> Result<Self, serde_json::Error> {
        let data = ev.data.clone();
        Ok(match ev.kind {
            EventKind::OrderUpsert => Mutation::UpsertOrder(serde_json::from_value(data)?),
            EventKind::OrderDelete => {
                let d: OrderDeleteData = serde_json::from_value(data)?;
                Mutation::DeleteOrder(d.client_ref)
            }
            EventKind::PositionUpsert => Mutation::UpsertPosition(serde_json::from_value(data)?),
            EventKind::PositionDelete => Mutation::DeletePosition(serde_json::from_value(data)?),
        })
    }

    fn target(&self) -> Target {
        match self {
            Mutation::UpsertOrder(_) | Mutation::DeleteOrder(_) => Target::Orders,
            Mutation::UpsertPosition(_) | Mutation::DeletePosition(_) => Target::Positions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target { Orders, Positions }

/// Outcome of [`StateStore::reserve_order`].
#[derive(Debug, Clone)]
pub enum Reservation {
    Fresh(OrderRecord),
    Existing(OrderRecord),
}

/// Outcome of [`StateStore::settle_order`].
#[derive(Debug, Clone)]
pub enum Settlement {
    Applied(OrderRecord),
    /// Reservation already gone or taken over by reconcile; nothing written.
    Superseded(Option<OrderRecord>),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Point-in-time copy of both maps, ordered for comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub orders: BTreeMap<String, OrderRecord>,
    pub positions: BTreeMap<PositionKey, PositionRecord>,
}

#[derive(Debug)]
pub struct StateStore {
    orders: DashMap<String, OrderRecord, RandomState>,
    positions: DashMap<PositionKey, PositionRecord, RandomState>,
    log: EventLog,
    orders_file: PathBuf,
    positions_file: PathBuf,
    write_lock: Mutex<()>,
    persist_lock: Mutex<()>,
}

impl StateStore {
    /// Open the store and rebuild it from the event log. Without a log the
    /// snapshot files are loaded instead and re-journaled.
    pub fn open(state_dir: &Path, log_path: &Path) -> Self {
        if let Err(e) = fs::create_dir_all(state_dir) {
            warn!(?e, dir = %state_dir.display(), "state dir not creatable, snapshots will fail");
        }
        let store = Self {
            orders: DashMap::with_hasher(RandomState::new()),
            positions: DashMap::with_hasher(RandomState::new()),
            log: EventLog::new(log_path),
            orders_file: state_dir.join("orders.json"),
            positions_file: state_dir.join("positions.json"),
            write_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
        };
        if store.log.exists() {
            let report = store.replay();
            info!(applied = report.applied, skipped = report.skipped, "state store: recovered from event log");
        } else {
            store.seed_from_snapshots();
        }
        store
    }

    // ---------------- orders ----------------

    pub fn put_order(&self, rec: OrderRecord) {
        self.commit(Mutation::UpsertOrder(rec));
    }

    pub fn get_order(&self, client_ref: &str) -> Option<OrderRecord> {
        self.orders.get(client_ref).map(|r| r.clone())
    }

    pub fn delete_order(&self, client_ref: &str) -> Option<OrderRecord> {
        let removed = {
            let _w = self.write_lock.lock();
            let prev = self.get_order(client_ref)?;
            self.commit_locked(&Mutation::DeleteOrder(client_ref.to_string()));
            prev
        };
        self.persist(Target::Orders);
        Some(removed)
    }

    /// Insert `rec` unless its client_ref is already known. The lookup and
    /// the insert happen under one writer lock.
    pub fn reserve_order(&self, rec: OrderRecord) -> Reservation {
        {
            let _w = self.write_lock.lock();
            if let Some(existing) = self.get_order(&rec.client_ref) {
                return Reservation::Existing(existing);
            }
            self.commit_locked(&Mutation::UpsertOrder(rec.clone()));
        }
        self.persist(Target::Orders);
        Reservation::Fresh(rec)
    }

    /// Replace the reservation for `rec.client_ref` with the acknowledged
    /// record and, if it carries fills, run `book` on its position. Both
    /// writes happen under the writer lock and only while the stored record
    /// is still the reservation (no broker id yet).
    pub fn settle_order<F>(&self, rec: OrderRecord, book: F) -> Settlement
    where
        F: FnOnce(&mut PositionRecord),
    {
        let booked = {
            let _w = self.write_lock.lock();
            match self.get_order(&rec.client_ref) {
                Some(cur) if cur.broker_order_id.is_none() => {}
                cur => return Settlement::Superseded(cur),
            }
            self.commit_locked(&Mutation::UpsertOrder(rec.clone()));
            if rec.filled_qty > 0 {
                let key = rec.position_key();
                let mut pos = self
                    .get_position(&key)
                    .unwrap_or_else(|| PositionRecord::empty(&key, &rec.trading_symbol));
                book(&mut pos);
                self.commit_locked(&Mutation::UpsertPosition(pos));
                true
            } else {
                false
            }
        };
        self.persist(Target::Orders);
        if booked {
            self.persist(Target::Positions);
        }
        Settlement::Applied(rec)
    }

    /// True while an order on `key` is reserved but not yet acknowledged.
    pub fn has_unacked_order(&self, key: &PositionKey) -> bool {
        self.orders
            .iter()
            .any(|o| o.broker_order_id.is_none() && &o.position_key() == key)
    }

    pub fn find_order_by_broker_id(&self, broker_order_id: &str) -> Option<OrderRecord> {
        self.orders
            .iter()
            .find(|r| r.broker_order_id.as_deref() == Some(broker_order_id))
            .map(|r| r.clone())
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        let mut v: Vec<OrderRecord> = self.orders.iter().map(|r| r.clone()).collect();
        v.sort_by(|a, b| a.client_ref.cmp(&b.client_ref));
        v
    }

    // ---------------- positions ----------------

    pub fn upsert_position(&self, rec: PositionRecord) {
        self.commit(Mutation::UpsertPosition(rec));
    }

    /// Read-modify-write of one position, created empty if absent.
    pub fn update_position<F>(&self, key: &PositionKey, trading_symbol: &str, f: F) -> PositionRecord
    where
        F: FnOnce(&mut PositionRecord),
    {
        let rec = {
            let _w = self.write_lock.lock();
            let mut rec = self
                .get_position(key)
                .unwrap_or_else(|| PositionRecord::empty(key, trading_symbol));
            f(&mut rec);
            self.commit_locked(&Mutation::UpsertPosition(rec.clone()));
            rec
        };
        self.persist(Target::Positions);
        rec
    }

    pub fn get_position(&self, key: &PositionKey) -> Option<PositionRecord> {
        self.positions.get(key).map(|r| r.clone())
    }

    pub fn delete_position(&self, key: &PositionKey) -> Option<PositionRecord> {
        let removed = {
            let _w = self.write_lock.lock();
            let prev = self.get_position(key)?;
            self.commit_locked(&Mutation::DeletePosition(key.clone()));
            prev
        };
        self.persist(Target::Positions);
        Some(removed)
    }

    pub fn positions(&self) -> Vec<PositionRecord> {
        let mut v: Vec<PositionRecord> = self.positions.iter().map(|r| r.clone()).collect();
        v.sort_by(|a, b| a.key().cmp(&b.key()));
        v
    }

    /// True if any live order points at this position key.
    pub fn is_position_referenced(&self, key: &PositionKey) -> bool {
        self.orders.iter().any(|o| &o.position_key() == key)
    }

    // ---------------- recovery ----------------

    /// Rebuild both maps from an empty state by re-applying the log.
    pub fn replay(&self) -> ReplayReport {
        let read = self.log.replay();
        let mut report = ReplayReport { applied: 0, skipped: read.skipped };
        {
            let _w = self.write_lock.lock();
            self.orders.clear();
            self.positions.clear();
            for ev in &read.events {
                match Mutation::from_event(ev) {
                    Ok(m) => {
                        self.apply(&m);
                        report.applied += 1;
                    }
                    Err(e) => {
                        report.skipped += 1;
                        REPLAY_SKIPPED.inc();
                        warn!(%e, kind = ev.kind.as_str(), "replay: event payload malformed, skipped");
                    }
                }
            }
        }
        self.persist(Target::Orders);
        self.persist(Target::Positions);
        report
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            orders: self.orders.iter().map(|r| (r.key().clone(), r.value().clone())).collect(),
            positions: self.positions.iter().map(|r| (r.key().clone(), r.value().clone())).collect(),
        }
    }

    fn seed_from_snapshots(&self) {
        let orders: Vec<OrderRecord> = read_snapshot(&self.orders_file);
        let positions: Vec<PositionRecord> = read_snapshot(&self.positions_file);
        if orders.is_empty() && positions.is_empty() {
            return;
        }
        let _w = self.write_lock.lock();
        for o in orders {
            self.commit_locked(&Mutation::UpsertOrder(o));
        }
        for p in positions {
            self.commit_locked(&Mutation::UpsertPosition(p));
        }
        info!(orders = self.orders.len(), positions = self.positions.len(), "state store: seeded from snapshots");
    }

    // ---------------- write path ----------------

    fn commit(&self, m: Mutation) {
        let target = m.target();
        {
            let _w = self.write_lock.lock();
            self.commit_locked(&m);
        }
        self.persist(target);
    }

    /// Caller holds `write_lock`.
    fn commit_locked(&self, m: &Mutation) {
        if !self.apply(m) {
            return;
        }
        match m {
            Mutation::UpsertOrder(o) => self.log.log(EventKind::OrderUpsert, o),
            Mutation::DeleteOrder(r) => {
                self.log.log(EventKind::OrderDelete, &OrderDeleteData { client_ref: r.clone() })
            }
            Mutation::UpsertPosition(p) => self.log.log(EventKind::PositionUpsert, p),
            Mutation::DeletePosition(k) => self.log.log(EventKind::PositionDelete, k),
        };
    }

    /// The only place the maps change. Returns false for deletes of absent keys.
    fn apply(&self, m: &Mutation) -> bool {
        let changed = match m {
            Mutation::UpsertOrder(o) => {
                self.orders.insert(o.client_ref.clone(), o.clone());
                true
            }
            Mutation::DeleteOrder(r) => self.orders.remove(r).is_some(),
            Mutation::UpsertPosition(p) => {
                self.positions.insert(p.key(), p.clone());
                true
            }
            Mutation::DeletePosition(k) => self.positions.remove(k).is_some(),
        };
        if m.target() == Target::Positions {
            OPEN_POSITIONS.set(self.positions.len() as i64);
        }
        changed
    }

    fn persist(&self, target: Target) {
        // snapshot diambil di dalam lock supaya penulis terakhir = state terbaru
        let _p = self.persist_lock.lock();
        let res = match target {
            Target::Orders => write_snapshot(&self.orders_file, &self.orders()),
            Target::Positions => write_snapshot(&self.positions_file, &self.positions()),
        };
        if let Err(e) = res {
            warn!(%e, ?target, "state store: snapshot write failed");
        }
    }
}

fn write_snapshot<T: Serialize>(path: &Path, items: &[T]) -> Result<(), String> {
    let body = serde_json::to_vec_pretty(items).map_err(|e| e.to_string())?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).map_err(|e| e.to_string())?;
    fs::rename(&tmp, path).map_err(|e| e.to_string())
}

fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    match fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(%e, path = %path.display(), "snapshot unreadable, ignored");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}
