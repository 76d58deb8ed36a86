// ===============================
// src/broker.rs (broker seam + paper venue)
// ===============================
//
// Trait `Broker` adalah satu-satunya jalan keluar ke venue. Wire protocol
// broker sungguhan ada di luar crate ini; PaperBroker mengisi order langsung
// di harga entry dan memakai mock feed untuk tick.
//
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::RandomState;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::{InstrumentKey, OrderStatus, PositionKey, PositionRecord, ProductType, Segment, Side, Tick};
use crate::error::BrokerError;
use crate::feed::run_mock;
use crate::positions::apply_fill;

/// Bracket entry with absolute distances from the entry price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRequest {
    pub client_ref: String,
    pub segment: Segment,
    pub security_id: String,
    pub trading_symbol: String,
    pub side: Side,
    pub product_type: ProductType,
    pub quantity: i64,
    pub price: f64,
    pub profit_value: f64,
    pub stop_loss_value: f64,
    pub trailing_jump: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceAck {
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub broker_order_id: String,
    /// Absolute prices; `None` leaves the leg as it is.
    pub stop_loss: Option<f64>,
    pub target: Option<f64>,
    pub trailing_jump: Option<f64>,
}

impl ModifyRequest {
    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none() && self.target.is_none() && self.trailing_jump.is_none()
    }
}

/// Broker view of one net position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub segment: Segment,
    pub security_id: String,
    pub product_type: ProductType,
    pub trading_symbol: String,
    pub net_qty: i64,
    pub buy_qty: i64,
    pub sell_qty: i64,
    pub buy_avg: f64,
    pub sell_avg: f64,
    pub realized: f64,
}

impl PositionSnapshot {
    pub fn key(&self) -> PositionKey {
        PositionKey { segment: self.segment, security_id: self.security_id.clone(), product_type: self.product_type }
    }

    pub fn is_sane(&self) -> bool {
        !self.security_id.trim().is_empty()
            && [self.buy_avg, self.sell_avg, self.realized].iter().all(|v| v.is_finite())
            && self.buy_qty >= 0
            && self.sell_qty >= 0
    }
}

/// Broker view of one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub broker_order_id: String,
    pub client_ref: Option<String>,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub remaining_qty: i64,
    pub avg_price: f64,
}

impl OrderSnapshot {
    pub fn is_sane(&self) -> bool {
        !self.broker_order_id.trim().is_empty()
            && self.avg_price.is_finite()
            && self.filled_qty >= 0
            && self.remaining_qty >= 0
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(&self, req: &PlaceRequest) -> Result<PlaceAck, BrokerError>;

    async fn modify_order(&self, req: &ModifyRequest) -> Result<OrderStatus, BrokerError>;

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError>;

    async fn fetch_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError>;

    /// Tick stream for `keys`. The stream ends when the venue goes away.
    async fn subscribe_feed(&self, keys: Vec<InstrumentKey>) -> Result<mpsc::Receiver<Tick>, BrokerError>;
}

/// In-process venue: every order fills in full at its limit price.
pub struct PaperBroker {
    seq: AtomicU64,
    orders: DashMap<String, OrderSnapshot, RandomState>,
    positions: DashMap<PositionKey, PositionRecord, RandomState>,
    // kegagalan yang disuntikkan untuk test, dipakai FIFO sebelum order berikutnya
    failures: Mutex<VecDeque<BrokerError>>,
    feed_every: Duration,
    feed_start_px: f64,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 100.0)
    }
}

impl PaperBroker {
    pub fn new(feed_every: Duration, feed_start_px: f64) -> Self {
        Self {
            seq: AtomicU64::new(1),
            orders: DashMap::with_hasher(RandomState::new()),
            positions: DashMap::with_hasher(RandomState::new()),
            failures: Mutex::new(VecDeque::new()),
            feed_every,
            feed_start_px,
        }
    }

    /// Queue errors returned by the next `place_order` calls, in order.
    pub fn inject_failures(&self, errs: impl IntoIterator<Item = BrokerError>) {
        self.failures.lock().extend(errs);
    }

    /// Number of accepted placements.
    pub fn placed(&self) -> u64 {
        self.seq.load(Ordering::SeqCst) - 1
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_order(&self, req: &PlaceRequest) -> Result<PlaceAck, BrokerError> {
        let injected = self.failures.lock().pop_front();
        if let Some(e) = injected {
            return Err(e);
        }
        if req.quantity <= 0 || !(req.price.is_finite() && req.price > 0.0) {
            return Err(BrokerError::Rejected(format!("bad qty/price for {}", req.client_ref)));
        }
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let broker_order_id = format!("PAPER-{n:08}");

        let key = PositionKey { segment: req.segment, security_id: req.security_id.clone(), product_type: req.product_type };
        {
            let mut pos = self
                .positions
                .entry(key.clone())
                .or_insert_with(|| PositionRecord::empty(&key, &req.trading_symbol));
            apply_fill(&mut pos, req.side, req.quantity, req.price);
        }
        self.orders.insert(
            broker_order_id.clone(),
            OrderSnapshot {
                broker_order_id: broker_order_id.clone(),
                client_ref: Some(req.client_ref.clone()),
                status: OrderStatus::Traded,
                filled_qty: req.quantity,
                remaining_qty: 0,
                avg_price: req.price,
            },
        );
        info!(venue = "paper", order_id = %broker_order_id, client_ref = %req.client_ref, qty = req.quantity, px = req.price, "paper fill");
        Ok(PlaceAck { broker_order_id, status: OrderStatus::Traded, filled_qty: req.quantity, avg_price: req.price })
    }

    async fn modify_order(&self, req: &ModifyRequest) -> Result<OrderStatus, BrokerError> {
        match self.orders.get(&req.broker_order_id) {
            Some(o) if o.status.is_terminal() => {
                Err(BrokerError::Rejected(format!("order {} is {}", req.broker_order_id, o.status.as_str())))
            }
            Some(o) => Ok(o.status),
            None => Err(BrokerError::Rejected(format!("unknown order {}", req.broker_order_id))),
        }
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        Ok(self
            .positions
            .iter()
            .map(|p| PositionSnapshot {
                segment: p.segment,
                security_id: p.security_id.clone(),
                product_type: p.product_type,
                trading_symbol: p.trading_symbol.clone(),
                net_qty: p.net_qty,
                buy_qty: p.buy_qty,
                sell_qty: p.sell_qty,
                buy_avg: p.buy_avg,
                sell_avg: p.sell_avg,
                realized: p.realized,
            })
            .collect())
    }

    async fn fetch_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        Ok(self.orders.iter().map(|o| o.clone()).collect())
    }

    async fn subscribe_feed(&self, keys: Vec<InstrumentKey>) -> Result<mpsc::Receiver<Tick>, BrokerError> {
        let (tx, rx) = mpsc::channel::<Tick>(1024);
        debug!(instruments = keys.len(), at = %Utc::now(), "paper feed: starting mock stream");
        tokio::spawn(run_mock(tx, keys, self.feed_start_px, self.feed_every));
        Ok(rx)
    }
}
