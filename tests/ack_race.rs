// ===============================
// tests/ack_race.rs
// ===============================
//
// Reconcile running while a placement waits for its ack.
//
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

use fno_bot_rust::broker::{Broker, ModifyRequest, OrderSnapshot, PlaceAck, PlaceRequest, PositionSnapshot};
use fno_bot_rust::config::{parse_watchlist, BackoffCfg, StrategyParams, WatchlistEntry};
use fno_bot_rust::domain::{Action, Bias, Decision, InstrumentKey, OrderStatus, Segment, Tick};
use fno_bot_rust::error::BrokerError;
use fno_bot_rust::executor::Executor;
use fno_bot_rust::feed::TickCache;
use fno_bot_rust::ratelimit::{BrokerGuard, TokenBucket};
use fno_bot_rust::reconcile::Reconciler;
use fno_bot_rust::store::StateStore;

/// Fills on arrival, then holds the ack until `release` is notified.
#[derive(Default)]
struct HeldAck {
    orders: Mutex<Vec<OrderSnapshot>>,
    positions: Mutex<Vec<PositionSnapshot>>,
    filled: Notify,
    release: Notify,
}

#[async_trait]
impl Broker for HeldAck {
    fn name(&self) -> &str {
        "held-ack"
    }

    async fn place_order(&self, req: &PlaceRequest) -> Result<PlaceAck, BrokerError> {
        let id = format!("H-{}", req.client_ref);
        self.orders.lock().push(OrderSnapshot {
            broker_order_id: id.clone(),
            client_ref: Some(req.client_ref.clone()),
            status: OrderStatus::Traded,
            filled_qty: req.quantity,
            remaining_qty: 0,
            avg_price: req.price,
        });
        self.positions.lock().push(PositionSnapshot {
            segment: req.segment,
            security_id: req.security_id.clone(),
            product_type: req.product_type,
            trading_symbol: req.trading_symbol.clone(),
            net_qty: req.quantity,
            buy_qty: req.quantity,
            sell_qty: 0,
            buy_avg: req.price,
            sell_avg: 0.0,
            realized: 0.0,
        });
        self.filled.notify_one();
        self.release.notified().await;
        Ok(PlaceAck { broker_order_id: id, status: OrderStatus::Traded, filled_qty: req.quantity, avg_price: req.price })
    }

    async fn modify_order(&self, _req: &ModifyRequest) -> Result<OrderStatus, BrokerError> {
        Err(BrokerError::Rejected("filled".into()))
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        Ok(self.positions.lock().clone())
    }

    async fn fetch_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        Ok(self.orders.lock().clone())
    }

    async fn subscribe_feed(&self, _keys: Vec<InstrumentKey>) -> Result<mpsc::Receiver<Tick>, BrokerError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

fn entry() -> WatchlistEntry {
    let raw = r#"[{"segment": "NSE_FNO", "security_id": "35001", "trading_symbol": "NIFTY-CE",
        "lot_size": 75, "tick_size": 0.05}]"#;
    parse_watchlist(raw, &StrategyParams::default()).unwrap().remove(0)
}

fn decision() -> Decision {
    Decision {
        instrument: InstrumentKey::new(Segment::NseFno, "35001"),
        symbol: "NIFTY-CE".into(),
        direction: Bias::Long,
        action: Action::Enter,
        risk_per_unit: 30.0,
        entry_price: 100.0,
        stop_loss: 70.0,
        take_profit: 160.0,
        quantity: 75,
        metadata: BTreeMap::new(),
    }
}

fn guard() -> Arc<BrokerGuard> {
    Arc::new(BrokerGuard::new(
        TokenBucket::new(20, 100.0),
        BackoffCfg {
            base: Duration::from_millis(1),
            multiplier: 2.0,
            max: Duration::from_millis(5),
            jitter: 0.0,
            max_attempts: 1,
        },
    ))
}

#[tokio::test]
async fn late_ack_does_not_double_book() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path(), &dir.path().join("events.jsonl")));
    let broker = Arc::new(HeldAck::default());
    let guard = guard();
    let exec = Arc::new(Executor::new(store.clone(), broker.clone(), guard.clone()));
    let reconciler = Reconciler::new(store.clone(), broker.clone(), guard, Arc::new(TickCache::new()));

    let submit = tokio::spawn({
        let exec = exec.clone();
        async move { exec.submit("NIFTY-CE-LONG-1".into(), &decision(), &entry()).await }
    });
    broker.filled.notified().await;

    // broker already shows the fill, the ack has not landed yet
    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.orders_deleted, 1);
    assert_eq!(report.positions_upserted, 1);

    broker.release.notify_one();
    let rec = submit.await.unwrap().unwrap();
    assert_eq!(rec.status, OrderStatus::Traded);

    assert!(store.get_order("NIFTY-CE-LONG-1").is_none());
    let pos = store.get_position(&rec.position_key()).unwrap();
    assert_eq!(pos.net_qty, 75);
    assert_eq!(pos.net_qty, broker.fetch_positions().await.unwrap()[0].net_qty);
}

#[tokio::test]
async fn reconcile_before_broker_fill_defers_position() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path(), &dir.path().join("events.jsonl")));
    let broker = Arc::new(HeldAck::default());
    let guard = guard();
    let exec = Arc::new(Executor::new(store.clone(), broker.clone(), guard.clone()));
    let reconciler = Reconciler::new(store.clone(), broker.clone(), guard, Arc::new(TickCache::new()));

    let submit = tokio::spawn({
        let exec = exec.clone();
        async move { exec.submit("NIFTY-CE-LONG-2".into(), &decision(), &entry()).await }
    });
    broker.filled.notified().await;
    // the broker order entry is gone from this pass, only the position shows
    broker.orders.lock().clear();

    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.positions_deferred, 1);

    broker.release.notify_one();
    let rec = submit.await.unwrap().unwrap();
    assert_eq!(store.get_position(&rec.position_key()).unwrap().net_qty, 75);

    // next pass lines up with the broker book
    reconciler.reconcile_once().await.unwrap();
    assert_eq!(store.get_position(&rec.position_key()).unwrap().net_qty, 75);
}
