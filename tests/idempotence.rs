// ===============================
// tests/idempotence.rs
// ===============================
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use fno_bot_rust::broker::{Broker, ModifyRequest, OrderSnapshot, PlaceAck, PlaceRequest, PositionSnapshot};
use fno_bot_rust::config::{parse_watchlist, BackoffCfg, StrategyParams, WatchlistEntry};
use fno_bot_rust::domain::{Action, Bias, Decision, InstrumentKey, OrderStatus, Segment, Tick};
use fno_bot_rust::error::BrokerError;
use fno_bot_rust::executor::Executor;
use fno_bot_rust::ratelimit::{BrokerGuard, TokenBucket};
use fno_bot_rust::store::StateStore;

/// Counts placements; each one takes `delay` so submissions overlap.
struct CountingBroker {
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl Broker for CountingBroker {
    fn name(&self) -> &str {
        "counting"
    }

    async fn place_order(&self, req: &PlaceRequest) -> Result<PlaceAck, BrokerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        Ok(PlaceAck {
            broker_order_id: format!("CNT-{n}"),
            status: OrderStatus::Open,
            filled_qty: 0,
            avg_price: req.price,
        })
    }

    async fn modify_order(&self, _req: &ModifyRequest) -> Result<OrderStatus, BrokerError> {
        Ok(OrderStatus::Open)
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        Ok(Vec::new())
    }

    async fn fetch_orders(&self) -> Result<Vec<OrderSnapshot>, BrokerError> {
        Ok(Vec::new())
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
        quantity: 150,
        metadata: BTreeMap::new(),
    }
}

fn setup(dir: &TempDir, delay: Duration) -> (Arc<StateStore>, Arc<CountingBroker>, Arc<Executor>) {
    let store = Arc::new(StateStore::open(dir.path(), &dir.path().join("events.jsonl")));
    let broker = Arc::new(CountingBroker { calls: AtomicUsize::new(0), delay });
    let guard = Arc::new(BrokerGuard::new(
        TokenBucket::new(20, 100.0),
        BackoffCfg {
            base: Duration::from_millis(1),
            multiplier: 2.0,
            max: Duration::from_millis(5),
            jitter: 0.0,
            max_attempts: 1,
        },
    ));
    let exec = Arc::new(Executor::new(store.clone(), broker.clone(), guard));
    (store, broker, exec)
}

#[tokio::test]
async fn sequential_repeat_hits_broker_once() {
    let dir = TempDir::new().unwrap();
    let (store, broker, exec) = setup(&dir, Duration::ZERO);
    let (d, e) = (decision(), entry());

    let first = exec.submit("NIFTY-CE-LONG-1".into(), &d, &e).await.unwrap();
    let second = exec.submit("NIFTY-CE-LONG-1".into(), &d, &e).await.unwrap();

    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
    assert_eq!(second.broker_order_id.as_deref(), Some("CNT-1"));
    assert_eq!(store.orders().len(), 1);
}

#[tokio::test]
async fn overlapping_submissions_hit_broker_once() {
    let dir = TempDir::new().unwrap();
    let (store, broker, exec) = setup(&dir, Duration::from_millis(30));
    let (d, e) = (decision(), entry());

    let (a, b) = tokio::join!(
        exec.submit("NIFTY-CE-LONG-2".into(), &d, &e),
        exec.submit("NIFTY-CE-LONG-2".into(), &d, &e),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    // the loser sees the reservation, possibly before the ack landed
    assert_eq!(a.client_ref, b.client_ref);
    assert_eq!(store.get_order("NIFTY-CE-LONG-2").unwrap().status, OrderStatus::Open);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_tasks_hit_broker_once() {
    let dir = TempDir::new().unwrap();
    let (store, broker, exec) = setup(&dir, Duration::from_millis(10));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let exec = exec.clone();
            tokio::spawn(async move { exec.submit("NIFTY-CE-LONG-3".into(), &decision(), &entry()).await })
        })
        .collect();
    for t in tasks {
        assert!(t.await.unwrap().is_ok());
    }
    assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.orders().len(), 1);
}

#[tokio::test]
async fn distinct_refs_are_distinct_orders() {
    let dir = TempDir::new().unwrap();
    let (store, broker, exec) = setup(&dir, Duration::ZERO);
    let (d, e) = (decision(), entry());
    exec.execute(&d, &e).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    exec.execute(&d, &e).await.unwrap();
    assert_eq!(broker.calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.orders().len(), 2);
}
