//! Full entry/exit cycles on the paper broker: daily lock, buy sizing,
//! take-profit and stop-loss exits, double-exit protection, order-failure
//! retry, and restart recovery.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, NaiveTime, Utc};
use tempfile::TempDir;

use stockbot::broker::{OrderPort, OrderReceipt, PaperBroker};
use stockbot::broker::paper::FillSide;
use stockbot::execution::{EntrySupervisor, ExitPolicy, ExitPolicyEngine, ExitState};
use stockbot::feed::{RetryPolicy, StreamingFeed};
use stockbot::persistence::{LockRecord, TradeLog, TradingLock};
use stockbot::{
    BrokerError, EntrySignal, ExitReason, Holding, Position, PriceTick, TickSource, TradeResult,
    TradingConfig,
};

const INSTRUMENT: &str = "005930";

fn dead_feed() -> Arc<StreamingFeed> {
    // Nothing listens on this port; the bounded policy stops the task fast.
    StreamingFeed::new(
        "ws://127.0.0.1:9",
        "",
        RetryPolicy::fixed(Duration::from_millis(10)).bounded(1),
    )
}

fn test_config(dir: &Path) -> TradingConfig {
    TradingConfig {
        account_no: "00000000-01".to_string(),
        max_investment: 1_000_000,
        safety_margin: 0.02,
        target_profit_rate: 0.01,
        stop_loss_rate: -0.025,
        emergency_stop_rate: -0.05,
        stop_loss_grace: Duration::ZERO,
        enable_stop_loss: true,
        enable_sell_monitoring: true,
        // Time-of-day triggers stay off so tests are clock-independent.
        enable_daily_force_sell: false,
        daily_force_sell_time: NaiveTime::from_hms_opt(15, 19, 0).unwrap(),
        buy_window_start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        buy_window_end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
        holdings_refresh_secs: 3_600,
        poll_interval_secs: 3_600,
        ws_url: "ws://127.0.0.1:9".to_string(),
        access_token: String::new(),
        reconnect_delay_secs: 1,
        reconnect_max_delay_secs: 1,
        reconnect_max_attempts: Some(1),
        lock_file: dir.join("lock.json"),
        results_dir: dir.join("results"),
    }
}

fn policy(config: &TradingConfig) -> ExitPolicy {
    ExitPolicy::from_config(config)
}

fn supervisor(broker: Arc<dyn OrderPort>, dir: &TempDir) -> EntrySupervisor {
    let config = test_config(dir.path());
    EntrySupervisor::new(
        broker,
        dead_feed(),
        TradingLock::new(&config.lock_file),
        TradeLog::new(&config.results_dir).unwrap(),
        config,
    )
}

fn engine(
    broker: Arc<dyn OrderPort>,
    dir: &TempDir,
    policy: ExitPolicy,
    position: Position,
) -> Arc<ExitPolicyEngine> {
    ExitPolicyEngine::new(
        broker,
        dead_feed(),
        TradeLog::new(dir.path().join("results")).unwrap(),
        policy,
        position,
    )
}

fn position(entry_price: i64, quantity: i64) -> Position {
    Position {
        instrument: INSTRUMENT.to_string(),
        name: "Samsung Electronics".to_string(),
        entry_price,
        quantity,
        entry_time: Utc::now(),
    }
}

fn tick(price: i64) -> PriceTick {
    PriceTick {
        instrument: INSTRUMENT.to_string(),
        price,
        timestamp: Utc::now(),
        source: TickSource::Stream,
    }
}

fn signal() -> EntrySignal {
    EntrySignal {
        instrument: INSTRUMENT.to_string(),
        name: "Samsung Electronics".to_string(),
    }
}

fn result_files(dir: &TempDir) -> Vec<TradeResult> {
    let results = dir.path().join("results");
    let mut parsed = Vec::new();
    if let Ok(entries) = fs::read_dir(&results) {
        for entry in entries {
            let raw = fs::read_to_string(entry.unwrap().path()).unwrap();
            parsed.push(serde_json::from_str(&raw).unwrap());
        }
    }
    parsed
}

fn sell_fills(broker: &PaperBroker) -> usize {
    broker
        .fills()
        .iter()
        .filter(|f| f.side == FillSide::Sell)
        .count()
}

#[tokio::test]
async fn full_cycle_take_profit() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new(10_000_000));
    broker.set_price(INSTRUMENT, 10_000);
    let supervisor = supervisor(broker.clone(), &dir);

    let engine = supervisor
        .open_position(&signal())
        .await
        .unwrap()
        .expect("entry should be accepted");

    // 1,000,000 * 0.98 / 10,000 = 98 shares.
    let holding = broker.holdings().await.unwrap().unwrap();
    assert_eq!(holding.quantity, 98);
    assert!(TradingLock::new(dir.path().join("lock.json"))
        .has_traded_today(Local::now().date_naive()));

    // Same-day re-entry is refused without touching the broker.
    assert!(supervisor.open_position(&signal()).await.unwrap().is_none());

    engine.handle_tick(&tick(10_100)).await;

    assert_eq!(engine.state(), ExitState::Exited);
    assert!(broker.holdings().await.unwrap().is_none());

    let results = result_files(&dir);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].reason, ExitReason::TakeProfit);
    // Target 10,100, one tick below in the 10-won tier.
    assert_eq!(results[0].exit_price, 10_090);
    assert_eq!(results[0].quantity, 98);
    assert!(!results[0].stale_holdings);

    // Further ticks are no-ops once exited.
    engine.handle_tick(&tick(10_500)).await;
    assert_eq!(sell_fills(&broker), 1);
}

#[tokio::test]
async fn concurrent_ticks_fire_one_exit() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new(10_000_000));
    broker.set_price(INSTRUMENT, 10_000);
    broker.buy_market(INSTRUMENT, 98).await.unwrap();

    let config = test_config(dir.path());
    let engine = engine(broker.clone(), &dir, policy(&config), position(10_000, 98));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.handle_tick(&tick(10_200)).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(engine.state(), ExitState::Exited);
    assert_eq!(sell_fills(&broker), 1);
    assert_eq!(result_files(&dir).len(), 1);
}

#[tokio::test]
async fn stop_loss_sells_at_market() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new(10_000_000));
    broker.set_price(INSTRUMENT, 10_000);
    broker.buy_market(INSTRUMENT, 98).await.unwrap();

    let config = test_config(dir.path());
    let engine = engine(broker.clone(), &dir, policy(&config), position(10_000, 98));

    broker.set_price(INSTRUMENT, 9_750);
    engine.handle_tick(&tick(9_750)).await;

    assert_eq!(engine.state(), ExitState::Exited);
    let results = result_files(&dir);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].reason, ExitReason::StopLoss);
    assert_eq!(results[0].exit_price, 9_750);
}

#[tokio::test]
async fn grace_period_holds_until_emergency_floor() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new(10_000_000));
    broker.set_price(INSTRUMENT, 10_000);
    broker.buy_market(INSTRUMENT, 98).await.unwrap();

    let config = TradingConfig {
        stop_loss_grace: Duration::from_secs(600),
        ..test_config(dir.path())
    };
    let engine = engine(broker.clone(), &dir, policy(&config), position(10_000, 98));

    // -2.5% inside the grace window: hold.
    engine.handle_tick(&tick(9_750)).await;
    assert_eq!(engine.state(), ExitState::Monitoring);
    assert_eq!(sell_fills(&broker), 0);

    // -6% breaches the emergency floor: grace no longer applies.
    broker.set_price(INSTRUMENT, 9_400);
    engine.handle_tick(&tick(9_400)).await;
    assert_eq!(engine.state(), ExitState::Exited);
    assert_eq!(result_files(&dir)[0].reason, ExitReason::StopLoss);
}

#[tokio::test]
async fn reconciliation_leaves_lock_file_untouched() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new(10_000_000));
    broker.set_price(INSTRUMENT, 9_900);
    broker.buy_market(INSTRUMENT, 98).await.unwrap();

    // Lock as written at entry, with the estimated price of the day.
    let lock_path = dir.path().join("lock.json");
    let lock = TradingLock::new(&lock_path);
    lock.record_entry(&LockRecord {
        date: Local::now().date_naive(),
        recorded_at: Utc::now() - ChronoDuration::hours(2),
        instrument: INSTRUMENT.to_string(),
        name: "Samsung Electronics".to_string(),
        entry_price: 10_000,
        quantity: 98,
    })
    .unwrap();
    let before = fs::read_to_string(&lock_path).unwrap();

    let config = test_config(dir.path());
    let engine = engine(broker.clone(), &dir, policy(&config), position(10_000, 98));

    // Broker reports avg cost 9,900; the tick keeps the position open
    // (+0.5% against the reconciled cost).
    engine.handle_tick(&tick(9_950)).await;

    assert_eq!(engine.state(), ExitState::Monitoring);
    assert_eq!(engine.position().entry_price, 9_900);
    // Reconciliation adopts broker values in memory only; the day's lock
    // record is immutable once written.
    let after = fs::read_to_string(&lock_path).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn forced_liquidation_outranks_take_profit() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new(10_000_000));
    broker.set_price(INSTRUMENT, 10_000);
    broker.buy_market(INSTRUMENT, 98).await.unwrap();

    let config = test_config(dir.path());
    let policy = ExitPolicy {
        force_sell_enabled: true,
        // Midnight is always in the past within a trading day.
        force_sell_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        ..ExitPolicy::from_config(&config)
    };
    let engine = engine(broker.clone(), &dir, policy, position(10_000, 98));

    broker.set_price(INSTRUMENT, 10_200);
    engine.handle_tick(&tick(10_200)).await;

    assert_eq!(engine.state(), ExitState::Exited);
    assert_eq!(result_files(&dir)[0].reason, ExitReason::ForcedLiquidation);
}

#[tokio::test]
async fn flat_holdings_at_exit_is_idempotent_success() {
    let dir = TempDir::new().unwrap();
    // No buy was made; the broker reports no holdings.
    let broker = Arc::new(PaperBroker::new(10_000_000));
    broker.set_price(INSTRUMENT, 10_000);

    let config = test_config(dir.path());
    let engine = engine(broker.clone(), &dir, policy(&config), position(10_000, 98));

    engine.handle_tick(&tick(10_200)).await;

    assert_eq!(engine.state(), ExitState::Exited);
    assert_eq!(sell_fills(&broker), 0);
    assert!(result_files(&dir).is_empty());
}

/// Reports a holding but fails the first N sell attempts.
struct FlakyBroker {
    failures_left: AtomicU32,
    sells: AtomicU32,
}

impl FlakyBroker {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            sells: AtomicU32::new(0),
        }
    }

    fn try_sell(&self, price: i64, quantity: i64) -> Result<OrderReceipt, BrokerError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Network("socket reset".into()));
        }
        let n = self.sells.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OrderReceipt {
            order_no: format!("F{n:08}"),
            avg_fill_price: Some(price),
            filled_quantity: quantity,
        })
    }
}

#[async_trait]
impl OrderPort for FlakyBroker {
    async fn buy_market(&self, _: &str, _: i64) -> Result<OrderReceipt, BrokerError> {
        Err(BrokerError::Rejected("buys unsupported".into()))
    }

    async fn sell_limit(
        &self,
        _instrument: &str,
        quantity: i64,
        price: i64,
    ) -> Result<OrderReceipt, BrokerError> {
        self.try_sell(price, quantity)
    }

    async fn sell_market(
        &self,
        _instrument: &str,
        quantity: i64,
    ) -> Result<OrderReceipt, BrokerError> {
        self.try_sell(10_200, quantity)
    }

    async fn holdings(&self) -> Result<Option<Holding>, BrokerError> {
        Ok(Some(Holding {
            instrument: INSTRUMENT.to_string(),
            name: "Samsung Electronics".to_string(),
            quantity: 98,
            avg_cost: 10_000,
        }))
    }

    async fn available_cash(&self) -> Result<i64, BrokerError> {
        Ok(0)
    }

    async fn current_price(&self, _: &str) -> Result<i64, BrokerError> {
        Ok(10_200)
    }
}

#[tokio::test]
async fn failed_sell_releases_latch_for_retry() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(FlakyBroker::new(1));

    let config = test_config(dir.path());
    let engine = engine(broker.clone(), &dir, policy(&config), position(10_000, 98));

    engine.handle_tick(&tick(10_200)).await;
    assert_eq!(engine.state(), ExitState::Monitoring);
    assert!(result_files(&dir).is_empty());

    engine.handle_tick(&tick(10_200)).await;
    assert_eq!(engine.state(), ExitState::Exited);
    assert_eq!(broker.sells.load(Ordering::SeqCst), 1);
    assert_eq!(result_files(&dir).len(), 1);
}

#[tokio::test]
async fn recovery_resumes_monitoring_from_holdings() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new(10_000_000));
    broker.set_price(INSTRUMENT, 10_000);
    broker.buy_market(INSTRUMENT, 98).await.unwrap();

    // Fresh supervisor, as after a process restart.
    let supervisor = supervisor(broker.clone(), &dir);
    let engine = supervisor
        .recover()
        .await
        .unwrap()
        .expect("holding should be recovered");

    let recovered = engine.position();
    assert_eq!(recovered.instrument, INSTRUMENT);
    assert_eq!(recovered.quantity, 98);
    assert_eq!(recovered.entry_price, 10_000);

    engine.handle_tick(&tick(10_100)).await;
    assert_eq!(engine.state(), ExitState::Exited);
    assert_eq!(result_files(&dir)[0].reason, ExitReason::TakeProfit);
}

#[tokio::test]
async fn recovery_is_noop_without_holdings() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new(10_000_000));
    let supervisor = supervisor(broker, &dir);
    assert!(supervisor.recover().await.unwrap().is_none());
}

#[tokio::test]
async fn entry_refused_outside_buy_window() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new(10_000_000));
    broker.set_price(INSTRUMENT, 10_000);

    // A one-minute window that excludes the current local time.
    let now = Local::now().time();
    let (start, end) = if now < NaiveTime::from_hms_opt(12, 0, 0).unwrap() {
        (
            NaiveTime::from_hms_opt(23, 58, 0).unwrap(),
            NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
        )
    } else {
        (
            NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(0, 1, 0).unwrap(),
        )
    };
    let config = TradingConfig {
        buy_window_start: start,
        buy_window_end: end,
        ..test_config(dir.path())
    };
    let supervisor = EntrySupervisor::new(
        broker.clone(),
        dead_feed(),
        TradingLock::new(&config.lock_file),
        TradeLog::new(&config.results_dir).unwrap(),
        config,
    );

    assert!(supervisor.open_position(&signal()).await.unwrap().is_none());
    assert!(broker.fills().is_empty());
}

#[tokio::test]
async fn stale_holdings_fallback_when_query_fails() {
    struct DeafBroker {
        sells: AtomicU32,
    }

    #[async_trait]
    impl OrderPort for DeafBroker {
        async fn buy_market(&self, _: &str, _: i64) -> Result<OrderReceipt, BrokerError> {
            Err(BrokerError::Rejected("buys unsupported".into()))
        }
        async fn sell_limit(
            &self,
            _: &str,
            quantity: i64,
            price: i64,
        ) -> Result<OrderReceipt, BrokerError> {
            self.sells.fetch_add(1, Ordering::SeqCst);
            Ok(OrderReceipt {
                order_no: "D00000001".to_string(),
                avg_fill_price: Some(price),
                filled_quantity: quantity,
            })
        }
        async fn sell_market(&self, _: &str, _: i64) -> Result<OrderReceipt, BrokerError> {
            Err(BrokerError::Rejected("unexpected market sell".into()))
        }
        async fn holdings(&self) -> Result<Option<Holding>, BrokerError> {
            Err(BrokerError::Network("balance endpoint down".into()))
        }
        async fn available_cash(&self) -> Result<i64, BrokerError> {
            Ok(0)
        }
        async fn current_price(&self, _: &str) -> Result<i64, BrokerError> {
            Ok(10_200)
        }
    }

    let dir = TempDir::new().unwrap();
    let broker = Arc::new(DeafBroker {
        sells: AtomicU32::new(0),
    });

    let config = test_config(dir.path());
    let mut pos = position(10_000, 98);
    pos.entry_time = Utc::now() - ChronoDuration::minutes(10);
    let engine = engine(broker.clone(), &dir, policy(&config), pos);

    engine.handle_tick(&tick(10_200)).await;

    assert_eq!(engine.state(), ExitState::Exited);
    assert_eq!(broker.sells.load(Ordering::SeqCst), 1);
    let results = result_files(&dir);
    assert_eq!(results.len(), 1);
    assert!(results[0].stale_holdings);
    assert_eq!(results[0].quantity, 98);
}
