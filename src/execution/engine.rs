//! Exit decision engine for the single tracked position.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Local, NaiveTime, Utc};
use tracing::{debug, error, info, warn};

use crate::broker::OrderPort;
use crate::config::TradingConfig;
use crate::feed::{StreamingFeed, TickSink};
use crate::models::{ExitReason, Position, PriceTick};
use crate::persistence::TradeLog;

use super::pricing;

const STATE_MONITORING: u8 = 0;
const STATE_EXIT_PENDING: u8 = 1;
const STATE_EXITED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Monitoring,
    ExitPending,
    Exited,
}

/// Exit thresholds and schedules, decoupled from I/O so decisions are
/// testable as a pure function of rate and time.
#[derive(Debug, Clone)]
pub struct ExitPolicy {
    pub target_profit_rate: f64,
    pub stop_loss_enabled: bool,
    pub stop_loss_rate: f64,
    /// Stop-loss is suppressed this long after entry, unless the loss
    /// reaches `emergency_stop_rate`.
    pub stop_loss_grace: Duration,
    pub emergency_stop_rate: f64,
    pub force_sell_enabled: bool,
    pub force_sell_time: NaiveTime,
    /// Periodic holdings reconciliation; `None` disables it.
    pub holdings_refresh: Option<Duration>,
}

impl ExitPolicy {
    pub fn from_config(config: &TradingConfig) -> Self {
        Self {
            target_profit_rate: config.target_profit_rate,
            stop_loss_enabled: config.enable_stop_loss,
            stop_loss_rate: config.stop_loss_rate,
            stop_loss_grace: config.stop_loss_grace,
            emergency_stop_rate: config.emergency_stop_rate,
            force_sell_enabled: config.enable_daily_force_sell,
            force_sell_time: config.daily_force_sell_time,
            holdings_refresh: match config.holdings_refresh_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    /// First matching exit trigger, in priority order: forced liquidation,
    /// stop-loss, take-profit. At most one fires per evaluation.
    pub fn evaluate(&self, rate: f64, held_for: Duration, now: NaiveTime) -> Option<ExitReason> {
        if self.force_sell_enabled && now >= self.force_sell_time {
            return Some(ExitReason::ForcedLiquidation);
        }
        if self.stop_loss_enabled && rate <= self.stop_loss_rate {
            let in_grace = held_for < self.stop_loss_grace;
            if !in_grace || rate <= self.emergency_stop_rate {
                return Some(ExitReason::StopLoss);
            }
            // Within grace and above the emergency floor: hold.
            return None;
        }
        if rate >= self.target_profit_rate {
            return Some(ExitReason::TakeProfit);
        }
        None
    }
}

/// Monitors ticks for one position and submits at most one exit order.
///
/// The `Monitoring -> ExitPending -> Exited` transition is guarded by a
/// compare-and-set so concurrent tick delivery cannot double-sell. A failed
/// order reverts `ExitPending` back to `Monitoring` so a later tick retries.
pub struct ExitPolicyEngine {
    broker: Arc<dyn OrderPort>,
    feed: Arc<StreamingFeed>,
    trade_log: TradeLog,
    policy: ExitPolicy,
    position: Mutex<Position>,
    state: AtomicU8,
    reconciled: AtomicBool,
    last_refresh: Mutex<Option<Instant>>,
}

impl ExitPolicyEngine {
    pub fn new(
        broker: Arc<dyn OrderPort>,
        feed: Arc<StreamingFeed>,
        trade_log: TradeLog,
        policy: ExitPolicy,
        position: Position,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            feed,
            trade_log,
            policy,
            position: Mutex::new(position),
            state: AtomicU8::new(STATE_MONITORING),
            reconciled: AtomicBool::new(false),
            last_refresh: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ExitState {
        match self.state.load(Ordering::SeqCst) {
            STATE_MONITORING => ExitState::Monitoring,
            STATE_EXIT_PENDING => ExitState::ExitPending,
            _ => ExitState::Exited,
        }
    }

    pub fn is_exited(&self) -> bool {
        self.state() == ExitState::Exited
    }

    pub fn position(&self) -> Position {
        self.position.lock().unwrap().clone()
    }

    pub async fn handle_tick(&self, tick: &PriceTick) {
        if tick.price <= 0 {
            debug!(instrument = %tick.instrument, price = tick.price, "ignoring non-positive tick");
            return;
        }
        if self.state() != ExitState::Monitoring {
            return;
        }

        self.maybe_refresh_holdings().await;

        let (rate, held_for) = {
            let position = self.position.lock().unwrap();
            if position.entry_price <= 0 {
                return;
            }
            let held = (Utc::now() - position.entry_time)
                .to_std()
                .unwrap_or(Duration::ZERO);
            (position.unrealized_rate(tick.price), held)
        };

        let now = Local::now().time();
        match self.policy.evaluate(rate, held_for, now) {
            Some(reason) => self.execute_exit(tick, rate, reason).await,
            None => {
                debug!(
                    instrument = %tick.instrument,
                    price = tick.price,
                    rate = format!("{:+.2}%", rate * 100.0),
                    "holding"
                );
            }
        }
    }

    /// Runs the exit attempt; no-ops unless this call wins the
    /// `Monitoring -> ExitPending` transition.
    async fn execute_exit(&self, tick: &PriceTick, rate: f64, reason: ExitReason) {
        if self
            .state
            .compare_exchange(
                STATE_MONITORING,
                STATE_EXIT_PENDING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let cached = self.position();
        info!(
            instrument = %cached.instrument,
            name = %cached.name,
            price = tick.price,
            rate = format!("{:+.2}%", rate * 100.0),
            ?reason,
            "exit triggered"
        );

        // Authoritative quantity and cost come from the broker, so manual
        // purchases are liquidated along with the bot's own.
        let mut stale_holdings = false;
        let (quantity, reference_price) = match self.broker.holdings().await {
            Ok(Some(h)) if h.instrument == cached.instrument && h.quantity > 0 => {
                let reference = if h.avg_cost > 0 {
                    h.avg_cost
                } else {
                    cached.entry_price
                };
                (h.quantity, reference)
            }
            Ok(_) => {
                // Already flat: closed externally. Success, nothing to sell.
                info!(instrument = %cached.instrument, "no holdings at exit, position already closed");
                self.state.store(STATE_EXITED, Ordering::SeqCst);
                self.feed.unsubscribe(&cached.instrument);
                return;
            }
            Err(e) => {
                warn!(error = %e, "pre-exit holdings query failed, selling on cached position");
                stale_holdings = true;
                (cached.quantity, cached.entry_price)
            }
        };

        let order = match reason {
            ExitReason::TakeProfit => {
                let target = pricing::target_price(reference_price, self.policy.target_profit_rate);
                let limit = pricing::limit_sell_price(target);
                info!(target, limit, quantity, "placing take-profit limit sell");
                self.broker
                    .sell_limit(&cached.instrument, quantity, limit)
                    .await
                    .map(|receipt| (receipt, limit))
            }
            ExitReason::StopLoss | ExitReason::ForcedLiquidation => {
                info!(quantity, "placing market sell");
                self.broker
                    .sell_market(&cached.instrument, quantity)
                    .await
                    .map(|receipt| (receipt, tick.price))
            }
        };

        match order {
            Ok((receipt, assumed_price)) => {
                self.state.store(STATE_EXITED, Ordering::SeqCst);
                let exit_price = receipt.avg_fill_price.unwrap_or(assumed_price);
                let realized_rate = if reference_price > 0 {
                    (exit_price - reference_price) as f64 / reference_price as f64
                } else {
                    0.0
                };
                let result = crate::models::TradeResult {
                    id: uuid::Uuid::new_v4(),
                    instrument: cached.instrument.clone(),
                    name: cached.name.clone(),
                    entry_price: reference_price,
                    exit_price,
                    quantity,
                    realized_rate,
                    reason,
                    stale_holdings,
                    entry_time: cached.entry_time,
                    exit_time: Utc::now(),
                };
                if let Err(e) = self.trade_log.record(&result) {
                    error!(error = %e, "failed to write trade result");
                }
                self.feed.unsubscribe(&cached.instrument);
                info!(
                    order_no = %receipt.order_no,
                    exit_price,
                    realized = format!("{:+.2}%", realized_rate * 100.0),
                    "exit complete"
                );
            }
            Err(e) => {
                // Release the latch or the position can never be closed.
                error!(error = %e, "exit order failed, will retry on a later tick");
                self.state.store(STATE_MONITORING, Ordering::SeqCst);
            }
        }
    }

    /// Reconciles cached position data against broker holdings on the first
    /// tick and then on the configured interval.
    async fn maybe_refresh_holdings(&self) {
        let due = {
            let mut last = self.last_refresh.lock().unwrap();
            let first = !self.reconciled.load(Ordering::SeqCst) && last.is_none();
            let interval_due = match (*last, self.policy.holdings_refresh) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(prev), Some(interval)) => prev.elapsed() >= interval,
            };
            if first || interval_due {
                *last = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if due {
            self.refresh_holdings().await;
        }
    }

    async fn refresh_holdings(&self) {
        let instrument = self.position.lock().unwrap().instrument.clone();
        match self.broker.holdings().await {
            Ok(Some(h)) if h.instrument == instrument && h.quantity > 0 && h.avg_cost > 0 => {
                // Only the in-memory position is reconciled; the daily lock
                // file stays as written at entry.
                let changed = {
                    let mut position = self.position.lock().unwrap();
                    let changed =
                        position.entry_price != h.avg_cost || position.quantity != h.quantity;
                    if changed {
                        position.entry_price = h.avg_cost;
                        position.quantity = h.quantity;
                    }
                    changed
                };
                if changed {
                    if self.reconciled.load(Ordering::SeqCst) {
                        warn!(
                            %instrument,
                            avg_cost = h.avg_cost,
                            quantity = h.quantity,
                            "holdings changed outside the bot, adopting broker values"
                        );
                    } else {
                        info!(
                            %instrument,
                            avg_cost = h.avg_cost,
                            quantity = h.quantity,
                            "position reconciled with broker holdings"
                        );
                    }
                }
                self.reconciled.store(true, Ordering::SeqCst);
            }
            Ok(_) => {
                debug!(%instrument, "instrument not in holdings during refresh");
                self.reconciled.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                // Keep estimating from the recorded entry price until the
                // next refresh succeeds.
                warn!(error = %e, "holdings refresh failed");
            }
        }
    }
}

#[async_trait]
impl TickSink for ExitPolicyEngine {
    async fn on_tick(&self, tick: &PriceTick) {
        self.handle_tick(tick).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ExitPolicy {
        ExitPolicy {
            target_profit_rate: 0.01,
            stop_loss_enabled: true,
            stop_loss_rate: -0.025,
            stop_loss_grace: Duration::from_secs(60),
            emergency_stop_rate: -0.05,
            force_sell_enabled: true,
            force_sell_time: NaiveTime::from_hms_opt(15, 19, 0).unwrap(),
            holdings_refresh: Some(Duration::from_secs(30)),
        }
    }

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).unwrap()
    }

    fn after_grace() -> Duration {
        Duration::from_secs(600)
    }

    #[test]
    fn take_profit_fires_at_target() {
        let p = policy();
        assert_eq!(
            p.evaluate(0.01, after_grace(), noon()),
            Some(ExitReason::TakeProfit)
        );
        assert_eq!(p.evaluate(0.009, after_grace(), noon()), None);
    }

    #[test]
    fn stop_loss_fires_after_grace() {
        let p = policy();
        assert_eq!(
            p.evaluate(-0.025, after_grace(), noon()),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(p.evaluate(-0.024, after_grace(), noon()), None);
    }

    #[test]
    fn grace_period_suppresses_stop_loss() {
        let p = policy();
        assert_eq!(p.evaluate(-0.03, Duration::from_secs(10), noon()), None);
    }

    #[test]
    fn emergency_rate_overrides_grace() {
        let p = policy();
        assert_eq!(
            p.evaluate(-0.05, Duration::from_secs(10), noon()),
            Some(ExitReason::StopLoss)
        );
    }

    #[test]
    fn force_sell_outranks_everything() {
        let p = policy();
        let late = NaiveTime::from_hms_opt(15, 19, 0).unwrap();
        assert_eq!(
            p.evaluate(0.05, after_grace(), late),
            Some(ExitReason::ForcedLiquidation)
        );
        assert_eq!(
            p.evaluate(-0.10, Duration::from_secs(1), late),
            Some(ExitReason::ForcedLiquidation)
        );
    }

    #[test]
    fn disabled_stop_loss_never_fires() {
        let p = ExitPolicy {
            stop_loss_enabled: false,
            ..policy()
        };
        assert_eq!(p.evaluate(-0.10, after_grace(), noon()), None);
    }

    #[test]
    fn disabled_force_sell_defers_to_other_triggers() {
        let p = ExitPolicy {
            force_sell_enabled: false,
            ..policy()
        };
        let late = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
        assert_eq!(
            p.evaluate(0.02, after_grace(), late),
            Some(ExitReason::TakeProfit)
        );
    }

    #[test]
    fn from_config_maps_refresh_interval() {
        let mut config = TradingConfig::default();
        config.holdings_refresh_secs = 0;
        assert!(ExitPolicy::from_config(&config).holdings_refresh.is_none());
        config.holdings_refresh_secs = 15;
        assert_eq!(
            ExitPolicy::from_config(&config).holdings_refresh,
            Some(Duration::from_secs(15))
        );
    }
}
