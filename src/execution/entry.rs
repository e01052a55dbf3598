//! Position entry: one trade per day, inside the buy window, sized to the
//! configured budget with a slippage safety margin.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveTime, Utc};
use tracing::{info, warn};

use crate::broker::OrderPort;
use crate::config::TradingConfig;
use crate::feed::{StreamingFeed, TickSink};
use crate::models::{EntrySignal, Position, PriceTick, TickSource};
use crate::persistence::{LockRecord, TradeLog, TradingLock};

use super::engine::{ExitPolicy, ExitPolicyEngine};

pub struct EntrySupervisor {
    broker: Arc<dyn OrderPort>,
    feed: Arc<StreamingFeed>,
    lock: TradingLock,
    trade_log: TradeLog,
    config: TradingConfig,
}

impl EntrySupervisor {
    pub fn new(
        broker: Arc<dyn OrderPort>,
        feed: Arc<StreamingFeed>,
        lock: TradingLock,
        trade_log: TradeLog,
        config: TradingConfig,
    ) -> Self {
        Self {
            broker,
            feed,
            lock,
            trade_log,
            config,
        }
    }

    /// Shares to buy for `budget` at `price`, holding back `safety_margin`
    /// of the budget to absorb market-order slippage.
    pub fn buy_quantity(price: i64, budget: i64, safety_margin: f64) -> i64 {
        if price <= 0 || budget <= 0 {
            return 0;
        }
        let adjusted = (budget as f64 * (1.0 - safety_margin)) as i64;
        adjusted / price
    }

    pub fn within_buy_window(&self, now: NaiveTime) -> bool {
        self.config.buy_window_start <= now && now < self.config.buy_window_end
    }

    /// Opens a position for `signal` and starts exit monitoring.
    ///
    /// Returns `Ok(None)` when the signal is declined (already traded today,
    /// outside the buy window, or budget too small for one share). Broker
    /// failures propagate; a failed buy leaves the daily lock unset.
    pub async fn open_position(&self, signal: &EntrySignal) -> Result<Option<Arc<ExitPolicyEngine>>> {
        let now = Local::now();
        if self.lock.has_traded_today(now.date_naive()) {
            warn!(instrument = %signal.instrument, "already traded today, ignoring signal");
            return Ok(None);
        }
        if !self.within_buy_window(now.time()) {
            warn!(
                instrument = %signal.instrument,
                window = %format!("{}..{}", self.config.buy_window_start, self.config.buy_window_end),
                "outside buy window, ignoring signal"
            );
            return Ok(None);
        }

        let price = self
            .broker
            .current_price(&signal.instrument)
            .await
            .with_context(|| format!("quoting {}", signal.instrument))?;
        anyhow::ensure!(price > 0, "no usable quote for {}", signal.instrument);

        let cash = self.broker.available_cash().await?;
        let budget = self.config.max_investment.min(cash);
        let quantity = Self::buy_quantity(price, budget, self.config.safety_margin);
        if quantity <= 0 {
            warn!(
                instrument = %signal.instrument,
                price,
                budget,
                "budget too small for a single share, ignoring signal"
            );
            return Ok(None);
        }

        info!(
            instrument = %signal.instrument,
            name = %signal.name,
            price,
            quantity,
            budget,
            "placing entry buy"
        );
        let receipt = self
            .broker
            .buy_market(&signal.instrument, quantity)
            .await
            .with_context(|| format!("buying {}", signal.instrument))?;

        let entry_price = receipt.avg_fill_price.unwrap_or(price);
        let entry_quantity = if receipt.filled_quantity > 0 {
            receipt.filled_quantity
        } else {
            quantity
        };

        self.lock.record_entry(&LockRecord {
            date: now.date_naive(),
            recorded_at: Utc::now(),
            instrument: signal.instrument.clone(),
            name: signal.name.clone(),
            entry_price,
            quantity: entry_quantity,
        })?;

        info!(order_no = %receipt.order_no, entry_price, entry_quantity, "entry filled");
        let position = Position {
            instrument: signal.instrument.clone(),
            name: signal.name.clone(),
            entry_price,
            quantity: entry_quantity,
            entry_time: Utc::now(),
        };
        Ok(Some(self.start_monitoring(position)))
    }

    /// Startup recovery: if the broker already reports a holding, resume
    /// exit monitoring for it instead of waiting for a new signal.
    pub async fn recover(&self) -> Result<Option<Arc<ExitPolicyEngine>>> {
        let Some(holding) = self.broker.holdings().await? else {
            return Ok(None);
        };
        if holding.quantity <= 0 {
            return Ok(None);
        }
        // Reuse the recorded entry time when the lock matches, so the
        // stop-loss grace period does not restart across a quick restart.
        let entry_time = self
            .lock
            .read()
            .filter(|r| r.instrument == holding.instrument && r.date == Local::now().date_naive())
            .map(|r| r.recorded_at)
            .unwrap_or_else(Utc::now);

        info!(
            instrument = %holding.instrument,
            name = %holding.name,
            quantity = holding.quantity,
            avg_cost = holding.avg_cost,
            "existing holding found, resuming exit monitoring"
        );
        let position = Position {
            instrument: holding.instrument,
            name: holding.name,
            entry_price: holding.avg_cost,
            quantity: holding.quantity,
            entry_time,
        };
        Ok(Some(self.start_monitoring(position)))
    }

    /// Wires an exit engine to the stream and spawns the polling backstop.
    pub fn start_monitoring(&self, position: Position) -> Arc<ExitPolicyEngine> {
        let engine = ExitPolicyEngine::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.feed),
            self.trade_log.clone(),
            ExitPolicy::from_config(&self.config),
            position.clone(),
        );
        if !self.config.enable_sell_monitoring {
            warn!(instrument = %position.instrument, "sell monitoring disabled, position left unmanaged");
            return engine;
        }

        self.feed
            .subscribe(&position.instrument, Arc::clone(&engine) as Arc<dyn TickSink>);

        // REST polling backstop keeps exits working through stream outages.
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let broker = Arc::clone(&self.broker);
        let poller = Arc::clone(&engine);
        let instrument = position.instrument.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if poller.is_exited() {
                    break;
                }
                match broker.current_price(&instrument).await {
                    Ok(price) if price > 0 => {
                        let tick = PriceTick {
                            instrument: instrument.clone(),
                            price,
                            timestamp: Utc::now(),
                            source: TickSource::Poll,
                        };
                        poller.on_tick(&tick).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, %instrument, "price poll failed"),
                }
            }
        });
        engine
    }
}
