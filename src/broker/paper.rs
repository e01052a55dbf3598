use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::feed::StreamingFeed;
use crate::models::Holding;

use super::{OrderPort, OrderReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSide {
    Buy,
    Sell,
}

/// Executed paper order, kept for inspection.
#[derive(Debug, Clone)]
pub struct PaperFill {
    pub side: FillSide,
    pub instrument: String,
    pub quantity: i64,
    pub price: i64,
}

#[derive(Default)]
struct PaperState {
    cash: i64,
    marks: HashMap<String, i64>,
    holding: Option<Holding>,
    fills: Vec<PaperFill>,
}

/// In-memory broker that fills orders instantly at the marked price.
///
/// Marks come from `set_price`, or from the attached feed's last-price
/// cache when one is wired in.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    next_order: AtomicU64,
    feed: Option<Arc<StreamingFeed>>,
}

impl PaperBroker {
    pub fn new(cash: i64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                cash,
                ..PaperState::default()
            }),
            next_order: AtomicU64::new(1),
            feed: None,
        }
    }

    /// Marks follow the live stream's last-price cache.
    pub fn with_feed(cash: i64, feed: Arc<StreamingFeed>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new(cash)
        }
    }

    pub fn set_price(&self, instrument: &str, price: i64) {
        let mut state = self.state.lock().unwrap();
        state.marks.insert(instrument.to_string(), price);
    }

    pub fn fills(&self) -> Vec<PaperFill> {
        self.state.lock().unwrap().fills.clone()
    }

    fn mark(&self, state: &PaperState, instrument: &str) -> Result<i64, BrokerError> {
        state
            .marks
            .get(instrument)
            .copied()
            .or_else(|| self.feed.as_ref().and_then(|f| f.last_price(instrument)))
            .ok_or_else(|| BrokerError::Rejected(format!("no quote for {instrument}")))
    }

    fn receipt(&self, price: i64, quantity: i64) -> OrderReceipt {
        OrderReceipt {
            order_no: format!("P{:08}", self.next_order.fetch_add(1, Ordering::Relaxed)),
            avg_fill_price: Some(price),
            filled_quantity: quantity,
        }
    }

    fn fill_sell(
        &self,
        instrument: &str,
        quantity: i64,
        price: i64,
    ) -> Result<OrderReceipt, BrokerError> {
        let mut state = self.state.lock().unwrap();
        let holding = state
            .holding
            .as_mut()
            .filter(|h| h.instrument == instrument)
            .ok_or_else(|| BrokerError::Rejected(format!("no holding in {instrument}")))?;
        if holding.quantity < quantity {
            return Err(BrokerError::Rejected(format!(
                "sell quantity {quantity} exceeds holding {}",
                holding.quantity
            )));
        }
        holding.quantity -= quantity;
        if holding.quantity == 0 {
            state.holding = None;
        }
        state.cash += price * quantity;
        state.fills.push(PaperFill {
            side: FillSide::Sell,
            instrument: instrument.to_string(),
            quantity,
            price,
        });
        Ok(self.receipt(price, quantity))
    }
}

#[async_trait]
impl OrderPort for PaperBroker {
    async fn buy_market(
        &self,
        instrument: &str,
        quantity: i64,
    ) -> Result<OrderReceipt, BrokerError> {
        if quantity <= 0 {
            return Err(BrokerError::Rejected("quantity must be positive".into()));
        }
        let mut state = self.state.lock().unwrap();
        if let Some(held) = &state.holding {
            if held.instrument != instrument {
                return Err(BrokerError::Rejected(format!(
                    "account already holds {}",
                    held.instrument
                )));
            }
        }
        let price = self.mark(&state, instrument)?;
        let cost = price * quantity;
        if cost > state.cash {
            return Err(BrokerError::Rejected(format!(
                "insufficient cash: need {cost}, have {}",
                state.cash
            )));
        }
        state.cash -= cost;
        match &mut state.holding {
            Some(held) => {
                let total_cost = held.avg_cost * held.quantity + cost;
                held.quantity += quantity;
                held.avg_cost = total_cost / held.quantity;
            }
            None => {
                state.holding = Some(Holding {
                    instrument: instrument.to_string(),
                    name: instrument.to_string(),
                    quantity,
                    avg_cost: price,
                });
            }
        }
        state.fills.push(PaperFill {
            side: FillSide::Buy,
            instrument: instrument.to_string(),
            quantity,
            price,
        });
        Ok(self.receipt(price, quantity))
    }

    async fn sell_limit(
        &self,
        instrument: &str,
        quantity: i64,
        price: i64,
    ) -> Result<OrderReceipt, BrokerError> {
        // Exit limits are placed below the current price, so fill at the limit.
        self.fill_sell(instrument, quantity, price)
    }

    async fn sell_market(
        &self,
        instrument: &str,
        quantity: i64,
    ) -> Result<OrderReceipt, BrokerError> {
        let price = {
            let state = self.state.lock().unwrap();
            self.mark(&state, instrument)?
        };
        self.fill_sell(instrument, quantity, price)
    }

    async fn holdings(&self) -> Result<Option<Holding>, BrokerError> {
        Ok(self.state.lock().unwrap().holding.clone())
    }

    async fn available_cash(&self) -> Result<i64, BrokerError> {
        Ok(self.state.lock().unwrap().cash)
    }

    async fn current_price(&self, instrument: &str) -> Result<i64, BrokerError> {
        let state = self.state.lock().unwrap();
        self.mark(&state, instrument)
    }
}
