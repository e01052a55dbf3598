use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a price observation came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TickSource {
    /// Real-time websocket stream.
    Stream,
    /// Periodic REST snapshot used as a backstop when the stream is quiet.
    Poll,
}

/// A single price observation for one instrument.
///
/// Prices are KRW integers; the exchange quotes whole won.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub instrument: String,
    pub price: i64,
    pub timestamp: DateTime<Utc>,
    pub source: TickSource,
}

/// Broker-reported holding for the account's single tracked position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Holding {
    pub instrument: String,
    pub name: String,
    pub quantity: i64,
    /// Average acquisition cost per share, in KRW.
    pub avg_cost: i64,
}

/// The open position being monitored for exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub name: String,
    /// Reference price for profit/loss, normally the broker's average cost.
    pub entry_price: i64,
    pub quantity: i64,
    pub entry_time: DateTime<Utc>,
}

impl Position {
    /// Unrealized return at `price`, as a decimal rate (0.01 = +1%).
    pub fn unrealized_rate(&self, price: i64) -> f64 {
        if self.entry_price <= 0 {
            return 0.0;
        }
        (price - self.entry_price) as f64 / self.entry_price as f64
    }
}

/// Why a position was closed, in priority order (highest first).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    ForcedLiquidation,
    StopLoss,
    TakeProfit,
}

impl ExitReason {
    /// Short slug used in result file names.
    pub fn slug(&self) -> &'static str {
        match self {
            ExitReason::ForcedLiquidation => "force_sell",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
        }
    }
}

/// Record of one completed round trip, written to the results directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub id: Uuid,
    pub instrument: String,
    pub name: String,
    pub entry_price: i64,
    pub exit_price: i64,
    pub quantity: i64,
    /// Realized return as a decimal rate.
    pub realized_rate: f64,
    pub reason: ExitReason,
    /// True when the pre-exit holdings query failed and cached position
    /// data was used to size the sell order.
    pub stale_holdings: bool,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
}

/// Instruction to open a position, produced by a `SignalSource`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub instrument: String,
    pub name: String,
}
