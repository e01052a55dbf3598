use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;

/// Runtime configuration, loaded from environment variables (optionally via
/// a `.env` file). Rate variables are given in percent and stored as decimal
/// rates internally.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub account_no: String,

    /// Per-trade budget ceiling in KRW.
    pub max_investment: i64,
    /// Fraction of the budget held back to absorb slippage on market buys.
    pub safety_margin: f64,

    pub target_profit_rate: f64,
    pub stop_loss_rate: f64,
    /// Losses at or below this rate bypass the stop-loss grace period.
    pub emergency_stop_rate: f64,
    pub stop_loss_grace: Duration,

    pub enable_stop_loss: bool,
    pub enable_sell_monitoring: bool,
    pub enable_daily_force_sell: bool,
    pub daily_force_sell_time: NaiveTime,

    pub buy_window_start: NaiveTime,
    pub buy_window_end: NaiveTime,

    /// Periodic holdings reconciliation interval; zero disables it.
    pub holdings_refresh_secs: u64,
    /// REST price polling backstop interval.
    pub poll_interval_secs: u64,

    pub ws_url: String,
    pub access_token: String,
    pub reconnect_delay_secs: u64,
    pub reconnect_max_delay_secs: u64,
    /// `None` retries forever.
    pub reconnect_max_attempts: Option<u32>,

    pub lock_file: PathBuf,
    pub results_dir: PathBuf,
}

impl TradingConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            account_no: env::var("ACCOUNT_NO").context("ACCOUNT_NO must be set")?,
            max_investment: env_parse("MAX_INVESTMENT", 1_000_000)?,
            safety_margin: env_parse("SAFETY_MARGIN", 0.02)?,
            target_profit_rate: env_percent("TARGET_PROFIT_RATE", 1.0)?,
            stop_loss_rate: env_percent("STOP_LOSS_RATE", -2.5)?,
            emergency_stop_rate: env_percent("EMERGENCY_STOP_RATE", -5.0)?,
            stop_loss_grace: Duration::from_secs(
                env_parse::<u64>("STOP_LOSS_DELAY_MINUTES", 1)? * 60,
            ),
            enable_stop_loss: env_flag("ENABLE_STOP_LOSS", true)?,
            enable_sell_monitoring: env_flag("ENABLE_SELL_MONITORING", true)?,
            enable_daily_force_sell: env_flag("ENABLE_DAILY_FORCE_SELL", true)?,
            daily_force_sell_time: env_time("DAILY_FORCE_SELL_TIME", "15:19")?,
            buy_window_start: env_time("BUY_WINDOW_START", "09:00")?,
            buy_window_end: env_time("BUY_WINDOW_END", "09:10")?,
            holdings_refresh_secs: env_parse("BALANCE_CHECK_INTERVAL", 30)?,
            poll_interval_secs: env_parse("POLL_INTERVAL_SECONDS", 10)?,
            ws_url: env::var("WS_URL")
                .unwrap_or_else(|_| "wss://api.kiwoom.com:10000/api/dostk/websocket".to_string()),
            access_token: env::var("ACCESS_TOKEN").unwrap_or_default(),
            reconnect_delay_secs: env_parse("RECONNECT_DELAY_SECONDS", 2)?,
            reconnect_max_delay_secs: env_parse("RECONNECT_MAX_DELAY_SECONDS", 60)?,
            reconnect_max_attempts: match env_parse::<u32>("RECONNECT_MAX_ATTEMPTS", 0)? {
                0 => None,
                n => Some(n),
            },
            lock_file: PathBuf::from(
                env::var("LOCK_FILE").unwrap_or_else(|_| "daily_trading_lock.json".to_string()),
            ),
            results_dir: PathBuf::from(
                env::var("RESULTS_DIR").unwrap_or_else(|_| "trading_results".to_string()),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_investment > 0, "MAX_INVESTMENT must be positive");
        anyhow::ensure!(
            (0.0..1.0).contains(&self.safety_margin),
            "SAFETY_MARGIN must be in [0, 1)"
        );
        anyhow::ensure!(
            self.target_profit_rate > 0.0,
            "TARGET_PROFIT_RATE must be positive"
        );
        anyhow::ensure!(self.stop_loss_rate < 0.0, "STOP_LOSS_RATE must be negative");
        anyhow::ensure!(
            self.emergency_stop_rate <= self.stop_loss_rate,
            "EMERGENCY_STOP_RATE must be at or below STOP_LOSS_RATE"
        );
        anyhow::ensure!(
            self.buy_window_start < self.buy_window_end,
            "buy window start must precede its end"
        );
        Ok(())
    }
}

#[cfg(test)]
impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            account_no: "00000000-01".to_string(),
            max_investment: 1_000_000,
            safety_margin: 0.02,
            target_profit_rate: 0.01,
            stop_loss_rate: -0.025,
            emergency_stop_rate: -0.05,
            stop_loss_grace: Duration::from_secs(60),
            enable_stop_loss: true,
            enable_sell_monitoring: true,
            enable_daily_force_sell: true,
            daily_force_sell_time: NaiveTime::from_hms_opt(15, 19, 0).unwrap(),
            buy_window_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            buy_window_end: NaiveTime::from_hms_opt(9, 10, 0).unwrap(),
            holdings_refresh_secs: 30,
            poll_interval_secs: 10,
            ws_url: "ws://127.0.0.1:10000".to_string(),
            access_token: String::new(),
            reconnect_delay_secs: 2,
            reconnect_max_delay_secs: 60,
            reconnect_max_attempts: None,
            lock_file: PathBuf::from("daily_trading_lock.json"),
            results_dir: PathBuf::from("trading_results"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}")),
        Err(_) => Ok(default),
    }
}

/// Percent-denominated variable, converted to a decimal rate.
fn env_percent(key: &str, default_percent: f64) -> Result<f64> {
    Ok(env_parse(key, default_percent)? / 100.0)
}

fn env_flag(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("invalid value for {key}: {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

fn env_time(key: &str, default: &str) -> Result<NaiveTime> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .with_context(|| format!("{key} must be HH:MM, got {raw:?}"))
}
