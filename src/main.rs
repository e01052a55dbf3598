use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use stockbot::broker::{OrderPort, PaperBroker};
use stockbot::execution::EntrySupervisor;
use stockbot::feed::{FeedStatus, RetryPolicy, StreamingFeed};
use stockbot::persistence::{TradeLog, TradingLock};
use stockbot::signal::{SignalSource, StdinSignalSource};
use stockbot::TradingConfig;

#[derive(Parser)]
#[command(name = "stockbot", about = "Single-position intraday auto trader")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trader, reading entry signals from stdin.
    Run {
        /// Simulate fills in-process instead of routing real orders.
        #[arg(long)]
        paper: bool,
        /// Starting cash for paper mode, in KRW.
        #[arg(long, default_value_t = 10_000_000)]
        paper_cash: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { paper, paper_cash } => run(paper, paper_cash).await,
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "stockbot=info".to_string()),
        )
        .init();
}

async fn run(paper: bool, paper_cash: i64) -> Result<()> {
    let config = TradingConfig::from_env()?;
    tracing::info!("🚀 stockbot starting");
    tracing::info!(
        account = %config.account_no,
        max_investment = config.max_investment,
        target = format!("{:+.2}%", config.target_profit_rate * 100.0),
        stop = format!("{:+.2}%", config.stop_loss_rate * 100.0),
        force_sell = %config.daily_force_sell_time,
        paper,
        "configuration"
    );

    let retry = {
        let policy = RetryPolicy::with_backoff(
            Duration::from_secs(config.reconnect_delay_secs),
            Duration::from_secs(config.reconnect_max_delay_secs),
        );
        match config.reconnect_max_attempts {
            Some(n) => policy.bounded(n),
            None => policy,
        }
    };
    let feed = StreamingFeed::new(config.ws_url.clone(), config.access_token.clone(), retry);

    let broker: Arc<dyn OrderPort> = if paper {
        tracing::info!(cash = paper_cash, "paper broker active, no real orders");
        Arc::new(PaperBroker::with_feed(paper_cash, Arc::clone(&feed)))
    } else {
        // The live order gateway ships separately; refuse rather than trade
        // against a half-wired account.
        anyhow::bail!("live order routing is not configured, run with --paper");
    };

    let lock = TradingLock::new(&config.lock_file);
    let trade_log = TradeLog::new(&config.results_dir)?;
    let supervisor = EntrySupervisor::new(
        Arc::clone(&broker),
        Arc::clone(&feed),
        lock,
        trade_log,
        config,
    );

    let mut active = supervisor.recover().await?;
    if active.is_some() {
        tracing::info!("recovered an open position, buy entries disabled until it closes");
    }

    let mut signals = StdinSignalSource::new();
    let mut feed_status = feed.status();
    tracing::info!("awaiting entry signals on stdin: code[,name]");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("⚠️  received Ctrl+C, shutting down");
                break;
            }
            changed = feed_status.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = feed_status.borrow_and_update().clone();
                if let FeedStatus::Failed(reason) = status {
                    tracing::error!(%reason, "price stream permanently unavailable");
                    break;
                }
            }
            signal = signals.next_signal() => {
                let Some(signal) = signal else {
                    tracing::info!("signal source closed");
                    break;
                };
                if active.as_ref().map(|e| !e.is_exited()).unwrap_or(false) {
                    tracing::warn!(instrument = %signal.instrument, "position still open, ignoring signal");
                    continue;
                }
                match supervisor.open_position(&signal).await {
                    Ok(Some(engine)) => active = Some(engine),
                    Ok(None) => {}
                    Err(e) => tracing::error!(error = %e, "entry failed"),
                }
            }
        }
    }

    feed.close();
    tracing::info!("👋 stockbot stopped");
    Ok(())
}
