//! Entry signal sources.
//!
//! Signal generation is pluggable: the default binary reads instrument
//! codes from stdin, and anything that can push into a channel can drive
//! the supervisor programmatically.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::warn;

use crate::models::EntrySignal;

/// Produces entry signals until exhausted.
#[async_trait]
pub trait SignalSource: Send {
    /// Next signal, or `None` when the source is finished.
    async fn next_signal(&mut self) -> Option<EntrySignal>;
}

/// Signals pushed through a tokio channel.
pub struct ChannelSignalSource {
    rx: mpsc::Receiver<EntrySignal>,
}

impl ChannelSignalSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<EntrySignal>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl SignalSource for ChannelSignalSource {
    async fn next_signal(&mut self) -> Option<EntrySignal> {
        self.rx.recv().await
    }
}

/// Reads `code[,name]` lines from stdin; blank lines and `#` comments are
/// skipped, bad lines are logged and skipped.
pub struct StdinSignalSource {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinSignalSource {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinSignalSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalSource for StdinSignalSource {
    async fn next_signal(&mut self) -> Option<EntrySignal> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "failed to read signal line");
                    return None;
                }
            };
            match parse_line(&line) {
                Some(signal) => return Some(signal),
                None => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() && !trimmed.starts_with('#') {
                        warn!(line = trimmed, "ignoring malformed signal line");
                    }
                }
            }
        }
    }
}

/// `code[,name]` with a 6-digit instrument code.
fn parse_line(line: &str) -> Option<EntrySignal> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (code, name) = match trimmed.split_once(',') {
        Some((code, name)) => (code.trim(), name.trim()),
        None => (trimmed, ""),
    };
    if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(EntrySignal {
        instrument: code.to_string(),
        name: if name.is_empty() {
            code.to_string()
        } else {
            name.to_string()
        },
    })
}
