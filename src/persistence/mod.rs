//! File-backed stores: the one-trade-per-day lock and the trade result log.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::TradeResult;

/// Contents of the daily lock file. One entry; a new trade overwrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub date: NaiveDate,
    pub recorded_at: DateTime<Utc>,
    pub instrument: String,
    pub name: String,
    pub entry_price: i64,
    pub quantity: i64,
}

/// Enforces at most one entry per calendar day across process restarts.
///
/// Fails open: a missing or unreadable lock file never blocks trading, it
/// only loses the restart guard for that day.
#[derive(Debug, Clone)]
pub struct TradingLock {
    path: PathBuf,
}

impl TradingLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read(&self) -> Option<LockRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read lock file");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt lock file, ignoring");
                None
            }
        }
    }

    pub fn has_traded_today(&self, today: NaiveDate) -> bool {
        self.read().map(|r| r.date == today).unwrap_or(false)
    }

    pub fn record_entry(&self, record: &LockRecord) -> Result<()> {
        let raw = serde_json::to_string_pretty(record)?;
        fs::write(&self.path, raw)
            .with_context(|| format!("writing lock file {}", self.path.display()))?;
        debug!(path = %self.path.display(), date = %record.date, "trading lock recorded");
        Ok(())
    }
}

/// Writes one JSON file per completed trade into the results directory.
#[derive(Debug, Clone)]
pub struct TradeLog {
    dir: PathBuf,
}

impl TradeLog {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating results directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name: `<yyyymmdd_hhmmss>_<instrument>_<reason>.json`.
    pub fn record(&self, result: &TradeResult) -> Result<PathBuf> {
        let stamp = result.exit_time.format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!(
            "{stamp}_{}_{}.json",
            result.instrument,
            result.reason.slug()
        ));
        let raw = serde_json::to_string_pretty(result)?;
        fs::write(&path, raw)
            .with_context(|| format!("writing trade result {}", path.display()))?;
        Ok(path)
    }
}
