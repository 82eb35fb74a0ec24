//! Console summaries for the `stats`, `parse` and `ingest` commands.

use crate::models::DayKey;
use crate::pipeline::IngestReport;
use crate::storage::{Repository, StorageError};
use std::fmt;
use std::path::{Path, PathBuf};

const RULE: &str = "─────────────────────────────────";

/// What the store currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub db_path: PathBuf,
    pub raw_rows: i64,
    pub daily_rows: i64,
    /// First and last aggregated day.
    pub days: Option<(DayKey, DayKey)>,
}

impl StoreStats {
    pub fn collect(repo: &Repository, db_path: &Path) -> Result<Self, StorageError> {
        Ok(Self {
            db_path: db_path.to_path_buf(),
            raw_rows: repo.raw_count()?,
            daily_rows: repo.daily_count()?,
            days: repo.day_range()?,
        })
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let day = |d: Option<DayKey>| d.map(|d| d.to_string()).unwrap_or_else(|| "—".into());
        writeln!(f, "{RULE}")?;
        writeln!(f, "  radiant-net: Database Stats")?;
        writeln!(f, "{RULE}")?;
        writeln!(f, "  File       : {}", self.db_path.display())?;
        writeln!(f, "  Raw rows   : {}", grouped(self.raw_rows))?;
        writeln!(f, "  Daily rows : {}", grouped(self.daily_rows))?;
        writeln!(f, "  From       : {}", day(self.days.map(|(first, _)| first)))?;
        writeln!(f, "  To         : {}", day(self.days.map(|(_, last)| last)))?;
        write!(f, "{RULE}")
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Groups: {} total, {} ingested, {} paywalled, {} failed ({:.2?})",
            self.groups_total,
            self.ingested,
            self.paywalled.len(),
            self.failed.len(),
            self.elapsed
        )?;
        write!(
            f,
            "Rows:   raw {} new / {} kept, daily {} new / {} kept",
            grouped(self.raw.inserted as i64),
            grouped(self.raw.skipped as i64),
            grouped(self.daily.inserted as i64),
            grouped(self.daily.skipped as i64)
        )?;
        for label in &self.paywalled {
            write!(f, "\n  paywalled  {}", label)?;
        }
        for failed in &self.failed {
            write!(f, "\n  failed     {}: {}", failed.label, failed.reason)?;
        }
        Ok(())
    }
}

/// Row counts with thousands separators: `1234567` → `1,234,567`.
fn grouped(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let head = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    out.push_str(&digits[..head]);
    for (i, chunk) in digits.as_bytes()[head..].chunks(3).enumerate() {
        if head > 0 || i > 0 {
            out.push(',');
        }
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
    }
    out
}
