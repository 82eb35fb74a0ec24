//! Ingestion: chart files on disk → tables → storage.
//!
//! Each group (one day's production chart plus an optional consumption chart)
//! is handled on its own:
//!   1. load both documents
//!   2. skip the day if any member is paywalled
//!   3. transform each chart, merge consumption into production
//!   4. append raw + daily rows (existing keys are skipped, never overwritten)
//!
//! A group that cannot be read or transformed is recorded in the report and the
//! run moves on. Storage errors abort the run.

use crate::config::AppConfig;
use crate::loader::{self, LoadError};
use crate::models::{ChartFileGroup, ChartFileSet, ChartPayload, ChartType, TablePair};
use crate::portal::fetcher::file_group;
use crate::portal::{ChartFetcher, PortalSession};
use crate::storage::{InsertSummary, Repository, StorageError};
use crate::transform::{DataError, SeriesTransform};
use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a single group was left out.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("{chart_type} chart: {source}")]
    Data {
        chart_type: ChartType,
        #[source]
        source: DataError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedGroup {
    pub label: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub groups_total: usize,
    pub ingested: usize,
    /// Labels of days skipped because the portal withheld their data.
    pub paywalled: Vec<String>,
    pub failed: Vec<FailedGroup>,
    pub raw: InsertSummary,
    pub daily: InsertSummary,
    pub elapsed: Duration,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of preparing one group for storage.
enum Prepared {
    Tables(TablePair),
    Paywalled,
}

pub struct IngestionPipeline {
    transform: SeriesTransform,
}

impl IngestionPipeline {
    pub fn new(transform: SeriesTransform) -> Self {
        Self { transform }
    }

    /// Chart files under `input_dir`, paired by day.
    pub fn discover_groups(&self, input_dir: &Path) -> Result<ChartFileSet> {
        loader::discover_groups(input_dir)
            .with_context(|| format!("Failed to list chart files in {:?}", input_dir))
    }

    pub fn ingest(
        &self,
        groups: &[ChartFileGroup],
        repo: &Repository,
    ) -> Result<IngestReport, StorageError> {
        let started = Instant::now();
        let mut report = IngestReport {
            groups_total: groups.len(),
            ..Default::default()
        };

        for group in groups {
            let tables = match self.prepare(group) {
                Ok(Prepared::Tables(tables)) => tables,
                Ok(Prepared::Paywalled) => {
                    warn!("{}: paywalled, skipping the whole day", group.label);
                    report.paywalled.push(group.label.clone());
                    continue;
                }
                Err(e) => {
                    warn!("{}: {}", group.label, e);
                    report.failed.push(FailedGroup {
                        label: group.label.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let (raw, daily) = repo.insert_pair(&tables)?;
            report.raw += raw;
            report.daily += daily;
            report.ingested += 1;
            info!(
                "{}: {} raw rows, {} days",
                group.label,
                tables.raw.len(),
                tables.daily.len()
            );
        }

        report.elapsed = started.elapsed();
        info!(
            "Ingested {}/{} groups ({} paywalled, {} failed) in {:.2?}; raw +{} ~{}, daily +{} ~{}",
            report.ingested,
            report.groups_total,
            report.paywalled.len(),
            report.failed.len(),
            report.elapsed,
            report.raw.inserted,
            report.raw.skipped,
            report.daily.inserted,
            report.daily.skipped,
        );
        Ok(report)
    }

    /// [`Self::ingest`] for a discovered file set; unpaired files count as
    /// failed groups.
    pub fn ingest_files(
        &self,
        files: &ChartFileSet,
        repo: &Repository,
    ) -> Result<IngestReport, StorageError> {
        let mut report = self.ingest(&files.groups, repo)?;
        report.groups_total += files.unpaired.len();
        report.failed.extend(files.unpaired.iter().map(|file| FailedGroup {
            label: file.label.clone(),
            reason: format!("no production chart next to {:?}", file.path),
        }));
        Ok(report)
    }

    fn prepare(&self, group: &ChartFileGroup) -> Result<Prepared, GroupError> {
        let charts = loader::load_chart_group(group)?;
        if charts.is_paywalled() {
            return Ok(Prepared::Paywalled);
        }
        debug!(
            "{}: transforming production{}",
            charts.label,
            if charts.consumption.is_some() { " + consumption" } else { "" }
        );

        let process = |chart_type: ChartType, payload: &ChartPayload| {
            self.transform
                .process(payload)
                .map_err(|source| GroupError::Data { chart_type, source })
        };
        let production = process(ChartType::Production, &charts.production)?;
        let consumption = charts
            .consumption
            .as_ref()
            .map(|payload| process(ChartType::Consumption, payload))
            .transpose()?;

        Ok(Prepared::Tables(
            self.transform
                .merge_production_consumption(production, consumption),
        ))
    }
}

/// Log in, fetch both charts of `today - days_ago` and ingest them.
pub async fn ingest_day(config: &AppConfig, days_ago: u32) -> Result<IngestReport> {
    let credentials = config.credentials()?;
    let transform = config.series_transform()?;
    let tz = transform.timezone();

    let session = PortalSession::connect(&config.portal, credentials)
        .await
        .context("Login to the portal failed")?;
    let fetcher = ChartFetcher::new(&session, tz);
    let date = fetcher
        .today()
        .checked_sub_days(chrono::Days::new(days_ago.into()))
        .ok_or_else(|| anyhow!("{} days ago is out of range", days_ago))?;
    let files = fetcher
        .run_for_date(&config.paths.raw_data_dir, date)
        .await
        .context("Fetching charts failed")?;

    let group = file_group(date, &files)
        .ok_or_else(|| anyhow!("No production chart was written for {}", date))?;

    let repo = Repository::open(&config.storage.db_path)
        .with_context(|| format!("Failed to open {:?}", config.storage.db_path))?;
    let report = IngestionPipeline::new(transform).ingest(&[group], &repo)?;
    Ok(report)
}
