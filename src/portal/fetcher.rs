use super::{ChartSource, PortalError};
use crate::loader::chart_file_name;
use crate::models::{ChartFileGroup, ChartType};
use chrono::{Days, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error("could not write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not serialize chart: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} days ago is before the start of the calendar")]
    DateOutOfRange(u32),
}

/// Decides which charts to request and writes them to disk untouched.
pub struct ChartFetcher<'a, S: ChartSource + ?Sized> {
    source: &'a S,
    tz: Tz,
}

impl<'a, S: ChartSource + ?Sized> ChartFetcher<'a, S> {
    /// `tz` decides which calendar day "today" is.
    pub fn new(source: &'a S, tz: Tz) -> Self {
        Self { source, tz }
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }

    pub async fn fetch_and_save(
        &self,
        date: NaiveDate,
        chart_type: ChartType,
        output_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        let chart = self.source.get_chart(date, chart_type).await?;

        std::fs::create_dir_all(output_dir).map_err(|source| FetchError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;
        let path = output_dir.join(chart_file_name(date, chart_type));
        let text = serde_json::to_string_pretty(&chart)?;
        std::fs::write(&path, text).map_err(|source| FetchError::Io {
            path: path.clone(),
            source,
        })?;

        info!("Saved {} chart for {} to {:?}", chart_type, date, path);
        Ok(path)
    }

    /// Fetch both charts of `today - days_ago`.
    pub async fn run(
        &self,
        output_dir: &Path,
        days_ago: u32,
    ) -> Result<BTreeMap<ChartType, PathBuf>, FetchError> {
        let date = self
            .today()
            .checked_sub_days(Days::new(days_ago.into()))
            .ok_or(FetchError::DateOutOfRange(days_ago))?;
        self.run_for_date(output_dir, date).await
    }

    pub async fn run_for_date(
        &self,
        output_dir: &Path,
        date: NaiveDate,
    ) -> Result<BTreeMap<ChartType, PathBuf>, FetchError> {
        let mut written = BTreeMap::new();
        for chart_type in ChartType::ALL {
            let path = self.fetch_and_save(date, chart_type, output_dir).await?;
            written.insert(chart_type, path);
        }
        Ok(written)
    }
}

/// Turn the files of one [`ChartFetcher::run`] into an ingestible group.
pub fn file_group(date: NaiveDate, files: &BTreeMap<ChartType, PathBuf>) -> Option<ChartFileGroup> {
    Some(ChartFileGroup {
        label: date.format("%Y%m%d").to_string(),
        production: files.get(&ChartType::Production)?.clone(),
        consumption: files.get(&ChartType::Consumption).cloned(),
    })
}
