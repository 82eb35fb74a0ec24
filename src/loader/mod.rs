//! Discovery and loading of chart JSON files written by the fetcher.

use crate::models::{ChartFileGroup, ChartFileSet, ChartGroup, ChartPayload, ChartType, UnpairedFile};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

static SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<base>.+?)_(?P<kind>production|consumption)$").expect("static pattern")
});

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?} is not a chart document: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File name the fetcher writes a chart to: `YYYYMMDD_<type>.json`.
pub fn chart_file_name(date: chrono::NaiveDate, chart_type: ChartType) -> String {
    format!("{}_{}.json", date.format("%Y%m%d"), chart_type)
}

/// Split a file stem into its group base and chart type. A stem without suffix
/// is a production chart.
fn classify(path: &Path) -> Option<(String, ChartType)> {
    let stem = path.file_stem()?.to_str()?;
    match SUFFIX_RE.captures(stem) {
        Some(caps) => {
            let kind = match &caps["kind"] {
                "consumption" => ChartType::Consumption,
                _ => ChartType::Production,
            };
            Some((caps["base"].to_string(), kind))
        }
        None => Some((stem.to_string(), ChartType::Production)),
    }
}

pub fn discover_json_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Pair production and consumption files of the same base name. Consumption
/// files without a production partner come back as unpaired.
pub fn group_chart_files(files: &[PathBuf]) -> ChartFileSet {
    let mut slots: BTreeMap<(PathBuf, String), (Option<PathBuf>, Option<PathBuf>)> =
        BTreeMap::new();

    for path in files {
        let Some((base, kind)) = classify(path) else {
            warn!("Skipping file with unusable name: {:?}", path);
            continue;
        };
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let slot = slots.entry((dir, base)).or_default();
        let target = match kind {
            ChartType::Production => &mut slot.0,
            ChartType::Consumption => &mut slot.1,
        };
        if let Some(previous) = target.replace(path.clone()) {
            warn!("{:?} shadows {:?} in the same group", path, previous);
        }
    }

    let mut set = ChartFileSet::default();
    for ((_, label), (production, consumption)) in slots {
        match (production, consumption) {
            (Some(production), consumption) => set.groups.push(ChartFileGroup {
                label,
                production,
                consumption,
            }),
            (None, Some(path)) => {
                warn!("{}: consumption chart without production chart", label);
                set.unpaired.push(UnpairedFile { label, path });
            }
            (None, None) => {}
        }
    }
    set
}

pub fn discover_groups(dir: &Path) -> std::io::Result<ChartFileSet> {
    let files = discover_json_files(dir)?;
    debug!("{} JSON files in {:?}", files.len(), dir);
    Ok(group_chart_files(&files))
}

pub fn load_chart(path: &Path) -> Result<ChartPayload, LoadError> {
    debug!("Loading {:?}", path);
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_chart_group(group: &ChartFileGroup) -> Result<ChartGroup, LoadError> {
    Ok(ChartGroup {
        label: group.label.clone(),
        production: load_chart(&group.production)?,
        consumption: group.consumption.as_deref().map(load_chart).transpose()?,
    })
}
