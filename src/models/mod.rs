use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ── Chart payload (portal JSON) ───────────────────────────────────────────────

/// One day's chart document as served by the portal.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartPayload {
    pub is_premium_feature: bool,
    #[serde(default)]
    pub settings: Option<ChartSettings>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ChartSettings {
    #[serde(default)]
    pub series: Vec<SeriesPayload>,
}

/// A named metric series. `data` holds the raw cells, normally `[ms, value]`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SeriesPayload {
    pub id: String,
    #[serde(rename = "yAxis", default)]
    pub y_axis: Option<String>,
    #[serde(default)]
    pub data: Vec<Vec<serde_json::Value>>,
}

// ── Chart type ────────────────────────────────────────────────────────────────

/// The `view` parameter of a chart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Production,
    Consumption,
}

impl ChartType {
    pub const ALL: [ChartType; 2] = [ChartType::Production, ChartType::Consumption];

    pub fn as_str(self) -> &'static str {
        match self {
            ChartType::Production => "production",
            ChartType::Consumption => "consumption",
        }
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Groups ────────────────────────────────────────────────────────────────────

/// Chart files on disk that belong to the same day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartFileGroup {
    /// Shared base name, e.g. `20240101`.
    pub label: String,
    pub production: PathBuf,
    pub consumption: Option<PathBuf>,
}

/// A consumption chart without the production chart of its day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpairedFile {
    pub label: String,
    pub path: PathBuf,
}

/// Chart files of a directory, paired by day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartFileSet {
    pub groups: Vec<ChartFileGroup>,
    pub unpaired: Vec<UnpairedFile>,
}

/// Loaded charts of one [`ChartFileGroup`].
#[derive(Debug, Clone)]
pub struct ChartGroup {
    pub label: String,
    pub production: ChartPayload,
    pub consumption: Option<ChartPayload>,
}

impl ChartGroup {
    /// Any paywalled member invalidates the whole day.
    pub fn is_paywalled(&self) -> bool {
        self.production.is_premium_feature
            || self
                .consumption
                .as_ref()
                .map(|c| c.is_premium_feature)
                .unwrap_or(false)
    }
}

// ── Tables ────────────────────────────────────────────────────────────────────

/// A cell value, keeping the numeric kind of its series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }
}

/// Calendar fields derived from a row's `time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

impl Stamp {
    pub fn day_key(&self) -> DayKey {
        DayKey {
            year: self.year,
            month: self.month,
            day: self.day,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DayKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// POSIX milliseconds, unique within a table.
    pub time: i64,
    pub stamp: Stamp,
    /// Aligned with [`RawTable::metrics`].
    pub values: Vec<Option<Value>>,
}

/// Per-timestamp view of all series of a chart, sorted by `time`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub metrics: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, metric: &str) -> Option<usize> {
        self.metrics.iter().position(|m| m == metric)
    }

    pub fn value(&self, row: usize, metric: &str) -> Option<Value> {
        let col = self.column(metric)?;
        self.rows.get(row)?.values[col]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyRow {
    pub key: DayKey,
    /// Aligned with [`DailyTable::columns`].
    pub values: Vec<Option<f64>>,
}

/// One row per day: `kwh_*` sums followed by `mean_*` averages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyTable {
    pub columns: Vec<String>,
    pub rows: Vec<DailyRow>,
}

impl DailyTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, name: &str) -> Option<f64> {
        let col = self.column(name)?;
        self.rows.get(row)?.values[col]
    }
}

/// Raw and aggregated tables of one chart (or of a merged group).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TablePair {
    pub raw: RawTable,
    pub daily: DailyTable,
}
