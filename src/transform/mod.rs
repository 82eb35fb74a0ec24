//! Chart JSON → per-timestamp table → daily rollup.
//!
//! Energy columns hold instantaneous power in watts. The daily sum integrates each
//! sample over the interval up to the next sample; the last sample of a table has no
//! successor and reuses the preceding interval.

use crate::models::{
    ChartPayload, DailyRow, DailyTable, DayKey, RawRow, RawTable, SeriesPayload, Stamp, TablePair,
    Value,
};
use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::Tz;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::debug;

/// Series that never enters a table (single-element cells).
pub const EXCLUDED_SERIES: &[&str] = &["BattOperatingState"];

/// Destination-specific generation flows collapsed into `FromGen` on merge.
pub const FROM_GEN_PREFIX: &str = "FromGenTo";
pub const FROM_GEN_TOTAL: &str = "FromGen";

pub const KWH_PREFIX: &str = "kwh_";
pub const MEAN_PREFIX: &str = "mean_";

const MS_PER_HOUR: f64 = 3_600_000.0;
const W_PER_KW: f64 = 1_000.0;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("chart is paywalled, it holds no data")]
    Paywalled,
    #[error("malformed chart: {0}")]
    Malformed(String),
    #[error("chart has no usable series")]
    NoUsableSeries,
    #[error("timestamp {0} ms is out of range")]
    TimestampOutOfRange(i64),
}

// ── Column classification ─────────────────────────────────────────────────────

/// Decides which metrics are summed to kWh and which are averaged.
#[derive(Debug, Clone)]
pub struct AggregationRules {
    kwh_pattern: Regex,
    mean_columns: Vec<String>,
}

impl AggregationRules {
    pub fn new(kwh_pattern: &str, mean_columns: Vec<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            kwh_pattern: Regex::new(kwh_pattern)?,
            mean_columns,
        })
    }

    pub fn is_mean(&self, metric: &str) -> bool {
        self.mean_columns.iter().any(|c| c == metric)
    }

    pub fn is_kwh(&self, metric: &str) -> bool {
        !self.is_mean(metric) && self.kwh_pattern.is_match(metric)
    }
}

impl Default for AggregationRules {
    /// Portal metrics are CamelCase, so "starts uppercase" marks an energy flow.
    fn default() -> Self {
        Self {
            kwh_pattern: Regex::new("^[A-Z]").expect("static pattern"),
            mean_columns: vec!["StateOfCharge".to_string()],
        }
    }
}

// ── Transform ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SeriesTransform {
    tz: Tz,
    rules: AggregationRules,
}

pub fn is_paywalled(payload: &ChartPayload) -> bool {
    payload.is_premium_feature
}

impl SeriesTransform {
    pub fn new(tz: Tz, rules: AggregationRules) -> Self {
        Self { tz, rules }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Both tables for one chart.
    pub fn process(&self, payload: &ChartPayload) -> Result<TablePair, DataError> {
        let raw = self.to_raw_table(payload)?;
        let daily = self.to_daily_aggregate(&raw);
        Ok(TablePair { raw, daily })
    }

    pub fn to_raw_table(&self, payload: &ChartPayload) -> Result<RawTable, DataError> {
        if is_paywalled(payload) {
            return Err(DataError::Paywalled);
        }

        let series: Vec<&SeriesPayload> = payload
            .settings
            .as_ref()
            .map(|s| s.series.iter())
            .into_iter()
            .flatten()
            .filter(|s| !EXCLUDED_SERIES.contains(&s.id.as_str()))
            .collect();

        if series.is_empty() {
            return Err(DataError::NoUsableSeries);
        }

        let mut metrics: Vec<String> = Vec::with_capacity(series.len());
        let mut by_time: BTreeMap<i64, Vec<Option<Value>>> = BTreeMap::new();

        for s in &series {
            if metrics.contains(&s.id) {
                return Err(DataError::Malformed(format!("duplicate series {}", s.id)));
            }
            let col = metrics.len();
            metrics.push(s.id.clone());

            for (time, value) in series_cells(s)? {
                let row = by_time.entry(time).or_default();
                row.resize(col + 1, None);
                row[col] = value;
            }
        }

        let width = metrics.len();
        let mut rows = Vec::with_capacity(by_time.len());
        for (time, mut values) in by_time {
            values.resize(width, None);
            rows.push(RawRow {
                time,
                stamp: self.stamp(time)?,
                values,
            });
        }

        debug!("raw table: {} rows × {} metrics", rows.len(), width);
        Ok(RawTable { metrics, rows })
    }

    pub fn to_daily_aggregate(&self, raw: &RawTable) -> DailyTable {
        let kwh_cols: Vec<usize> = (0..raw.metrics.len())
            .filter(|&i| self.rules.is_kwh(&raw.metrics[i]))
            .collect();
        let mean_cols: Vec<usize> = (0..raw.metrics.len())
            .filter(|&i| self.rules.is_mean(&raw.metrics[i]))
            .collect();

        let steps = time_steps_hours(raw);

        // Per day and column: (sum, number of non-null samples).
        let mut days: BTreeMap<DayKey, (Vec<(f64, usize)>, Vec<(f64, usize)>)> = BTreeMap::new();
        for (row, step) in raw.rows.iter().zip(&steps) {
            let (kwh, mean) = days.entry(row.stamp.day_key()).or_insert_with(|| {
                (vec![(0.0, 0); kwh_cols.len()], vec![(0.0, 0); mean_cols.len()])
            });
            for (acc, &col) in kwh.iter_mut().zip(&kwh_cols) {
                if let Some(v) = row.values[col] {
                    acc.0 += v.as_f64() * step / W_PER_KW;
                    acc.1 += 1;
                }
            }
            for (acc, &col) in mean.iter_mut().zip(&mean_cols) {
                if let Some(v) = row.values[col] {
                    acc.0 += v.as_f64();
                    acc.1 += 1;
                }
            }
        }

        let columns = kwh_cols
            .iter()
            .map(|&i| format!("{KWH_PREFIX}{}", raw.metrics[i]))
            .chain(mean_cols.iter().map(|&i| format!("{MEAN_PREFIX}{}", raw.metrics[i])))
            .collect();

        let rows = days
            .into_iter()
            .map(|(key, (kwh, mean))| {
                let values = kwh
                    .into_iter()
                    .map(|(sum, n)| (n > 0).then_some(sum))
                    .chain(mean.into_iter().map(|(sum, n)| (n > 0).then(|| sum / n as f64)))
                    .collect();
                DailyRow { key, values }
            })
            .collect();

        DailyTable { columns, rows }
    }

    /// Merge a production chart with the consumption chart of the same day.
    ///
    /// The consumption table's `FromGenTo*` columns are summed into `FromGen` and
    /// dropped before the outer merge; its daily table is rebuilt from that.
    pub fn merge_production_consumption(
        &self,
        production: TablePair,
        consumption: Option<TablePair>,
    ) -> TablePair {
        let Some(consumption) = consumption else {
            return production;
        };

        let cons_raw = collapse_from_gen(consumption.raw);
        let cons_daily = self.to_daily_aggregate(&cons_raw);

        TablePair {
            raw: merge_raw(&production.raw, &cons_raw),
            daily: merge_daily(&production.daily, &cons_daily),
        }
    }

    fn stamp(&self, time_ms: i64) -> Result<Stamp, DataError> {
        let local = DateTime::from_timestamp_millis(time_ms)
            .ok_or(DataError::TimestampOutOfRange(time_ms))?
            .with_timezone(&self.tz);
        Ok(Stamp {
            year: local.year(),
            month: local.month(),
            day: local.day(),
            hour: local.hour(),
            minute: local.minute(),
        })
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Decode the `[ms, value]` cells of a series. The numeric kind of the first
/// non-null value fixes the kind of the whole series.
fn series_cells(series: &SeriesPayload) -> Result<Vec<(i64, Option<Value>)>, DataError> {
    let integer = series
        .data
        .iter()
        .filter_map(|cell| cell.get(1))
        .find(|v| !v.is_null())
        .map(|v| v.is_i64() || v.is_u64())
        .unwrap_or(false);

    series
        .data
        .iter()
        .map(|cell| {
            let [time, value] = cell.as_slice() else {
                return Err(DataError::Malformed(format!(
                    "series {}: cell with {} elements",
                    series.id,
                    cell.len()
                )));
            };
            let time = time
                .as_i64()
                .or_else(|| time.as_f64().map(|t| t as i64))
                .ok_or_else(|| {
                    DataError::Malformed(format!("series {}: bad timestamp {}", series.id, time))
                })?;
            let value = if value.is_null() {
                None
            } else {
                let v = value.as_f64().ok_or_else(|| {
                    DataError::Malformed(format!("series {}: bad value {}", series.id, value))
                })?;
                Some(if integer {
                    Value::Int(value.as_i64().unwrap_or(v as i64))
                } else {
                    Value::Float(v)
                })
            };
            Ok((time, value))
        })
        .collect()
}

/// Hours from each row to the next; the last row repeats the previous step.
fn time_steps_hours(raw: &RawTable) -> Vec<f64> {
    let mut steps: Vec<f64> = raw
        .rows
        .windows(2)
        .map(|w| (w[1].time - w[0].time) as f64 / MS_PER_HOUR)
        .collect();
    if !raw.rows.is_empty() {
        steps.push(steps.last().copied().unwrap_or(0.0));
    }
    steps
}

fn collapse_from_gen(mut raw: RawTable) -> RawTable {
    let sources: Vec<usize> = (0..raw.metrics.len())
        .filter(|&i| raw.metrics[i].starts_with(FROM_GEN_PREFIX))
        .collect();
    if sources.is_empty() {
        return raw;
    }

    let keep: Vec<usize> = (0..raw.metrics.len())
        .filter(|i| !sources.contains(i))
        .collect();

    for row in &mut raw.rows {
        let present: Vec<f64> = sources
            .iter()
            .filter_map(|&i| row.values[i])
            .map(Value::as_f64)
            .collect();
        let total = (!present.is_empty()).then(|| Value::Float(present.iter().sum()));

        let mut values: Vec<Option<Value>> = keep.iter().map(|&i| row.values[i]).collect();
        values.push(total);
        row.values = values;
    }

    let mut metrics: Vec<String> = keep.iter().map(|&i| raw.metrics[i].clone()).collect();
    metrics.push(FROM_GEN_TOTAL.to_string());
    raw.metrics = metrics;
    raw
}

fn union_columns(left: &[String], right: &[String]) -> Vec<String> {
    let seen: HashSet<&String> = left.iter().collect();
    left.iter()
        .chain(right.iter().filter(|c| !seen.contains(c)))
        .cloned()
        .collect()
}

/// Re-index `values` laid out as `from` onto `to`; missing columns become NULL.
fn align<T: Copy>(values: &[Option<T>], from: &[String], to: &[String]) -> Vec<Option<T>> {
    to.iter()
        .map(|c| from.iter().position(|f| f == c).and_then(|i| values[i]))
        .collect()
}

fn coalesce<T: Copy>(left: &mut [Option<T>], right: &[Option<T>]) {
    for (l, r) in left.iter_mut().zip(right) {
        if l.is_none() {
            *l = *r;
        }
    }
}

fn merge_raw(left: &RawTable, right: &RawTable) -> RawTable {
    let metrics = union_columns(&left.metrics, &right.metrics);
    let mut rows: BTreeMap<i64, RawRow> = BTreeMap::new();

    for row in &left.rows {
        rows.insert(
            row.time,
            RawRow {
                time: row.time,
                stamp: row.stamp,
                values: align(&row.values, &left.metrics, &metrics),
            },
        );
    }
    for row in &right.rows {
        let values = align(&row.values, &right.metrics, &metrics);
        rows.entry(row.time)
            .and_modify(|existing| coalesce(&mut existing.values, &values))
            .or_insert_with(|| RawRow {
                time: row.time,
                stamp: row.stamp,
                values: values.clone(),
            });
    }

    RawTable {
        metrics,
        rows: rows.into_values().collect(),
    }
}

fn merge_daily(left: &DailyTable, right: &DailyTable) -> DailyTable {
    let columns = union_columns(&left.columns, &right.columns);
    let mut rows: BTreeMap<DayKey, Vec<Option<f64>>> = BTreeMap::new();

    for row in &left.rows {
        rows.insert(row.key, align(&row.values, &left.columns, &columns));
    }
    for row in &right.rows {
        let values = align(&row.values, &right.columns, &columns);
        rows.entry(row.key)
            .and_modify(|existing| coalesce(existing, &values))
            .or_insert(values);
    }

    DailyTable {
        columns,
        rows: rows
            .into_iter()
            .map(|(key, values)| DailyRow { key, values })
            .collect(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transform() -> SeriesTransform {
        SeriesTransform::new(chrono_tz::UTC, AggregationRules::default())
    }

    fn payload(value: serde_json::Value) -> ChartPayload {
        serde_json::from_value(value).unwrap()
    }

    fn example() -> ChartPayload {
        payload(json!({
            "isPremiumFeature": false,
            "settings": {"series": [
                {"id": "FromGenToBatt", "yAxis": "W",
                 "data": [[1700000000000i64, 10], [1700000300000i64, 20]]}
            ]}
        }))
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn test_raw_table_from_example() {
        let raw = transform().to_raw_table(&example()).unwrap();

        assert_eq!(raw.metrics, vec!["FromGenToBatt"]);
        assert_eq!(raw.len(), 2);
        assert_eq!(raw.rows[0].time, 1_700_000_000_000);
        assert_eq!(raw.rows[1].time, 1_700_000_300_000);
        assert_eq!(raw.value(0, "FromGenToBatt"), Some(Value::Int(10)));
        assert_eq!(raw.value(1, "FromGenToBatt"), Some(Value::Int(20)));

        // 2023-11-14 22:13:20 UTC
        let s = raw.rows[0].stamp;
        assert_eq!((s.year, s.month, s.day, s.hour, s.minute), (2023, 11, 14, 22, 13));
        assert_eq!(raw.rows[1].stamp.minute, 18);
    }

    #[test]
    fn test_daily_aggregate_from_example() {
        let t = transform();
        let daily = t.to_daily_aggregate(&t.to_raw_table(&example()).unwrap());

        assert_eq!(daily.columns, vec!["kwh_FromGenToBatt"]);
        assert_eq!(daily.len(), 1);
        assert_eq!(
            daily.rows[0].key,
            DayKey { year: 2023, month: 11, day: 14 }
        );
        let step = 300.0 / 3600.0;
        assert_close(
            daily.value(0, "kwh_FromGenToBatt").unwrap(),
            step * 10.0 / 1000.0 + step * 20.0 / 1000.0,
        );
    }

    #[test]
    fn test_union_of_timestamps_and_nulls() {
        let p = payload(json!({
            "isPremiumFeature": false,
            "settings": {"series": [
                {"id": "FromGenToGrid", "yAxis": "W", "data": [[1000, 1.5], [2000, 2.5]]},
                {"id": "StateOfCharge", "yAxis": "%", "data": [[2000, 50], [3000, 60]]},
                {"id": "BattOperatingState", "data": [[1000]]}
            ]}
        }));
        let raw = transform().to_raw_table(&p).unwrap();

        assert_eq!(raw.metrics, vec!["FromGenToGrid", "StateOfCharge"]);
        assert_eq!(
            raw.rows.iter().map(|r| r.time).collect::<Vec<_>>(),
            vec![1000, 2000, 3000]
        );
        assert_eq!(raw.value(0, "StateOfCharge"), None);
        assert_eq!(raw.value(2, "FromGenToGrid"), None);
        assert_eq!(raw.value(1, "FromGenToGrid"), Some(Value::Float(2.5)));
    }

    #[test]
    fn test_paywalled_payload_is_rejected() {
        let p = payload(json!({"isPremiumFeature": true}));
        assert!(is_paywalled(&p));
        assert!(matches!(
            transform().to_raw_table(&p),
            Err(DataError::Paywalled)
        ));
    }

    #[test]
    fn test_only_excluded_series_is_unusable() {
        let p = payload(json!({
            "isPremiumFeature": false,
            "settings": {"series": [{"id": "BattOperatingState", "data": [[1, 2]]}]}
        }));
        assert!(matches!(
            transform().to_raw_table(&p),
            Err(DataError::NoUsableSeries)
        ));
    }

    #[test]
    fn test_short_cell_is_malformed() {
        let p = payload(json!({
            "isPremiumFeature": false,
            "settings": {"series": [{"id": "ToConsumer", "data": [[1000]]}]}
        }));
        assert!(matches!(
            transform().to_raw_table(&p),
            Err(DataError::Malformed(_))
        ));
    }

    #[test]
    fn test_integer_series_keeps_integer_kind() {
        let p = payload(json!({
            "isPremiumFeature": false,
            "settings": {"series": [
                {"id": "ToConsumer", "data": [[1000, 3], [2000, 4.7]]},
                {"id": "FromGenToGrid", "data": [[1000, 3.2], [2000, 4]]}
            ]}
        }));
        let raw = transform().to_raw_table(&p).unwrap();
        assert_eq!(raw.value(1, "ToConsumer"), Some(Value::Int(4)));
        assert_eq!(raw.value(1, "FromGenToGrid"), Some(Value::Float(4.0)));
    }

    #[test]
    fn test_mean_and_kwh_classification() {
        let p = payload(json!({
            "isPremiumFeature": false,
            "settings": {"series": [
                {"id": "StateOfCharge", "data": [[0, 40], [1800000, 60], [3600000, null]]},
                {"id": "ToConsumer", "data": [[0, 1000], [1800000, 1000], [3600000, 1000]]},
                {"id": "lowercaseMetric", "data": [[0, 1], [1800000, 1], [3600000, 1]]}
            ]}
        }));
        let t = transform();
        let daily = t.to_daily_aggregate(&t.to_raw_table(&p).unwrap());

        assert_eq!(daily.columns, vec!["kwh_ToConsumer", "mean_StateOfCharge"]);
        // three half-hour steps at 1 kW
        assert_close(daily.value(0, "kwh_ToConsumer").unwrap(), 1.5);
        assert_close(daily.value(0, "mean_StateOfCharge").unwrap(), 50.0);
    }

    #[test]
    fn test_configurable_kwh_predicate() {
        let rules = AggregationRules::new("^From", vec![]).unwrap();
        assert!(rules.is_kwh("FromGenToBatt"));
        assert!(!rules.is_kwh("ToConsumer"));
        assert!(!rules.is_mean("StateOfCharge"));
    }

    #[test]
    fn test_single_row_has_zero_step() {
        let p = payload(json!({
            "isPremiumFeature": false,
            "settings": {"series": [{"id": "ToConsumer", "data": [[0, 500]]}]}
        }));
        let t = transform();
        let daily = t.to_daily_aggregate(&t.to_raw_table(&p).unwrap());
        assert_eq!(daily.value(0, "kwh_ToConsumer"), Some(0.0));
    }

    #[test]
    fn test_rows_split_by_local_day() {
        // 23:55 and 00:00 UTC on consecutive days
        let p = payload(json!({
            "isPremiumFeature": false,
            "settings": {"series": [
                {"id": "ToConsumer", "data": [[1704153300000i64, 1200], [1704153600000i64, 1200]]}
            ]}
        }));
        let utc = transform();
        let daily = utc.to_daily_aggregate(&utc.to_raw_table(&p).unwrap());
        assert_eq!(daily.len(), 2);

        let vienna = SeriesTransform::new(chrono_tz::Europe::Vienna, AggregationRules::default());
        let daily = vienna.to_daily_aggregate(&vienna.to_raw_table(&p).unwrap());
        assert_eq!(daily.len(), 1);
        assert_eq!(daily.rows[0].key, DayKey { year: 2024, month: 1, day: 2 });
    }

    #[test]
    fn test_transform_is_deterministic() {
        let t = transform();
        let first = t.process(&example()).unwrap();
        let second = t.process(&example()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_collapses_from_gen_columns() {
        let t = transform();
        let production = t
            .process(&payload(json!({
                "isPremiumFeature": false,
                "settings": {"series": [
                    {"id": "FromGenToBatt", "data": [[0, 100.0], [300000, 200.0]]},
                    {"id": "StateOfCharge", "data": [[0, 50], [300000, 52]]}
                ]}
            })))
            .unwrap();
        let consumption = t
            .process(&payload(json!({
                "isPremiumFeature": false,
                "settings": {"series": [
                    {"id": "FromGenToConsumer", "data": [[0, 300.0], [300000, 400.0]]},
                    {"id": "FromGenToGrid", "data": [[0, 10.0], [300000, null]]},
                    {"id": "FromGridToConsumer", "data": [[300000, 5.0], [600000, 6.0]]}
                ]}
            })))
            .unwrap();

        let merged = t.merge_production_consumption(production, Some(consumption));

        assert_eq!(
            merged.raw.metrics,
            vec!["FromGenToBatt", "StateOfCharge", "FromGridToConsumer", "FromGen"]
        );
        assert_eq!(merged.raw.len(), 3);
        assert_eq!(merged.raw.value(0, "FromGen"), Some(Value::Float(310.0)));
        assert_eq!(merged.raw.value(1, "FromGen"), Some(Value::Float(400.0)));
        assert_eq!(merged.raw.value(2, "FromGen"), None);
        assert_eq!(merged.raw.value(2, "FromGenToBatt"), None);
        assert_eq!(merged.raw.value(2, "FromGridToConsumer"), Some(Value::Float(6.0)));

        assert_eq!(
            merged.daily.columns,
            vec![
                "kwh_FromGenToBatt",
                "mean_StateOfCharge",
                "kwh_FromGridToConsumer",
                "kwh_FromGen"
            ]
        );
        assert_eq!(merged.daily.len(), 1);
        let step = 300.0 / 3600.0;
        assert_close(
            merged.daily.value(0, "kwh_FromGen").unwrap(),
            step * 310.0 / 1000.0 + step * 400.0 / 1000.0,
        );
        assert_close(merged.daily.value(0, "mean_StateOfCharge").unwrap(), 51.0);
    }

    #[test]
    fn test_merge_without_consumption_is_identity() {
        let t = transform();
        let production = t.process(&example()).unwrap();
        assert_eq!(
            t.merge_production_consumption(production.clone(), None),
            production
        );
    }
}
