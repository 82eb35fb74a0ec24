use crate::models::{DailyTable, DayKey, RawTable, TablePair};
use duckdb::types::Value as DbValue;
use duckdb::{Connection, params, params_from_iter};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Schema ────────────────────────────────────────────────────────────────────

pub const RAW_TABLE: &str = "raw_data";
pub const DAILY_TABLE: &str = "daily_aggregated";

/// Metric columns of `raw_data`.
pub const RAW_METRICS: &[&str] = &[
    "FromGenToBatt",
    "FromGenToGrid",
    "FromGenToConsumer",
    "FromGenToSomewhere",
    "FromGenToWattPilot",
    "FromGen",
    "ToConsumer",
    "FromBattToConsumer",
    "FromGridToConsumer",
    "EmergencyPower",
    "StateOfCharge",
];

/// Value columns of `daily_aggregated`.
pub const DAILY_COLUMNS: &[&str] = &[
    "kwh_FromGenToBatt",
    "kwh_FromGenToGrid",
    "kwh_FromGenToConsumer",
    "kwh_FromGenToSomewhere",
    "kwh_FromGenToWattPilot",
    "kwh_FromGen",
    "kwh_ToConsumer",
    "kwh_FromBattToConsumer",
    "kwh_FromGridToConsumer",
    "kwh_EmergencyPower",
    "mean_StateOfCharge",
];

const RAW_KEY_COLUMNS: &[&str] = &["time", "year", "month", "day", "hour", "minute"];
const DAILY_KEY_COLUMNS: &[&str] = &["year", "month", "day"];

/// DuckDB type of a column in either table.
fn declared_type(column: &str) -> &'static str {
    match column {
        "time" => "BIGINT",
        "year" | "month" | "day" | "hour" | "minute" => "INTEGER",
        _ => "DOUBLE",
    }
}

fn raw_ddl() -> String {
    let metrics: String = RAW_METRICS
        .iter()
        .map(|m| format!("    \"{m}\" DOUBLE,\n"))
        .collect();
    format!(
        r#"CREATE TABLE IF NOT EXISTS {RAW_TABLE} (
    "time"    BIGINT  NOT NULL,
    "year"    INTEGER NOT NULL,
    "month"   INTEGER NOT NULL,
    "day"     INTEGER NOT NULL,
    "hour"    INTEGER NOT NULL,
    "minute"  INTEGER NOT NULL,
{metrics}    PRIMARY KEY ("time")
);"#
    )
}

fn daily_ddl() -> String {
    let columns: String = DAILY_COLUMNS
        .iter()
        .map(|c| format!("    \"{c}\" DOUBLE,\n"))
        .collect();
    format!(
        r#"CREATE TABLE IF NOT EXISTS {DAILY_TABLE} (
    "year"    INTEGER NOT NULL,
    "month"   INTEGER NOT NULL,
    "day"     INTEGER NOT NULL,
{columns}    PRIMARY KEY ("year", "month", "day")
);"#
    )
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("column {column:?} does not match the schema of table {table}")]
    Schema { table: &'static str, column: String },
    #[error("column {column:?} of table {table} is {found}, expected {expected}")]
    ColumnType {
        table: &'static str,
        column: String,
        expected: &'static str,
        found: String,
    },
    #[error(transparent)]
    Db(#[from] duckdb::Error),
    #[error("could not create directory {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a bulk insert. Rows whose key already exists are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    pub inserted: usize,
    pub skipped: usize,
}

impl std::ops::AddAssign for InsertSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.skipped += rhs.skipped;
    }
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

impl Repository {
    /// Open (or create) the store and make sure both tables match the schema.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        if path.exists() {
            info!("Opening existing database at {:?}", path);
        } else {
            info!("No database at {:?}, creating a new one", path);
        }
        let repo = Self {
            conn: Connection::open(path)?,
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let repo = Self {
            conn: Connection::open_in_memory()?,
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn ensure_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(&raw_ddl())?;
        self.conn.execute_batch(&daily_ddl())?;
        self.check_columns(RAW_TABLE, RAW_KEY_COLUMNS, RAW_METRICS)?;
        self.check_columns(DAILY_TABLE, DAILY_KEY_COLUMNS, DAILY_COLUMNS)?;
        Ok(())
    }

    /// A pre-existing table with a different layout is a schema error: every
    /// declared column must exist with its declared type, and nothing else.
    fn check_columns(
        &self,
        table: &'static str,
        keys: &[&str],
        values: &[&str],
    ) -> Result<(), StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = ? ORDER BY ordinal_position",
        )?;
        let actual: Vec<(String, String)> = stmt
            .query_map(params![table], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let expected: Vec<&str> = keys.iter().chain(values).copied().collect();
        if let Some((column, _)) = actual.iter().find(|(c, _)| !expected.contains(&c.as_str())) {
            return Err(StorageError::Schema {
                table,
                column: column.clone(),
            });
        }
        for column in expected {
            let Some((_, found)) = actual.iter().find(|(a, _)| a == column) else {
                return Err(StorageError::Schema {
                    table,
                    column: column.to_string(),
                });
            };
            let want = declared_type(column);
            if !found.eq_ignore_ascii_case(want) {
                return Err(StorageError::ColumnType {
                    table,
                    column: column.to_string(),
                    expected: want,
                    found: found.clone(),
                });
            }
        }
        Ok(())
    }

    // ── Inserts ───────────────────────────────────────────────────────────────

    /// Append rows to `raw_data`; rows whose `time` is already stored are skipped.
    pub fn insert_raw(&self, table: &RawTable) -> Result<InsertSummary, StorageError> {
        check_raw(table)?;
        let tx = self.conn.unchecked_transaction()?;
        let summary = write_raw(&tx, table)?;
        tx.commit()?;

        log_conflicts(RAW_TABLE, summary);
        Ok(summary)
    }

    /// Append rows to `daily_aggregated`; existing days are skipped.
    pub fn insert_daily(&self, table: &DailyTable) -> Result<InsertSummary, StorageError> {
        check_daily(table)?;
        let tx = self.conn.unchecked_transaction()?;
        let summary = write_daily(&tx, table)?;
        tx.commit()?;

        log_conflicts(DAILY_TABLE, summary);
        Ok(summary)
    }

    /// Both tables of one day in a single transaction. Either table failing
    /// the schema check leaves the store untouched.
    pub fn insert_pair(
        &self,
        tables: &TablePair,
    ) -> Result<(InsertSummary, InsertSummary), StorageError> {
        check_raw(&tables.raw)?;
        check_daily(&tables.daily)?;

        let tx = self.conn.unchecked_transaction()?;
        let raw = write_raw(&tx, &tables.raw)?;
        let daily = write_daily(&tx, &tables.daily)?;
        tx.commit()?;

        log_conflicts(RAW_TABLE, raw);
        log_conflicts(DAILY_TABLE, daily);
        Ok((raw, daily))
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Non-null metric values stored for one timestamp.
    pub fn raw_row(&self, time: i64) -> Result<Option<BTreeMap<String, f64>>, StorageError> {
        let select: Vec<String> = RAW_METRICS.iter().map(|m| format!("\"{m}\"")).collect();
        let mut stmt = self.conn.prepare(&format!(
            r#"SELECT {} FROM {RAW_TABLE} WHERE "time" = ?"#,
            select.join(", ")
        ))?;
        let mut rows = stmt.query(params![time])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let mut values = BTreeMap::new();
        for (i, metric) in RAW_METRICS.iter().enumerate() {
            if let Some(v) = row.get::<_, Option<f64>>(i)? {
                values.insert(metric.to_string(), v);
            }
        }
        Ok(Some(values))
    }

    /// Non-null aggregate values stored for one day.
    pub fn daily_row(&self, key: DayKey) -> Result<Option<BTreeMap<String, f64>>, StorageError> {
        let select: Vec<String> = DAILY_COLUMNS.iter().map(|c| format!("\"{c}\"")).collect();
        let mut stmt = self.conn.prepare(&format!(
            r#"SELECT {} FROM {DAILY_TABLE} WHERE "year" = ? AND "month" = ? AND "day" = ?"#,
            select.join(", ")
        ))?;
        let mut rows = stmt.query(params![key.year, key.month as i32, key.day as i32])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let mut values = BTreeMap::new();
        for (i, column) in DAILY_COLUMNS.iter().enumerate() {
            if let Some(v) = row.get::<_, Option<f64>>(i)? {
                values.insert(column.to_string(), v);
            }
        }
        Ok(Some(values))
    }

    pub fn raw_count(&self) -> Result<i64, StorageError> {
        let mut s = self.conn.prepare(&format!("SELECT COUNT(*) FROM {RAW_TABLE}"))?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn daily_count(&self) -> Result<i64, StorageError> {
        let mut s = self.conn.prepare(&format!("SELECT COUNT(*) FROM {DAILY_TABLE}"))?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    /// First and last day with an aggregate row.
    pub fn day_range(&self) -> Result<Option<(DayKey, DayKey)>, StorageError> {
        let mut s = self.conn.prepare(&format!(
            r#"SELECT "year", "month", "day" FROM {DAILY_TABLE} ORDER BY 1, 2, 3"#
        ))?;
        let keys: Vec<DayKey> = s
            .query_map([], |r| {
                Ok(DayKey {
                    year: r.get(0)?,
                    month: r.get::<_, i32>(1)? as u32,
                    day: r.get::<_, i32>(2)? as u32,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(keys.first().copied().zip(keys.last().copied()))
    }
}

fn check_raw(table: &RawTable) -> Result<(), StorageError> {
    match table.metrics.iter().find(|m| !RAW_METRICS.contains(&m.as_str())) {
        Some(metric) => Err(StorageError::Schema {
            table: RAW_TABLE,
            column: metric.clone(),
        }),
        None => Ok(()),
    }
}

fn check_daily(table: &DailyTable) -> Result<(), StorageError> {
    match table.columns.iter().find(|c| !DAILY_COLUMNS.contains(&c.as_str())) {
        Some(column) => Err(StorageError::Schema {
            table: DAILY_TABLE,
            column: column.clone(),
        }),
        None => Ok(()),
    }
}

fn write_raw(conn: &Connection, table: &RawTable) -> Result<InsertSummary, StorageError> {
    let mut summary = InsertSummary::default();
    if table.is_empty() {
        return Ok(summary);
    }

    let columns: Vec<&str> = RAW_KEY_COLUMNS
        .iter()
        .copied()
        .chain(table.metrics.iter().map(String::as_str))
        .collect();
    let mut exists =
        conn.prepare(&format!(r#"SELECT COUNT(*) FROM {RAW_TABLE} WHERE "time" = ?"#))?;
    let mut insert = conn.prepare(&insert_sql(RAW_TABLE, &columns))?;

    for row in &table.rows {
        let n: i64 = exists.query_row(params![row.time], |r| r.get(0))?;
        if n > 0 {
            debug!("raw_data: time {} already stored", row.time);
            summary.skipped += 1;
            continue;
        }

        let s = row.stamp;
        let values = [
            DbValue::BigInt(row.time),
            DbValue::Int(s.year),
            DbValue::Int(s.month as i32),
            DbValue::Int(s.day as i32),
            DbValue::Int(s.hour as i32),
            DbValue::Int(s.minute as i32),
        ]
        .into_iter()
        .chain(row.values.iter().map(|v| match v {
            Some(v) => DbValue::Double(v.as_f64()),
            None => DbValue::Null,
        }));
        insert.execute(params_from_iter(values))?;
        summary.inserted += 1;
    }
    Ok(summary)
}

fn write_daily(conn: &Connection, table: &DailyTable) -> Result<InsertSummary, StorageError> {
    let mut summary = InsertSummary::default();
    if table.is_empty() {
        return Ok(summary);
    }

    let columns: Vec<&str> = DAILY_KEY_COLUMNS
        .iter()
        .copied()
        .chain(table.columns.iter().map(String::as_str))
        .collect();
    let mut exists = conn.prepare(&format!(
        r#"SELECT COUNT(*) FROM {DAILY_TABLE} WHERE "year" = ? AND "month" = ? AND "day" = ?"#
    ))?;
    let mut insert = conn.prepare(&insert_sql(DAILY_TABLE, &columns))?;

    for row in &table.rows {
        let k = row.key;
        let (year, month, day) = (k.year, k.month as i32, k.day as i32);
        let n: i64 = exists.query_row(params![year, month, day], |r| r.get(0))?;
        if n > 0 {
            debug!("daily_aggregated: {} already stored", k);
            summary.skipped += 1;
            continue;
        }

        let values = [DbValue::Int(year), DbValue::Int(month), DbValue::Int(day)]
            .into_iter()
            .chain(row.values.iter().map(|v| match v {
                Some(v) => DbValue::Double(*v),
                None => DbValue::Null,
            }));
        insert.execute(params_from_iter(values))?;
        summary.inserted += 1;
    }
    Ok(summary)
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let names: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT DO NOTHING",
        names.join(", ")
    )
}

fn log_conflicts(table: &str, summary: InsertSummary) {
    if summary.skipped > 0 {
        warn!(
            "{}: {} of {} rows already present, kept the stored rows",
            table,
            summary.skipped,
            summary.inserted + summary.skipped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DailyRow, RawRow, Stamp, Value};

    fn stamp(minute: u32) -> Stamp {
        Stamp { year: 2024, month: 1, day: 1, hour: 12, minute }
    }

    fn raw_table(rows: &[(i64, Option<Value>, Option<Value>)]) -> RawTable {
        RawTable {
            metrics: vec!["FromGenToBatt".into(), "StateOfCharge".into()],
            rows: rows
                .iter()
                .map(|&(time, a, b)| RawRow {
                    time,
                    stamp: stamp((time / 60_000 % 60) as u32),
                    values: vec![a, b],
                })
                .collect(),
        }
    }

    #[test]
    fn test_raw_round_trip() {
        let repo = Repository::open_in_memory().unwrap();
        let table = raw_table(&[
            (60_000, Some(Value::Int(10)), Some(Value::Float(55.5))),
            (120_000, Some(Value::Float(12.25)), None),
        ]);

        let summary = repo.insert_raw(&table).unwrap();
        assert_eq!(summary, InsertSummary { inserted: 2, skipped: 0 });

        let first = repo.raw_row(60_000).unwrap().unwrap();
        assert_eq!(first.get("FromGenToBatt"), Some(&10.0));
        assert_eq!(first.get("StateOfCharge"), Some(&55.5));

        let second = repo.raw_row(120_000).unwrap().unwrap();
        assert_eq!(second.get("FromGenToBatt"), Some(&12.25));
        assert_eq!(second.get("StateOfCharge"), None);

        assert!(repo.raw_row(1).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_time_is_skipped_not_overwritten() {
        let repo = Repository::open_in_memory().unwrap();
        repo.insert_raw(&raw_table(&[(60_000, Some(Value::Int(10)), None)]))
            .unwrap();

        let summary = repo
            .insert_raw(&raw_table(&[
                (60_000, Some(Value::Int(99)), None),
                (120_000, Some(Value::Int(20)), None),
            ]))
            .unwrap();

        assert_eq!(summary, InsertSummary { inserted: 1, skipped: 1 });
        assert_eq!(repo.raw_count().unwrap(), 2);
        assert_eq!(
            repo.raw_row(60_000).unwrap().unwrap().get("FromGenToBatt"),
            Some(&10.0)
        );
    }

    #[test]
    fn test_unknown_column_is_schema_error() {
        let repo = Repository::open_in_memory().unwrap();
        let table = RawTable {
            metrics: vec!["Bogus".into()],
            rows: vec![RawRow {
                time: 1,
                stamp: stamp(0),
                values: vec![Some(Value::Int(1))],
            }],
        };
        assert!(matches!(
            repo.insert_raw(&table),
            Err(StorageError::Schema { table: RAW_TABLE, .. })
        ));
        assert_eq!(repo.raw_count().unwrap(), 0);
    }

    #[test]
    fn test_daily_insert_and_conflict() {
        let repo = Repository::open_in_memory().unwrap();
        let key = DayKey { year: 2024, month: 1, day: 1 };
        let table = DailyTable {
            columns: vec!["kwh_FromGen".into(), "mean_StateOfCharge".into()],
            rows: vec![DailyRow { key, values: vec![Some(3.5), Some(61.0)] }],
        };

        assert_eq!(repo.insert_daily(&table).unwrap().inserted, 1);
        assert_eq!(repo.insert_daily(&table).unwrap().skipped, 1);
        assert_eq!(repo.daily_count().unwrap(), 1);

        let stored = repo.daily_row(key).unwrap().unwrap();
        assert_eq!(stored.get("kwh_FromGen"), Some(&3.5));
        assert_eq!(stored.get("mean_StateOfCharge"), Some(&61.0));
        assert_eq!(repo.day_range().unwrap(), Some((key, key)));

        let bad = DailyTable {
            columns: vec!["sum_FromGen".into()],
            rows: vec![DailyRow { key, values: vec![Some(1.0)] }],
        };
        assert!(matches!(
            repo.insert_daily(&bad),
            Err(StorageError::Schema { table: DAILY_TABLE, .. })
        ));
    }

    #[test]
    fn test_reopen_file_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("usage.duckdb");
        {
            let repo = Repository::open(&path).unwrap();
            repo.insert_raw(&raw_table(&[(60_000, Some(Value::Int(1)), None)]))
                .unwrap();
        }
        let repo = Repository::open(&path).unwrap();
        assert_eq!(repo.raw_count().unwrap(), 1);
        assert!(repo.day_range().unwrap().is_none());
    }

    #[test]
    fn test_mismatched_existing_table_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.duckdb");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE raw_data (time BIGINT PRIMARY KEY, sum_Foo DOUBLE);",
            )
            .unwrap();
        }
        assert!(matches!(
            Repository::open(&path),
            Err(StorageError::Schema { table: RAW_TABLE, .. })
        ));
    }

    #[test]
    fn test_existing_table_with_wrong_types_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("text.duckdb");
        {
            let metrics: String = RAW_METRICS
                .iter()
                .map(|m| format!(", \"{m}\" VARCHAR"))
                .collect();
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(&format!(
                r#"CREATE TABLE raw_data ("time" VARCHAR PRIMARY KEY, "year" VARCHAR,
                   "month" INTEGER, "day" INTEGER, "hour" INTEGER, "minute" INTEGER{metrics});"#
            ))
            .unwrap();
        }

        match Repository::open(&path) {
            Err(StorageError::ColumnType {
                table,
                column,
                expected,
                found,
            }) => {
                assert_eq!(table, RAW_TABLE);
                assert_eq!(column, "time");
                assert_eq!(expected, "BIGINT");
                assert_eq!(found, "VARCHAR");
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("a VARCHAR time column must be rejected"),
        }
    }

    #[test]
    fn test_fresh_tables_pass_type_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.duckdb");
        drop(Repository::open(&path).unwrap());
        assert!(Repository::open(&path).is_ok());
    }

    #[test]
    fn test_pair_with_bad_daily_column_writes_nothing() {
        let repo = Repository::open_in_memory().unwrap();
        let key = DayKey { year: 2024, month: 1, day: 1 };
        let tables = TablePair {
            raw: raw_table(&[(60_000, Some(Value::Int(1)), None)]),
            daily: DailyTable {
                columns: vec!["mean_ToConsumer".into()],
                rows: vec![DailyRow { key, values: vec![Some(1.0)] }],
            },
        };

        assert!(matches!(
            repo.insert_pair(&tables),
            Err(StorageError::Schema { table: DAILY_TABLE, .. })
        ));
        assert_eq!(repo.raw_count().unwrap(), 0);
        assert_eq!(repo.daily_count().unwrap(), 0);
    }

    #[test]
    fn test_pair_inserts_both_tables() {
        let repo = Repository::open_in_memory().unwrap();
        let key = DayKey { year: 2024, month: 1, day: 1 };
        let tables = TablePair {
            raw: raw_table(&[(60_000, Some(Value::Int(1)), None)]),
            daily: DailyTable {
                columns: vec!["kwh_FromGenToBatt".into()],
                rows: vec![DailyRow { key, values: vec![Some(0.5)] }],
            },
        };

        let (raw, daily) = repo.insert_pair(&tables).unwrap();
        assert_eq!(raw.inserted, 1);
        assert_eq!(daily.inserted, 1);

        let (raw, daily) = repo.insert_pair(&tables).unwrap();
        assert_eq!((raw.skipped, daily.skipped), (1, 1));
    }
}
