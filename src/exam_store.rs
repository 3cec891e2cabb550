use chrono::{SecondsFormat, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::exam_record::{ExamRecord, Period};
use crate::Result;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS driving_exams (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    province TEXT NOT NULL,
    exam_center TEXT NOT NULL,
    driving_school_code TEXT,
    driving_school_name TEXT,
    section_code TEXT,
    month INTEGER NOT NULL,
    year INTEGER NOT NULL,
    exam_type TEXT NOT NULL DEFAULT '',
    permit_name TEXT,
    passed INTEGER NOT NULL DEFAULT 0,
    passed_1conv INTEGER NOT NULL DEFAULT 0,
    passed_2conv INTEGER NOT NULL DEFAULT 0,
    passed_3or4conv INTEGER NOT NULL DEFAULT 0,
    passed_5plus INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS imported_periods (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    imported_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(year, month)
);
CREATE INDEX IF NOT EXISTS idx_exams_period ON driving_exams (year, month);
CREATE INDEX IF NOT EXISTS idx_exams_filters ON driving_exams (province, exam_center, driving_school_name, exam_type, permit_name);
"#;

/// Scalar SQL function lowercasing text with full Unicode rules. SQLite's own
/// `lower()` and `LIKE` only fold ASCII.
pub(crate) const FOLD_CASE_FN: &str = "fold_case";

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub db_path: Option<String>,
    pub record_count: i64,
    pub period_count: i64,
    pub first_period: Option<Period>,
    pub last_period: Option<Period>,
}

/// Append-only repository of exam records plus the ledger of imported periods.
pub struct ExamStore {
    pub(crate) conn: Connection,
    db_path: Option<PathBuf>,
}

impl ExamStore {
    /// Opens (or creates) the database file, creating its parent directory if needed.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn,
            db_path: Some(db_path.to_path_buf()),
        };
        store.ensure_schema()?;
        info!(db = %db_path.display(), "opened exam store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            db_path: None,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        register_functions(&self.conn)?;
        self.conn.execute_batch(SCHEMA_SQL)?;
        debug!("exam store schema ready");
        Ok(())
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn is_period_imported(&self, year: u32, month: u32) -> Result<bool> {
        period_in_ledger(&self.conn, Period::new(year, month)).map_err(Into::into)
    }

    /// Adds periods to the ledger; already present periods are left untouched.
    pub fn mark_periods_imported(&mut self, periods: &[Period]) -> Result<()> {
        let imported_at = now_rfc3339();
        let tx = self.conn.transaction()?;
        for period in periods {
            insert_ledger_period(&tx, *period, &imported_at)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Appends records as-is. Duplicate content is accepted.
    pub fn insert_records(&mut self, records: &[ExamRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let inserted = insert_exam_rows(&tx, records)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Inserts records and marks their periods in one transaction. Records whose period
    /// already sits in the ledger when the transaction starts are dropped.
    pub fn commit_import(
        &mut self,
        records: &[ExamRecord],
        periods: &BTreeSet<Period>,
    ) -> Result<usize> {
        let imported_at = now_rfc3339();
        let tx = self.conn.transaction()?;

        let mut open_periods = BTreeSet::new();
        for period in periods {
            if !period_in_ledger(&tx, *period)? {
                open_periods.insert(*period);
            }
        }
        let to_insert = records
            .iter()
            .filter(|r| open_periods.contains(&r.period()))
            .cloned()
            .collect::<Vec<_>>();

        let inserted = insert_exam_rows(&tx, &to_insert)?;
        for period in &open_periods {
            insert_ledger_period(&tx, *period, &imported_at)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let record_count = self
            .conn
            .query_row("SELECT COUNT(*) FROM driving_exams", [], |row| {
                row.get::<_, i64>(0)
            })?;
        let (period_count, first_key, last_key) = self.conn.query_row(
            "SELECT COUNT(*), MIN(year * 100 + month), MAX(year * 100 + month) \
             FROM imported_periods",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )?;

        Ok(StoreStats {
            db_path: self.db_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            record_count,
            period_count,
            first_period: first_key.and_then(period_from_sql_key),
            last_period: last_key.and_then(period_from_sql_key),
        })
    }
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        FOLD_CASE_FN,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|text| text.to_lowercase())),
    )
}

fn period_from_sql_key(key: i64) -> Option<Period> {
    u64::try_from(key).ok().and_then(Period::from_key)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn period_in_ledger(conn: &Connection, period: Period) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM imported_periods WHERE year = ?1 AND month = ?2",
        params![period.year, period.month],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn insert_ledger_period(
    conn: &Connection,
    period: Period,
    imported_at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO imported_periods (year, month, imported_at) VALUES (?1, ?2, ?3)",
        params![period.year, period.month, imported_at],
    )?;
    Ok(())
}

fn insert_exam_rows(conn: &Connection, records: &[ExamRecord]) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        r#"
        INSERT INTO driving_exams (
            province, exam_center, driving_school_code, driving_school_name,
            section_code, month, year, exam_type, permit_name,
            passed, passed_1conv, passed_2conv, passed_3or4conv,
            passed_5plus, failed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
    )?;
    let mut inserted = 0_usize;
    for record in records {
        inserted += stmt.execute(params![
            record.province,
            record.exam_center,
            record.school_code,
            record.school_name,
            record.section_code,
            record.month,
            record.year,
            record.exam_type,
            record.permit_name,
            record.passed,
            record.passed_1conv,
            record.passed_2conv,
            record.passed_3or4conv,
            record.passed_5plus,
            record.failed,
        ])?;
    }
    Ok(inserted)
}
