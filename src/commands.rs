use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;

use crate::exam_import::{import_exam_file, import_exam_path, preview_exam_file};
use crate::exam_record::{Period, TextField};
use crate::exam_store::ExamStore;
use crate::read_queries::ExamFilter;
use crate::report_export::{render_text_report, write_table_csv, write_text_report, ReportLayout};
use crate::{Error, Result};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
pub enum CommandResponse {
    #[serde(rename = "success")]
    Success { payload: Value },
    #[serde(rename = "error")]
    Error { error: ErrorBody },
}

impl CommandResponse {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        CommandResponse::Error {
            error: ErrorBody {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AppMetadata {
    pub app_name: String,
    pub app_version: String,
    pub target_os: String,
    pub target_arch: String,
    pub debug: bool,
}

pub fn app_metadata() -> AppMetadata {
    AppMetadata {
        app_name: env!("CARGO_PKG_NAME").to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        target_os: std::env::consts::OS.to_string(),
        target_arch: std::env::consts::ARCH.to_string(),
        debug: cfg!(debug_assertions),
    }
}

/// Accepts `YYYY-MM`, `YYYY/MM` or `YYYYMM` and returns the `year * 100 + month` key.
pub fn parse_period_arg(raw: &str) -> Result<u64> {
    let text = raw.trim();
    let invalid =
        || Error::InvalidFilter(format!("period must be YYYY-MM or YYYYMM, got {raw:?}"));

    let (year, month) = match text.split_once(['-', '/']) {
        Some((y, m)) => (
            y.parse::<u32>().map_err(|_| invalid())?,
            m.parse::<u32>().map_err(|_| invalid())?,
        ),
        None if text.len() == 6 && text.chars().all(|c| c.is_ascii_digit()) => {
            let key = text.parse::<u32>().map_err(|_| invalid())?;
            (key / 100, key % 100)
        }
        None => return Err(invalid()),
    };
    if year == 0 || !(1..=12).contains(&month) {
        return Err(invalid());
    }
    Ok(Period::new(year, month).key())
}

/// Imports one file, or every importable file under a directory.
pub fn import_command(store: &mut ExamStore, path: &Path) -> Result<Value> {
    if path.is_dir() {
        return Ok(serde_json::to_value(import_exam_path(store, path)?)?);
    }
    Ok(serde_json::to_value(import_exam_file(store, path)?)?)
}

pub fn preview_command(path: &Path) -> Result<Value> {
    Ok(serde_json::to_value(preview_exam_file(path)?)?)
}

pub fn table_command(store: &ExamStore, filter: &ExamFilter) -> Result<Value> {
    let table = store.fetch_table(filter)?;
    Ok(json!({
        "filter": filter,
        "row_count": table.rows.len(),
        "headers": table.headers,
        "rows": table.rows,
    }))
}

pub fn aggregate_command(store: &ExamStore, filter: &ExamFilter) -> Result<Value> {
    let totals = store.fetch_aggregate(filter)?;
    let rows = totals
        .iter()
        .map(|t| {
            json!({
                "exam_type": t.exam_type,
                "passed": t.passed,
                "failed": t.failed,
                "presented": t.presented(),
            })
        })
        .collect::<Vec<_>>();
    Ok(json!({
        "filter": filter,
        "rows": rows,
    }))
}

pub fn values_command(store: &ExamStore, field_name: &str) -> Result<Value> {
    let field = TextField::parse(field_name).ok_or_else(|| {
        Error::InvalidFilter(format!(
            "unknown field {field_name:?}; expected one of province, exam_center, driving_school, exam_type, permit"
        ))
    })?;
    Ok(json!({
        "field": field,
        "values": store.distinct_values(field)?,
    }))
}

pub fn years_command(store: &ExamStore) -> Result<Value> {
    Ok(json!({ "years": store.available_years()? }))
}

pub fn periods_command(store: &ExamStore) -> Result<Value> {
    Ok(json!({ "periods": store.imported_periods()? }))
}

pub fn status_command(store: &ExamStore) -> Result<Value> {
    Ok(json!({
        "app": app_metadata(),
        "store": store.stats()?,
    }))
}

pub fn report_command(
    store: &ExamStore,
    filter: &ExamFilter,
    layout: &ReportLayout,
    output: &Path,
    as_csv: bool,
) -> Result<Value> {
    let table = store.fetch_table(filter)?;
    if as_csv {
        write_table_csv(output, &table)?;
        return Ok(json!({
            "output": output.to_string_lossy().to_string(),
            "format": "csv",
            "row_count": table.rows.len(),
        }));
    }

    let totals = store.fetch_aggregate(filter)?;
    let pages = render_text_report(&table, &totals, layout);
    write_text_report(output, &pages)?;
    Ok(json!({
        "output": output.to_string_lossy().to_string(),
        "format": "text",
        "row_count": table.rows.len(),
        "page_count": pages.len(),
    }))
}
