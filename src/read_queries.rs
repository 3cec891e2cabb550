use rusqlite::{params_from_iter, types::Value as SqlValue};
use serde::{Deserialize, Serialize};

use crate::exam_record::TextField;
use crate::exam_store::{ExamStore, FOLD_CASE_FN};
use crate::Result;

const ALL_SENTINEL: &str = "all";

const TABLE_COLUMNS: &[(&str, &str)] = &[
    ("province", "Province"),
    ("exam_center", "Exam Center"),
    ("driving_school_name", "Driving School"),
    ("exam_type", "Exam Type"),
    ("permit_name", "Permit"),
    ("year", "Year"),
    ("month", "Month"),
    ("passed", "Passed"),
    ("failed", "Failed"),
    ("presented", "Presented"),
];

/// Optional predicates narrowing table and aggregate queries. Text options match by
/// case-insensitive substring (Unicode folding, so `cádiz` finds `CÁDIZ`); the period
/// range applies only when both bounds are set and is passed through unchecked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExamFilter {
    pub province: Option<String>,
    pub exam_center: Option<String>,
    pub driving_school: Option<String>,
    pub exam_type: Option<String>,
    pub permit: Option<String>,
    /// Inclusive `year * 100 + month` lower bound.
    pub from_period: Option<u64>,
    /// Inclusive `year * 100 + month` upper bound.
    pub to_period: Option<u64>,
}

impl ExamFilter {
    fn text_conditions(&self) -> [(TextField, Option<&String>); 5] {
        [
            (TextField::Province, self.province.as_ref()),
            (TextField::ExamCenter, self.exam_center.as_ref()),
            (TextField::DrivingSchool, self.driving_school.as_ref()),
            (TextField::ExamType, self.exam_type.as_ref()),
            (TextField::Permit, self.permit.as_ref()),
        ]
    }

    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        for (field, raw) in self.text_conditions() {
            let text = parse_optional_text(raw);
            if text.is_empty() || text.eq_ignore_ascii_case(ALL_SENTINEL) {
                continue;
            }
            conditions.push(format!("instr({FOLD_CASE_FN}({}), ?) > 0", field.column()));
            params.push(SqlValue::Text(text.to_lowercase()));
        }

        if let (Some(from), Some(to)) = (self.from_period, self.to_period) {
            conditions.push("(year * 100 + month) BETWEEN ? AND ?".to_string());
            params.push(SqlValue::Integer(sql_key(from)));
            params.push(SqlValue::Integer(sql_key(to)));
        }

        let where_sql = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        (where_sql, params)
    }
}

fn parse_optional_text(raw: Option<&String>) -> String {
    raw.map(|s| s.trim().to_string()).unwrap_or_default()
}

// Keys past i64::MAX sit above every stored period.
fn sql_key(key: u64) -> i64 {
    i64::try_from(key).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExamTableRow {
    pub province: String,
    pub exam_center: String,
    pub driving_school_name: String,
    pub exam_type: String,
    pub permit_name: String,
    pub year: u32,
    pub month: u32,
    pub passed: i64,
    pub failed: i64,
    pub presented: i64,
}

impl ExamTableRow {
    /// Cell texts in header order.
    pub fn cells(&self) -> Vec<String> {
        vec![
            self.province.clone(),
            self.exam_center.clone(),
            self.driving_school_name.clone(),
            self.exam_type.clone(),
            self.permit_name.clone(),
            self.year.to_string(),
            format!("{:02}", self.month),
            self.passed.to_string(),
            self.failed.to_string(),
            self.presented.to_string(),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExamTable {
    pub headers: Vec<String>,
    pub rows: Vec<ExamTableRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExamTypeTotals {
    pub exam_type: String,
    pub passed: i64,
    pub failed: i64,
}

impl ExamTypeTotals {
    pub fn presented(&self) -> i64 {
        self.passed + self.failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub year: u32,
    pub month: u32,
    pub imported_at: String,
}

impl ExamStore {
    /// Non-empty distinct values of one text column, ascending.
    pub fn distinct_values(&self, field: TextField) -> Result<Vec<String>> {
        let column = field.column();
        let sql = format!(
            "SELECT DISTINCT {column} FROM driving_exams WHERE {column} IS NOT NULL AND {column} != '' ORDER BY {column}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    pub fn available_years(&self) -> Result<Vec<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT year FROM driving_exams ORDER BY year")?;
        let rows = stmt.query_map([], |row| row.get::<_, u32>(0))?;
        let mut years = Vec::new();
        for row in rows {
            years.push(row?);
        }
        Ok(years)
    }

    /// Every matching record with the derived `presented` column, ordered by
    /// year, month and province.
    pub fn fetch_table(&self, filter: &ExamFilter) -> Result<ExamTable> {
        let (where_sql, params) = filter.where_clause();
        let sql = format!(
            r#"
            SELECT
                province,
                exam_center,
                COALESCE(driving_school_name, ''),
                exam_type,
                COALESCE(permit_name, ''),
                year,
                month,
                passed,
                failed,
                (passed + failed) AS presented
            FROM driving_exams
            {where_sql}
            ORDER BY year, month, province
            "#
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows_iter = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok(ExamTableRow {
                province: row.get(0)?,
                exam_center: row.get(1)?,
                driving_school_name: row.get(2)?,
                exam_type: row.get(3)?,
                permit_name: row.get(4)?,
                year: row.get(5)?,
                month: row.get(6)?,
                passed: row.get(7)?,
                failed: row.get(8)?,
                presented: row.get(9)?,
            })
        })?;
        let mut rows = Vec::new();
        for row in rows_iter {
            rows.push(row?);
        }

        Ok(ExamTable {
            headers: TABLE_COLUMNS
                .iter()
                .map(|(_, label)| (*label).to_string())
                .collect(),
            rows,
        })
    }

    /// Passed/failed sums per exam type, ascending by exam type.
    pub fn fetch_aggregate(&self, filter: &ExamFilter) -> Result<Vec<ExamTypeTotals>> {
        let (where_sql, params) = filter.where_clause();
        let sql = format!(
            r#"
            SELECT exam_type, SUM(passed) AS passed, SUM(failed) AS failed
            FROM driving_exams
            {where_sql}
            GROUP BY exam_type
            ORDER BY exam_type
            "#
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows_iter = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok(ExamTypeTotals {
                exam_type: row.get(0)?,
                passed: row.get(1)?,
                failed: row.get(2)?,
            })
        })?;
        let mut totals = Vec::new();
        for row in rows_iter {
            totals.push(row?);
        }
        Ok(totals)
    }

    pub fn imported_periods(&self) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT year, month, imported_at FROM imported_periods ORDER BY year, month",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LedgerEntry {
                year: row.get(0)?,
                month: row.get(1)?,
                imported_at: row.get(2)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}
