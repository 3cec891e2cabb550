use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::read_queries::{ExamTable, ExamTypeTotals};
use crate::Result;

const SAMPLE_ROWS_FOR_WIDTH: usize = 50;
const MIN_COLUMN_WIDTH: usize = 6;
const MAX_COLUMN_WIDTH: usize = 30;
const CELL_PADDING: usize = 1;
const PAGE_BREAK: &str = "\u{000C}";
const AGGREGATE_HEADERS: [&str; 4] = ["Exam Type", "Passed", "Failed", "Presented"];

/// Page geometry for the printable text report, in characters and lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportLayout {
    pub title: String,
    pub page_width: usize,
    pub page_height: usize,
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self {
            title: "Driving Exam Statistics".to_string(),
            page_width: 132,
            page_height: 60,
        }
    }
}

struct PageWriter {
    pages: Vec<Vec<String>>,
    current: Vec<String>,
    page_height: usize,
}

impl PageWriter {
    fn new(page_height: usize) -> Self {
        Self {
            pages: Vec::new(),
            current: Vec::new(),
            page_height: page_height.max(5),
        }
    }

    fn remaining(&self) -> usize {
        self.page_height.saturating_sub(self.current.len())
    }

    fn push(&mut self, line: String) {
        if self.remaining() == 0 {
            self.new_page();
        }
        self.current.push(line);
    }

    fn new_page(&mut self) {
        if !self.current.is_empty() {
            self.pages.push(std::mem::take(&mut self.current));
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.new_page();
        self.pages.into_iter().map(|lines| lines.join("\n")).collect()
    }
}

fn text_width(text: &str) -> usize {
    text.chars().count()
}

fn elide(text: &str, width: usize) -> String {
    if text_width(text) <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let mut out = text.chars().take(width - 1).collect::<String>();
    out.push('…');
    out
}

fn column_widths(headers: &[String], rows: &[Vec<String>]) -> Vec<usize> {
    headers
        .iter()
        .enumerate()
        .map(|(col, header)| {
            let widest = rows
                .iter()
                .take(SAMPLE_ROWS_FOR_WIDTH)
                .filter_map(|row| row.get(col))
                .map(|cell| text_width(cell))
                .fold(text_width(header), usize::max);
            (widest + CELL_PADDING * 2).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH)
        })
        .collect()
}

/// Splits columns into groups whose rendered width fits the page.
fn column_groups(widths: &[usize], page_width: usize) -> Vec<Vec<usize>> {
    let mut groups = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_width = 1;
    for (col, width) in widths.iter().enumerate() {
        let cell_width = width + 1;
        if !current.is_empty() && current_width + cell_width > page_width {
            groups.push(std::mem::take(&mut current));
            current_width = 1;
        }
        current.push(col);
        current_width += cell_width;
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn format_line(cells: &[&str], group: &[usize], widths: &[usize]) -> String {
    let mut line = String::from("|");
    for (cell, col) in cells.iter().zip(group) {
        let inner = widths[*col] - CELL_PADDING * 2;
        let text = elide(cell, inner);
        let pad = inner - text_width(&text);
        line.push_str(&" ".repeat(CELL_PADDING));
        line.push_str(&text);
        line.push_str(&" ".repeat(pad + CELL_PADDING));
        line.push('|');
    }
    line
}

fn separator_line(group: &[usize], widths: &[usize]) -> String {
    let mut line = String::from("+");
    for col in group {
        line.push_str(&"-".repeat(widths[*col]));
        line.push('+');
    }
    line
}

fn write_grid_header(
    writer: &mut PageWriter,
    headers: &[String],
    group: &[usize],
    widths: &[usize],
) {
    let cells = group
        .iter()
        .map(|col| headers[*col].as_str())
        .collect::<Vec<_>>();
    writer.push(separator_line(group, widths));
    writer.push(format_line(&cells, group, widths));
    writer.push(separator_line(group, widths));
}

/// Renders a grid with the header repeated on every page. Column groups that do not
/// fit beside each other start on a fresh page.
fn write_grid(
    writer: &mut PageWriter,
    headers: &[String],
    rows: &[Vec<String>],
    page_width: usize,
) {
    if headers.is_empty() {
        return;
    }
    let widths = column_widths(headers, rows);
    let groups = column_groups(&widths, page_width);

    for (group_index, group) in groups.iter().enumerate() {
        if group_index > 0 || writer.remaining() < 4 {
            writer.new_page();
        }
        write_grid_header(writer, headers, group, &widths);
        for row in rows {
            if writer.remaining() == 0 {
                writer.new_page();
                write_grid_header(writer, headers, group, &widths);
            }
            let cells = group
                .iter()
                .map(|col| row.get(*col).map(String::as_str).unwrap_or(""))
                .collect::<Vec<_>>();
            writer.push(format_line(&cells, group, &widths));
        }
        writer.push(separator_line(group, &widths));
    }
}

/// Lays out a printable summary: title, per exam type totals, then the filtered
/// table. Returns one string per page.
pub fn render_text_report(
    table: &ExamTable,
    totals: &[ExamTypeTotals],
    layout: &ReportLayout,
) -> Vec<String> {
    let page_width = layout.page_width.max(MIN_COLUMN_WIDTH + 2);
    let mut writer = PageWriter::new(layout.page_height);

    let title_pad = page_width.saturating_sub(text_width(&layout.title)) / 2;
    writer.push(format!("{}{}", " ".repeat(title_pad), layout.title));
    writer.push(String::new());

    if !totals.is_empty() {
        let headers = AGGREGATE_HEADERS
            .iter()
            .map(|h| (*h).to_string())
            .collect::<Vec<_>>();
        let rows = totals
            .iter()
            .map(|t| {
                vec![
                    t.exam_type.clone(),
                    t.passed.to_string(),
                    t.failed.to_string(),
                    t.presented().to_string(),
                ]
            })
            .collect::<Vec<_>>();
        write_grid(&mut writer, &headers, &rows, page_width);
        writer.push(String::new());
    }

    let rows = table.rows.iter().map(|r| r.cells()).collect::<Vec<_>>();
    if rows.is_empty() {
        writer.push("No data".to_string());
    } else {
        write_grid(&mut writer, &table.headers, &rows, page_width);
    }

    writer.finish()
}

pub fn write_text_report(path: &Path, pages: &[String]) -> Result<()> {
    let separator = format!("\n{PAGE_BREAK}");
    let mut body = pages.join(separator.as_str());
    body.push('\n');
    std::fs::write(path, body)?;
    info!(output = %path.display(), pages = pages.len(), "wrote text report");
    Ok(())
}

pub fn write_table_csv(path: &Path, table: &ExamTable) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_record(row.cells())?;
    }
    writer.flush()?;
    info!(output = %path.display(), rows = table.rows.len(), "wrote table csv");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_queries::ExamTableRow;
    use std::fs;
    use uuid::Uuid;

    fn sample_table(row_count: usize) -> ExamTable {
        ExamTable {
            headers: [
                "Province",
                "Exam Center",
                "Driving School",
                "Exam Type",
                "Permit",
                "Year",
                "Month",
                "Passed",
                "Failed",
                "Presented",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect(),
            rows: (0..row_count)
                .map(|i| ExamTableRow {
                    province: format!("Provincia {i}"),
                    exam_center: "Centro".to_string(),
                    driving_school_name: "AUTOESCUELA CON UN NOMBRE MUY LARGO QUE NO CABE"
                        .to_string(),
                    exam_type: "PRUEBA".to_string(),
                    permit_name: "B".to_string(),
                    year: 2023,
                    month: 1,
                    passed: 1,
                    failed: 1,
                    presented: 2,
                })
                .collect(),
        }
    }

    #[test]
    fn long_cells_are_elided_to_max_width() {
        assert_eq!(elide("abcdef", 4), "abc…");
        assert_eq!(elide("abc", 4), "abc");

        let widths = column_widths(
            &["Driving School".to_string()],
            &[vec!["X".repeat(80)]],
        );
        assert_eq!(widths, vec![MAX_COLUMN_WIDTH]);
    }

    #[test]
    fn columns_split_into_groups_that_fit_the_page() {
        let groups = column_groups(&[10, 10, 10, 10], 25);
        assert_eq!(groups, vec![vec![0, 1], vec![2, 3]]);

        let single = column_groups(&[40], 25);
        assert_eq!(single, vec![vec![0]], "an oversize column still gets a group");
    }

    #[test]
    fn rows_paginate_with_repeated_header() {
        let table = sample_table(30);
        let layout = ReportLayout {
            title: "Test".to_string(),
            page_width: 200,
            page_height: 12,
        };
        let pages = render_text_report(&table, &[], &layout);
        assert!(pages.len() > 2);
        for page in &pages {
            assert!(page.lines().count() <= 12);
        }
        for page in &pages[1..] {
            assert!(page.contains("| Province"), "header repeated on every page");
        }
        let body_rows = pages
            .iter()
            .flat_map(|p| p.lines())
            .filter(|l| l.contains("Provincia "))
            .count();
        assert_eq!(body_rows, 30);
    }

    #[test]
    fn report_includes_totals_and_handles_empty_tables() {
        let totals = vec![ExamTypeTotals {
            exam_type: "PRUEBA CIRCULACION".to_string(),
            passed: 20,
            failed: 8,
        }];
        let pages = render_text_report(&sample_table(0), &totals, &ReportLayout::default());
        assert_eq!(pages.len(), 1);
        assert!(pages[0].contains("Driving Exam Statistics"));
        assert!(pages[0].contains("| PRUEBA CIRCULACION"));
        assert!(pages[0].contains("28"));
        assert!(pages[0].contains("No data"));
    }

    #[test]
    fn table_csv_round_trips_headers_and_rows() {
        let path = std::env::temp_dir().join(format!(
            "driving_exams_table_{}_{}.csv",
            std::process::id(),
            Uuid::new_v4()
        ));
        write_table_csv(&path, &sample_table(2)).expect("write table csv");

        let text = fs::read_to_string(&path).expect("read table csv");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("Province,Exam Center,Driving School,Exam Type,Permit,Year,Month,Passed,Failed,Presented")
        );
        assert_eq!(lines.count(), 2);
        let _ = fs::remove_file(&path);
    }
}
