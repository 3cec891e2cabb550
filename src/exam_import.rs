use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::csv_source::{read_source_rows, trim_cell, TextEncoding};
use crate::exam_record::{ExamRecord, Period};
use crate::exam_store::ExamStore;
use crate::{Error, Result};

const MIN_CELLS_PER_ROW: usize = 5;
const PREVIEW_ROW_LIMIT: usize = 10;
const IMPORTABLE_EXTENSIONS: &[&str] = &["csv", "txt"];

#[derive(Debug)]
struct AliasSpec {
    field: &'static str,
    aliases: &'static [&'static str],
}

const PROVINCE_ALIASES: &[&str] = &["desc_provincia", "provincia"];

const EXAM_ALIAS_SPECS: &[AliasSpec] = &[
    AliasSpec {
        field: "province",
        aliases: PROVINCE_ALIASES,
    },
    AliasSpec {
        field: "exam_center",
        aliases: &["centro_examen", "centro"],
    },
    AliasSpec {
        field: "school_code",
        aliases: &["codigo_autoescuela", "cod_autoescuela"],
    },
    AliasSpec {
        field: "school_name",
        aliases: &["nombre_autoescuela", "autoescuela"],
    },
    AliasSpec {
        field: "section_code",
        aliases: &["codigo_seccion", "seccion"],
    },
    AliasSpec {
        field: "month",
        aliases: &["mes"],
    },
    AliasSpec {
        field: "year",
        aliases: &["anyo", "anio", "año", "year"],
    },
    AliasSpec {
        field: "exam_type",
        aliases: &["tipo_examen"],
    },
    AliasSpec {
        field: "permit_name",
        aliases: &["nombre_permiso", "permiso"],
    },
    AliasSpec {
        field: "passed",
        aliases: &["num_aptos", "aptos"],
    },
    AliasSpec {
        field: "passed_1conv",
        aliases: &["num_aptos_1conv"],
    },
    AliasSpec {
        field: "passed_2conv",
        aliases: &["num_aptos_2conv"],
    },
    AliasSpec {
        field: "passed_3or4conv",
        aliases: &["num_aptos_3o4conv"],
    },
    AliasSpec {
        field: "passed_5plus",
        aliases: &["num_aptos_5_o_mas_conv"],
    },
    AliasSpec {
        field: "failed",
        aliases: &["num_no_aptos", "no_aptos"],
    },
];

/// Result of parsing one exam statistics file.
#[derive(Debug)]
pub struct ParsedExamFile {
    pub records: Vec<ExamRecord>,
    pub periods: BTreeSet<Period>,
    pub encoding: TextEncoding,
    pub delimiter: char,
    pub has_header: bool,
    /// Logical field -> source header text, for fields the header provided.
    pub mapping: BTreeMap<String, String>,
    pub discarded_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ImportOutcome {
    pub file: String,
    pub inserted: usize,
    pub imported_periods: Vec<Period>,
    pub skipped_periods: Vec<Period>,
    pub encoding: TextEncoding,
    pub delimiter: String,
}

#[derive(Debug, Serialize)]
pub struct ImportFailure {
    pub file: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct PathImportSummary {
    pub source: String,
    pub file_count: usize,
    pub inserted_total: usize,
    pub imported: Vec<ImportOutcome>,
    pub failed: Vec<ImportFailure>,
}

#[derive(Debug, Serialize)]
pub struct ExamFilePreview {
    pub file: String,
    pub encoding: TextEncoding,
    pub delimiter: String,
    pub has_header: bool,
    pub mapping: BTreeMap<String, String>,
    pub parsed_count: usize,
    pub discarded_count: usize,
    pub periods: Vec<Period>,
    pub preview_rows: Vec<ExamRecord>,
}

/// Best-effort count: strips `.`/`,` thousands separators, returns 0 for anything
/// that is not a non-negative integer.
pub fn parse_count(raw: &str) -> u32 {
    raw.replace(['.', ','], "")
        .trim()
        .parse::<u32>()
        .unwrap_or(0)
}

fn normalize_key(key: &str) -> String {
    trim_cell(key)
        .trim_matches('"')
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn is_header_row(row: &[String]) -> bool {
    row.first()
        .map(|cell| {
            let key = normalize_key(cell);
            PROVINCE_ALIASES.iter().any(|alias| *alias == key)
        })
        .unwrap_or(false)
}

fn resolve_alias_mapping_from_row(row: &[String]) -> HashMap<&'static str, usize> {
    let mut normalized: HashMap<String, usize> = HashMap::new();
    for (idx, cell) in row.iter().enumerate() {
        let key = normalize_key(cell);
        if !key.is_empty() {
            normalized.entry(key).or_insert(idx);
        }
    }

    let mut mapping = HashMap::new();
    for spec in EXAM_ALIAS_SPECS {
        for alias in spec.aliases {
            if let Some(idx) = normalized.get(*alias) {
                mapping.insert(spec.field, *idx);
                break;
            }
        }
    }
    mapping
}

fn mapping_headers(
    header_row: &[String],
    mapping_idx: &HashMap<&'static str, usize>,
) -> BTreeMap<String, String> {
    mapping_idx
        .iter()
        .filter_map(|(field, idx)| {
            header_row
                .get(*idx)
                .map(|header| (field.to_string(), trim_cell(header)))
        })
        .collect()
}

fn row_get(row: &[String], mapping_idx: &HashMap<&'static str, usize>, field: &str) -> String {
    mapping_idx
        .get(field)
        .and_then(|i| row.get(*i))
        .map(|s| trim_cell(s))
        .unwrap_or_default()
}

fn record_from_row(row: &[String], mapping_idx: &HashMap<&'static str, usize>) -> ExamRecord {
    let text = |field: &str| row_get(row, mapping_idx, field);
    let count = |field: &str| parse_count(&row_get(row, mapping_idx, field));
    ExamRecord {
        province: text("province"),
        exam_center: text("exam_center"),
        school_code: text("school_code"),
        school_name: text("school_name"),
        section_code: text("section_code"),
        month: count("month"),
        year: count("year"),
        exam_type: text("exam_type"),
        permit_name: text("permit_name"),
        passed: count("passed"),
        passed_1conv: count("passed_1conv"),
        passed_2conv: count("passed_2conv"),
        passed_3or4conv: count("passed_3or4conv"),
        passed_5plus: count("passed_5plus"),
        failed: count("failed"),
    }
}

/// Parses a delimited exam statistics file into complete records and the set of
/// periods they cover.
pub fn parse_exam_file(path: &Path) -> Result<ParsedExamFile> {
    let source = read_source_rows(path)?;
    let rows = source.rows;

    let has_header = rows.first().map(|r| is_header_row(r)).unwrap_or(false);
    // Without a recognized header the first line still drives the mapping, which
    // normally resolves no fields and leaves every record incomplete.
    let mapping_idx = rows
        .first()
        .map(|r| resolve_alias_mapping_from_row(r))
        .unwrap_or_default();
    let mapping = if has_header {
        mapping_headers(&rows[0], &mapping_idx)
    } else {
        BTreeMap::new()
    };
    let data_rows = if has_header { &rows[1..] } else { &rows[..] };
    debug!(
        file = %path.display(),
        has_header,
        mapped_fields = mapping_idx.len(),
        "resolved header mapping"
    );

    let mut records = Vec::new();
    let mut periods = BTreeSet::new();
    let mut discarded_count = 0_usize;
    for row in data_rows {
        if row.len() < MIN_CELLS_PER_ROW {
            if row.iter().any(|c| !c.is_empty()) {
                discarded_count += 1;
            }
            continue;
        }
        let record = record_from_row(row, &mapping_idx);
        if !record.is_complete() {
            discarded_count += 1;
            continue;
        }
        periods.insert(record.period());
        records.push(record);
    }

    if records.is_empty() {
        return Err(Error::NoValidRows {
            path: path.to_path_buf(),
        });
    }
    if discarded_count > 0 {
        debug!(file = %path.display(), discarded_count, "discarded incomplete rows");
    }

    Ok(ParsedExamFile {
        records,
        periods,
        encoding: source.encoding,
        delimiter: source.delimiter,
        has_header,
        mapping,
        discarded_count,
    })
}

pub fn preview_exam_file(path: &Path) -> Result<ExamFilePreview> {
    let parsed = parse_exam_file(path)?;
    Ok(ExamFilePreview {
        file: path.to_string_lossy().to_string(),
        encoding: parsed.encoding,
        delimiter: parsed.delimiter.to_string(),
        has_header: parsed.has_header,
        mapping: parsed.mapping,
        parsed_count: parsed.records.len(),
        discarded_count: parsed.discarded_count,
        periods: parsed.periods.into_iter().collect(),
        preview_rows: parsed
            .records
            .into_iter()
            .take(PREVIEW_ROW_LIMIT)
            .collect(),
    })
}

/// Imports one file. Periods already in the ledger are skipped whole; the remaining
/// records and their ledger entries are committed together.
pub fn import_exam_file(store: &mut ExamStore, path: &Path) -> Result<ImportOutcome> {
    let parsed = parse_exam_file(path)?;

    let mut skipped_periods = Vec::new();
    let mut new_periods = BTreeSet::new();
    for period in &parsed.periods {
        if store.is_period_imported(period.year, period.month)? {
            skipped_periods.push(*period);
        } else {
            new_periods.insert(*period);
        }
    }
    if new_periods.is_empty() {
        return Err(Error::NothingToImport {
            path: path.to_path_buf(),
            periods: skipped_periods,
        });
    }
    if !skipped_periods.is_empty() {
        warn!(file = %path.display(), skipped = ?skipped_periods, "skipping already imported periods");
    }

    let to_insert = parsed
        .records
        .into_iter()
        .filter(|r| new_periods.contains(&r.period()))
        .collect::<Vec<_>>();
    let inserted = store.commit_import(&to_insert, &new_periods)?;
    info!(file = %path.display(), inserted, periods = new_periods.len(), "imported exam file");

    Ok(ImportOutcome {
        file: path.to_string_lossy().to_string(),
        inserted,
        imported_periods: new_periods.into_iter().collect(),
        skipped_periods,
        encoding: parsed.encoding,
        delimiter: parsed.delimiter.to_string(),
    })
}

fn is_importable_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| {
            IMPORTABLE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}

fn collect_importable_files(input_path: &Path) -> Result<Vec<PathBuf>> {
    if input_path.is_file() {
        return Ok(vec![input_path.to_path_buf()]);
    }
    if !input_path.is_dir() {
        return Err(Error::UnreadableFile {
            path: input_path.to_path_buf(),
            reason: "path does not exist".to_string(),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(input_path).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::UnreadableFile {
            path: input_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if entry.file_type().is_file() && is_importable_file(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}

/// Imports a single file or every `.csv`/`.txt` file under a directory. Each file is
/// its own atomic unit; a failing file is reported and the walk continues.
pub fn import_exam_path(store: &mut ExamStore, input_path: &Path) -> Result<PathImportSummary> {
    let files = collect_importable_files(input_path)?;
    let mut imported = Vec::new();
    let mut failed = Vec::new();

    for file in &files {
        match import_exam_file(store, file) {
            Ok(outcome) => imported.push(outcome),
            Err(err @ Error::Storage(_)) => return Err(err),
            Err(err) => {
                warn!(file = %file.display(), error = %err, "file not imported");
                failed.push(ImportFailure {
                    file: file.to_string_lossy().to_string(),
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    Ok(PathImportSummary {
        source: input_path.to_string_lossy().to_string(),
        file_count: files.len(),
        inserted_total: imported.iter().map(|o| o.inserted).sum(),
        imported,
        failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_queries::ExamFilter;
    use std::fs;
    use uuid::Uuid;

    const HEADER: &str = "DESC_PROVINCIA;CENTRO_EXAMEN;CODIGO_AUTOESCUELA;NOMBRE_AUTOESCUELA;CODIGO_SECCION;MES;ANYO;TIPO_EXAMEN;NOMBRE_PERMISO;NUM_APTOS;NUM_APTOS_1conv;NUM_APTOS_2conv;NUM_APTOS_3o4conv;NUM_APTOS_5_o_MAS_conv;NUM_NO_APTOS";

    fn create_temp_path(prefix: &str, ext: &str) -> PathBuf {
        let unique = format!("{prefix}_{}_{}.{}", std::process::id(), Uuid::new_v4(), ext);
        std::env::temp_dir().join(unique)
    }

    fn write_sample_exam_csv(path: &Path) {
        let csv = format!(
            "{HEADER}\n\
Madrid;Madrid;M001;AUTOESCUELA SOL;01;1;2023;PRUEBA CONTROL DE CONOCIMIENTOS;B;1.234;800;300;100;34;500\n\
Madrid;Alcorcón;M002;AUTOESCUELA LUNA;01;1;2023;PRUEBA CIRCULACION;B;20;10;5;3;2;N/D\n\
Sevilla;Sevilla;S001;AUTOESCUELA GIRALDA;01;2;2023;PRUEBA CIRCULACION;A2;15;10;5;0;0;7\n\
;Sevilla;S002;SIN PROVINCIA;01;2;2023;PRUEBA CIRCULACION;B;1;1;0;0;0;1\n\
Sevilla;Sevilla;S003;SIN MES;01;;2023;PRUEBA CIRCULACION;B;1;1;0;0;0;1\n\
corta;fila\n"
        );
        fs::write(path, csv).expect("write temp exam csv");
    }

    #[test]
    fn parse_count_strips_thousands_separators_and_defaults_to_zero() {
        assert_eq!(parse_count("1.234"), 1234);
        assert_eq!(parse_count("1,234"), 1234);
        assert_eq!(parse_count(" 12 "), 12);
        assert_eq!(parse_count("N/D"), 0);
        assert_eq!(parse_count(""), 0);
        assert_eq!(parse_count("-5"), 0);
    }

    #[test]
    fn parse_keeps_complete_rows_in_file_order() {
        let csv_path = create_temp_path("driving_exams_parse", "csv");
        write_sample_exam_csv(&csv_path);

        let parsed = parse_exam_file(&csv_path).expect("parse sample csv");
        assert!(parsed.has_header);
        assert_eq!(parsed.delimiter, ';');
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(parsed.discarded_count, 3);
        assert_eq!(
            parsed.periods.iter().copied().collect::<Vec<_>>(),
            vec![Period::new(2023, 1), Period::new(2023, 2)]
        );

        let first = &parsed.records[0];
        assert_eq!(first.school_name, "AUTOESCUELA SOL");
        assert_eq!(first.passed, 1234);
        assert_eq!(first.passed_5plus, 34);
        assert_eq!(parsed.records[1].failed, 0, "N/D coerces to zero");
        assert_eq!(parsed.records[2].province, "Sevilla");

        for record in &parsed.records {
            assert!(!record.province.is_empty());
            assert!(!record.exam_center.is_empty());
            assert!(record.year > 0);
            assert!((1..=12).contains(&record.month));
        }

        let _ = fs::remove_file(&csv_path);
    }

    #[test]
    fn every_province_alias_is_recognized() {
        for alias in ["provincia", "desc_provincia", "  DESC_PROVINCIA ", "Provincia"] {
            let csv_path = create_temp_path("driving_exams_alias", "csv");
            let csv = format!(
                "{alias},centro,autoescuela,mes,anio,aptos,no_aptos\nToledo,Toledo,AUTOESCUELA TAJO,3,2024,4,1\n"
            );
            fs::write(&csv_path, csv).expect("write alias csv");

            let parsed = parse_exam_file(&csv_path).expect("parse alias csv");
            assert_eq!(parsed.records.len(), 1, "alias {alias:?}");
            assert_eq!(parsed.records[0].province, "Toledo");
            assert_eq!(parsed.records[0].year, 2024);
            assert_eq!(parsed.records[0].failed, 1);
            assert!(parsed.records[0].exam_type.is_empty());
            let _ = fs::remove_file(&csv_path);
        }
    }

    #[test]
    fn headerless_file_yields_no_valid_rows() {
        let csv_path = create_temp_path("driving_exams_headerless", "csv");
        fs::write(
            &csv_path,
            "Madrid;Madrid;M001;SOL;01;1;2023;PRUEBA;B;1;1;0;0;0;1\n",
        )
        .expect("write headerless csv");

        let err = parse_exam_file(&csv_path).expect_err("headerless csv has no mapping");
        assert!(matches!(err, Error::NoValidRows { .. }));
        let _ = fs::remove_file(&csv_path);
    }

    #[test]
    fn windows_1252_school_names_survive_parse() {
        let csv_path = create_temp_path("driving_exams_cp1252", "csv");
        let mut bytes = format!("{HEADER}\n").into_bytes();
        bytes.extend_from_slice(
            b"M\xE1laga;M\xE1laga;MA01;AUTOESCUELA ESPA\xD1A \x96 CENTRO;01;5;2023;PRUEBA CIRCULACION;B;3;3;0;0;0;2\n",
        );
        fs::write(&csv_path, bytes).expect("write cp1252 csv");

        let parsed = parse_exam_file(&csv_path).expect("parse cp1252 csv");
        assert_eq!(parsed.encoding, TextEncoding::Windows1252);
        assert_eq!(parsed.records[0].province, "Málaga");
        assert_eq!(parsed.records[0].school_name, "AUTOESCUELA ESPAÑA – CENTRO");
        let _ = fs::remove_file(&csv_path);
    }

    #[test]
    fn import_twice_reports_nothing_to_import() {
        let csv_path = create_temp_path("driving_exams_import_twice", "csv");
        write_sample_exam_csv(&csv_path);
        let mut store = ExamStore::open_in_memory().expect("open store");

        let first = import_exam_file(&mut store, &csv_path).expect("first import");
        assert_eq!(first.inserted, 3);
        assert!(first.skipped_periods.is_empty());

        let err = import_exam_file(&mut store, &csv_path).expect_err("second import");
        match err {
            Error::NothingToImport { periods, .. } => assert_eq!(periods.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        let table = store
            .fetch_table(&ExamFilter::default())
            .expect("fetch table");
        assert_eq!(table.rows.len(), 3, "second import must not insert anything");

        let _ = fs::remove_file(&csv_path);
    }

    #[test]
    fn partial_reimport_only_inserts_new_periods() {
        let csv_path = create_temp_path("driving_exams_partial", "csv");
        write_sample_exam_csv(&csv_path);
        let mut store = ExamStore::open_in_memory().expect("open store");
        store
            .mark_periods_imported(&[Period::new(2023, 1)])
            .expect("pre-mark january");

        let outcome = import_exam_file(&mut store, &csv_path).expect("partial import");
        assert_eq!(outcome.inserted, 1, "only the single 2023-02 row");
        assert_eq!(outcome.skipped_periods, vec![Period::new(2023, 1)]);
        assert_eq!(outcome.imported_periods, vec![Period::new(2023, 2)]);
        assert!(store.is_period_imported(2023, 2).expect("ledger lookup"));

        let _ = fs::remove_file(&csv_path);
    }

    #[test]
    fn directory_import_continues_past_failing_files() {
        let dir = create_temp_path("driving_exams_dir", "d");
        fs::create_dir_all(&dir).expect("create temp dir");
        write_sample_exam_csv(&dir.join("a_2023.csv"));
        fs::write(dir.join("b_empty.txt"), "").expect("write empty txt");
        fs::write(dir.join("c_notes.md"), "ignored").expect("write ignored file");

        let mut store = ExamStore::open_in_memory().expect("open store");
        let summary = import_exam_path(&mut store, &dir).expect("import directory");
        assert_eq!(summary.file_count, 2);
        assert_eq!(summary.inserted_total, 3);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].kind, "EMPTY_FILE");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn preview_reports_mapping_without_touching_store() {
        let csv_path = create_temp_path("driving_exams_preview", "csv");
        write_sample_exam_csv(&csv_path);

        let preview = preview_exam_file(&csv_path).expect("preview csv");
        assert_eq!(preview.parsed_count, 3);
        assert_eq!(preview.delimiter, ";");
        assert_eq!(
            preview.mapping.get("province").map(String::as_str),
            Some("DESC_PROVINCIA")
        );
        assert_eq!(
            preview.mapping.get("passed_5plus").map(String::as_str),
            Some("NUM_APTOS_5_o_MAS_conv")
        );
        assert_eq!(preview.preview_rows.len(), 3);

        let _ = fs::remove_file(&csv_path);
    }
}
