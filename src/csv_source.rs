use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::{Error, Result};

const SNIFF_SAMPLE_CHARS: usize = 4096;
const CANDIDATE_DELIMITERS: [char; 4] = [',', ';', '\t', '|'];
const FALLBACK_DELIMITER: char = ';';

/// Text encodings tried in order when decoding an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TextEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "utf-8-bom")]
    Utf8Bom,
    #[serde(rename = "windows-1252")]
    Windows1252,
    #[serde(rename = "latin-1")]
    Latin1,
}

impl TextEncoding {
    pub const FALLBACK_ORDER: [TextEncoding; 4] = [
        TextEncoding::Utf8,
        TextEncoding::Utf8Bom,
        TextEncoding::Windows1252,
        TextEncoding::Latin1,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf8Bom => "utf-8-bom",
            TextEncoding::Windows1252 => "windows-1252",
            TextEncoding::Latin1 => "latin-1",
        }
    }

    /// Strict decode: `None` when the bytes are not valid in this encoding.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8 => {
                if bytes.starts_with(UTF8_BOM) {
                    return None;
                }
                std::str::from_utf8(bytes).ok().map(str::to_string)
            }
            TextEncoding::Utf8Bom => {
                let rest = bytes.strip_prefix(UTF8_BOM)?;
                std::str::from_utf8(rest).ok().map(str::to_string)
            }
            TextEncoding::Windows1252 => bytes.iter().map(|b| windows_1252_char(*b)).collect(),
            TextEncoding::Latin1 => Some(bytes.iter().map(|b| char::from(*b)).collect()),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

// 0x80..=0x9F; `None` marks bytes Windows-1252 leaves undefined.
const WINDOWS_1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'),
    None,
    Some('\u{201A}'),
    Some('\u{0192}'),
    Some('\u{201E}'),
    Some('\u{2026}'),
    Some('\u{2020}'),
    Some('\u{2021}'),
    Some('\u{02C6}'),
    Some('\u{2030}'),
    Some('\u{0160}'),
    Some('\u{2039}'),
    Some('\u{0152}'),
    None,
    Some('\u{017D}'),
    None,
    None,
    Some('\u{2018}'),
    Some('\u{2019}'),
    Some('\u{201C}'),
    Some('\u{201D}'),
    Some('\u{2022}'),
    Some('\u{2013}'),
    Some('\u{2014}'),
    Some('\u{02DC}'),
    Some('\u{2122}'),
    Some('\u{0161}'),
    Some('\u{203A}'),
    Some('\u{0153}'),
    None,
    Some('\u{017E}'),
    Some('\u{0178}'),
];

fn windows_1252_char(byte: u8) -> Option<char> {
    match byte {
        0x80..=0x9F => WINDOWS_1252_HIGH[usize::from(byte - 0x80)],
        _ => Some(char::from(byte)),
    }
}

/// Decoded, split rows of a delimited file plus the dialect that produced them.
#[derive(Debug)]
pub struct SourceRows {
    pub rows: Vec<Vec<String>>,
    pub encoding: TextEncoding,
    pub delimiter: char,
}

pub fn decode_with_fallback(bytes: &[u8]) -> Option<(String, TextEncoding)> {
    TextEncoding::FALLBACK_ORDER
        .iter()
        .find_map(|enc| enc.decode(bytes).map(|text| (text, *enc)))
}

pub(crate) fn trim_cell(text: &str) -> String {
    text.trim()
        .trim_start_matches('\u{feff}')
        .trim()
        .to_string()
}

fn count_unquoted(line: &str, delimiter: char) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for c in line.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == delimiter && !in_quotes {
            count += 1;
        }
    }
    count
}

/// Picks the candidate delimiter whose per-line count is most consistent over the
/// sample. Ties go to the higher per-line count, then to candidate order.
pub fn sniff_delimiter(text: &str) -> Option<char> {
    let truncated = text.chars().count() > SNIFF_SAMPLE_CHARS;
    let sample: String = text.chars().take(SNIFF_SAMPLE_CHARS).collect();
    let mut lines = sample
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>();
    if truncated && lines.len() > 1 {
        lines.pop();
    }
    if lines.is_empty() {
        return None;
    }

    let mut best: Option<(usize, usize, char)> = None;
    for delimiter in CANDIDATE_DELIMITERS {
        let counts = lines
            .iter()
            .map(|l| count_unquoted(l, delimiter))
            .collect::<Vec<_>>();
        let mut mode = 0;
        let mut mode_hits = 0;
        for candidate in counts.iter().copied().filter(|c| *c > 0) {
            let hits = counts.iter().filter(|c| **c == candidate).count();
            if hits > mode_hits || (hits == mode_hits && candidate > mode) {
                mode = candidate;
                mode_hits = hits;
            }
        }
        if mode == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_hits, best_mode, _)) => {
                mode_hits > best_hits || (mode_hits == best_hits && mode > best_mode)
            }
        };
        if better {
            best = Some((mode_hits, mode, delimiter));
        }
    }
    best.map(|(_, _, delimiter)| delimiter)
}

fn split_rows(text: &str, delimiter: char) -> std::result::Result<Vec<Vec<String>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter as u8)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for rec in reader.records() {
        let rec = rec?;
        rows.push(rec.iter().map(trim_cell).collect());
    }
    Ok(rows)
}

/// Reads the whole file, decodes it with the first encoding that accepts the bytes,
/// sniffs the delimiter and splits it into trimmed cells.
pub fn read_source_rows(path: &Path) -> Result<SourceRows> {
    let bytes = std::fs::read(path).map_err(|e| Error::UnreadableFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if bytes.is_empty() {
        return Err(Error::EmptyFile {
            path: path.to_path_buf(),
        });
    }

    let (text, encoding) = decode_with_fallback(&bytes).ok_or_else(|| Error::UnreadableFile {
        path: path.to_path_buf(),
        reason: "no supported text encoding could decode the file".to_string(),
    })?;

    let delimiter = sniff_delimiter(&text).unwrap_or(FALLBACK_DELIMITER);
    debug!(file = %path.display(), %encoding, ?delimiter, "decoded source file");

    let rows = split_rows(&text, delimiter).map_err(|e| Error::UnreadableFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if rows.iter().all(|r| r.iter().all(String::is_empty)) {
        return Err(Error::EmptyFile {
            path: path.to_path_buf(),
        });
    }

    Ok(SourceRows {
        rows,
        encoding,
        delimiter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn create_temp_path(prefix: &str, ext: &str) -> PathBuf {
        let unique = format!("{prefix}_{}_{}.{}", std::process::id(), Uuid::new_v4(), ext);
        std::env::temp_dir().join(unique)
    }

    #[test]
    fn utf8_is_preferred_and_bom_is_detected() {
        let (text, enc) = decode_with_fallback("Málaga".as_bytes()).expect("decode utf-8");
        assert_eq!(enc, TextEncoding::Utf8);
        assert_eq!(text, "Málaga");

        let mut with_bom = UTF8_BOM.to_vec();
        with_bom.extend_from_slice("Cádiz".as_bytes());
        let (text, enc) = decode_with_fallback(&with_bom).expect("decode utf-8 bom");
        assert_eq!(enc, TextEncoding::Utf8Bom);
        assert_eq!(text, "Cádiz");
    }

    #[test]
    fn windows_1252_bytes_fall_back_without_loss() {
        // "AUTOESCUELA PEÑA €" in Windows-1252
        let bytes = b"AUTOESCUELA PE\xD1A \x80";
        let (text, enc) = decode_with_fallback(bytes).expect("decode cp1252");
        assert_eq!(enc, TextEncoding::Windows1252);
        assert_eq!(text, "AUTOESCUELA PEÑA €");
    }

    #[test]
    fn undefined_windows_1252_bytes_fall_back_to_latin1() {
        let bytes = b"A\x81B";
        let (text, enc) = decode_with_fallback(bytes).expect("decode latin-1");
        assert_eq!(enc, TextEncoding::Latin1);
        assert_eq!(text.chars().count(), 3);
    }

    #[test]
    fn sniffs_semicolon_even_with_commas_in_names() {
        let text = "\
DESC_PROVINCIA;CENTRO_EXAMEN;NOMBRE_AUTOESCUELA;MES\n\
Madrid;Madrid;AUTOESCUELA SOL, S.L.;1\n\
Madrid;Madrid;AUTOESCUELA LUNA;1\n";
        assert_eq!(sniff_delimiter(text), Some(';'));
    }

    #[test]
    fn sniffs_tab_and_pipe() {
        assert_eq!(sniff_delimiter("a\tb\tc\n1\t2\t3\n"), Some('\t'));
        assert_eq!(sniff_delimiter("a|b|c\n1|2|3\n"), Some('|'));
        assert_eq!(sniff_delimiter("single column\nno delimiters\n"), None);
    }

    #[test]
    fn quoted_delimiters_are_ignored_when_sniffing() {
        let text = "\"a,b\";c\n\"d,e\";f\n";
        assert_eq!(sniff_delimiter(text), Some(';'));
    }

    #[test]
    fn empty_file_is_reported() {
        let path = create_temp_path("driving_exams_empty", "csv");
        fs::write(&path, "").expect("write empty file");
        let err = read_source_rows(&path).expect_err("empty file must fail");
        assert!(matches!(err, Error::EmptyFile { .. }));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_unreadable() {
        let path = create_temp_path("driving_exams_missing", "csv");
        let err = read_source_rows(&path).expect_err("missing file must fail");
        assert!(matches!(err, Error::UnreadableFile { .. }));
    }

    #[test]
    fn reads_rows_with_detected_dialect() {
        let path = create_temp_path("driving_exams_rows", "csv");
        fs::write(&path, "a|b|c\n 1 | 2 |3\n").expect("write pipe file");
        let source = read_source_rows(&path).expect("read pipe file");
        assert_eq!(source.delimiter, '|');
        assert_eq!(source.encoding, TextEncoding::Utf8);
        assert_eq!(source.rows[1], vec!["1", "2", "3"]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn undelimited_file_falls_back_to_semicolon() {
        let path = create_temp_path("driving_exams_single_col", "csv");
        fs::write(&path, "Madrid\nToledo\n").expect("write single column file");
        let source = read_source_rows(&path).expect("read single column file");
        assert_eq!(source.delimiter, FALLBACK_DELIMITER);
        assert_eq!(source.delimiter, ';');
        assert_eq!(source.rows, vec![vec!["Madrid"], vec!["Toledo"]]);
        let _ = fs::remove_file(&path);
    }
}
