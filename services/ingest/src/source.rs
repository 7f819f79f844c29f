//! Input file loading
//!
//! CSV text is decoded as UTF-8 (BOM stripped) and falls back to
//! Windows-1252, which is what spreadsheet exports of the source data use.
//! Spreadsheets (xlsx, xls, ods) are read from their first sheet, off the
//! async runtime. In both cases the header row is kept apart from the data.

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// One data row with the 1-based line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub line: usize,
    pub fields: Vec<String>,
}

#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub headers: Vec<String>,
    pub records: Vec<SourceRecord>,
}

pub fn is_spreadsheet(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref(),
        Some("xlsx" | "xls" | "xlsm" | "ods")
    )
}

/// Read and split an input file. A missing file or a file without data rows
/// is an error: there is nothing to upload.
pub async fn load(path: &Path, delimiter: u8) -> Result<SourceFile> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("Failed to read input file {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let content_hash = format!("sha256:{:x}", hasher.finalize());

    let (headers, records) = if is_spreadsheet(path) {
        let sheet_path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_spreadsheet(&sheet_path))
            .await
            .context("Spreadsheet reader task failed")??
    } else {
        read_records(&decode_text(&bytes), delimiter)
    };

    if records.is_empty() {
        anyhow::bail!("Input file {} has no data rows", path.display());
    }

    Ok(SourceFile {
        path: path.to_path_buf(),
        content_hash,
        headers,
        records,
    })
}

pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// Split delimited text into its header and records. Fields are kept
/// untrimmed so that free text re-joined by the layout keeps its original
/// spacing; the normalizer trims each cell.
pub fn read_records(content: &str, delimiter: u8) -> (Vec<String>, Vec<SourceRecord>) {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(header) => header.iter().map(|h| h.trim().to_string()).collect(),
        Err(e) => {
            warn!(error = %e, "Unreadable CSV header");
            Vec::new()
        }
    };

    let mut records = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        match result {
            Ok(record) => {
                let line = record
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(idx + 2);
                records.push(SourceRecord {
                    line,
                    fields: record.iter().map(str::to_string).collect(),
                });
            }
            Err(e) => warn!(line = idx + 2, error = %e, "Skipping unreadable CSV line"),
        }
    }
    (headers, records)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        other => format!("{}", other),
    }
}

fn read_spreadsheet(path: &Path) -> Result<(Vec<String>, Vec<SourceRecord>)> {
    let mut workbook = open_workbook_auto(path).context("Failed to open spreadsheet")?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .context("Spreadsheet has no sheets")?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read sheet")?;

    let headers: Vec<String> = range
        .rows()
        .next()
        .map(|row| {
            row.iter()
                .map(|c| cell_text(c).trim().to_string())
                .filter(|h| !h.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let records: Vec<SourceRecord> = range
        .rows()
        .enumerate()
        .skip(1)
        .filter(|(_, row)| row.iter().any(|c| !matches!(c, Data::Empty)))
        .map(|(idx, row)| SourceRecord {
            line: idx + 1,
            fields: row.iter().map(cell_text).collect(),
        })
        .collect();

    Ok((headers, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_records_skips_header_and_keeps_lines() {
        let (headers, records) = read_records("a,b\n1,5000001\n2,5000002\n", b',');
        assert_eq!(headers, vec!["a", "b"]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].line, 2);
        assert_eq!(records[0].fields, vec!["1", "5000001"]);
        assert_eq!(records[1].line, 3);
    }

    #[test]
    fn test_read_records_quoted_delimiters() {
        let (_, records) = read_records(
            "id,descripcion,valor\n7,\"Uso de IA, big data\",12.5\n",
            b',',
        );
        assert_eq!(records[0].fields, vec!["7", "Uso de IA, big data", "12.5"]);
    }

    #[test]
    fn test_read_records_variable_width() {
        let (headers, records) = read_records("a,b,c\n1,2\n1,2,3,4\n", b',');
        assert_eq!(headers.len(), 3);
        assert_eq!(records[0].fields.len(), 2);
        assert_eq!(records[1].fields.len(), 4);
    }

    #[test]
    fn test_read_records_semicolon() {
        let (_, records) = read_records("a;b\n1;2\n", b';');
        assert_eq!(records[0].fields, vec!["1", "2"]);
    }

    #[test]
    fn test_decode_text_bom_and_latin1() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFid\n"), "id\n");
        // "Espa\xF1a" is "España" in Windows-1252
        assert_eq!(decode_text(b"Espa\xF1a"), "España");
    }

    #[test]
    fn test_is_spreadsheet() {
        assert!(is_spreadsheet(Path::new("data/datos.XLSX")));
        assert!(is_spreadsheet(Path::new("datos.ods")));
        assert!(!is_spreadsheet(Path::new("datos.csv")));
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let err = load(Path::new("/nonexistent/datos.csv"), b',')
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read input file"));
    }

    #[tokio::test]
    async fn test_load_header_only_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id_componente,id_resultado").unwrap();
        let err = load(file.path(), b',').await.unwrap_err();
        assert!(err.to_string().contains("no data rows"));
    }

    #[tokio::test]
    async fn test_load_hashes_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "id_componente,id_resultado\n1,5000001\n").unwrap();
        let source = load(file.path(), b',').await.unwrap();
        assert!(source.content_hash.starts_with("sha256:"));
        assert_eq!(source.content_hash.len(), "sha256:".len() + 64);
        assert_eq!(source.records.len(), 1);
        assert_eq!(source.headers, vec!["id_componente", "id_resultado"]);
    }

    #[tokio::test]
    async fn test_load_unreadable_spreadsheet_fails() {
        let mut file = tempfile::Builder::new().suffix(".xlsx").tempfile().unwrap();
        write!(file, "not a workbook").unwrap();
        let err = load(file.path(), b',').await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to open spreadsheet"));
    }
}
