//! JSON Lines table reading and writing
//!
//! Every table a stage emits is a `.jsonl` file with one serialized row per
//! line. Writers emit rows in the caller's order; callers sort first.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Read every row of a JSONL file
///
/// Blank lines are skipped. A malformed row fails the whole read with its
/// 1-based line number.
pub fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::NotFound(format!("Required input file missing: {}", path.display()))
        }
        _ => Error::Io(e),
    })?;

    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line).map_err(|e| {
            Error::InvalidInput(format!("{}:{}: {}", path.display(), idx + 1, e))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Write rows to a JSONL file, replacing any existing file
///
/// Returns the number of rows written.
pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(rows.len() as u64)
}

/// Count non-blank lines in a JSONL file
pub fn count_rows(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

/// Write a pretty JSON document atomically (temp file + rename)
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    fs::write(&temp_path, body)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read a JSON document
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::NotFound(format!("Required input file missing: {}", path.display()))
        }
        _ => Error::Io(e),
    })?;
    Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
        name: String,
    }

    #[test]
    fn test_write_then_read_preserves_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.jsonl");
        let rows = vec![
            Row { id: 2, name: "b".into() },
            Row { id: 1, name: "a".into() },
        ];
        assert_eq!(write_rows(&path, &rows).unwrap(), 2);
        let back: Vec<Row> = read_rows(&path).unwrap();
        assert_eq!(back, rows);
        assert_eq!(count_rows(&path).unwrap(), 2);
    }

    #[test]
    fn test_read_reports_line_number() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\":1,\"name\":\"a\"}\n\nnot json\n").unwrap();
        let err = read_rows::<Row>(&path).unwrap_err();
        assert!(err.to_string().contains(":3:"), "got {}", err);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = read_rows::<Row>(&dir.path().join("absent.jsonl")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_atomic_json_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &Row { id: 7, name: "x".into() }).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("doc.json.tmp").exists());
        let back: Row = read_json(&path).unwrap();
        assert_eq!(back.id, 7);
    }
}
