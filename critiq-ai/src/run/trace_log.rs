//! Append-only call log (`calls.jsonl`) and parse log (`parse_outcomes.jsonl`)

use crate::parse::ParseOutcome;
use crate::service::CallTrace;
use critiq_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// How the response of one logged call parsed
///
/// Written only for calls that returned a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseRecord {
    pub call_id: String,
    pub unit_key: String,
    pub parse_outcome: ParseOutcome,
}

impl ParseRecord {
    pub fn new(trace: &CallTrace, parse_outcome: ParseOutcome) -> Self {
        Self {
            call_id: trace.call_id.clone(),
            unit_key: trace.unit_key.clone(),
            parse_outcome,
        }
    }
}

/// Receives every call trace before its response is parsed, then the
/// parse outcome once it is known
pub trait TraceSink: Send + Sync {
    fn record(&self, trace: &CallTrace) -> Result<()>;

    fn record_parse(&self, record: &ParseRecord) -> Result<()>;
}

struct JsonlAppender {
    path: PathBuf,
    file: Mutex<File>,
    rows: AtomicU64,
}

impl JsonlAppender {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            rows: AtomicU64::new(0),
        })
    }

    // The lock is held only for one line write
    fn append<T: Serialize>(&self, row: &T) -> Result<()> {
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        {
            let mut file = self
                .file
                .lock()
                .map_err(|_| Error::Internal(format!("{} lock poisoned", self.path.display())))?;
            file.write_all(line.as_bytes())?;
            file.flush()?;
        }
        self.rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}

/// File-backed sink
pub struct TraceLog {
    calls: JsonlAppender,
    parses: JsonlAppender,
}

impl TraceLog {
    pub fn create(calls_path: &Path, parses_path: &Path) -> Result<Self> {
        Ok(Self {
            calls: JsonlAppender::open(calls_path)?,
            parses: JsonlAppender::open(parses_path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.calls.path
    }

    pub fn rows(&self) -> u64 {
        self.calls.rows()
    }

    pub fn parse_rows(&self) -> u64 {
        self.parses.rows()
    }
}

impl TraceSink for TraceLog {
    fn record(&self, trace: &CallTrace) -> Result<()> {
        self.calls.append(trace)
    }

    fn record_parse(&self, record: &ParseRecord) -> Result<()> {
        self.parses.append(record)
    }
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct MemorySink {
    traces: Mutex<Vec<CallTrace>>,
    parses: Mutex<Vec<ParseRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<CallTrace> {
        self.traces.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn parses(&self) -> Vec<ParseRecord> {
        self.parses.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl TraceSink for MemorySink {
    fn record(&self, trace: &CallTrace) -> Result<()> {
        self.traces
            .lock()
            .map_err(|_| Error::Internal("memory sink lock poisoned".to_string()))?
            .push(trace.clone());
        Ok(())
    }

    fn record_parse(&self, record: &ParseRecord) -> Result<()> {
        self.parses
            .lock()
            .map_err(|_| Error::Internal("memory sink lock poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }
}
