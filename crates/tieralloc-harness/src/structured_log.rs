//! JSONL export of allocator lifecycle records.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tieralloc_core::{AllocatorLogLevel, AllocatorLogRecord};

use crate::HarnessError;

/// Serializable mirror of [`AllocatorLogRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub decision_id: u64,
    pub trace_id: String,
    pub level: String,
    pub symbol: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<usize>,
    pub outcome: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub details: String,
    pub heap_size: usize,
    pub pool_remaining: usize,
}

impl From<&AllocatorLogRecord> for LogRecord {
    fn from(record: &AllocatorLogRecord) -> Self {
        Self {
            decision_id: record.decision_id,
            trace_id: record.trace_id.clone(),
            level: record.level.as_str().to_string(),
            symbol: record.symbol.to_string(),
            event: record.event.to_string(),
            ptr: record.ptr.map(|p| format!("{p:#x}")),
            size: record.size,
            class: record.class,
            outcome: record.outcome.to_string(),
            details: record.details.clone(),
            heap_size: record.heap_size,
            pool_remaining: record.pool_remaining,
        }
    }
}

/// Parses a `--log-level` value; `off` disables recording.
pub fn parse_log_level(raw: &str) -> Result<Option<AllocatorLogLevel>, HarnessError> {
    if raw.trim().eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    AllocatorLogLevel::from_str_loose(raw)
        .map(Some)
        .ok_or_else(|| HarnessError::InvalidArgument(format!("unknown log level '{raw}'")))
}

/// Writes one JSON object per line.
pub fn write_records<W: Write>(mut writer: W, records: &[LogRecord]) -> Result<(), HarnessError> {
    for record in records {
        let line = serde_json::to_string(record)?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `records` to `path` as JSONL, replacing any existing file.
pub fn write_jsonl(path: &Path, records: &[LogRecord]) -> Result<(), HarnessError> {
    let file = std::fs::File::create(path)?;
    write_records(std::io::BufWriter::new(file), records)
}
