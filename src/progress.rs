//! Progress bus: a durable, append-only event log with live fan-out.
//!
//! Every published event is appended as one NDJSON record to the progress
//! log and pushed to in-process subscribers over a broadcast channel. Two
//! record kinds share the log, distinguished by the `event` field: `phase`
//! for raw telemetry and `user_progress` for human-readable events carrying
//! a rendered `message`.
//!
//! The HTTP streaming path does not subscribe in memory: it tails the log
//! file through `LogTailer`, so the pipeline task and the response stream
//! are decoupled and a consumer can reattach after a brief disconnect by
//! re-reading from its last offset. The log is single-writer, multi-reader.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const EVENT_PHASE: &str = "phase";
pub const EVENT_USER_PROGRESS: &str = "user_progress";

/// One progress event, as written to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub ts: DateTime<Utc>,
    pub event: String,
    pub operation: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

struct BusInner {
    log_path: PathBuf,
    tx: broadcast::Sender<ProgressRecord>,
}

/// Fan-out publisher for progress events. Cheap to clone.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl ProgressBus {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            inner: Arc::new(BusInner {
                log_path: log_path.into(),
                tx,
            }),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.inner.log_path
    }

    /// Publish a raw telemetry event.
    pub fn phase(&self, operation: &str, phase: &str, fields: Value) {
        self.publish(EVENT_PHASE, operation, phase, None, fields);
    }

    /// Publish a human-readable progress event. The message is rendered from
    /// the operation/phase/fields so every consumer sees the same text.
    pub fn user(&self, operation: &str, phase: &str, fields: Value) {
        let fields_map = to_map(fields);
        let message = friendly_message(operation, phase, &fields_map);
        self.publish_record(ProgressRecord {
            ts: Utc::now(),
            event: EVENT_USER_PROGRESS.to_string(),
            operation: operation.to_string(),
            phase: phase.to_string(),
            message: Some(message),
            fields: fields_map,
        });
    }

    fn publish(
        &self,
        event: &str,
        operation: &str,
        phase: &str,
        message: Option<String>,
        fields: Value,
    ) {
        self.publish_record(ProgressRecord {
            ts: Utc::now(),
            event: event.to_string(),
            operation: operation.to_string(),
            phase: phase.to_string(),
            message,
            fields: to_map(fields),
        });
    }

    fn publish_record(&self, record: ProgressRecord) {
        self.append(&record);
        // Nobody listening is fine; the durable log is the source of truth.
        let _ = self.inner.tx.send(record);
    }

    /// Live, in-process subscription. Slow consumers may miss events; the
    /// durable log never does.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressRecord> {
        self.inner.tx.subscribe()
    }

    fn append(&self, record: &ProgressRecord) {
        if let Err(e) = self.try_append(record) {
            // The pipeline must not die over a telemetry write.
            tracing::warn!(error = %e, path = %self.inner.log_path.display(), "progress log append failed");
        }
    }

    fn try_append(&self, record: &ProgressRecord) -> std::io::Result<()> {
        if let Some(parent) = self.inner.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.log_path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

fn to_map(fields: Value) -> Map<String, Value> {
    match fields {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Incremental reader over the progress log.
///
/// Tracks a byte offset and returns complete records appended since the
/// last poll. Unparseable lines are skipped; a partially-written final line
/// is held back until its newline arrives.
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl LogTailer {
    /// Tail from the beginning of the log (replays existing records).
    pub fn from_start(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: String::new(),
        }
    }

    /// Tail from the current end of the log (new records only).
    pub fn from_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            path,
            offset,
            partial: String::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read any records appended since the last poll.
    pub fn poll(&mut self) -> std::io::Result<Vec<ProgressRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        self.offset += buf.len() as u64;
        self.partial.push_str(&buf);

        let mut records = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ProgressRecord>(line) {
                Ok(record) => records.push(record),
                Err(_) => continue,
            }
        }
        Ok(records)
    }
}

fn field_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

fn field_u64(fields: &Map<String, Value>, key: &str) -> Option<u64> {
    fields.get(key).and_then(Value::as_u64)
}

fn field_f64(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    fields.get(key).and_then(Value::as_f64)
}

/// Render the human-readable message for a user-progress event.
fn friendly_message(operation: &str, phase: &str, fields: &Map<String, Value>) -> String {
    match (operation, phase) {
        ("stage.understand", "start") => "Analyzing your question...".to_string(),
        ("stage.understand", "parse_result") | ("stage.understand", "done") => {
            match (field_str(fields, "domain"), field_str(fields, "intent")) {
                (Some(domain), Some(intent)) => {
                    format!("Identified a {intent} analysis in the {domain} domain")
                }
                _ => "Question understood".to_string(),
            }
        }
        ("stage.plan_structure", "start") => "Planning the report structure...".to_string(),
        ("stage.plan_structure", "parse_result") => {
            let count = field_u64(fields, "sections_count").unwrap_or(0);
            format!("Planned {count} sections")
        }
        ("stage.plan_structure", "done") => "Report structure planned".to_string(),
        ("stage.retrieve_knowledge", "external_search_start") => {
            "Searching for relevant sources...".to_string()
        }
        ("stage.retrieve_knowledge", "external_search_done") => {
            let docs = field_u64(fields, "docs").unwrap_or(0);
            format!("Found {docs} relevant documents")
        }
        ("stage.retrieve_knowledge", "section_done") => {
            let title = field_str(fields, "title").unwrap_or("section");
            format!("Finished section: {title}")
        }
        ("stage.retrieve_knowledge", "start") => "Generating report content...".to_string(),
        ("stage.retrieve_knowledge", "done") => "Content generation complete".to_string(),
        ("stage.write_and_polish", "start") => "Polishing the report...".to_string(),
        ("stage.write_and_polish", "done") => {
            let words = field_u64(fields, "word_count").unwrap_or(0);
            let target = field_u64(fields, "target_word_limit").unwrap_or(0);
            format!("Report written ({words} words, target {target})")
        }
        ("stage.validate", "start") => "Checking report quality...".to_string(),
        ("stage.validate", "parse_result") => {
            let score = field_f64(fields, "score").unwrap_or(0.0);
            format!("Quality score: {score:.1}/10")
        }
        ("stage.validate", "done") => match field_str(fields, "status") {
            Some("validated") => "Quality check passed".to_string(),
            _ => "Further refinement needed".to_string(),
        },
        ("stage.revise", "start") => "Revising the report...".to_string(),
        ("stage.revise", "score_comparison") => {
            let original = field_f64(fields, "original_score").unwrap_or(0.0);
            let revised = field_f64(fields, "revised_score").unwrap_or(0.0);
            match field_str(fields, "decision") {
                Some("keep_revised") => {
                    format!("Revision improved the report ({original:.1} -> {revised:.1})")
                }
                _ => format!("Kept the original (revised: {revised:.1}, original: {original:.1})"),
            }
        }
        ("stage.revise", "done") => {
            let count = field_u64(fields, "revision_count").unwrap_or(0);
            format!("Completed revision round {count}")
        }
        ("stage.generate_report", "start") => "Producing the final report...".to_string(),
        ("stage.generate_report", "done") => "Final report ready".to_string(),
        ("quality.evaluation", "start") => {
            let method = field_str(fields, "method").unwrap_or("standard");
            format!("Starting {method} quality evaluation...")
        }
        ("quality.evaluation", "done") => {
            let score = field_f64(fields, "score").unwrap_or(0.0);
            format!("Evaluation complete (score {score:.1}/10)")
        }
        (_, "skip") => {
            let reason = field_str(fields, "reason").unwrap_or("already complete");
            format!("Skipped ({reason})")
        }
        (_, "error") => {
            let msg = field_str(fields, "message").unwrap_or("unknown error");
            format!("Error: {msg}")
        }
        (op, ph) => format!("{op}: {ph}"),
    }
}
