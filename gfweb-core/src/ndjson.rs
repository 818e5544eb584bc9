//! Line-oriented decoding of the streamed response bodies returned by the
//! copy, archive and zip endpoints.
//!
//! Chunks arrive at arbitrary boundaries, so bytes are buffered until a full
//! `\n`-terminated line is available. Each line is parsed on its own; a line
//! that does not parse is logged and dropped without affecting its
//! neighbours.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Splits a byte stream into complete text lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line completed by it. The trailing
    /// fragment stays buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = decode_line(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flushes whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches('\r');
    if line.trim().is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    Warn(String),
    Error(String),
    Progress { copied: u64, total: Option<u64> },
    Message(String),
    Done,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    warn: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    copied: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    done: Option<Value>,
}

/// Parses one NDJSON line. Returns `None` for malformed or unrecognised
/// records.
pub fn parse_record(line: &str) -> Option<StreamRecord> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            warn!(line = %line, error = %err, "skipping malformed stream line");
            return None;
        }
    };
    // A derived struct also accepts arrays positionally; records are objects.
    if !value.is_object() {
        warn!(line = %line, "skipping stream line that is not an object");
        return None;
    }
    let raw: RawRecord = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(line = %line, error = %err, "skipping malformed stream line");
            return None;
        }
    };
    if let Some(error) = raw.error.filter(|v| !v.is_null()) {
        return Some(StreamRecord::Error(value_text(error)));
    }
    if let Some(warning) = raw.warn.filter(|v| !v.is_null()) {
        return Some(StreamRecord::Warn(value_text(warning)));
    }
    if let Some(copied) = raw.copied {
        return Some(StreamRecord::Progress {
            copied,
            total: raw.total,
        });
    }
    if let Some(message) = raw.message.filter(|v| !v.is_null()) {
        return Some(StreamRecord::Message(value_text(message)));
    }
    if raw.done.is_some_and(|v| !matches!(v, Value::Bool(false) | Value::Null)) {
        return Some(StreamRecord::Done);
    }
    debug!(line = %line, "ignoring stream record without known fields");
    None
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// [`LineBuffer`] plus [`parse_record`].
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    lines: LineBuffer,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamRecord> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| parse_record(line))
            .collect()
    }

    pub fn finish(&mut self) -> Vec<StreamRecord> {
        self.lines
            .finish()
            .and_then(|line| parse_record(&line))
            .into_iter()
            .collect()
    }
}

/// Events carried by the `data:` lines of a streaming zip response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZipEvent {
    Percent(u8),
    Status(String),
    Ready(String),
    Error(String),
}

pub fn parse_sse_line(line: &str) -> Option<ZipEvent> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!(line = %line, error = %err, "skipping malformed event line");
            return None;
        }
    };
    if let Some(path) = value.get("zipPath").and_then(Value::as_str) {
        return Some(ZipEvent::Ready(path.to_string()));
    }
    if let Some(error) = value.get("error").filter(|v| !v.is_null()) {
        return Some(ZipEvent::Error(value_text(error.clone())));
    }
    match value.get("progress") {
        Some(Value::Number(n)) => {
            let percent = n.as_f64().unwrap_or(0.0).clamp(0.0, 100.0).floor() as u8;
            Some(ZipEvent::Percent(percent))
        }
        Some(Value::String(text)) => Some(ZipEvent::Status(text.clone())),
        _ => {
            debug!(line = %line, "ignoring event line without progress or zipPath");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMemberKind {
    Directory,
    File,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub kind: ArchiveMemberKind,
    pub path: String,
}

/// Parses a `"<TYPE> <path>"` listing line where TYPE is `D`, `F` or `S`.
pub fn parse_listing_line(line: &str) -> Option<ArchiveMember> {
    let (kind, path) = line.split_once(' ')?;
    let kind = match kind {
        "D" => ArchiveMemberKind::Directory,
        "F" => ArchiveMemberKind::File,
        "S" => ArchiveMemberKind::Symlink,
        _ => return None,
    };
    if path.trim().is_empty() {
        return None;
    }
    Some(ArchiveMember {
        kind,
        path: path.to_string(),
    })
}
