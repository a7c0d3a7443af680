//! Reads the gateway's on-disk session transcripts for replay when the gateway has none.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

use crate::payload_fields::{as_object, field_str, first_field_str};

pub const LOCAL_HISTORY_LIMIT: usize = 200;
pub const LOCAL_HISTORY_TAIL_WINDOW_LINES: usize = if LOCAL_HISTORY_LIMIT * 32 > 64 {
    LOCAL_HISTORY_LIMIT * 32
} else {
    64
};
pub const LOCAL_HISTORY_TAIL_CHUNK_BYTES: u64 = 64 * 1024;
pub const LOCAL_HISTORY_TAIL_MAX_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Roles kept when reading a local session log; other rows are skipped.
pub enum HistoryRole {
    User,
    Assistant,
    ToolResult,
}

impl HistoryRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "toolResult" => Some(Self::ToolResult),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolResult => "toolResult",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One transcript message recovered from a session log.
pub struct LocalHistoryEntry {
    pub role: HistoryRole,
    pub content: Value,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub timestamp: Option<i64>,
}

impl LocalHistoryEntry {
    /// Gateway `chat.history` message shape, so both sources replay identically.
    pub fn to_message(&self) -> Map<String, Value> {
        let mut message = Map::new();
        message.insert("role".to_string(), json!(self.role.as_str()));
        message.insert("content".to_string(), self.content.clone());
        if let Some(tool_call_id) = &self.tool_call_id {
            message.insert("toolCallId".to_string(), json!(tool_call_id));
        }
        if let Some(tool_name) = &self.tool_name {
            message.insert("toolName".to_string(), json!(tool_name));
        }
        if let Some(timestamp) = self.timestamp {
            message.insert("timestamp".to_string(), json!(timestamp));
        }
        message
    }
}

/// Source of locally persisted transcript entries, oldest first.
pub trait HistorySource: Send + Sync {
    fn read_entries(&self, session_id: &str, session_key: &str) -> Vec<LocalHistoryEntry>;
}

#[derive(Debug, Clone)]
/// Reads transcripts from the agent's on-disk session store.
pub struct LocalSessionHistory {
    openclaw_home: PathBuf,
    agent_id: String,
}

/// `$OPENCLAW_HOME` when set, else `~/.openclaw`.
pub fn resolve_openclaw_home() -> PathBuf {
    if let Some(from_env) = std::env::var("OPENCLAW_HOME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return PathBuf::from(from_env);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openclaw")
}

impl LocalSessionHistory {
    pub fn new(openclaw_home: PathBuf, agent_id: &str) -> Self {
        Self {
            openclaw_home,
            agent_id: agent_id.to_string(),
        }
    }

    pub fn from_env(agent_id: &str) -> Self {
        Self::new(resolve_openclaw_home(), agent_id)
    }

    pub fn session_root(&self) -> PathBuf {
        self.openclaw_home
            .join("agents")
            .join(&self.agent_id)
            .join("sessions")
    }

    fn resolve_session_file(&self, session_id: &str, session_key: &str) -> Result<Option<PathBuf>> {
        let session_root = self.session_root();
        let store_path = session_root.join("sessions.json");
        if !store_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&store_path)
            .with_context(|| format!("failed to read local session store {}", store_path.display()))?;
        let store: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse local session store {}", store_path.display()))?;
        let Some(store) = store.as_object() else {
            return Ok(None);
        };
        let Some(entry) = as_object(store.get(session_key)).or_else(|| as_object(store.get(session_id)))
        else {
            return Ok(None);
        };
        let session_file = match (field_str(entry, "sessionFile"), field_str(entry, "sessionId")) {
            (Some(session_file), _) => PathBuf::from(session_file),
            (None, Some(entry_session_id)) => session_root.join(format!("{entry_session_id}.jsonl")),
            (None, None) => return Ok(None),
        };
        let resolved = if session_file.is_absolute() {
            session_file
        } else {
            session_root.join(session_file)
        };
        Ok(resolved.exists().then_some(resolved))
    }

    fn try_read_entries(&self, session_id: &str, session_key: &str) -> Result<Vec<LocalHistoryEntry>> {
        let Some(session_file) = self.resolve_session_file(session_id, session_key)? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for line in read_tail_lines(&session_file)? {
            let Some(entry) = parse_history_row(&line) else {
                continue;
            };
            entries.push(entry);
            if entries.len() >= LOCAL_HISTORY_LIMIT {
                break;
            }
        }
        entries.reverse();
        Ok(entries)
    }
}

impl HistorySource for LocalSessionHistory {
    fn read_entries(&self, session_id: &str, session_key: &str) -> Vec<LocalHistoryEntry> {
        match self.try_read_entries(session_id, session_key) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "failed to read local session history");
                Vec::new()
            }
        }
    }
}

fn parse_history_row(line: &str) -> Option<LocalHistoryEntry> {
    let row: Value = serde_json::from_str(line).ok()?;
    let row = row.as_object()?;
    if field_str(row, "type") != Some("message") {
        return None;
    }
    let message = as_object(row.get("message"))?;
    let role = HistoryRole::parse(field_str(message, "role")?)?;
    let integral = |value: Option<&Value>| value.and_then(Value::as_f64).filter(|ts| ts.is_finite()).map(|ts| ts as i64);
    Some(LocalHistoryEntry {
        role,
        content: message.get("content").cloned().unwrap_or(Value::Null),
        tool_call_id: first_field_str(message, &["toolCallId", "tool_call_id"]).map(str::to_string),
        tool_name: first_field_str(message, &["toolName", "tool_name"]).map(str::to_string),
        timestamp: integral(row.get("ts")).or_else(|| integral(message.get("timestamp"))),
    })
}

fn push_line(bytes: &[u8], lines: &mut Vec<String>) {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
}

/// Non-empty trimmed lines from the end of `path`, newest first, bounded by bytes and lines.
pub fn read_tail_lines(path: &Path) -> Result<Vec<String>> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open local session history {}", path.display()))?;
    let file_size = file
        .metadata()
        .with_context(|| format!("failed to stat local session history {}", path.display()))?
        .len();
    let mut cursor = file_size;
    let mut budget = LOCAL_HISTORY_TAIL_MAX_BYTES;
    let mut remainder = Vec::new();
    let mut newest_first = Vec::new();
    while cursor > 0 && budget > 0 && newest_first.len() < LOCAL_HISTORY_TAIL_WINDOW_LINES {
        let chunk_len = LOCAL_HISTORY_TAIL_CHUNK_BYTES.min(cursor).min(budget);
        let next_cursor = cursor - chunk_len;
        let mut chunk = vec![0_u8; chunk_len as usize];
        file.seek(SeekFrom::Start(next_cursor))
            .and_then(|_| file.read_exact(&mut chunk))
            .with_context(|| format!("failed to read local session history {}", path.display()))?;
        cursor = next_cursor;
        budget -= chunk_len;

        chunk.extend_from_slice(&remainder);
        let mut parts = chunk.split(|byte| *byte == b'\n');
        let head = parts.next().unwrap_or_default().to_vec();
        let rest = parts.collect::<Vec<_>>();
        for part in rest.iter().rev() {
            push_line(part, &mut newest_first);
            if newest_first.len() >= LOCAL_HISTORY_TAIL_WINDOW_LINES {
                break;
            }
        }
        remainder = head;
    }
    if newest_first.len() < LOCAL_HISTORY_TAIL_WINDOW_LINES {
        push_line(&remainder, &mut newest_first);
    }
    Ok(newest_first)
}
