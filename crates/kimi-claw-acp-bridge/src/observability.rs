use std::{
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        LazyLock, Mutex,
    },
};

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use kimi_claw_transport::{ObsEvent, ObsSeverity, ObsSink};
use regex::Regex;
use serde_json::{json, Map, Value};

pub const DEFAULT_OBS_ROLLING_MAX_BYTES: u64 = 500 * 1024 * 1024;
pub const DEFAULT_OBS_ROLLING_MAX_BACKUPS: u32 = 1;
const REDACTED: &str = "(redacted)";
const MIN_ANYWHERE_SECRET_LEN: usize = 8;
const MAX_INLINE_BASE64_CHARS: usize = 1024;
const BINARY_KEYS: [&str; 3] = ["content", "data", "dataBase64"];

static BASE64_PAYLOAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+/]*={0,2}$").expect("base64 payload regex"));

/// Dedups non-blank secrets and orders them longest first so overlapping tokens redact cleanly.
pub fn collect_secrets<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Vec<String> {
    let mut secrets = candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|secret| !secret.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    secrets.sort_by(|left, right| right.len().cmp(&left.len()).then_with(|| left.cmp(right)));
    secrets.dedup();
    secrets
}

fn redact_str(input: &str, secrets: &[String]) -> String {
    let mut next = input.to_string();
    for secret in secrets {
        if secret.len() >= MIN_ANYWHERE_SECRET_LEN {
            next = next.replace(secret.as_str(), REDACTED);
        } else if next == *secret {
            next = REDACTED.to_string();
        }
    }
    next
}

/// Replaces secrets in every string of `value`; short secrets only on exact match.
pub fn redact_secrets(value: &Value, secrets: &[String]) -> Value {
    if secrets.is_empty() {
        return value.clone();
    }
    match value {
        Value::String(text) => Value::String(redact_str(text, secrets)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| redact_secrets(item, secrets))
                .collect(),
        ),
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(key, entry)| (key.clone(), redact_secrets(entry, secrets)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn omitted_base64(length: usize) -> Value {
    json!({"_obs": {"omitted": true, "kind": "base64", "length": length}})
}

/// Strips large base64 blobs from mapping snapshots so trace rows stay readable.
pub fn sanitize_obs_mapping_payload(value: &Value) -> Value {
    sanitize_mapping_node(value, None)
}

fn sanitize_mapping_node(value: &Value, parent_key: Option<&str>) -> Value {
    match value {
        Value::String(text) => {
            let length = text.chars().count();
            let binary_key = parent_key.is_some_and(|key| BINARY_KEYS.contains(&key));
            if length > MAX_INLINE_BASE64_CHARS
                && (binary_key || (length % 4 == 0 && BASE64_PAYLOAD.is_match(text)))
            {
                return omitted_base64(length);
            }
            value.clone()
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_mapping_node(item, None))
                .collect(),
        ),
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(key, entry)| (key.clone(), sanitize_mapping_node(entry, Some(key))))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Mirrors observability events into the process log.
pub struct TracingObsSink;

impl ObsSink for TracingObsSink {
    fn emit(&self, event: ObsEvent) {
        let summary = event.summary.as_deref().unwrap_or_default();
        let location = event.location.as_deref().unwrap_or_default();
        match event.severity {
            ObsSeverity::Debug => {
                tracing::debug!(obs = %event.name, location, summary, "observability event")
            }
            ObsSeverity::Info => {
                tracing::info!(obs = %event.name, location, summary, "observability event")
            }
            ObsSeverity::Warn => {
                tracing::warn!(obs = %event.name, location, summary, "observability event")
            }
            ObsSeverity::Error => {
                tracing::error!(obs = %event.name, location, summary, "observability event")
            }
        }
    }
}

/// Appends one redacted JSON row per event, rolling to `<file>.1` past the size limit.
pub struct JsonlObsSink {
    path: PathBuf,
    max_bytes: u64,
    max_backups: u32,
    secrets: Vec<String>,
    file: Mutex<std::fs::File>,
    warned_write_failure: AtomicBool,
    warned_oversized_row: AtomicBool,
}

fn open_append(path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open observability log {}", path.display()))
}

fn file_size(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(metadata.len()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(0),
        Err(error) => Err(error)
            .with_context(|| format!("failed to stat observability log {}", path.display())),
    }
}

fn backup_path(path: &Path, index: u32) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(format!(".{index}"));
    PathBuf::from(raw)
}

impl JsonlObsSink {
    pub fn open(path: PathBuf, secrets: Vec<String>) -> Result<Self> {
        Self::open_with_limits(
            path,
            secrets,
            DEFAULT_OBS_ROLLING_MAX_BYTES,
            DEFAULT_OBS_ROLLING_MAX_BACKUPS,
        )
    }

    pub fn open_with_limits(
        path: PathBuf,
        secrets: Vec<String>,
        max_bytes: u64,
        max_backups: u32,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "failed to create observability log directory {}",
                        parent.display()
                    )
                })?;
            }
        }
        let file = open_append(&path)?;
        Ok(Self {
            path,
            max_bytes,
            max_backups,
            secrets,
            file: Mutex::new(file),
            warned_write_failure: AtomicBool::new(false),
            warned_oversized_row: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotate(&self) -> Result<()> {
        if self.max_backups == 0 {
            return std::fs::remove_file(&self.path)
                .or_else(|error| match error.kind() {
                    ErrorKind::NotFound => Ok(()),
                    _ => Err(error),
                })
                .with_context(|| format!("failed to truncate {}", self.path.display()));
        }
        for index in (1..=self.max_backups).rev() {
            let source = if index == 1 {
                self.path.clone()
            } else {
                backup_path(&self.path, index - 1)
            };
            let target = backup_path(&self.path, index);
            let _ = std::fs::remove_file(&target);
            if !source.exists() {
                continue;
            }
            std::fs::rename(&source, &target).with_context(|| {
                format!("failed to rotate {} to {}", source.display(), target.display())
            })?;
        }
        Ok(())
    }

    fn write_row(&self, event: &ObsEvent) -> Result<()> {
        let mut row = serde_json::to_value(event).context("failed to encode observability event")?;
        if let Value::Object(object) = &mut row {
            object.insert(
                "ts".to_string(),
                json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        let row = redact_secrets(&row, &self.secrets);
        let line = serde_json::to_string(&row).context("failed to encode observability row")?;
        let line_bytes = line.len() as u64 + 1;

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("observability log lock is poisoned"))?;
        if file_size(&self.path)? + line_bytes > self.max_bytes {
            self.rotate()?;
            *file = open_append(&self.path)?;
        }
        writeln!(file, "{line}")
            .with_context(|| format!("failed to write observability log {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush observability log {}", self.path.display()))?;
        if line_bytes > self.max_bytes && !self.warned_oversized_row.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                max_bytes = self.max_bytes,
                path = %self.path.display(),
                "single observability row is larger than the rolling limit"
            );
        }
        Ok(())
    }
}

impl ObsSink for JsonlObsSink {
    fn emit(&self, event: ObsEvent) {
        if let Err(error) = self.write_row(&event) {
            if !self.warned_write_failure.swap(true, Ordering::Relaxed) {
                tracing::warn!(error = %error, "failed to append observability log");
            }
        }
    }
}

/// Fans one event out to several sinks.
pub struct FanoutObsSink {
    sinks: Vec<std::sync::Arc<dyn ObsSink>>,
}

impl FanoutObsSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn ObsSink>>) -> Self {
        Self { sinks }
    }
}

impl ObsSink for FanoutObsSink {
    fn emit(&self, event: ObsEvent) {
        let Some((last, rest)) = self.sinks.split_last() else {
            return;
        };
        for sink in rest {
            sink.emit(event.clone());
        }
        last.emit(event);
    }
}
