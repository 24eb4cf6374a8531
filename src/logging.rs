use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::LoggingConfig;
use crate::interpret::ApiFamily;

/// The user side of a proxied exchange.
#[derive(Debug, Clone, Serialize)]
pub struct InputRecord {
    pub role: &'static str,
    #[serde(rename = "type")]
    pub family: ApiFamily,
    pub content: Value,
}

impl InputRecord {
    pub fn new(family: ApiFamily, content: Value) -> Self {
        Self {
            role: "user",
            family,
            content,
        }
    }
}

/// The assistant side of a proxied exchange. `tool_calls` and `refusal`
/// only appear on the wire when they carry data.
#[derive(Debug, Clone, Serialize)]
pub struct OutputRecord {
    pub role: &'static str,
    #[serde(rename = "type")]
    pub family: ApiFamily,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<Value>,
}

impl OutputRecord {
    pub fn new(family: ApiFamily, content: Value) -> Self {
        Self {
            role: "assistant",
            family,
            content,
            tool_calls: None,
            refusal: None,
        }
    }
}

/// One JSONL line. Exactly one of `input` / `output` is set.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<InputRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputRecord>,
    pub truncated: bool,
    /// Stamped by the writer at encode time when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl LogEvent {
    pub fn input(record: InputRecord, truncated: bool) -> Self {
        Self {
            input: Some(record),
            output: None,
            truncated,
            timestamp: None,
        }
    }

    pub fn output(record: OutputRecord, truncated: bool) -> Self {
        Self {
            input: None,
            output: Some(record),
            truncated,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogWriteResult {
    pub bytes_written: usize,
    pub rotated: bool,
    pub path: PathBuf,
}

/// Append-only JSONL writer with size-triggered rotation. A single mutex
/// serializes the rotate-check and the append so concurrent writers never
/// interleave partial lines.
pub struct JsonlLogger {
    path: PathBuf,
    max_file_bytes: u64,
    lock: Mutex<()>,
}

impl JsonlLogger {
    pub fn new(path: PathBuf, max_file_bytes: u64) -> Self {
        Self {
            path,
            max_file_bytes,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(cfg: &LoggingConfig) -> Result<Self> {
        std::fs::create_dir_all(&cfg.log_dir)
            .with_context(|| format!("failed to create log dir {:?}", cfg.log_dir))?;
        Ok(Self::new(cfg.log_dir.join(&cfg.filename), cfg.max_file_bytes))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode `event` as one compact JSON line and append it to the active
    /// file, rotating first when the write would push it past the size
    /// threshold.
    pub async fn write_event(&self, mut event: LogEvent) -> Result<LogWriteResult> {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false));
        }
        let mut line = serde_json::to_vec(&event).context("failed to encode log event")?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let rotated = self.rotate_if_needed(line.len() as u64)?;
        let bytes_written = self.append_bytes(&line)?;
        Ok(LogWriteResult {
            bytes_written,
            rotated,
            path: self.path.clone(),
        })
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> Result<bool> {
        let current = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current + incoming_bytes <= self.max_file_bytes {
            return Ok(false);
        }

        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("promptlens");
        let suffix = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();

        let mut rotated_path = self.path.with_file_name(format!("{stem}-{timestamp}{suffix}"));
        let mut counter = 1u32;
        while rotated_path.exists() {
            rotated_path = self
                .path
                .with_file_name(format!("{stem}-{timestamp}-{counter}{suffix}"));
            counter += 1;
        }

        if self.path.exists() {
            std::fs::rename(&self.path, &rotated_path).with_context(|| {
                format!("failed to rotate {:?} to {:?}", self.path, rotated_path)
            })?;
        }
        Ok(true)
    }

    fn append_bytes(&self, payload: &[u8]) -> Result<usize> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir {:?}", parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open log file {:?}", self.path))?;
        // One write call for the whole line so interleaved writers from other
        // processes cannot tear it.
        file.write_all(payload)
            .with_context(|| format!("failed to append to log file {:?}", self.path))?;
        Ok(payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn temp_log_path() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("promptlens-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir.join("promptlens.jsonl")
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .expect("read log")
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[tokio::test]
    async fn writes_one_compact_line_per_event() {
        let path = temp_log_path();
        let logger = JsonlLogger::new(path.clone(), 1024 * 1024);

        let event = LogEvent::input(
            InputRecord::new(ApiFamily::Chat, json!([{"role": "user", "content": "Hi"}])),
            false,
        );
        let result = logger.write_event(event).await.expect("write");
        assert!(!result.rotated);
        assert_eq!(result.path, path);

        let text = std::fs::read_to_string(&path).expect("read log");
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert_eq!(result.bytes_written, text.len());

        let value: Value = serde_json::from_str(text.trim_end()).expect("line parses");
        assert_eq!(value["input"]["role"], "user");
        assert_eq!(value["input"]["type"], "chat");
        assert_eq!(value["input"]["content"][0]["content"], "Hi");
        assert_eq!(value["truncated"], false);
        let timestamp = value["timestamp"].as_str().expect("timestamp stamped");
        chrono::DateTime::parse_from_rfc3339(timestamp).expect("timestamp is RFC 3339");
        assert!(timestamp.ends_with("+00:00"));
    }

    #[tokio::test]
    async fn preserves_caller_timestamp() {
        let path = temp_log_path();
        let logger = JsonlLogger::new(path.clone(), 1024 * 1024);

        let mut event = LogEvent::output(OutputRecord::new(ApiFamily::Chat, json!("Hello!")), false);
        event.timestamp = Some("2025-01-01T00:00:00+00:00".to_string());
        logger.write_event(event).await.expect("write");

        let lines = read_lines(&path);
        let value: Value = serde_json::from_str(&lines[0]).expect("parse");
        assert_eq!(value["timestamp"], "2025-01-01T00:00:00+00:00");
        assert_eq!(value["output"]["role"], "assistant");
        assert!(value["output"].get("tool_calls").is_none());
    }

    #[tokio::test]
    async fn rotates_when_write_would_exceed_threshold() {
        let path = temp_log_path();
        let logger = JsonlLogger::new(path.clone(), 200);

        // Each line lands around 180 bytes, so the first write fits and the
        // second one trips the 200-byte threshold.
        let big = "x".repeat(60);
        let first = logger
            .write_event(LogEvent::input(
                InputRecord::new(ApiFamily::Chat, json!(big.clone())),
                false,
            ))
            .await
            .expect("first write");
        assert!(!first.rotated);

        let second = logger
            .write_event(LogEvent::input(
                InputRecord::new(ApiFamily::Chat, json!(big)),
                false,
            ))
            .await
            .expect("second write");
        assert!(second.rotated);

        // The active file holds only the post-rotation line.
        let active_lines = read_lines(&path);
        assert_eq!(active_lines.len(), 1);

        let dir = path.parent().expect("parent");
        let rotated: Vec<PathBuf> = std::fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p != &path)
            .collect();
        assert_eq!(rotated.len(), 1);
        let rotated_name = rotated[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(
            rotated_name.starts_with("promptlens-") && rotated_name.ends_with(".jsonl"),
            "unexpected rotated name: {rotated_name}"
        );
        assert_eq!(read_lines(&rotated[0]).len(), 1);
    }

    #[tokio::test]
    async fn rotated_siblings_get_unique_names() {
        let path = temp_log_path();
        // Every write rotates the previous one.
        let logger = JsonlLogger::new(path.clone(), 1);

        for i in 0..3 {
            logger
                .write_event(LogEvent::input(
                    InputRecord::new(ApiFamily::Unknown, json!(format!("event-{i}"))),
                    false,
                ))
                .await
                .expect("write");
        }

        let dir = path.parent().expect("parent");
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        // Active file plus two rotated siblings, all distinct.
        assert_eq!(names.len(), 3);
        let unique: std::collections::HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_writers_never_tear_lines() {
        let path = temp_log_path();
        let logger = Arc::new(JsonlLogger::new(path.clone(), 1024 * 1024));

        let mut handles = Vec::new();
        for i in 0..32 {
            let logger = logger.clone();
            handles.push(tokio::spawn(async move {
                logger
                    .write_event(LogEvent::input(
                        InputRecord::new(ApiFamily::Chat, json!({"seq": i, "pad": "y".repeat(64)})),
                        false,
                    ))
                    .await
                    .expect("write");
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 32);
        for line in &lines {
            let value: Value = serde_json::from_str(line).expect("every line is intact JSON");
            assert!(value["input"]["content"]["seq"].is_u64());
        }
    }
}
