//! Dead-letter sink for malformed or unresolvable inbound events.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sf_core::{Result, TimingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_key: Option<String>,
    /// Raw payload as text (lossy when the bytes were not UTF-8).
    pub original_value: String,
    pub partition: u32,
    pub offset: u64,
    pub ingested_at: DateTime<Utc>,
}

pub trait DeadLetterSink: Send + Sync {
    fn send(&self, letter: &DeadLetter) -> Result<()>;
}

/// Append-only JSONL file sink.
pub struct JsonlDeadLetterSink {
    path: PathBuf,
}

impl JsonlDeadLetterSink {
    pub fn new(dir: &std::path::Path) -> Self {
        Self {
            path: dir.join("dead_letters.jsonl"),
        }
    }
}

impl DeadLetterSink for JsonlDeadLetterSink {
    fn send(&self, letter: &DeadLetter) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TimingError::BackendUnavailable(format!("dlq open: {}", e)))?;
        let line = serde_json::to_string(letter)
            .map_err(|e| TimingError::BackendUnavailable(format!("dlq encode: {}", e)))?;
        writeln!(file, "{}", line)
            .map_err(|e| TimingError::BackendUnavailable(format!("dlq write: {}", e)))?;
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn send(&self, letter: &DeadLetter) -> Result<()> {
        self.letters.lock().unwrap().push(letter.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_letter(error: &str) -> DeadLetter {
        DeadLetter {
            error: error.to_string(),
            original_key: Some("sf_abc".into()),
            original_value: "{not json".into(),
            partition: 2,
            offset: 17,
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlDeadLetterSink::new(dir.path());
        sink.send(&make_letter("deserialize failed")).unwrap();
        sink.send(&make_letter("missing event_id")).unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("dead_letters.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("deserialize failed"));
        assert!(content.contains("\"partition\":2"));
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemoryDeadLetterSink::new();
        sink.send(&make_letter("bad timestamp")).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.letters()[0].offset, 17);
    }
}
