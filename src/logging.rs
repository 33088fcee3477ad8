//! Call log: one record per dispatch outcome, kept in a ring buffer and
//! appended to a JSONL file.
//!
//! Writes are fire-and-forget. A failing disk never fails a dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub timestamp: DateTime<Utc>,
    pub account_name: String,
    pub model: String,
    pub status: CallStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CallRecord {
    pub fn new(
        account_name: impl Into<String>,
        model: impl Into<String>,
        status: CallStatus,
        duration_ms: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            account_name: account_name.into(),
            model: model.into(),
            status,
            duration_ms,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

struct CallLogInner {
    entries: VecDeque<CallRecord>,
    file_path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl CallLogInner {
    fn open(file_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries = VecDeque::with_capacity(MAX_LOG_ENTRIES);

        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<CallRecord>(&line) {
                    if entries.len() >= MAX_LOG_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self {
            entries,
            file_path: Some(file_path.to_path_buf()),
            writer: Some(BufWriter::new(file)),
        })
    }

    fn push(&mut self, entry: CallRecord) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Rewrite the backing file from the ring buffer.
    fn compact(&mut self) -> std::io::Result<()> {
        let Some(path) = self.file_path.clone() else {
            return Ok(());
        };
        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            if let Ok(json) = serde_json::to_string(entry) {
                writeln!(writer, "{}", json)?;
            }
        }
        writer.flush()?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

/// Shared handle to the call log. Cheap to clone.
#[derive(Clone)]
pub struct CallLog(Arc<Mutex<CallLogInner>>);

impl CallLog {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(CallLogInner::open(
            file_path.as_ref(),
        )?))))
    }

    /// A log that keeps records in memory only.
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(CallLogInner {
            entries: VecDeque::new(),
            file_path: None,
            writer: None,
        })))
    }

    pub fn log(&self, entry: CallRecord) {
        if let Ok(mut inner) = self.0.lock() {
            inner.push(entry);
        }
    }

    pub fn record(
        &self,
        account_name: &str,
        model: &str,
        status: CallStatus,
        duration_ms: u64,
    ) {
        self.log(CallRecord::new(account_name, model, status, duration_ms));
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<CallRecord> {
        self.0
            .lock()
            .map(|inner| inner.entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut inner) => {
                inner.entries.clear();
                inner.compact()
            }
            Err(_) => Ok(()),
        }
    }

    pub fn compact(&self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut inner) => inner.compact(),
            Err(_) => Ok(()),
        }
    }
}
