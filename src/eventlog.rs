use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One applied (or attempted) action on a path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub timestamp: String,
    pub path: String,
    pub action: String,
}

impl Event {
    pub fn new(path: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            path: path.into(),
            action: action.into(),
        }
    }
}

/// Append-only JSONL stream of sync events. A disabled log swallows writes,
/// so callers never branch.
pub struct EventLog {
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl EventLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("open event log")?;
        Ok(Self {
            file: Some(Mutex::new(f)),
            path: Some(path.as_ref().to_path_buf()),
        })
    }

    pub fn disabled() -> Self {
        Self {
            file: None,
            path: None,
        }
    }

    /// Write one event. Failures are reported but callers treat the event
    /// stream as best-effort (an unloggable event never halts the queue).
    pub fn write(&self, event: Event) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let Ok(mut f) = file.lock() else {
            return Ok(());
        };
        let mut writer = BufWriter::new(&mut *f);
        serde_json::to_writer(&mut writer, &event).context("encode event")?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<Event>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).context("open event log for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}
