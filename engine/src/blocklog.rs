//! Bounded ring of recent query dispositions, persistable across runs.

use crate::rules::Disposition;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_CAPACITY: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLogEntry {
    pub name: String,
    pub disposition: Disposition,
    pub timestamp_ms: u64,
}

/// Fixed-capacity ring; appending to a full log drops the oldest entry.
pub struct BlockLog {
    entries: VecDeque<BlockLogEntry>,
    capacity: usize,
}

impl BlockLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, name: &str, disposition: Disposition) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(BlockLogEntry {
            name: name.to_string(),
            disposition,
            timestamp_ms: unix_millis(),
        });
    }

    pub fn snapshot(&self) -> Vec<BlockLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the ring to `path` as JSON, via a temp file and rename so a
    /// crash mid-write never corrupts the previous log.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec(&self.snapshot())?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)
    }

    /// Load a previously persisted log. A missing file yields an empty log.
    pub fn load(path: &Path, capacity: usize) -> std::io::Result<Self> {
        let mut log = Self::new(capacity);
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(e) => return Err(e),
        };
        let entries: Vec<BlockLogEntry> = serde_json::from_slice(&data)?;
        for entry in entries.into_iter().rev().take(capacity).rev() {
            log.entries.push_back(entry);
        }
        Ok(log)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
