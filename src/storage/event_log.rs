use crate::common::{DevMode, GateError, Result};
use crate::storage::VerificationSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VerificationEvent {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only JSON Lines log of successful verifications.
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path, write_lock: Mutex::new(()) })
    }

    pub fn new_with_dev_mode(dev_mode: &DevMode) -> Result<Self> {
        Self::new(dev_mode.events_file())
    }

    pub fn read_all(&self) -> Result<Vec<VerificationEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.path)?;
        let mut events = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping malformed event on line {}: {}", number + 1, e),
            }
        }
        Ok(events)
    }
}

impl VerificationSink for EventLog {
    fn record_verification(&self, user_id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let event = VerificationEvent { user_id: user_id.to_string(), timestamp };
        let mut line = serde_json::to_string(&event)
            .map_err(|e| GateError::Storage(format!("Failed to encode event: {}", e)))?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}
