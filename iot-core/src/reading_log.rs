//! Per-device reading records. The meter keeps one CSV file per reporting sensor.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::logger::{FileLog, LogSink};

/// Destination for received readings.
pub trait ReadingLog: Send + Sync {
    /// Record one report from `device`, stamped with `at`.
    fn record(&self, device: &str, at: &str, water: &str, power: &str) -> io::Result<()>;
    /// Persist everything recorded so far.
    fn flush(&self) -> io::Result<()>;
    /// Persist and drop whatever is held for `device`.
    fn release(&self, device: &str) -> io::Result<()>;
}

/// Writes `<dir>/<device>.csv` with lines `timestamp,water,power`.
/// Files are opened on first record.
pub struct CsvReadingLog {
    dir: PathBuf,
    logs: Mutex<HashMap<String, FileLog>>,
}

impl CsvReadingLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, device: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", sanitize(device)))
    }

    /// File stems with an open log. Names that sanitize alike share one file.
    pub fn devices(&self) -> Vec<String> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.keys().cloned().collect()
    }
}

impl ReadingLog for CsvReadingLog {
    fn record(&self, device: &str, at: &str, water: &str, power: &str) -> io::Result<()> {
        let key = sanitize(device);
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        if !logs.contains_key(&key) {
            let log = FileLog::open(self.dir.join(format!("{key}.csv")))?;
            logs.insert(key.clone(), log);
        }
        if let Some(log) = logs.get(&key) {
            log.log(&format!("{at},{water},{power}"));
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut first_err = None;
        for log in logs.values() {
            if let Err(e) = log.write() {
                tracing::warn!(
                    path = %log.path().display(),
                    error = %e,
                    "failed to write reading log"
                );
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn release(&self, device: &str) -> io::Result<()> {
        let removed = self
            .logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sanitize(device));
        match removed {
            Some(log) => log.write(),
            None => Ok(()),
        }
    }
}

/// Device names come off the wire; keep them from escaping the log directory.
fn sanitize(device: &str) -> String {
    let cleaned: String = device
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_owned()
    } else {
        cleaned
    }
}
