//! Log sinks: the "accepts a log line" capability, the concurrent sink set,
//! and buffered or file-backed sinks.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::timestamp;

/// Anything that accepts human-readable diagnostic lines.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str);
}

/// Set of shared sinks. Emission snapshots the set first, so sinks can be
/// added or removed while another task is logging.
#[derive(Default)]
pub struct LogSinks {
    sinks: RwLock<Vec<Arc<dyn LogSink>>>,
}

impl LogSinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the given sinks.
    pub fn with(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self {
            sinks: RwLock::new(sinks),
        }
    }

    /// Add a sink. Adding the same `Arc` twice is a no-op.
    pub fn add(&self, sink: Arc<dyn LogSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        if !sinks.iter().any(|s| Arc::ptr_eq(s, &sink)) {
            sinks.push(sink);
        }
    }

    /// Remove a sink by identity. Returns whether it was present.
    pub fn remove(&self, sink: &Arc<dyn LogSink>) -> bool {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        sinks.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn LogSink>> {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write one line to every sink registered right now.
    pub fn emit(&self, message: &str) {
        for sink in self.snapshot() {
            sink.log(message);
        }
    }
}

/// Default initial buffer capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 50;

struct Buffer {
    text: String,
    timestamps: bool,
}

/// Growable in-memory log. Each line is newline-terminated, optionally
/// prefixed with `[timestamp] `.
pub struct BufferedLog {
    inner: Mutex<Buffer>,
}

impl BufferedLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Buffer {
                text: String::with_capacity(capacity),
                timestamps: false,
            }),
        }
    }

    /// Buffered log that stamps every line.
    pub fn timestamped() -> Self {
        let log = Self::new();
        log.set_timestamps(true);
        log
    }

    pub fn set_timestamps(&self, enabled: bool) {
        self.lock().timestamps = enabled;
    }

    /// Drain and return the buffered text.
    pub fn flush(&self) -> String {
        std::mem::take(&mut self.lock().text)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().text.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BufferedLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for BufferedLog {
    fn log(&self, message: &str) {
        let mut buf = self.lock();
        if buf.timestamps {
            let stamp = timestamp::now();
            buf.text.push('[');
            buf.text.push_str(&stamp);
            buf.text.push_str("] ");
        }
        buf.text.push_str(message);
        buf.text.push('\n');
    }
}

/// A `BufferedLog` whose contents are appended to a file on `write()`.
pub struct FileLog {
    buffer: BufferedLog,
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLog {
    /// Open `path` in append mode, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            buffer: BufferedLog::new(),
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the buffered lines into the file.
    pub fn write(&self) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let text = self.buffer.flush();
        if text.is_empty() {
            return Ok(());
        }
        file.write_all(text.as_bytes())?;
        file.flush()
    }
}

impl LogSink for FileLog {
    fn log(&self, message: &str) {
        self.buffer.log(message);
    }
}

/// Forwards every line to `tracing` at info level.
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::info!(sink = %self.label, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_past_initial_capacity() {
        let log = BufferedLog::with_capacity(5);
        log.log("The quick brown fox jumps over the lazy dog.");
        assert_eq!(log.flush(), "The quick brown fox jumps over the lazy dog.\n");
        assert!(log.is_empty());
    }

    #[test]
    fn timestamp_prefix() {
        let log = BufferedLog::timestamped();
        log.log("Sent ping");
        let text = log.flush();
        assert!(text.starts_with('['));
        assert!(text.ends_with("] Sent ping\n"));
    }

    #[test]
    fn sink_set_add_remove_by_identity() {
        let sinks = LogSinks::new();
        let a: Arc<dyn LogSink> = Arc::new(BufferedLog::new());
        let b = Arc::new(BufferedLog::new());
        let b_dyn: Arc<dyn LogSink> = b.clone();
        sinks.add(a.clone());
        sinks.add(a.clone());
        sinks.add(b_dyn.clone());
        assert_eq!(sinks.len(), 2);

        sinks.emit("hello");
        assert_eq!(b.flush(), "hello\n");

        assert!(sinks.remove(&b_dyn));
        assert!(!sinks.remove(&b_dyn));
        sinks.emit("again");
        assert!(b.is_empty());
        assert_eq!(sinks.len(), 1);
    }

    #[test]
    fn file_log_appends_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A1.csv");
        let log = FileLog::open(&path).unwrap();
        log.log("t1,1,2");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        log.write().unwrap();
        log.log("t2,3,4");
        log.write().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "t1,1,2\nt2,3,4\n");

        let reopened = FileLog::open(&path).unwrap();
        reopened.log("t3,5,6");
        reopened.write().unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "t1,1,2\nt2,3,4\nt3,5,6\n"
        );
    }
}
