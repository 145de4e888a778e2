//! Log artifacts collected during a run.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// A log file produced by a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    /// Human-readable description, e.g. "Test run transcript"
    pub description: String,

    pub path: PathBuf,
}

impl LogFile {
    pub fn new(description: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            description: description.into(),
            path: path.into(),
        }
    }
}

/// Ordered, append-only set of logs shared between the orchestrator and a strategy.
///
/// Insertion order is preserved; the classifier relies on it when it asks the
/// knowledge base about each log in turn.
#[derive(Debug, Clone, Default)]
pub struct RunLogs {
    inner: Arc<Mutex<Vec<LogFile>>>,
}

impl RunLogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a log. Registering the same path twice is a no-op.
    pub fn register(&self, log: LogFile) {
        let mut logs = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !logs.iter().any(|l| l.path == log.path) {
            logs.push(log);
        }
    }

    /// Copy of the current logs in registration order
    pub fn snapshot(&self) -> Vec<LogFile> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
