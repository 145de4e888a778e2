//! Live output interpretation.
//!
//! A [`LineStreamProcessor`] consumes the output of a running test process one
//! line at a time. Each line is unwrapped from its console envelope if it has
//! one, checked for an embedded result artifact, logged at a severity derived
//! from its content, appended to the run transcript and scanned for known
//! error signatures. A line starting with [`EXIT_SENTINEL`] completes the
//! stream.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::scanner::ErrorSignatureScanner;
use super::severity::Severity;

/// Prefix of the line that ends a test run, optionally followed by an exit code
pub const EXIT_SENTINEL: &str = "RUN EXIT ";

/// Errors raised while processing a line
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Invalid base64 in embedded result: {0}")]
    InvalidResultPayload(#[from] base64::DecodeError),

    #[error("Failed to write result file {path}: {source}")]
    ResultWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write transcript: {0}")]
    Transcript(#[source] io::Error),
}

/// Console envelope wrapping a line, e.g. `{"method":"console.log","payload":"..."}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

/// How a line was interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// Carried an embedded result artifact
    ResultArtifact { expected_len: usize, actual_len: usize },

    /// `[PASS]` or `[SKIP]` test marker
    Passed,

    /// `[FAIL]` test marker
    Failed,

    /// Any other line, logged at the given severity
    Console(Severity),
}

/// State of the end-of-run signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Received {
        /// Exit code printed after the sentinel, if it parsed
        exit_code: Option<i32>,
    },
}

/// Single-assignment end-of-run signal.
///
/// Setting it more than once is allowed and only the first value sticks.
/// Any number of observers can wait on it.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    tx: Arc<watch::Sender<CompletionState>>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CompletionState::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Set the signal. Returns `true` if this call was the one that set it.
    pub fn complete(&self, exit_code: Option<i32>) -> bool {
        self.tx.send_if_modified(|state| match state {
            CompletionState::Pending => {
                *state = CompletionState::Received { exit_code };
                true
            }
            CompletionState::Received { .. } => false,
        })
    }

    pub fn state(&self) -> CompletionState {
        *self.tx.borrow()
    }

    pub fn is_complete(&self) -> bool {
        self.state() != CompletionState::Pending
    }

    /// Wait until the signal is set and return the reported exit code
    pub async fn wait(&self) -> Option<i32> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| *state != CompletionState::Pending)
            .await
            .map(|state| *state);

        match state {
            Ok(CompletionState::Received { exit_code }) => exit_code,
            // The sender lives in self, so the channel cannot close here
            _ => None,
        }
    }
}

/// Append-only run transcript, flushed after every line.
///
/// May be closed while lines are still arriving; later writes are dropped.
#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Transcript {
    /// Create (or truncate) the transcript file
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn is_writable(&self) -> bool {
        self.file
            .lock()
            .map(|f| f.is_some())
            .unwrap_or(false)
    }

    /// Append one line. Returns `false` if the transcript was already closed.
    pub fn append(&self, line: &str) -> io::Result<bool> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(file) => {
                writeln!(file, "{}", line)?;
                file.flush()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close the file. Further appends are skipped.
    pub fn close(&self) {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut file) = guard.take() {
            if let Err(e) = file.flush() {
                warn!(path = %self.path.display(), error = %e, "Failed to flush transcript");
            }
        }
    }
}

fn result_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"^STARTRESULTXML (\d+) (\S+) ENDRESULTXML$").expect("result marker regex is valid")
    })
}

/// Split a raw line into its content and console method.
///
/// Lines that look like JSON objects are parsed as envelopes; anything that
/// fails to parse is kept as plain text.
pub fn unwrap_envelope(raw: &str) -> (String, Option<String>) {
    if !raw.starts_with('{') {
        return (raw.to_string(), None);
    }

    match serde_json::from_str::<Envelope>(raw) {
        Ok(envelope) => {
            let content = envelope.payload.unwrap_or_else(|| raw.to_string());
            (content, envelope.method)
        }
        Err(e) => {
            debug!(error = %e, "Line is not a console envelope, treating as text");
            (raw.to_string(), None)
        }
    }
}

/// Interprets the live output of one test run
pub struct LineStreamProcessor {
    result_path: PathBuf,
    transcript: Arc<Transcript>,
    scanner: Arc<ErrorSignatureScanner>,
    completion: CompletionSignal,
    matched_error_line: OnceLock<String>,
}

impl LineStreamProcessor {
    pub fn new(
        result_path: impl Into<PathBuf>,
        transcript: Arc<Transcript>,
        scanner: Arc<ErrorSignatureScanner>,
    ) -> Self {
        Self {
            result_path: result_path.into(),
            transcript,
            scanner,
            completion: CompletionSignal::new(),
            matched_error_line: OnceLock::new(),
        }
    }

    /// Where embedded results are written
    pub fn result_path(&self) -> &Path {
        &self.result_path
    }

    pub fn transcript(&self) -> &Arc<Transcript> {
        &self.transcript
    }

    /// Handle that resolves when the end-of-run sentinel is seen
    pub fn completion(&self) -> CompletionSignal {
        self.completion.clone()
    }

    /// First line that matched a known error signature
    pub fn line_that_matched_error_pattern(&self) -> Option<&str> {
        self.matched_error_line.get().map(String::as_str)
    }

    /// Process one line of output.
    ///
    /// Once the run has signalled completion, failures are logged and dropped
    /// because the results are already final.
    pub fn consume(&self, line: &str) -> Result<Option<LineKind>, StreamError> {
        match self.process_line(line) {
            Ok(kind) => Ok(Some(kind)),
            Err(e) if self.completion.is_complete() => {
                warn!(error = %e, "Error processing output after the run completed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Report a failure seen outside the line stream, e.g. a dropped connection
    pub fn report_external_error(&self, message: &str) {
        error!("{}", message);
        self.scan_for_error(message);
    }

    fn process_line(&self, raw: &str) -> Result<LineKind, StreamError> {
        let (content, method) = unwrap_envelope(raw);
        let line = content.trim_end();

        let kind = if let Some(captures) = result_marker().captures(line) {
            self.write_result_artifact(&captures[1], &captures[2])?
        } else {
            let kind = self.log_line(line, method.as_deref());
            if self.transcript.is_writable() {
                self.transcript
                    .append(line)
                    .map_err(StreamError::Transcript)?;
            }
            kind
        };

        if let Some(rest) = line.strip_prefix(EXIT_SENTINEL) {
            let exit_code = rest.trim().parse::<i32>().ok();
            if self.completion.complete(exit_code) {
                info!(?exit_code, "Test run signalled completion");
            } else {
                debug!("Duplicate completion signal ignored");
            }
        }

        Ok(kind)
    }

    fn log_line(&self, line: &str, method: Option<&str>) -> LineKind {
        if line.starts_with("[PASS]") || line.starts_with("[SKIP]") {
            debug!("{}", line);
            LineKind::Passed
        } else if line.starts_with("[FAIL]") {
            error!("{}", line);
            LineKind::Failed
        } else {
            self.scan_for_error(line);
            let severity = Severity::from_console_method(method);
            severity.emit(line);
            LineKind::Console(severity)
        }
    }

    fn write_result_artifact(
        &self,
        expected_len: &str,
        payload: &str,
    ) -> Result<LineKind, StreamError> {
        let bytes = BASE64_STANDARD.decode(payload)?;

        std::fs::write(&self.result_path, &bytes).map_err(|source| StreamError::ResultWrite {
            path: self.result_path.clone(),
            source,
        })?;

        // The regex only captures digits; an overflowing length can never match
        let expected_len = expected_len.parse::<usize>().unwrap_or(usize::MAX);
        if bytes.len() == expected_len {
            info!(
                path = %self.result_path.display(),
                bytes = bytes.len(),
                "Received test results, length matches"
            );
        } else {
            warn!(
                path = %self.result_path.display(),
                expected = expected_len,
                actual = bytes.len(),
                "Received test results, length mismatch"
            );
        }

        Ok(LineKind::ResultArtifact {
            expected_len,
            actual_len: bytes.len(),
        })
    }

    fn scan_for_error(&self, line: &str) {
        if self.matched_error_line.get().is_some() {
            return;
        }
        if self.scanner.is_error(line) && self.matched_error_line.set(line.to_string()).is_ok() {
            debug!(line, "Line matched a known error pattern");
        }
    }
}
