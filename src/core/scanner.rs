//! Error signature scanning.
//!
//! Patterns come from a plain text file, one per line. Blank lines and lines
//! starting with `#` are ignored. Each line is compiled as a regular
//! expression; a line that is not a valid expression matches literally.
//!
//! The file must exist when the scanner is created, but it is only read and
//! compiled the first time a line is checked.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

/// Scanner construction errors
#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("Error pattern file does not exist: {0}")]
    PatternFileNotFound(PathBuf),
}

/// Answers whether a line matches a known failure signature
#[derive(Debug)]
pub struct ErrorSignatureScanner {
    /// Pattern file; `None` means nothing ever matches
    source: Option<PathBuf>,

    patterns: OnceLock<Vec<Regex>>,
}

impl ErrorSignatureScanner {
    /// Create a scanner backed by a pattern file.
    ///
    /// Fails immediately if `path` is given but does not exist.
    pub fn new(path: Option<&Path>) -> Result<Self, ScannerError> {
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ScannerError::PatternFileNotFound(path.to_path_buf()));
            }
        }

        Ok(Self {
            source: path.map(Path::to_path_buf),
            patterns: OnceLock::new(),
        })
    }

    /// A scanner that never reports a match
    pub fn disabled() -> Self {
        Self {
            source: None,
            patterns: OnceLock::new(),
        }
    }

    /// Check a single line against the known signatures
    pub fn is_error(&self, line: &str) -> bool {
        self.patterns().iter().any(|p| p.is_match(line))
    }

    /// Whether the patterns have been loaded yet
    pub fn is_loaded(&self) -> bool {
        self.patterns.get().is_some()
    }

    fn patterns(&self) -> &[Regex] {
        self.patterns.get_or_init(|| match self.source {
            Some(ref path) => load_patterns(path),
            None => Vec::new(),
        })
    }
}

fn load_patterns(path: &Path) -> Vec<Regex> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read error patterns, scanning disabled");
            return Vec::new();
        }
    };

    let patterns = parse_patterns(&content);
    debug!(path = %path.display(), count = patterns.len(), "Loaded error patterns");
    patterns
}

fn parse_patterns(content: &str) -> Vec<Regex> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            Regex::new(line)
                .or_else(|_| Regex::new(&regex::escape(line)))
                .ok()
        })
        .collect()
}
