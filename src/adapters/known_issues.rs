//! File-backed known issue knowledge base.
//!
//! The database is a YAML list:
//!
//! ```yaml
//! - pattern: "Failed to launch .* because the device was locked"
//!   message: "The device is locked. Unlock it and retry."
//!   exit_code: 85
//! - pattern: "LocalNetworkPermission"
//!   message: "The app was denied local network access."
//! ```
//!
//! A log matches when its content matches any pattern. Entries are tried in
//! file order and the first match wins.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use super::KnownIssueSource;
use crate::domain::{ExitCode, KnownIssue, LogFile};

/// Raw entry as written in the YAML file
#[derive(Debug, Clone, Deserialize)]
struct KnownIssueEntry {
    pattern: String,
    message: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Debug)]
struct CompiledIssue {
    pattern: Regex,
    issue: KnownIssue,
}

/// Knowledge base loaded from a YAML file
#[derive(Debug)]
pub struct FileKnowledgeBase {
    issues: Vec<CompiledIssue>,
}

impl FileKnowledgeBase {
    /// Load the database from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read known issues file: {}", path.display()))?;

        let kb = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse known issues file: {}", path.display()))?;
        debug!(path = %path.display(), issues = kb.issues.len(), "Loaded known issues");
        Ok(kb)
    }

    /// Parse the database from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let entries: Vec<KnownIssueEntry> = serde_yaml::from_str(yaml)?;

        let issues = entries
            .into_iter()
            .map(|entry| {
                let pattern = Regex::new(&entry.pattern)
                    .with_context(|| format!("Invalid known issue pattern '{}'", entry.pattern))?;
                let mut issue = KnownIssue::new(entry.message);
                if let Some(code) = entry.exit_code {
                    if !(0..=255).contains(&code) {
                        anyhow::bail!(
                            "Exit code {} for known issue '{}' is outside 0..=255",
                            code,
                            entry.pattern
                        );
                    }
                    issue = issue.with_exit_code(ExitCode::from_code(code));
                }
                Ok(CompiledIssue { pattern, issue })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { issues })
    }

    fn match_content(&self, content: &str) -> Option<KnownIssue> {
        self.issues
            .iter()
            .find(|c| c.pattern.is_match(content))
            .map(|c| c.issue.clone())
    }
}

impl KnownIssueSource for FileKnowledgeBase {
    fn is_known_issue(&self, log: &LogFile) -> Option<KnownIssue> {
        let bytes = match std::fs::read(&log.path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(log = %log.path.display(), error = %e, "Could not read log for known issue lookup");
                return None;
            }
        };

        let content = String::from_utf8_lossy(&bytes);
        let found = self.match_content(&content);
        if found.is_some() {
            debug!(log = %log.description, "Log matches a known issue");
        }
        found
    }
}

/// Knowledge base that knows nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKnownIssues;

impl KnownIssueSource for NoKnownIssues {
    fn is_known_issue(&self, _log: &LogFile) -> Option<KnownIssue> {
        None
    }
}
