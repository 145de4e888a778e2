//! Domain types for apprunner.
//!
//! This module contains the core data structures:
//! - Outcome: what a run reported and the exit code it maps to
//! - Target: where and how the test application runs
//! - Logs: log artifacts collected during a run

pub mod logs;
pub mod outcome;
pub mod target;

// Re-export commonly used types
pub use logs::{LogFile, RunLogs};
pub use outcome::{ExecutionOutcome, ExitCode, KnownIssue, ResultKind};
pub use target::{
    AppBundle, CommunicationChannel, Platform, ResultFormat, TargetClass, TargetKind,
    TargetParseError, TestTarget,
};
