//! apprunner - Test application run orchestrator
//!
//! Runs a test application on a device, simulator or the host, enforces a
//! launch deadline and a total deadline, and turns whatever the app reports
//! into a single process exit code.
//!
//! # Architecture
//!
//! - A launch watchdog and the caller's cancellation are folded into one
//!   token before anything is started
//! - The run is dispatched to a host-native or a device strategy
//! - Live output is interpreted line by line: console envelopes, embedded
//!   result payloads, test markers, error signatures, end-of-run sentinel
//! - The strategy's outcome is classified into an exit code, consulting a
//!   known issue database for launch failures and crashes
//!
//! # Modules
//!
//! - `adapters`: External collaborators (process runner, device launcher, known issues)
//! - `core`: Orchestration logic (cancellation, classifier, stream processor)
//! - `domain`: Data structures (outcomes, targets, logs)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a Mac Catalyst test app
//! apprunner run --app Tests.app --executable Tests --target maccatalyst
//!
//! # Run on a device through the configured launcher
//! apprunner run --app Tests.app --target ios-device --device "My iPhone" --timeout 600
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{LineStreamProcessor, ResultClassifier, RunOrchestrator, RunRequest};
pub use domain::{ExecutionOutcome, ExitCode, ResultKind, TestTarget};
