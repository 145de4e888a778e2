//! Core orchestration logic.
//!
//! This module contains:
//! - Cancellation: launch watchdog composed with external cancellation
//! - Classifier: execution outcome to exit code
//! - Scanner: known error signatures
//! - Stream: live output interpretation
//! - Orchestrator: Main execution engine

pub mod cancellation;
pub mod classifier;
pub mod orchestrator;
pub mod scanner;
pub mod severity;
pub mod stream;

// Re-export commonly used types
pub use cancellation::{ComposedCancellation, RunBudget, RunStartedFlag};
pub use classifier::{Classification, ResultClassifier, CHECK_LOGS_HINT};
pub use orchestrator::{
    target_warnings, ExecutionStrategy, OrchestratorError, RunOrchestrator, RunReport, RunRequest,
};
pub use scanner::{ErrorSignatureScanner, ScannerError};
pub use severity::Severity;
pub use stream::{
    CompletionSignal, CompletionState, LineKind, LineStreamProcessor, StreamError, Transcript,
    EXIT_SENTINEL,
};
