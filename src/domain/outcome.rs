//! Execution outcomes and process exit codes.
//!
//! An execution strategy produces exactly one [`ExecutionOutcome`] per run;
//! the classifier turns it into an [`ExitCode`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// What happened to the test application, as reported by a strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Ran to completion, all tests passed
    Succeeded,

    /// Ran to completion, some assertions failed
    Failed,

    /// The application never started producing activity
    LaunchFailure,

    /// The application started and then died
    Crashed,

    /// A deadline elapsed or the run was cancelled
    TimedOut,

    /// Anything the strategy could not map onto the kinds above
    Unexpected(String),
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKind::Succeeded => write!(f, "succeeded"),
            ResultKind::Failed => write!(f, "failed"),
            ResultKind::LaunchFailure => write!(f, "launch failure"),
            ResultKind::Crashed => write!(f, "crashed"),
            ResultKind::TimedOut => write!(f, "timed out"),
            ResultKind::Unexpected(kind) => write!(f, "unexpected ({})", kind),
        }
    }
}

/// Result of one run of the test application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub kind: ResultKind,

    /// Free-form detail; `None` means no detail is available
    pub message: Option<String>,
}

impl ExecutionOutcome {
    /// Create an outcome without a message
    pub fn new(kind: ResultKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Attach a message. Blank messages are normalised to `None`.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.message = if message.trim().is_empty() {
            None
        } else {
            Some(message)
        };
        self
    }

    /// The message, if it carries any detail
    pub fn detail(&self) -> Option<&str> {
        self.message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
    }
}

/// Process-level outcome of an orchestration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitCode {
    Success,
    TestsFailed,
    InvalidArguments,
    TimedOut,
    GeneralFailure,
    DeviceNotFound,
    AppLaunchFailure,

    /// Code suggested by the known-issue knowledge base
    Custom(i32),
}

impl ExitCode {
    /// Numeric process exit code
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::TestsFailed => 1,
            ExitCode::InvalidArguments => 4,
            ExitCode::TimedOut => 70,
            ExitCode::GeneralFailure => 71,
            ExitCode::DeviceNotFound => 81,
            ExitCode::AppLaunchFailure => 83,
            ExitCode::Custom(code) => code,
        }
    }

    /// Map a numeric code back onto a named variant where one exists
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExitCode::Success,
            1 => ExitCode::TestsFailed,
            4 => ExitCode::InvalidArguments,
            70 => ExitCode::TimedOut,
            71 => ExitCode::GeneralFailure,
            81 => ExitCode::DeviceNotFound,
            83 => ExitCode::AppLaunchFailure,
            other => ExitCode::Custom(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Success
    }
}

impl PartialOrd for ExitCode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExitCode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.code().cmp(&other.code())
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Custom(code) => write!(f, "CUSTOM({})", code),
            named => write!(f, "{:?} ({})", named, named.code()),
        }
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        // A failure must never surface as status 0 or be truncated to it
        match code {
            ExitCode::Success => std::process::ExitCode::SUCCESS,
            other => match u8::try_from(other.code()) {
                Ok(status) if status != 0 => std::process::ExitCode::from(status),
                _ => std::process::ExitCode::from(ExitCode::GeneralFailure.code() as u8),
            },
        }
    }
}

/// Entry from the known-issue knowledge base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownIssue {
    pub human_message: String,
    pub suggested_exit_code: Option<ExitCode>,
}

impl KnownIssue {
    pub fn new(human_message: impl Into<String>) -> Self {
        Self {
            human_message: human_message.into(),
            suggested_exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: ExitCode) -> Self {
        self.suggested_exit_code = Some(code);
        self
    }
}
