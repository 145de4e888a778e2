//! Interfaces to external collaborators.
//!
//! The orchestrator never talks to devices, simulators or the host directly.
//! It consumes these traits:
//! - `HostRunner`: run the app natively on this machine
//! - `DeviceRunner`: run the app on a resolved device or simulator
//! - `DeviceFinder`: resolve the device (and companion) for a target
//! - `KnownIssueSource`: knowledge base of previously catalogued failures

pub mod known_issues;
pub mod launcher;
pub mod process;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::RunBudget;
use crate::domain::{
    AppBundle, CommunicationChannel, ExecutionOutcome, KnownIssue, LogFile, ResultFormat,
    RunLogs, TestTarget,
};

// Re-export the concrete implementations
pub use known_issues::{FileKnowledgeBase, NoKnownIssues};
pub use launcher::{LauncherDeviceRunner, StaticDeviceFinder};
pub use process::ProcessRunner;

/// A device or simulator the app can run on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,

    /// Stable identifier (UDID) if known
    pub udid: Option<String>,
}

impl DeviceInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            udid: None,
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.udid {
            Some(ref udid) => write!(f, "{} ({})", self.name, udid),
            None => f.write_str(&self.name),
        }
    }
}

/// Devices resolved for a device/simulator run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandles {
    pub device: DeviceInfo,

    /// Paired companion (e.g. the phone a watch is paired with)
    pub companion: Option<DeviceInfo>,
}

/// Device lookup failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceLookupError {
    #[error("No device found for target {0}")]
    NotFound(String),

    #[error("No companion device found for {0}")]
    CompanionNotFound(String),
}

/// Everything a strategy needs to run the app once
#[derive(Debug, Clone)]
pub struct StrategyRequest {
    pub app: AppBundle,

    /// Remaining budget; the launch part already has setup time deducted
    pub budget: RunBudget,

    pub channel: CommunicationChannel,
    pub result_format: ResultFormat,

    /// Test filters (skipped tests or categories)
    pub filters: Vec<String>,

    pub environment: Vec<(String, String)>,

    /// Arguments passed verbatim to the app
    pub passthrough_args: Vec<String>,

    /// Ask the app to print an end-of-run signal
    pub signal_end: bool,

    /// Composed launch/external cancellation
    pub cancellation: CancellationToken,

    /// Where logs produced by the run get registered
    pub logs: RunLogs,

    /// Directory for transcripts and result files
    pub output_dir: PathBuf,
}

/// Runs the app natively on the host
#[async_trait]
pub trait HostRunner: Send + Sync {
    /// Human-readable runner name
    fn name(&self) -> &str;

    /// Run the app once and report what happened
    async fn run(&self, request: &StrategyRequest) -> ExecutionOutcome;
}

/// Runs the app on a device or simulator
#[async_trait]
pub trait DeviceRunner: Send + Sync {
    /// Human-readable runner name
    fn name(&self) -> &str;

    /// Run the app once on the given devices and report what happened
    async fn run(&self, devices: &DeviceHandles, request: &StrategyRequest) -> ExecutionOutcome;
}

/// Resolves devices for a target
#[async_trait]
pub trait DeviceFinder: Send + Sync {
    async fn find(
        &self,
        target: &TestTarget,
        device_name: Option<&str>,
        include_wireless: bool,
    ) -> Result<DeviceHandles, DeviceLookupError>;
}

/// Knowledge base of known failure signatures
pub trait KnownIssueSource: Send + Sync {
    /// Return the known issue this log shows, if any
    fn is_known_issue(&self, log: &LogFile) -> Option<KnownIssue>;
}
