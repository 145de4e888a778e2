//! Main orchestrator for test application runs.
//!
//! Composes the launch/total cancellation, picks an execution strategy for
//! the target, hands it the remaining time budget and classifies what it
//! reports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    DeviceFinder, DeviceHandles, DeviceLookupError, DeviceRunner, HostRunner, StrategyRequest,
};
use crate::domain::{
    AppBundle, CommunicationChannel, ExecutionOutcome, ExitCode, Platform, ResultFormat,
    RunLogs, TargetClass, TargetKind, TestTarget,
};

use super::cancellation::{ComposedCancellation, RunBudget};
use super::classifier::{Classification, ResultClassifier};

/// First OS version that asks the user for local network access
const LOCAL_NETWORK_PROMPT_MIN_VERSION: u32 = 14;

/// Errors that stop a run before the app is started
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    DeviceNotFound(#[from] DeviceLookupError),

    #[error("Failed to create output directory {path}: {source}")]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    /// Exit code the process should report for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            OrchestratorError::DeviceNotFound(_) => ExitCode::DeviceNotFound,
            OrchestratorError::OutputDirectory { .. } => ExitCode::GeneralFailure,
        }
    }
}

/// Parameters of one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub app: AppBundle,
    pub target: TestTarget,

    /// Bound on the whole run
    pub timeout: Duration,

    /// Bound on the time until the app is started
    pub launch_timeout: Duration,

    pub channel: CommunicationChannel,
    pub result_format: ResultFormat,
    pub filters: Vec<String>,

    /// Device name to run on (device/simulator targets)
    pub device_name: Option<String>,

    /// Consider devices connected over Wi-Fi
    pub include_wireless: bool,

    pub environment: Vec<(String, String)>,
    pub passthrough_args: Vec<String>,
    pub signal_end: bool,

    /// Root directory for run output; each run gets a subdirectory
    pub output_root: PathBuf,
}

impl RunRequest {
    pub fn new(app: AppBundle, target: TestTarget, output_root: impl Into<PathBuf>) -> Self {
        Self {
            app,
            target,
            timeout: Duration::from_secs(15 * 60),
            launch_timeout: Duration::from_secs(5 * 60),
            channel: CommunicationChannel::default(),
            result_format: ResultFormat::default(),
            filters: Vec::new(),
            device_name: None,
            include_wireless: false,
            environment: Vec::new(),
            passthrough_args: Vec::new(),
            signal_end: false,
            output_root: output_root.into(),
        }
    }

    pub fn with_timeouts(mut self, timeout: Duration, launch_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.launch_timeout = launch_timeout;
        self
    }

    pub fn budget(&self) -> RunBudget {
        RunBudget::new(self.timeout, self.launch_timeout)
    }
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    pub classification: Classification,
    pub output_dir: PathBuf,
    pub duration: Duration,
}

impl RunReport {
    pub fn exit_code(&self) -> ExitCode {
        self.classification.exit_code
    }
}

/// How the app gets run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Natively on this machine
    HostNative,

    /// On a resolved device or simulator
    Device(DeviceHandles),
}

/// Main test run orchestrator
pub struct RunOrchestrator {
    host_runner: Arc<dyn HostRunner>,
    device_runner: Arc<dyn DeviceRunner>,
    device_finder: Arc<dyn DeviceFinder>,
    classifier: ResultClassifier,
}

impl RunOrchestrator {
    pub fn new(
        host_runner: Arc<dyn HostRunner>,
        device_runner: Arc<dyn DeviceRunner>,
        device_finder: Arc<dyn DeviceFinder>,
        classifier: ResultClassifier,
    ) -> Self {
        Self {
            host_runner,
            device_runner,
            device_finder,
            classifier,
        }
    }

    /// Run the app once and return the process exit code
    pub async fn orchestrate(
        &self,
        request: &RunRequest,
        cancellation: &CancellationToken,
    ) -> Result<ExitCode, OrchestratorError> {
        Ok(self.run(request, cancellation).await?.exit_code())
    }

    /// Run the app once and return the full report
    #[instrument(skip(self, request, cancellation), fields(test_target = %request.target, app = %request.app.bundle_identifier))]
    pub async fn run(
        &self,
        request: &RunRequest,
        cancellation: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let started_at = Instant::now();
        let run_id = Uuid::new_v4();
        let started_wall = Utc::now();
        info!(%run_id, started_at = %started_wall.to_rfc3339(), "Starting test run");

        let composed = ComposedCancellation::compose(request.budget(), cancellation);

        warn_about_target(request);

        let output_dir = request.output_root.join(run_id.to_string());
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|source| OrchestratorError::OutputDirectory {
                path: output_dir.clone(),
                source,
            })?;

        // Device lookup is setup time: it erodes the launch budget below
        let strategy = self.select_strategy(request).await?;

        // Must happen before any blocking call into the strategy
        composed.mark_started();

        let elapsed = started_at.elapsed();
        let budget = request.budget().after_setup(elapsed);
        debug!(
            setup_ms = elapsed.as_millis() as u64,
            launch_budget_ms = budget.launch_timeout.as_millis() as u64,
            "Setup finished"
        );

        let logs = RunLogs::new();
        let strategy_request = StrategyRequest {
            app: request.app.clone(),
            budget,
            channel: request.channel,
            result_format: request.result_format,
            filters: request.filters.clone(),
            environment: request.environment.clone(),
            passthrough_args: request.passthrough_args.clone(),
            signal_end: request.signal_end,
            cancellation: composed.token().clone(),
            logs: logs.clone(),
            output_dir: output_dir.clone(),
        };

        let outcome = match strategy {
            ExecutionStrategy::HostNative => {
                info!(runner = self.host_runner.name(), "Running on host");
                self.host_runner.run(&strategy_request).await
            }
            ExecutionStrategy::Device(ref devices) => {
                info!(
                    runner = self.device_runner.name(),
                    device = %devices.device,
                    "Running on device"
                );
                self.device_runner.run(devices, &strategy_request).await
            }
        };

        let classification = self.classifier.classify(&outcome, &logs.snapshot());
        let duration = started_at.elapsed();
        info!(
            %run_id,
            exit_code = classification.exit_code.code(),
            duration_ms = duration.as_millis() as u64,
            "Test run finished"
        );

        Ok(RunReport {
            run_id,
            started_at: started_wall,
            outcome,
            classification,
            output_dir,
            duration,
        })
    }

    async fn select_strategy(
        &self,
        request: &RunRequest,
    ) -> Result<ExecutionStrategy, OrchestratorError> {
        match request.target.class() {
            TargetClass::HostNative => Ok(ExecutionStrategy::HostNative),
            TargetClass::DeviceOrSimulator => {
                let devices = self
                    .device_finder
                    .find(
                        &request.target,
                        request.device_name.as_deref(),
                        request.include_wireless,
                    )
                    .await?;
                Ok(ExecutionStrategy::Device(devices))
            }
        }
    }
}

/// Advisory warnings for target/option combinations. Never fatal.
pub fn target_warnings(request: &RunRequest) -> Vec<String> {
    let mut warnings = Vec::new();
    let target = &request.target;

    let prompts_for_network = target.kind == TargetKind::Device
        && matches!(target.platform, Platform::Ios | Platform::TvOs | Platform::XrOs)
        && request.channel == CommunicationChannel::Network
        && target
            .os_major_version()
            .map_or(true, |major| major >= LOCAL_NETWORK_PROMPT_MIN_VERSION);

    if prompts_for_network {
        warnings.push(format!(
            "Running on {} over the network may show a local network permission prompt \
             that must be accepted on the device",
            target
        ));
    }

    if request.signal_end && target.is_virtual() {
        warnings.push(format!(
            "Signalling the end of the run has no effect on {} targets",
            target
        ));
    }

    warnings
}

fn warn_about_target(request: &RunRequest) {
    for warning in target_warnings(request) {
        warn!("{}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str) -> RunRequest {
        RunRequest::new(
            AppBundle::new("/apps/Tests.app", "com.example.tests"),
            target.parse().unwrap(),
            "/tmp/out",
        )
    }

    #[test]
    fn test_network_prompt_warning() {
        let mut req = request("ios-device_17.0");
        req.channel = CommunicationChannel::Network;
        assert_eq!(target_warnings(&req).len(), 1);

        let mut req = request("ios-device_13.4");
        req.channel = CommunicationChannel::Network;
        assert!(target_warnings(&req).is_empty());

        // Unknown version is assumed recent
        let mut req = request("tvos-device");
        req.channel = CommunicationChannel::Network;
        assert_eq!(target_warnings(&req).len(), 1);

        let req = request("ios-device_17.0");
        assert!(target_warnings(&req).is_empty());
    }

    #[test]
    fn test_signal_end_on_simulator_warning() {
        let mut req = request("ios-simulator-64");
        req.signal_end = true;
        let warnings = target_warnings(&req);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("no effect"));

        let mut req = request("ios-device");
        req.signal_end = true;
        assert!(target_warnings(&req).is_empty());
    }

    #[test]
    fn test_error_exit_codes() {
        let err = OrchestratorError::DeviceNotFound(DeviceLookupError::NotFound("ios-device".into()));
        assert_eq!(err.exit_code(), ExitCode::DeviceNotFound);
    }
}
