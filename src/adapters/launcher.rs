//! Device runs through an external launcher tool.
//!
//! apprunner does not speak any device protocol itself. Device and simulator
//! runs shell out to a configured launcher command that installs nothing,
//! starts the app on the named device and relays its output on stdout:
//!
//! ```text
//! <launcher> --device <name> [--udid <udid>] [--companion <name>]
//!            --app <path> --bundle-id <id> --channel <channel>
//!            --format <format> [--filter <f>]... [--signal-end] [-- <args>...]
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use tokio::process::Command;

use super::process::stream_process;
use super::{DeviceFinder, DeviceHandles, DeviceInfo, DeviceLookupError, DeviceRunner, StrategyRequest};
use crate::core::ErrorSignatureScanner;
use crate::domain::{ExecutionOutcome, ResultKind, TestTarget};

const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(10);

/// Runs the app on a device through the launcher command
pub struct LauncherDeviceRunner {
    /// Path to the launcher; `None` when no launcher is configured
    launcher: Option<PathBuf>,
    scanner: Arc<ErrorSignatureScanner>,
    exit_grace: Duration,
}

impl LauncherDeviceRunner {
    pub fn new(launcher: Option<PathBuf>, scanner: Arc<ErrorSignatureScanner>) -> Self {
        Self {
            launcher,
            scanner,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    /// Arguments passed to the launcher for one run
    pub fn launcher_args(devices: &DeviceHandles, request: &StrategyRequest) -> Vec<String> {
        let mut args = vec!["--device".to_string(), devices.device.name.clone()];

        if let Some(ref udid) = devices.device.udid {
            args.extend(["--udid".to_string(), udid.clone()]);
        }
        if let Some(ref companion) = devices.companion {
            args.extend(["--companion".to_string(), companion.name.clone()]);
        }

        args.extend([
            "--app".to_string(),
            request.app.path.display().to_string(),
            "--bundle-id".to_string(),
            request.app.bundle_identifier.clone(),
        ]);

        if let Some(channel) = request.channel.to_possible_value() {
            args.extend(["--channel".to_string(), channel.get_name().to_string()]);
        }
        if let Some(format) = request.result_format.to_possible_value() {
            args.extend(["--format".to_string(), format.get_name().to_string()]);
        }
        for filter in &request.filters {
            args.extend(["--filter".to_string(), filter.clone()]);
        }
        if request.signal_end {
            args.push("--signal-end".to_string());
        }
        if !request.passthrough_args.is_empty() {
            args.push("--".to_string());
            args.extend(request.passthrough_args.iter().cloned());
        }

        args
    }
}

#[async_trait]
impl DeviceRunner for LauncherDeviceRunner {
    fn name(&self) -> &str {
        "launcher"
    }

    async fn run(&self, devices: &DeviceHandles, request: &StrategyRequest) -> ExecutionOutcome {
        let Some(ref launcher) = self.launcher else {
            return ExecutionOutcome::new(ResultKind::LaunchFailure)
                .with_message("No device launcher configured (set device.launcher in config)");
        };

        let mut command = Command::new(launcher);
        command.args(Self::launcher_args(devices, request));

        stream_process(command, request, self.scanner.clone(), self.exit_grace).await
    }
}

/// Resolves the device named on the command line
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceFinder {
    /// Companion to pair with targets that need one
    companion: Option<String>,
}

impl StaticDeviceFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_companion(mut self, companion: impl Into<String>) -> Self {
        self.companion = Some(companion.into());
        self
    }
}

#[async_trait]
impl DeviceFinder for StaticDeviceFinder {
    async fn find(
        &self,
        target: &TestTarget,
        device_name: Option<&str>,
        _include_wireless: bool,
    ) -> Result<DeviceHandles, DeviceLookupError> {
        let name = device_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| DeviceLookupError::NotFound(target.to_string()))?;

        let companion = if target.needs_companion() {
            let companion = self
                .companion
                .as_deref()
                .ok_or_else(|| DeviceLookupError::CompanionNotFound(name.to_string()))?;
            Some(DeviceInfo::named(companion))
        } else {
            None
        };

        Ok(DeviceHandles {
            device: DeviceInfo::named(name),
            companion,
        })
    }
}
