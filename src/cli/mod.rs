//! Command-line interface for apprunner.
//!
//! Provides commands for running a test application on a target and for
//! inspecting the resolved configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::adapters::{
    FileKnowledgeBase, KnownIssueSource, LauncherDeviceRunner, NoKnownIssues, ProcessRunner,
    StaticDeviceFinder,
};
use crate::config::{self, ResolvedConfig};
use crate::core::{ErrorSignatureScanner, ResultClassifier, RunOrchestrator, RunRequest};
use crate::domain::{AppBundle, CommunicationChannel, ExitCode, ResultFormat, TestTarget};

/// apprunner - Run test applications on devices, simulators and the host
#[derive(Parser, Debug)]
#[command(name = "apprunner")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a test application and report its outcome as the exit code
    Run(RunArgs),

    /// Show resolved configuration (debug)
    Config,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Path to the app bundle or executable
    #[arg(short, long)]
    pub app: PathBuf,

    /// Target, e.g. ios-device, ios-simulator-64_17.2, maccatalyst
    #[arg(short, long)]
    pub target: TestTarget,

    /// Bundle identifier (defaults to the bundle's file stem)
    #[arg(long)]
    pub bundle_id: Option<String>,

    /// Executable name inside the bundle (host-native runs)
    #[arg(long)]
    pub executable: Option<String>,

    /// Total run timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Time allowed until the app starts, in seconds
    #[arg(long)]
    pub launch_timeout: Option<u64>,

    /// How to talk to the running app
    #[arg(long, value_enum, default_value_t = CommunicationChannel::UsbTunnel)]
    pub channel: CommunicationChannel,

    /// Result format the app should produce
    #[arg(long, value_enum, default_value_t = ResultFormat::Xunit)]
    pub format: ResultFormat,

    /// Test filter (repeatable)
    #[arg(long = "filter")]
    pub filters: Vec<String>,

    /// Device name to run on
    #[arg(short, long)]
    pub device: Option<String>,

    /// Also consider devices connected over Wi-Fi
    #[arg(long)]
    pub include_wireless: bool,

    /// Environment variable for the app, as KEY=VALUE (repeatable)
    #[arg(long = "set-env", value_parser = parse_key_val)]
    pub environment: Vec<(String, String)>,

    /// Ask the app to signal the end of the run
    #[arg(long)]
    pub signal_app_end: bool,

    /// Output root (defaults to the configured output directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Error signature pattern file
    #[arg(long, env = "APPRUNNER_ERROR_PATTERNS")]
    pub error_patterns: Option<PathBuf>,

    /// Known issue database
    #[arg(long, env = "APPRUNNER_KNOWN_ISSUES")]
    pub known_issues: Option<PathBuf>,

    /// Arguments passed to the app
    #[arg(last = true)]
    pub passthrough: Vec<String>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        match self.command {
            Commands::Run(args) => run_app(args).await,
            Commands::Config => show_config(),
        }
    }
}

impl RunArgs {
    /// Build the run request, filling gaps from the configuration
    pub fn to_request(&self, config: &ResolvedConfig) -> RunRequest {
        let bundle_id = self.bundle_id.clone().unwrap_or_else(|| {
            self.app
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        });

        let mut app = AppBundle::new(&self.app, bundle_id);
        if let Some(ref exe) = self.executable {
            app = app.with_executable(exe.clone());
        }

        let timeout = self
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(config.timeouts.run);
        let launch_timeout = self
            .launch_timeout
            .map(Duration::from_secs)
            .unwrap_or(config.timeouts.launch);

        let output_root = self.output.clone().unwrap_or_else(|| config.output.clone());

        let mut request = RunRequest::new(app, self.target.clone(), output_root)
            .with_timeouts(timeout, launch_timeout);
        request.channel = self.channel;
        request.result_format = self.format;
        request.filters = self.filters.clone();
        request.device_name = self.device.clone();
        request.include_wireless = self.include_wireless;
        request.environment = self.environment.clone();
        request.passthrough_args = self.passthrough.clone();
        request.signal_end = self.signal_app_end;
        request
    }
}

async fn run_app(args: RunArgs) -> Result<ExitCode> {
    let config = config::load_config()?;

    if !args.app.exists() {
        error!(app = %args.app.display(), "App not found");
        return Ok(ExitCode::InvalidArguments);
    }

    // Configuration problems fail here, before anything is started
    let patterns = args.error_patterns.clone().or_else(|| config.error_patterns.clone());
    let scanner = Arc::new(
        ErrorSignatureScanner::new(patterns.as_deref()).context("Invalid error pattern file")?,
    );

    let knowledge_base: Arc<dyn KnownIssueSource> =
        match args.known_issues.clone().or_else(|| config.known_issues.clone()) {
            Some(path) => Arc::new(FileKnowledgeBase::load(&path)?),
            None => Arc::new(NoKnownIssues),
        };

    let mut finder = StaticDeviceFinder::new();
    if let Some(ref companion) = config.companion_device {
        finder = finder.with_companion(companion.clone());
    }

    let orchestrator = RunOrchestrator::new(
        Arc::new(ProcessRunner::new(scanner.clone())),
        Arc::new(LauncherDeviceRunner::new(config.device_launcher.clone(), scanner)),
        Arc::new(finder),
        ResultClassifier::new(knowledge_base),
    );

    let cancellation = CancellationToken::new();
    tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling the run");
                cancellation.cancel();
            }
        }
    });

    let request = args.to_request(&config);
    match orchestrator.run(&request, &cancellation).await {
        Ok(report) => {
            println!("Run:     {}", report.run_id);
            println!("Started: {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("Duration: {:.1}s", report.duration.as_secs_f64());
            println!("Outcome: {}", report.outcome.kind);
            println!("Output:  {}", report.output_dir.display());
            println!("Exit:    {}", report.exit_code());
            Ok(report.exit_code())
        }
        Err(e) => {
            error!(error = %e, "Run could not start");
            Ok(e.exit_code())
        }
    }
}

fn show_config() -> Result<ExitCode> {
    let config = config::load_config()?;

    println!("Configuration:");
    println!("  Config file:    {}", display_opt(config.config_file.as_ref()));
    println!("  Home:           {}", config.home.display());
    println!("  Output:         {}", config.output.display());
    println!("  Error patterns: {}", display_opt(config.error_patterns.as_ref()));
    println!("  Known issues:   {}", display_opt(config.known_issues.as_ref()));
    println!("  Launcher:       {}", display_opt(config.device_launcher.as_ref()));
    println!(
        "  Companion:      {}",
        config.companion_device.as_deref().unwrap_or("(none)")
    );
    println!("  Run timeout:    {:?}", config.timeouts.run);
    println!("  Launch timeout: {:?}", config.timeouts.launch);

    Ok(ExitCode::Success)
}

fn display_opt(path: Option<&PathBuf>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResolvedConfig {
        ResolvedConfig {
            home: PathBuf::from("/home/u/.apprunner"),
            output: PathBuf::from("/home/u/.apprunner/runs"),
            error_patterns: None,
            known_issues: None,
            device_launcher: None,
            companion_device: None,
            timeouts: config::TimeoutSettings::default(),
            config_file: None,
        }
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_run_args_to_request() {
        let cli = Cli::try_parse_from([
            "apprunner",
            "run",
            "--app",
            "/apps/Tests.app",
            "--target",
            "ios-simulator-64_17.2",
            "--launch-timeout",
            "30",
            "--filter",
            "Slow",
            "--set-env",
            "LANG=C",
            "--",
            "--verbose",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };

        let request = args.to_request(&config());
        assert_eq!(request.app.bundle_identifier, "Tests");
        assert_eq!(request.launch_timeout, Duration::from_secs(30));
        assert_eq!(request.timeout, Duration::from_secs(900));
        assert_eq!(request.filters, vec!["Slow"]);
        assert_eq!(request.environment, vec![("LANG".to_string(), "C".to_string())]);
        assert_eq!(request.passthrough_args, vec!["--verbose"]);
        assert_eq!(request.output_root, PathBuf::from("/home/u/.apprunner/runs"));
    }

    #[test]
    fn test_invalid_target_is_rejected() {
        let result = Cli::try_parse_from([
            "apprunner", "run", "--app", "/apps/Tests.app", "--target", "android-device",
        ]);
        assert!(result.is_err());
    }
}
