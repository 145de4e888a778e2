//! Configuration for apprunner.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line flags (applied by the CLI)
//! 2. Environment variables (APPRUNNER_HOME, APPRUNNER_ERROR_PATTERNS, APPRUNNER_KNOWN_ISSUES)
//! 3. Config file (.apprunner/config.yaml)
//! 4. Defaults (~/.apprunner)
//!
//! Config file discovery:
//! - Searches current directory and parents for .apprunner/config.yaml
//! - Paths in config file are relative to the .apprunner/ directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default bound on a whole run (15 minutes)
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 15 * 60;

/// Default bound on the time until the app starts (5 minutes)
pub const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 5 * 60;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub timeouts: Option<TimeoutsConfig>,
    #[serde(default)]
    pub device: Option<DeviceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Root for run output directories
    pub output: Option<String>,
    /// Error signature pattern file
    pub error_patterns: Option<String>,
    /// Known issue database (YAML)
    pub known_issues: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    pub run_seconds: Option<u64>,
    pub launch_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// External command that starts the app on a device
    pub launcher: Option<String>,
    /// Companion device paired with watch targets
    pub companion: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to apprunner home
    pub home: PathBuf,
    /// Root for run output directories
    pub output: PathBuf,
    pub error_patterns: Option<PathBuf>,
    pub known_issues: Option<PathBuf>,
    pub device_launcher: Option<PathBuf>,
    pub companion_device: Option<String>,
    pub timeouts: TimeoutSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub run: Duration,
    pub launch: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            run: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
            launch: Duration::from_secs(DEFAULT_LAUNCH_TIMEOUT_SECS),
        }
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".apprunner").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Load configuration from all sources, discovering the config file from
/// the current directory
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd)
}

/// Load configuration, discovering the config file from `start`
pub fn load_config_from(start: &Path) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".apprunner");
    let home = env_path("APPRUNNER_HOME").unwrap_or(default_home);

    let config_file = find_config_file(start);
    let file = config_file.as_deref().map(load_config_file).transpose()?;

    // Paths in the file are relative to .apprunner/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let paths = file.as_ref().map(|f| &f.paths);
    let resolve = |value: Option<&String>| value.map(|p| resolve_path(base_dir, p));

    let output = resolve(paths.and_then(|p| p.output.as_ref())).unwrap_or_else(|| home.join("runs"));
    let error_patterns = env_path("APPRUNNER_ERROR_PATTERNS")
        .or_else(|| resolve(paths.and_then(|p| p.error_patterns.as_ref())));
    let known_issues = env_path("APPRUNNER_KNOWN_ISSUES")
        .or_else(|| resolve(paths.and_then(|p| p.known_issues.as_ref())));

    let device = file.as_ref().and_then(|f| f.device.clone());
    let device_launcher = device
        .as_ref()
        .and_then(|d| d.launcher.as_deref())
        .map(|l| resolve_path(base_dir, l));
    let companion_device = device.and_then(|d| d.companion);

    let defaults = TimeoutSettings::default();
    let timeouts = match file.as_ref().and_then(|f| f.timeouts.as_ref()) {
        Some(t) => TimeoutSettings {
            run: t.run_seconds.map(Duration::from_secs).unwrap_or(defaults.run),
            launch: t
                .launch_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.launch),
        },
        None => defaults,
    };

    Ok(ResolvedConfig {
        home,
        output,
        error_patterns,
        known_issues,
        device_launcher,
        companion_device,
        timeouts,
        config_file,
    })
}
