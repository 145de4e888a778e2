//! Execution targets and run parameters.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors when parsing a target string
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetParseError {
    #[error("Unknown platform '{0}'")]
    UnknownPlatform(String),

    #[error("Unknown target kind '{0}' (expected device or simulator)")]
    UnknownKind(String),

    #[error("Target '{0}' is missing a kind (e.g. ios-device, ios-simulator)")]
    MissingKind(String),
}

/// Operating system family of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Ios,
    TvOs,
    WatchOs,
    XrOs,
    MacCatalyst,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Ios => "ios",
            Platform::TvOs => "tvos",
            Platform::WatchOs => "watchos",
            Platform::XrOs => "xros",
            Platform::MacCatalyst => "maccatalyst",
        };
        f.write_str(name)
    }
}

/// Where the application physically runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    Device,
    Simulator,
    Host,
}

/// Coarse category used to pick an execution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetClass {
    HostNative,
    DeviceOrSimulator,
}

/// A fully described execution target, e.g. `ios-simulator-64_17.2`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTarget {
    pub platform: Platform,
    pub kind: TargetKind,
    pub os_version: Option<String>,
}

impl TestTarget {
    pub fn class(&self) -> TargetClass {
        match self.kind {
            TargetKind::Host => TargetClass::HostNative,
            TargetKind::Device | TargetKind::Simulator => TargetClass::DeviceOrSimulator,
        }
    }

    /// Simulators are virtual; devices and the host are not
    pub fn is_virtual(&self) -> bool {
        self.kind == TargetKind::Simulator
    }

    /// Major OS version, if one was given and parses
    pub fn os_major_version(&self) -> Option<u32> {
        self.os_version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.parse().ok())
    }

    /// Watch apps run against a paired phone
    pub fn needs_companion(&self) -> bool {
        self.platform == Platform::WatchOs && self.kind == TargetKind::Device
    }
}

impl FromStr for TestTarget {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let (name, os_version) = match lower.split_once('_') {
            Some((name, version)) if !version.is_empty() => (name, Some(version.to_string())),
            Some((name, _)) => (name, None),
            None => (lower.as_str(), None),
        };

        if name == "maccatalyst" {
            return Ok(Self {
                platform: Platform::MacCatalyst,
                kind: TargetKind::Host,
                os_version,
            });
        }

        let mut parts = name.split('-');
        let platform = match parts.next().unwrap_or_default() {
            "ios" => Platform::Ios,
            "tvos" => Platform::TvOs,
            "watchos" => Platform::WatchOs,
            "xros" => Platform::XrOs,
            other => return Err(TargetParseError::UnknownPlatform(other.to_string())),
        };

        // Architecture suffixes such as `-64` or `-32` are accepted and ignored
        let kind = match parts.next() {
            Some("device") => TargetKind::Device,
            Some("simulator") => TargetKind::Simulator,
            Some(other) => return Err(TargetParseError::UnknownKind(other.to_string())),
            None => return Err(TargetParseError::MissingKind(s.to_string())),
        };

        Ok(Self {
            platform,
            kind,
            os_version,
        })
    }
}

impl fmt::Display for TestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TargetKind::Host => write!(f, "{}", self.platform)?,
            TargetKind::Device => write!(f, "{}-device", self.platform)?,
            TargetKind::Simulator => write!(f, "{}-simulator", self.platform)?,
        }
        if let Some(ref version) = self.os_version {
            write!(f, "_{}", version)?;
        }
        Ok(())
    }
}

/// Transport used to talk to the running test application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum CommunicationChannel {
    /// Tunnel over the USB connection
    #[default]
    UsbTunnel,

    /// Plain TCP over the local network
    Network,
}

/// Format of the test results the application emits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ResultFormat {
    #[default]
    Xunit,
    #[value(name = "nunitv2")]
    NUnitV2,
    #[value(name = "nunitv3")]
    NUnitV3,
}

/// Application package to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBundle {
    /// Path to the `.app` bundle or executable
    pub path: PathBuf,

    pub bundle_identifier: String,

    /// Executable name inside the bundle (host-native runs)
    pub executable: Option<String>,
}

impl AppBundle {
    pub fn new(path: impl Into<PathBuf>, bundle_identifier: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bundle_identifier: bundle_identifier.into(),
            executable: None,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    /// Path of the binary to spawn for host-native runs
    pub fn executable_path(&self) -> PathBuf {
        match self.executable {
            Some(ref exe) => self.path.join("Contents").join("MacOS").join(exe),
            None => self.path.clone(),
        }
    }
}
