//! Log severities for messages routed at runtime.

use std::fmt;

use tracing::{debug, error, info, trace, warn};

/// Severity chosen for a message at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Severity for a console method name such as `console.warn`.
    ///
    /// Unknown or absent methods log at info.
    pub fn from_console_method(method: Option<&str>) -> Self {
        match method.map(str::to_ascii_lowercase).as_deref() {
            Some("console.debug") => Severity::Debug,
            Some("console.error") => Severity::Error,
            Some("console.warn") => Severity::Warning,
            Some("console.trace") => Severity::Trace,
            _ => Severity::Info,
        }
    }

    /// Emit `message` through tracing at this severity
    pub fn emit(self, message: &str) {
        match self {
            Severity::Trace => trace!("{}", message),
            Severity::Debug => debug!("{}", message),
            Severity::Info => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_method_routing() {
        assert_eq!(Severity::from_console_method(Some("console.debug")), Severity::Debug);
        assert_eq!(Severity::from_console_method(Some("Console.Error")), Severity::Error);
        assert_eq!(Severity::from_console_method(Some("console.warn")), Severity::Warning);
        assert_eq!(Severity::from_console_method(Some("console.trace")), Severity::Trace);
        assert_eq!(Severity::from_console_method(Some("console.log")), Severity::Info);
        assert_eq!(Severity::from_console_method(Some("console.table")), Severity::Info);
        assert_eq!(Severity::from_console_method(None), Severity::Info);
    }
}
