//! Maps execution outcomes to process exit codes.
//!
//! Launch failures and crashes are checked against the known issue knowledge
//! base. Logs are consulted in order and the first log that matches decides
//! both the exit code override and the hint shown to the user.

use std::sync::Arc;

use tracing::debug;

use super::severity::Severity;
use crate::adapters::{KnownIssueSource, NoKnownIssues};
use crate::domain::{ExecutionOutcome, ExitCode, KnownIssue, LogFile, ResultKind};

/// Suffix appended when no specific diagnosis is available
pub const CHECK_LOGS_HINT: &str = "Check logs for more information";

/// Result of classifying one outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub exit_code: ExitCode,

    /// Severity of the single top-level message
    pub severity: Severity,

    /// The human-readable message that was logged
    pub message: String,

    /// Known issue that matched, if the knowledge base was consulted and hit
    pub known_issue: Option<KnownIssue>,
}

/// Turns an outcome plus the run's logs into an exit code
pub struct ResultClassifier {
    knowledge_base: Arc<dyn KnownIssueSource>,
}

impl Default for ResultClassifier {
    fn default() -> Self {
        Self::new(Arc::new(NoKnownIssues))
    }
}

impl ResultClassifier {
    pub fn new(knowledge_base: Arc<dyn KnownIssueSource>) -> Self {
        Self { knowledge_base }
    }

    /// Classify and log the outcome. Emits exactly one top-level message.
    pub fn classify(&self, outcome: &ExecutionOutcome, logs: &[LogFile]) -> Classification {
        let classification = self.evaluate(outcome, logs);
        classification.severity.emit(&classification.message);
        classification
    }

    /// Classify without logging
    pub fn evaluate(&self, outcome: &ExecutionOutcome, logs: &[LogFile]) -> Classification {
        let detail = outcome.detail();

        match outcome.kind {
            ResultKind::Succeeded => Classification {
                exit_code: ExitCode::Success,
                severity: Severity::Info,
                message: with_detail("Application finished the test run successfully", detail),
                known_issue: None,
            },
            ResultKind::Failed => Classification {
                exit_code: ExitCode::TestsFailed,
                severity: Severity::Info,
                message: with_detail(
                    "Application finished the test run successfully with some failed tests",
                    detail,
                ),
                known_issue: None,
            },
            ResultKind::LaunchFailure => {
                self.with_knowledge_base("Application failed to launch", detail, logs)
            }
            ResultKind::Crashed => self.with_knowledge_base("Application run crashed", detail, logs),
            ResultKind::TimedOut => Classification {
                exit_code: ExitCode::TimedOut,
                severity: Severity::Warning,
                message: with_detail("Application run timed out", detail),
                known_issue: None,
            },
            ResultKind::Unexpected(ref kind) => Classification {
                exit_code: ExitCode::GeneralFailure,
                severity: Severity::Error,
                message: format!(
                    "{}. {}",
                    with_detail(
                        &format!("Application has finished with an unexpected result ({})", kind),
                        detail,
                    ),
                    CHECK_LOGS_HINT
                ),
                known_issue: None,
            },
        }
    }

    fn with_knowledge_base(
        &self,
        summary: &str,
        detail: Option<&str>,
        logs: &[LogFile],
    ) -> Classification {
        let default_code = ExitCode::AppLaunchFailure;

        // First match wins; later logs are never consulted
        let hit = logs.iter().find_map(|log| {
            self.knowledge_base
                .is_known_issue(log)
                .map(|issue| (log, issue))
        });

        match hit {
            Some((log, issue)) => {
                debug!(log = %log.description, "Known issue found");
                Classification {
                    exit_code: issue.suggested_exit_code.unwrap_or(default_code),
                    severity: Severity::Error,
                    message: format!("{}: {}", with_detail(summary, detail), issue.human_message),
                    known_issue: Some(issue),
                }
            }
            None => Classification {
                exit_code: default_code,
                severity: Severity::Error,
                message: format!("{}. {}", with_detail(summary, detail), CHECK_LOGS_HINT),
                known_issue: None,
            },
        }
    }
}

fn with_detail(summary: &str, detail: Option<&str>) -> String {
    match detail {
        Some(detail) => format!("{}: {}", summary, detail),
        None => summary.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Knowledge base keyed by log description
    struct ScriptedKnowledgeBase {
        answers: Vec<(&'static str, KnownIssue)>,
        calls: AtomicUsize,
    }

    impl ScriptedKnowledgeBase {
        fn new(answers: Vec<(&'static str, KnownIssue)>) -> Self {
            Self {
                answers,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl KnownIssueSource for ScriptedKnowledgeBase {
        fn is_known_issue(&self, log: &LogFile) -> Option<KnownIssue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .iter()
                .find(|(name, _)| *name == log.description)
                .map(|(_, issue)| issue.clone())
        }
    }

    fn logs(names: &[&str]) -> Vec<LogFile> {
        names
            .iter()
            .map(|n| LogFile::new(*n, format!("/logs/{}.log", n)))
            .collect()
    }

    #[test]
    fn test_succeeded_includes_message() {
        let classifier = ResultClassifier::default();
        let outcome = ExecutionOutcome::new(ResultKind::Succeeded).with_message("12 passed");

        let result = classifier.classify(&outcome, &[]);
        assert_eq!(result.exit_code, ExitCode::Success);
        assert_eq!(result.severity, Severity::Info);
        assert!(result.message.contains("12 passed"));
    }

    #[test]
    fn test_failed_maps_to_tests_failed() {
        let classifier = ResultClassifier::default();
        let outcome = ExecutionOutcome::new(ResultKind::Failed);
        assert_eq!(classifier.classify(&outcome, &[]).exit_code, ExitCode::TestsFailed);
    }

    #[test]
    fn test_launch_failure_without_logs() {
        let classifier = ResultClassifier::default();
        let outcome = ExecutionOutcome::new(ResultKind::LaunchFailure).with_message("boom");

        let result = classifier.classify(&outcome, &[]);
        assert_eq!(result.exit_code, ExitCode::AppLaunchFailure);
        assert_eq!(result.severity, Severity::Error);
        assert!(result.message.contains("boom"));
        assert!(result.message.contains(CHECK_LOGS_HINT));
    }

    #[test]
    fn test_crash_uses_known_issue_hint() {
        let kb = ScriptedKnowledgeBase::new(vec![(
            "crash",
            KnownIssue::new("Out of memory on device"),
        )]);
        let classifier = ResultClassifier::new(Arc::new(kb));
        let outcome = ExecutionOutcome::new(ResultKind::Crashed);

        let result = classifier.classify(&outcome, &logs(&["crash"]));
        // No suggested code keeps the default
        assert_eq!(result.exit_code, ExitCode::AppLaunchFailure);
        assert!(result.message.contains("Out of memory on device"));
        assert!(!result.message.contains(CHECK_LOGS_HINT));
    }

    #[test]
    fn test_first_matching_log_wins() {
        let kb = Arc::new(ScriptedKnowledgeBase::new(vec![
            ("b", KnownIssue::new("issue B").with_exit_code(ExitCode::Custom(90))),
            ("c", KnownIssue::new("issue C").with_exit_code(ExitCode::Custom(91))),
        ]));
        let classifier = ResultClassifier::new(kb.clone());
        let outcome = ExecutionOutcome::new(ResultKind::LaunchFailure);

        let result = classifier.classify(&outcome, &logs(&["a", "b", "c"]));
        assert_eq!(result.exit_code, ExitCode::Custom(90));
        assert!(result.message.contains("issue B"));
        assert!(!result.message.contains("issue C"));
        assert_eq!(kb.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timeout_skips_knowledge_base() {
        let kb = Arc::new(ScriptedKnowledgeBase::new(vec![(
            "a",
            KnownIssue::new("should not be used"),
        )]));
        let classifier = ResultClassifier::new(kb.clone());
        let outcome = ExecutionOutcome::new(ResultKind::TimedOut);

        let result = classifier.classify(&outcome, &logs(&["a"]));
        assert_eq!(result.exit_code, ExitCode::TimedOut);
        assert_eq!(result.severity, Severity::Warning);
        assert_eq!(kb.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unexpected_is_general_failure_without_lookup() {
        let kb = Arc::new(ScriptedKnowledgeBase::new(vec![(
            "a",
            KnownIssue::new("should not be used"),
        )]));
        let classifier = ResultClassifier::new(kb.clone());
        let outcome = ExecutionOutcome::new(ResultKind::Unexpected("exit code 3".to_string()))
            .with_message("weird");

        let result = classifier.classify(&outcome, &logs(&["a"]));
        assert_eq!(result.exit_code, ExitCode::GeneralFailure);
        assert!(result.message.contains("exit code 3"));
        assert!(result.message.contains("weird"));
        assert_eq!(kb.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let kb = Arc::new(ScriptedKnowledgeBase::new(vec![(
            "b",
            KnownIssue::new("known").with_exit_code(ExitCode::Custom(77)),
        )]));
        let classifier = ResultClassifier::new(kb);
        let all_logs = logs(&["a", "b"]);

        for kind in [
            ResultKind::Succeeded,
            ResultKind::Failed,
            ResultKind::LaunchFailure,
            ResultKind::Crashed,
            ResultKind::TimedOut,
        ] {
            let outcome = ExecutionOutcome::new(kind).with_message("detail");
            let first = classifier.evaluate(&outcome, &all_logs);
            let second = classifier.evaluate(&outcome, &all_logs);
            assert_eq!(first, second);
        }
    }

    /// Writer that collects formatted log output in memory
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn classify_captured(
        classifier: &ResultClassifier,
        outcome: &ExecutionOutcome,
        logs: &[LogFile],
    ) -> (Classification, Vec<String>) {
        let captured = CapturedLogs::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .without_time()
            .finish();

        let result = tracing::subscriber::with_default(subscriber, || {
            classifier.classify(outcome, logs)
        });
        (result, captured.lines())
    }

    #[test]
    fn test_classify_logs_exactly_one_message() {
        let kb = Arc::new(ScriptedKnowledgeBase::new(vec![(
            "b",
            KnownIssue::new("Device is locked").with_exit_code(ExitCode::Custom(85)),
        )]));
        let classifier = ResultClassifier::new(kb);
        let all_logs = logs(&["a", "b"]);

        let cases = [
            (ExecutionOutcome::new(ResultKind::Succeeded).with_message("12 passed"), "INFO"),
            (ExecutionOutcome::new(ResultKind::TimedOut), "WARN"),
            (ExecutionOutcome::new(ResultKind::LaunchFailure).with_message("boom"), "ERROR"),
            (ExecutionOutcome::new(ResultKind::Unexpected("exit code 3".into())), "ERROR"),
        ];

        for (outcome, level) in cases {
            let (result, lines) = classify_captured(&classifier, &outcome, &all_logs);
            assert_eq!(lines.len(), 1, "{:?} logged {:?}", outcome.kind, lines);
            assert!(lines[0].contains(level), "{:?}", lines[0]);
            assert!(lines[0].contains(&result.message), "{:?}", lines[0]);
        }
    }
}
