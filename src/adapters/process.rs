//! Host-native execution via a child process.
//!
//! The app binary is spawned directly. Its stdout and stderr are merged into
//! one ordered channel and fed line by line to a [`LineStreamProcessor`].

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{HostRunner, StrategyRequest};
use crate::core::{
    CompletionState, ErrorSignatureScanner, LineStreamProcessor, Transcript,
};
use crate::domain::{ExecutionOutcome, LogFile, ResultKind};

/// Transcript file name inside the run output directory
pub const TRANSCRIPT_FILE: &str = "transcript.log";

/// Result file name inside the run output directory
pub const RESULTS_FILE: &str = "testResults.xml";

/// Environment variable carrying the result format to the app
pub const ENV_RESULT_FORMAT: &str = "APPRUNNER_RESULT_FORMAT";

/// Environment variable carrying test filters (comma separated)
pub const ENV_FILTERS: &str = "APPRUNNER_FILTERS";

/// Environment variable asking the app to print the end-of-run sentinel
pub const ENV_SIGNAL_END: &str = "APPRUNNER_SIGNAL_END";

const LINE_BUFFER: usize = 1024;

/// How long the post-completion drain waits for another line
const DRAIN_IDLE_TIMEOUT: Duration = Duration::from_millis(250);

/// Upper bound on the whole post-completion drain
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Default time a process gets to exit after it reported completion
const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Runs the app as a child process on this machine
pub struct ProcessRunner {
    scanner: Arc<ErrorSignatureScanner>,
    exit_grace: Duration,
}

impl ProcessRunner {
    pub fn new(scanner: Arc<ErrorSignatureScanner>) -> Self {
        Self {
            scanner,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    /// How long to wait for exit after the completion sentinel
    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    fn command(&self, request: &StrategyRequest) -> Command {
        let mut command = Command::new(request.app.executable_path());
        command.args(&request.passthrough_args);

        if let Some(format) = request.result_format.to_possible_value() {
            command.env(ENV_RESULT_FORMAT, format.get_name());
        }
        if !request.filters.is_empty() {
            command.env(ENV_FILTERS, request.filters.join(","));
        }
        if request.signal_end {
            command.env(ENV_SIGNAL_END, "1");
        }
        command
    }
}

#[async_trait]
impl HostRunner for ProcessRunner {
    fn name(&self) -> &str {
        "process"
    }

    async fn run(&self, request: &StrategyRequest) -> ExecutionOutcome {
        let command = self.command(request);
        stream_process(command, request, self.scanner.clone(), self.exit_grace).await
    }
}

/// Why the supervision loop stopped
enum Stop {
    /// Process exited and both streams closed
    Exited(ExitStatus),

    /// The app printed the end-of-run sentinel
    Completed(Option<i32>),

    /// The run must be torn down with this outcome
    Abort(ExecutionOutcome),
}

/// Spawn `command`, stream its output through a processor and supervise it
/// against the request's budget and cancellation.
pub(crate) async fn stream_process(
    mut command: Command,
    request: &StrategyRequest,
    scanner: Arc<ErrorSignatureScanner>,
    exit_grace: Duration,
) -> ExecutionOutcome {
    let transcript_path = request.output_dir.join(TRANSCRIPT_FILE);
    let transcript = match Transcript::create(&transcript_path) {
        Ok(transcript) => Arc::new(transcript),
        Err(e) => {
            return ExecutionOutcome::new(ResultKind::Unexpected("output error".to_string()))
                .with_message(format!(
                    "Failed to create transcript {}: {}",
                    transcript_path.display(),
                    e
                ));
        }
    };
    request
        .logs
        .register(LogFile::new("Test run transcript", &transcript_path));

    let processor = LineStreamProcessor::new(
        request.output_dir.join(RESULTS_FILE),
        transcript.clone(),
        scanner,
    );

    command
        .envs(request.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            transcript.close();
            return ExecutionOutcome::new(ResultKind::LaunchFailure)
                .with_message(format!("Failed to start process: {}", e));
        }
    };
    debug!(pid = ?child.id(), "Test process started");

    let (tx, mut rx) = mpsc::channel::<String>(LINE_BUFFER);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx.clone()));
    }
    drop(tx);

    let launch_deadline = tokio::time::sleep(request.budget.launch_timeout);
    let total_deadline = tokio::time::sleep(request.budget.timeout);
    tokio::pin!(launch_deadline, total_deadline);

    let mut seen_activity = false;
    let mut streams_open = true;
    let mut exit_status: Option<ExitStatus> = None;

    let stop = loop {
        if let (Some(status), false) = (exit_status, streams_open) {
            break Stop::Exited(status);
        }

        tokio::select! {
            biased;

            _ = request.cancellation.cancelled() => {
                break Stop::Abort(
                    ExecutionOutcome::new(ResultKind::TimedOut).with_message("Run was cancelled"),
                );
            }
            _ = &mut total_deadline => {
                break Stop::Abort(
                    ExecutionOutcome::new(ResultKind::TimedOut)
                        .with_message(format!("Run exceeded the timeout of {:?}", request.budget.timeout)),
                );
            }
            line = rx.recv(), if streams_open => match line {
                Some(line) => {
                    seen_activity = true;
                    if let Err(e) = processor.consume(&line) {
                        processor.report_external_error(&e.to_string());
                        break Stop::Abort(
                            ExecutionOutcome::new(ResultKind::Unexpected("output error".to_string()))
                                .with_message(e.to_string()),
                        );
                    }
                    if let CompletionState::Received { exit_code } = processor.completion().state() {
                        break Stop::Completed(exit_code);
                    }
                }
                None => streams_open = false,
            },
            status = child.wait(), if exit_status.is_none() => match status {
                Ok(status) => {
                    seen_activity = true;
                    exit_status = Some(status);
                }
                Err(e) => {
                    processor.report_external_error(&format!("Lost track of test process: {}", e));
                    break Stop::Abort(
                        ExecutionOutcome::new(ResultKind::Unexpected("process error".to_string()))
                            .with_message(e.to_string()),
                    );
                }
            },
            _ = &mut launch_deadline, if !seen_activity => {
                break Stop::Abort(
                    ExecutionOutcome::new(ResultKind::LaunchFailure).with_message(format!(
                        "No output within the launch timeout of {:?}",
                        request.budget.launch_timeout
                    )),
                );
            }
        }
    };

    let outcome = match stop {
        Stop::Exited(status) => outcome_from_exit(status),
        Stop::Completed(exit_code) => {
            if exit_status.is_none() {
                wait_or_kill(&mut child, exit_grace).await;
            }
            drain_after_completion(&mut rx, &processor).await;
            outcome_from_completion(exit_code)
        }
        Stop::Abort(outcome) => {
            if exit_status.is_none() {
                kill(&mut child).await;
            }
            outcome
        }
    };

    transcript.close();
    if processor.result_path().exists() {
        request
            .logs
            .register(LogFile::new("Test results", processor.result_path()));
    }

    with_error_line(outcome, processor.line_that_matched_error_pattern())
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    // Raw bytes so one undecodable line cannot stop the stream
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(decode_line(&buf)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read test process output");
                break;
            }
        }
    }
}

/// Strip the line terminator and decode, replacing invalid UTF-8
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Feed output printed between the sentinel and exit to the transcript.
/// Stops when both streams are closed, go quiet or the drain limit is hit.
async fn drain_after_completion(rx: &mut mpsc::Receiver<String>, processor: &LineStreamProcessor) {
    let limit = tokio::time::Instant::now() + DRAIN_LIMIT;
    loop {
        let idle = (tokio::time::Instant::now() + DRAIN_IDLE_TIMEOUT).min(limit);
        match tokio::time::timeout_at(idle, rx.recv()).await {
            // Errors after completion are logged by the processor itself
            Ok(Some(line)) => {
                processor.consume(&line).ok();
            }
            Ok(None) => break,
            Err(_) => {
                debug!("Output still open after completion, stopping drain");
                break;
            }
        }
    }
}

async fn wait_or_kill(child: &mut Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "Test process exited after completion"),
        Ok(Err(e)) => warn!(error = %e, "Failed to wait for test process"),
        Err(_) => {
            info!(?grace, "Test process still running after completion, killing it");
            kill(child).await;
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill test process");
    }
}

fn outcome_from_completion(exit_code: Option<i32>) -> ExecutionOutcome {
    match exit_code {
        Some(0) | None => ExecutionOutcome::new(ResultKind::Succeeded),
        Some(code) => ExecutionOutcome::new(ResultKind::Failed)
            .with_message(format!("Test run reported exit code {}", code)),
    }
}

fn outcome_from_exit(status: ExitStatus) -> ExecutionOutcome {
    match status.code() {
        Some(0) => ExecutionOutcome::new(ResultKind::Succeeded),
        Some(1) => ExecutionOutcome::new(ResultKind::Failed),
        Some(code) => ExecutionOutcome::new(ResultKind::Unexpected(format!("exit code {}", code))),
        None => ExecutionOutcome::new(ResultKind::Crashed)
            .with_message(format!("Test process was terminated: {}", status)),
    }
}

/// Add the first error-signature line to failing outcomes
fn with_error_line(outcome: ExecutionOutcome, error_line: Option<&str>) -> ExecutionOutcome {
    let Some(line) = error_line else {
        return outcome;
    };

    match outcome.kind {
        ResultKind::Succeeded | ResultKind::Failed => outcome,
        _ => {
            let message = match outcome.detail() {
                Some(detail) => format!("{} (first error: {})", detail, line),
                None => format!("First error: {}", line),
            };
            outcome.with_message(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_line_strips_terminators_and_replaces_invalid_bytes() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\xff ok\n"), "\u{FFFD} ok");
    }

    #[tokio::test]
    async fn test_drain_picks_up_late_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcript = Arc::new(Transcript::create(dir.path().join(TRANSCRIPT_FILE)).unwrap());
        let processor = LineStreamProcessor::new(
            dir.path().join(RESULTS_FILE),
            transcript,
            Arc::new(ErrorSignatureScanner::disabled()),
        );
        processor.consume("RUN EXIT 0").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send("late line".to_string()).await.unwrap();
        });

        drain_after_completion(&mut rx, &processor).await;

        let content = std::fs::read_to_string(dir.path().join(TRANSCRIPT_FILE)).unwrap();
        assert_eq!(content, "RUN EXIT 0\nlate line\n");
    }

    #[test]
    fn test_outcome_from_completion() {
        assert_eq!(outcome_from_completion(Some(0)).kind, ResultKind::Succeeded);
        assert_eq!(outcome_from_completion(None).kind, ResultKind::Succeeded);

        let outcome = outcome_from_completion(Some(2));
        assert_eq!(outcome.kind, ResultKind::Failed);
        assert!(outcome.detail().unwrap().contains('2'));
    }

    #[test]
    fn test_error_line_only_on_failures() {
        let ok = ExecutionOutcome::new(ResultKind::Succeeded);
        assert_eq!(with_error_line(ok.clone(), Some("Exception")), ok);

        let crashed = ExecutionOutcome::new(ResultKind::Crashed).with_message("signal 11");
        let crashed = with_error_line(crashed, Some("Segmentation fault"));
        assert_eq!(
            crashed.detail(),
            Some("signal 11 (first error: Segmentation fault)")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_outcome_from_exit_codes() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(
            outcome_from_exit(ExitStatus::from_raw(0)).kind,
            ResultKind::Succeeded
        );
        assert_eq!(
            outcome_from_exit(ExitStatus::from_raw(1 << 8)).kind,
            ResultKind::Failed
        );
        assert_eq!(
            outcome_from_exit(ExitStatus::from_raw(3 << 8)).kind,
            ResultKind::Unexpected("exit code 3".to_string())
        );
        // Raw status 9 = killed by SIGKILL
        assert_eq!(
            outcome_from_exit(ExitStatus::from_raw(9)).kind,
            ResultKind::Crashed
        );
    }
}
