//! Output Stream Integration Tests
//!
//! Line interpretation across a whole simulated run: envelopes, embedded
//! results, error signatures and the end-of-run sentinel.

use std::sync::Arc;

use tempfile::TempDir;

use apprunner::core::{
    CompletionState, ErrorSignatureScanner, LineKind, LineStreamProcessor, Severity, Transcript,
};

struct Run {
    dir: TempDir,
    processor: LineStreamProcessor,
}

impl Run {
    fn new(patterns: Option<&str>) -> Self {
        let dir = TempDir::new().unwrap();
        let scanner = match patterns {
            Some(content) => {
                let path = dir.path().join("patterns.txt");
                std::fs::write(&path, content).unwrap();
                ErrorSignatureScanner::new(Some(path.as_path())).unwrap()
            }
            None => ErrorSignatureScanner::disabled(),
        };
        let transcript = Arc::new(Transcript::create(dir.path().join("transcript.log")).unwrap());
        let processor =
            LineStreamProcessor::new(dir.path().join("testResults.xml"), transcript, Arc::new(scanner));
        Self { dir, processor }
    }

    fn transcript(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("transcript.log")).unwrap()
    }

    fn results(&self) -> Vec<u8> {
        std::fs::read(self.dir.path().join("testResults.xml")).unwrap()
    }
}

#[test]
fn test_full_run_transcript() {
    let run = Run::new(Some("Unhandled exception\n"));
    let lines = [
        r#"{"method":"console.log","payload":"Starting tests"}"#,
        "[PASS] MathTests.Adds",
        "[FAIL] MathTests.Divides",
        r#"{"method":"console.warn","payload":"slow test   "}"#,
        "STARTRESULTXML 4 QUJDRA== ENDRESULTXML",
        "Unhandled exception: boom",
        "RUN EXIT 1",
    ];

    for line in lines {
        run.processor.consume(line).unwrap();
    }

    assert_eq!(
        run.transcript(),
        "Starting tests\n[PASS] MathTests.Adds\n[FAIL] MathTests.Divides\nslow test\n\
         Unhandled exception: boom\nRUN EXIT 1\n"
    );
    assert_eq!(run.results(), b"ABCD");
    assert_eq!(
        run.processor.line_that_matched_error_pattern(),
        Some("Unhandled exception: boom")
    );
    assert_eq!(
        run.processor.completion().state(),
        CompletionState::Received { exit_code: Some(1) }
    );
}

#[test]
fn test_console_error_scenario() {
    let run = Run::new(None);

    let kind = run
        .processor
        .consume(r#"{"method":"console.error","payload":"NullRef"}"#)
        .unwrap();

    assert_eq!(kind, Some(LineKind::Console(Severity::Error)));
    assert_eq!(run.transcript(), "NullRef\n");
}

#[test]
fn test_envelope_without_payload_keeps_method() {
    let run = Run::new(None);

    let kind = run
        .processor
        .consume(r#"{"method":"console.debug","id":7}"#)
        .unwrap();

    assert_eq!(kind, Some(LineKind::Console(Severity::Debug)));
    assert_eq!(run.transcript(), "{\"method\":\"console.debug\",\"id\":7}\n");
}

#[test]
fn test_result_artifact_inside_envelope() {
    let run = Run::new(None);

    let kind = run
        .processor
        .consume(r#"{"method":"console.log","payload":"STARTRESULTXML 3 eHl6 ENDRESULTXML"}"#)
        .unwrap();

    assert_eq!(
        kind,
        Some(LineKind::ResultArtifact {
            expected_len: 3,
            actual_len: 3
        })
    );
    assert_eq!(run.results(), b"xyz");
    assert_eq!(run.transcript(), "");
}

#[test]
fn test_later_result_overwrites_earlier() {
    let run = Run::new(None);

    run.processor
        .consume("STARTRESULTXML 4 QUJDRA== ENDRESULTXML")
        .unwrap();
    run.processor
        .consume("STARTRESULTXML 3 eHl6 ENDRESULTXML")
        .unwrap();

    assert_eq!(run.results(), b"xyz");
}

#[test]
fn test_sentinel_twice_completes_once() {
    let run = Run::new(None);
    let completion = run.processor.completion();

    assert!(run.processor.consume("RUN EXIT 0").is_ok());
    assert!(run.processor.consume("RUN EXIT 2").is_ok());

    assert!(completion.is_complete());
    assert_eq!(
        completion.state(),
        CompletionState::Received { exit_code: Some(0) }
    );
}

#[test]
fn test_sentinel_without_code() {
    let run = Run::new(None);

    run.processor.consume("RUN EXIT done").unwrap();

    assert_eq!(
        run.processor.completion().state(),
        CompletionState::Received { exit_code: None }
    );
}

#[test]
fn test_external_error_is_scanned() {
    let run = Run::new(Some("Connection reset\n"));

    run.processor
        .report_external_error("Connection reset by peer while reading results");

    assert_eq!(
        run.processor.line_that_matched_error_pattern(),
        Some("Connection reset by peer while reading results")
    );
    // External errors are not part of the transcript
    assert_eq!(run.transcript(), "");
}

#[tokio::test]
async fn test_waiters_see_completion() {
    let run = Run::new(None);
    let completion = run.processor.completion();
    let waiter = tokio::spawn(async move { completion.wait().await });

    run.processor.consume("still running").unwrap();
    run.processor.consume("RUN EXIT 0").unwrap();

    assert_eq!(waiter.await.unwrap(), Some(0));
}
