//! Integration tests for the execution supervisor: modes, output capture,
//! the pipeline contract, timeouts, and validation.

use mcp_shell::config::Settings;
use mcp_shell::error::ErrorCategory;
use mcp_shell::store::OutputStore;
use mcp_shell::supervisor::{
    ExecuteOptions, ExecutionFilter, ExecutionMode, ExecutionStatus, ExecutionSupervisor,
    SignalKind, TransitionReason,
};
use std::time::Duration;

async fn supervisor() -> (ExecutionSupervisor, OutputStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = OutputStore::open(dir.path()).await.expect("open store");
    let supervisor = ExecutionSupervisor::new(Settings::default(), store.clone());
    (supervisor, store, dir)
}

fn foreground(command: &str) -> ExecuteOptions {
    ExecuteOptions {
        command: command.to_string(),
        mode: ExecutionMode::Foreground,
        ..ExecuteOptions::default()
    }
}

/// Poll `get` until the execution reaches a terminal status.
async fn await_terminal(
    supervisor: &ExecutionSupervisor,
    execution_id: &str,
) -> mcp_shell::supervisor::ExecutionRecord {
    for _ in 0..100 {
        let record = supervisor.get(execution_id).await.expect("record");
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("execution {execution_id} never reached a terminal status");
}

// ---------------------------------------------------------------------------
// Foreground mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_foreground_echo_completes_with_output() {
    let (supervisor, store, _dir) = supervisor().await;
    let record = supervisor
        .execute(foreground("echo 'Hello Pipeline World'"))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.stdout, "Hello Pipeline World\n");
    assert!(record.output_status.complete);
    assert!(record.execution_time_ms.is_some());

    // The artifact holds exactly the bytes the child wrote.
    let output_id = record.output_id.expect("output id");
    let bytes = store.read_all(&output_id).await.unwrap();
    assert_eq!(bytes, b"Hello Pipeline World\n");
}

#[tokio::test]
async fn test_foreground_nonzero_exit_is_failed() {
    let (supervisor, _store, _dir) = supervisor().await;
    let record = supervisor.execute(foreground("exit 42")).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.exit_code, Some(42));
}

#[tokio::test]
async fn test_foreground_captures_stderr_when_merged() {
    let (supervisor, store, _dir) = supervisor().await;
    let record = supervisor
        .execute(foreground("echo out; echo err >&2"))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.stdout.contains("out"));
    assert!(record.stderr.contains("err"));

    let bytes = store.read_all(&record.output_id.unwrap()).await.unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("out"));
    assert!(text.contains("err"));
}

#[tokio::test]
async fn test_foreground_split_streams_create_two_artifacts() {
    let (supervisor, store, _dir) = supervisor().await;
    let record = supervisor
        .execute(ExecuteOptions {
            command: "echo out; echo err >&2".to_string(),
            mode: ExecutionMode::Foreground,
            capture_stderr: false,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);

    let (artifacts, total) = store
        .list(&mcp_shell::store::ArtifactFilter {
            execution_id: Some(record.execution_id.clone()),
            ..Default::default()
        })
        .await;
    assert_eq!(total, 2, "expected stdout + stderr artifacts: {artifacts:?}");

    // The record's primary output id is the stdout artifact.
    let bytes = store.read_all(&record.output_id.unwrap()).await.unwrap();
    assert_eq!(bytes, b"out\n");
}

#[tokio::test]
async fn test_foreground_timeout_returns_partial_record() {
    let (supervisor, _store, _dir) = supervisor().await;
    let start = std::time::Instant::now();
    let record = supervisor
        .execute(ExecuteOptions {
            command: "sleep 30".to_string(),
            mode: ExecutionMode::Foreground,
            timeout_seconds: 1,
            return_partial_on_timeout: true,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Timeout);
    assert!(record.exit_code.is_none());
    assert_eq!(record.stdout, "");
    assert!(!record.output_status.complete);
    assert!(start.elapsed() < Duration::from_secs(10));

    // The table agrees with the returned record.
    let fetched = supervisor.get(&record.execution_id).await.unwrap();
    assert_eq!(fetched.status, ExecutionStatus::Timeout);
}

#[tokio::test]
async fn test_foreground_timeout_without_partial_is_execution_error() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor
        .execute(ExecuteOptions {
            command: "sleep 30".to_string(),
            mode: ExecutionMode::Foreground,
            timeout_seconds: 1,
            return_partial_on_timeout: false,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Execution);
    assert_eq!(err.code, "EXECUTION_TIMEOUT");
}

#[tokio::test]
async fn test_timeout_captures_output_produced_before_deadline() {
    let (supervisor, store, _dir) = supervisor().await;
    let record = supervisor
        .execute(ExecuteOptions {
            command: "echo early; sleep 30".to_string(),
            mode: ExecutionMode::Foreground,
            timeout_seconds: 1,
            return_partial_on_timeout: true,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Timeout);
    assert!(record.stdout.contains("early"));
    let bytes = store.read_all(&record.output_id.unwrap()).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("early"));
}

// ---------------------------------------------------------------------------
// Stdin and the pipeline contract
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stdin_data_feeds_child() {
    let (supervisor, _store, _dir) = supervisor().await;
    let record = supervisor
        .execute(ExecuteOptions {
            command: "cat".to_string(),
            mode: ExecutionMode::Foreground,
            stdin_data: Some("piped input\n".to_string()),
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.stdout, "piped input\n");
}

#[tokio::test]
async fn test_pipeline_output_id_as_stdin() {
    let (supervisor, _store, _dir) = supervisor().await;
    let first = supervisor
        .execute(foreground("printf 'apple\\nbanana\\napricot\\n'"))
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);

    let second = supervisor
        .execute(ExecuteOptions {
            command: "grep '^a'".to_string(),
            mode: ExecutionMode::Foreground,
            stdin_output_id: first.output_id.clone(),
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert!(second.stdout.contains("apple"));
    assert!(second.stdout.contains("apricot"));
    assert!(!second.stdout.contains("banana"));
}

#[tokio::test]
async fn test_stdin_conflict_is_param_error() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor
        .execute(ExecuteOptions {
            command: "cat".to_string(),
            stdin_data: Some("x".to_string()),
            stdin_output_id: Some("out-y".to_string()),
            ..ExecuteOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Param);
    assert_eq!(err.code, "STDIN_CONFLICT");
}

#[tokio::test]
async fn test_missing_stdin_artifact_fails_before_spawn() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor
        .execute(ExecuteOptions {
            command: "cat".to_string(),
            stdin_output_id: Some("out-does-not-exist".to_string()),
            ..ExecuteOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Resource);
    // No execution record was created.
    let (records, total) = supervisor.list(&ExecutionFilter::default()).await;
    assert_eq!(total, 0, "no record should exist: {records:?}");
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_command_is_param_error() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor.execute(foreground("   ")).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::Param);
    assert_eq!(err.code, "EMPTY_COMMAND");
}

#[tokio::test]
async fn test_timeout_range_validation() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor
        .execute(ExecuteOptions {
            command: "true".to_string(),
            timeout_seconds: 0,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, "TIMEOUT_OUT_OF_RANGE");

    let err = supervisor
        .execute(ExecuteOptions {
            command: "true".to_string(),
            timeout_seconds: 4000,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, "TIMEOUT_OUT_OF_RANGE");
}

#[tokio::test]
async fn test_output_size_range_validation() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor
        .execute(ExecuteOptions {
            command: "true".to_string(),
            max_output_size: 100,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, "OUTPUT_SIZE_OUT_OF_RANGE");
}

#[tokio::test]
async fn test_adaptive_requires_larger_overall_timeout() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor
        .execute(ExecuteOptions {
            command: "true".to_string(),
            mode: ExecutionMode::Adaptive,
            timeout_seconds: 10,
            foreground_timeout_seconds: 10,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Param);
}

#[tokio::test]
async fn test_nonexistent_workdir_is_execution_error() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor
        .execute(ExecuteOptions {
            command: "pwd".to_string(),
            working_directory: Some("/definitely/not/a/real/dir".to_string()),
            ..ExecuteOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Execution);
}

// ---------------------------------------------------------------------------
// Background mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_background_returns_running_then_completes() {
    let (supervisor, store, _dir) = supervisor().await;
    let record = supervisor
        .execute(ExecuteOptions {
            command: "sleep 0.3; echo done".to_string(),
            mode: ExecutionMode::Background,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
    assert!(record.process_id.is_some());
    assert!(record.output_id.is_some());

    let finished = await_terminal(&supervisor, &record.execution_id).await;
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert!(finished.stdout.contains("done"));

    let bytes = store.read_all(&finished.output_id.unwrap()).await.unwrap();
    assert_eq!(bytes, b"done\n");
}

#[tokio::test]
async fn test_background_timeout_marks_record() {
    let (supervisor, _store, _dir) = supervisor().await;
    let record = supervisor
        .execute(ExecuteOptions {
            command: "sleep 30".to_string(),
            mode: ExecutionMode::Background,
            timeout_seconds: 1,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
    let finished = await_terminal(&supervisor, &record.execution_id).await;
    assert_eq!(finished.status, ExecutionStatus::Timeout);
}

// ---------------------------------------------------------------------------
// Detached mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_detached_returns_immediately() {
    let (supervisor, _store, _dir) = supervisor().await;
    let start = std::time::Instant::now();
    let record = supervisor
        .execute(ExecuteOptions {
            command: "sleep 0.5; echo detached done".to_string(),
            mode: ExecutionMode::Detached,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
    assert!(start.elapsed() < Duration::from_secs(2));

    // Best-effort reap may reconcile the record once the child exits.
    let finished = await_terminal(&supervisor, &record.execution_id).await;
    assert_eq!(finished.status, ExecutionStatus::Completed);
}

// ---------------------------------------------------------------------------
// Adaptive mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_adaptive_quick_command_behaves_like_foreground() {
    let (supervisor, _store, _dir) = supervisor().await;
    let record = supervisor
        .execute(ExecuteOptions {
            command: "echo quick".to_string(),
            mode: ExecutionMode::Adaptive,
            timeout_seconds: 60,
            foreground_timeout_seconds: 30,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.stdout, "quick\n");
    assert!(record.transition_reason.is_none());
}

#[tokio::test]
async fn test_adaptive_transitions_on_foreground_timeout() {
    let (supervisor, store, _dir) = supervisor().await;
    let start = std::time::Instant::now();
    let record = supervisor
        .execute(ExecuteOptions {
            command: "echo started; sleep 3; echo finished".to_string(),
            mode: ExecutionMode::Adaptive,
            timeout_seconds: 30,
            foreground_timeout_seconds: 1,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();

    // Single response: still running, with the transition recorded and the
    // output id usable for streaming the rest.
    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(
        record.transition_reason,
        Some(TransitionReason::ForegroundTimeout)
    );
    assert!(record.output_id.is_some());
    assert!(!record.output_status.complete);
    assert!(start.elapsed() < Duration::from_secs(3));

    let finished = await_terminal(&supervisor, &record.execution_id).await;
    assert_eq!(finished.status, ExecutionStatus::Completed);
    let bytes = store.read_all(&finished.output_id.unwrap()).await.unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("started"));
    assert!(text.contains("finished"));
}

#[tokio::test]
async fn test_adaptive_transitions_on_output_size() {
    let (supervisor, store, _dir) = supervisor().await;
    let record = supervisor
        .execute(ExecuteOptions {
            command: "head -c 200000 /dev/zero; sleep 3".to_string(),
            mode: ExecutionMode::Adaptive,
            timeout_seconds: 30,
            foreground_timeout_seconds: 20,
            max_output_size: 1024,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(
        record.transition_reason,
        Some(TransitionReason::OutputSizeLimit)
    );

    // The complete bytes keep accumulating and are readable afterwards.
    let finished = await_terminal(&supervisor, &record.execution_id).await;
    assert_eq!(finished.status, ExecutionStatus::Completed);
    let artifact = store.get(&finished.output_id.unwrap()).await.unwrap();
    assert!(artifact.size >= 200_000, "full output stored: {}", artifact.size);
}

// ---------------------------------------------------------------------------
// Listing and lookup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_get_unknown_execution_is_resource_error() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor.get("exec-nope").await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::Resource);
}

#[tokio::test]
async fn test_list_filters_by_status_and_pattern() {
    let (supervisor, _store, _dir) = supervisor().await;
    supervisor.execute(foreground("echo alpha")).await.unwrap();
    supervisor.execute(foreground("echo beta")).await.unwrap();

    let (all, total) = supervisor.list(&ExecutionFilter::default()).await;
    assert_eq!(total, 2);
    assert_eq!(all.len(), 2);

    let (completed, _) = supervisor
        .list(&ExecutionFilter {
            status: Some(ExecutionStatus::Completed),
            ..Default::default()
        })
        .await;
    assert_eq!(completed.len(), 2);

    let (alpha, total) = supervisor
        .list(&ExecutionFilter {
            command_pattern: Some("alpha".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(total, 1);
    assert!(alpha[0].command.contains("alpha"));
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_signal_terminates_background_child() {
    let (supervisor, _store, _dir) = supervisor().await;
    let record = supervisor
        .execute(ExecuteOptions {
            command: "sleep 30".to_string(),
            mode: ExecutionMode::Background,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap();
    let pid = record.process_id.expect("pid");

    let result = supervisor.signal(pid, SignalKind::Term, false).await.unwrap();
    assert!(result.delivered);
    assert!(result.owned);

    let finished = await_terminal(&supervisor, &record.execution_id).await;
    // TERM'd children exit nonzero.
    assert_eq!(finished.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_signal_unowned_pid_notes_ownership() {
    let (supervisor, _store, _dir) = supervisor().await;
    // A pid we certainly don't own (and that almost certainly doesn't
    // exist); delivery may fail, ownership must be false.
    let result = supervisor
        .signal(3_999_999, SignalKind::Term, false)
        .await
        .unwrap();
    assert!(!result.owned);
    assert!(!result.delivered);
}

// ---------------------------------------------------------------------------
// Default working directory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_set_default_workdir_applies_to_executions() {
    let (supervisor, _store, _dir) = supervisor().await;
    supervisor.set_default_working_directory("/tmp").unwrap();
    let record = supervisor.execute(foreground("pwd")).await.unwrap();
    assert!(record.stdout.trim_end().ends_with("tmp"));
}

#[tokio::test]
async fn test_set_default_workdir_rejects_missing_dir() {
    let (supervisor, _store, _dir) = supervisor().await;
    let err = supervisor
        .set_default_working_directory("/not/a/real/dir")
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Param);
}

#[tokio::test]
async fn test_workdir_allow_list_enforced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = OutputStore::open(dir.path()).await.expect("open store");
    let settings = Settings {
        allowed_workdirs: vec!["/tmp".into()],
        ..Settings::default()
    };
    let supervisor = ExecutionSupervisor::new(settings, store);

    let ok = supervisor
        .execute(ExecuteOptions {
            command: "pwd".to_string(),
            working_directory: Some("/tmp".to_string()),
            mode: ExecutionMode::Foreground,
            ..ExecuteOptions::default()
        })
        .await;
    assert!(ok.is_ok());

    let err = supervisor
        .execute(ExecuteOptions {
            command: "pwd".to_string(),
            working_directory: Some("/usr".to_string()),
            mode: ExecutionMode::Foreground,
            ..ExecuteOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, "WORKDIR_NOT_ALLOWED");
}
