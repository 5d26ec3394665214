//! Execution supervisor: spawns commands and owns their lifecycle.
//!
//! One [`ExecutionRecord`] per spawn, driven through a mode state machine:
//! foreground waits to a deadline, background returns immediately, detached
//! disowns the child, and adaptive begins foreground then transitions to
//! background when the foreground deadline or the output-size cap is
//! crossed. Output is streamed by dedicated reader tasks into Output Store
//! artifacts, with a bounded inline prefix copied onto the record for caller
//! convenience. Children run in their own process group (`setsid`) so
//! termination can take the whole tree.

use crate::config::Settings;
use crate::error::{Result, ServiceError};
use crate::output;
use crate::store::{AppendHandle, ArtifactKind, OutputStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Grace period between TERM and KILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Allowed execute timeout range, seconds.
pub const MIN_TIMEOUT_SECONDS: u64 = 1;
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

/// Allowed foreground (adaptive) timeout range, seconds.
pub const MAX_FOREGROUND_TIMEOUT_SECONDS: u64 = 300;

/// Allowed max_output_size range, bytes.
pub const MIN_OUTPUT_SIZE: u64 = 1024;
pub const MAX_OUTPUT_SIZE: u64 = 100 * 1024 * 1024;

/// How a command is supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Foreground,
    Background,
    Detached,
    Adaptive,
}

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Why an adaptive execution left the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ForegroundTimeout,
    OutputSizeLimit,
}

/// Why captured output stopped short of the stream's end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    SizeLimit,
    Timeout,
    UserInterrupt,
    Error,
    BackgroundTransition,
}

/// Completeness of the output visible on the record.
#[derive(Debug, Clone, Serialize)]
pub struct OutputStatus {
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<IncompleteReason>,
    pub available_via_output_id: bool,
}

impl OutputStatus {
    fn pending() -> Self {
        Self {
            complete: false,
            reason: None,
            available_via_output_id: false,
        }
    }
}

/// The supervisor's handle on one spawned command.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub command: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    pub working_directory: String,
    /// Caller-supplied additions to the child environment.
    pub environment: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// Inline prefix of captured stdout (possibly truncated).
    pub stdout: String,
    /// Inline prefix of captured stderr (possibly truncated).
    pub stderr: String,
    pub output_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
    pub output_status: OutputStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_reason: Option<TransitionReason>,
}

/// Options for [`ExecutionSupervisor::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub command: String,
    pub mode: ExecutionMode,
    pub working_directory: Option<String>,
    pub environment: HashMap<String, String>,
    pub stdin_data: Option<String>,
    pub stdin_output_id: Option<String>,
    pub timeout_seconds: u64,
    pub foreground_timeout_seconds: u64,
    pub max_output_size: u64,
    pub capture_stderr: bool,
    pub return_partial_on_timeout: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            command: String::new(),
            mode: ExecutionMode::Foreground,
            working_directory: None,
            environment: HashMap::new(),
            stdin_data: None,
            stdin_output_id: None,
            timeout_seconds: 300,
            foreground_timeout_seconds: 30,
            max_output_size: 10 * 1024 * 1024,
            capture_stderr: true,
            return_partial_on_timeout: true,
        }
    }
}

/// Signals deliverable through [`ExecutionSupervisor::signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Term,
    Kill,
    Int,
    Hup,
    Usr1,
    Usr2,
}

impl SignalKind {
    fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            SignalKind::Term => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
            SignalKind::Int => Signal::SIGINT,
            SignalKind::Hup => Signal::SIGHUP,
            SignalKind::Usr1 => Signal::SIGUSR1,
            SignalKind::Usr2 => Signal::SIGUSR2,
        }
    }
}

/// Result of a signal delivery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SignalResult {
    pub process_id: u32,
    pub signal: SignalKind,
    pub delivered: bool,
    /// Whether the pid belongs to an execution this supervisor owns.
    pub owned: bool,
    pub escalated_to_kill: bool,
}

/// Filter for [`ExecutionSupervisor::list`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub command_pattern: Option<String>,
    pub terminal_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Shared capture state between reader tasks and the waiter.
struct CaptureShared {
    inline_stdout: Mutex<Vec<u8>>,
    inline_stderr: Mutex<Vec<u8>>,
    total_bytes: AtomicU64,
    truncated: AtomicBool,
    store_error: AtomicBool,
    size_exceeded: Notify,
    size_tripped: AtomicBool,
    max_output_size: u64,
    inline_cap: usize,
}

/// Everything the waiter needs to finish one spawned child.
struct RunningChild {
    execution_id: String,
    child: tokio::process::Child,
    pid: u32,
    readers: Vec<JoinHandle<()>>,
    handles: Vec<Arc<Mutex<AppendHandle>>>,
    /// Id of the combined (or stdout) artifact, captured at creation.
    primary_output_id: String,
    shared: Arc<CaptureShared>,
    started: Instant,
}

/// The execution supervisor. Exclusively owns all execution records.
pub struct ExecutionSupervisor {
    settings: Settings,
    store: OutputStore,
    records: Arc<Mutex<HashMap<String, ExecutionRecord>>>,
    default_workdir: std::sync::Mutex<Option<PathBuf>>,
    started_at: Instant,
}

impl ExecutionSupervisor {
    pub fn new(settings: Settings, store: OutputStore) -> Self {
        let default_workdir = settings.default_workdir.clone();
        Self {
            settings,
            store,
            records: Arc::new(Mutex::new(HashMap::new())),
            default_workdir: std::sync::Mutex::new(default_workdir),
            started_at: Instant::now(),
        }
    }

    /// Seconds since the supervisor came up (monitoring).
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Execute a command under the given mode. The returned record is the
    /// single response the caller gets: terminal for a finished foreground
    /// run, `running` for background/detached/transitioned-adaptive.
    pub async fn execute(&self, options: ExecuteOptions) -> Result<ExecutionRecord> {
        self.validate(&options)?;

        let workdir = self.resolve_workdir(options.working_directory.as_deref())?;

        // Resolve the stdin source before spawning: a missing artifact must
        // fail without side effects.
        let stdin_bytes: Option<Vec<u8>> = if let Some(id) = &options.stdin_output_id {
            Some(self.store.read_all(id).await?)
        } else {
            options.stdin_data.as_ref().map(|s| s.clone().into_bytes())
        };

        // Concurrency cap over currently running executions.
        {
            let records = self.records.lock().await;
            let running = records
                .values()
                .filter(|r| r.status == ExecutionStatus::Running)
                .count();
            if running >= self.settings.max_concurrent {
                return Err(ServiceError::resource(
                    "TOO_MANY_EXECUTIONS",
                    format!(
                        "{running}/{} executions already running",
                        self.settings.max_concurrent
                    ),
                ));
            }
        }

        let execution_id = format!("exec-{}", uuid::Uuid::new_v4());
        tracing::info!(
            execution_id = %execution_id,
            command = %options.command,
            mode = ?options.mode,
            "execute"
        );

        let mut run = self
            .spawn(&execution_id, &options, &workdir, stdin_bytes)
            .await?;

        // Register the record before waiting so concurrent `get` calls see it.
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            command: options.command.clone(),
            mode: options.mode,
            status: ExecutionStatus::Running,
            exit_code: None,
            process_id: Some(run.pid),
            working_directory: workdir.display().to_string(),
            environment: options.environment.clone(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            execution_time_ms: None,
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            output_id: Some(run.primary_output_id.clone()),
            output_status: OutputStatus::pending(),
            terminal_id: None,
            transition_reason: None,
        };
        self.records
            .lock()
            .await
            .insert(execution_id.clone(), record);

        match options.mode {
            ExecutionMode::Foreground => {
                self.wait_foreground(run, &options).await
            }
            ExecutionMode::Adaptive => self.wait_adaptive(run, &options).await,
            ExecutionMode::Background => {
                let records = self.records.clone();
                let overall = Duration::from_secs(options.timeout_seconds);
                tokio::spawn(async move {
                    finish_with_deadline(records, run, overall).await;
                });
                self.get(&execution_id).await
            }
            ExecutionMode::Detached => {
                // The parent makes no attempt to enforce a deadline; a
                // best-effort reap keeps the process table clean and may
                // reconcile the record's status after the fact.
                let records = self.records.clone();
                tokio::spawn(async move {
                    let status = run.child.wait().await;
                    for reader in run.readers.drain(..) {
                        let _ = reader.await;
                    }
                    finalize_handles(&mut run.handles).await;
                    if let Ok(status) = status {
                        complete_record(&records, &run, exit_outcome(status)).await;
                    }
                });
                self.get(&execution_id).await
            }
        }
    }

    /// Register an execution that was spawned into a PTY session instead of
    /// a pipe-backed child. The terminal owns the process; the record exists
    /// so the execution is listable and joinable to its session.
    pub async fn register_terminal_execution(
        &self,
        command: &str,
        terminal_id: &str,
        process_id: Option<u32>,
        working_directory: &str,
    ) -> ExecutionRecord {
        let execution_id = format!("exec-{}", uuid::Uuid::new_v4());
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            command: command.to_string(),
            mode: ExecutionMode::Background,
            status: ExecutionStatus::Running,
            exit_code: None,
            process_id,
            working_directory: working_directory.to_string(),
            environment: HashMap::new(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            execution_time_ms: None,
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            output_id: None,
            output_status: OutputStatus {
                complete: false,
                reason: None,
                available_via_output_id: false,
            },
            terminal_id: Some(terminal_id.to_string()),
            transition_reason: None,
        };
        self.records
            .lock()
            .await
            .insert(execution_id, record.clone());
        record
    }

    /// Look up one execution record.
    pub async fn get(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.records
            .lock()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| {
                ServiceError::resource(
                    "EXECUTION_NOT_FOUND",
                    format!("no execution with id '{execution_id}'"),
                )
            })
    }

    /// List executions, newest first, with the pre-pagination total.
    pub async fn list(&self, filter: &ExecutionFilter) -> (Vec<ExecutionRecord>, usize) {
        let records = self.records.lock().await;
        let mut matched: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| {
                filter.status.is_none_or(|s| r.status == s)
                    && filter
                        .command_pattern
                        .as_deref()
                        .is_none_or(|p| r.command.contains(p))
                    && filter
                        .terminal_id
                        .as_deref()
                        .is_none_or(|t| r.terminal_id.as_deref() == Some(t))
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len();
        let limit = if filter.limit == 0 { total } else { filter.limit };
        (
            matched.into_iter().skip(filter.offset).take(limit).collect(),
            total,
        )
    }

    /// Count of currently running executions (monitoring).
    pub async fn status_counts(&self) -> HashMap<String, usize> {
        let records = self.records.lock().await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for record in records.values() {
            let key = match record.status {
                ExecutionStatus::Running => "running",
                ExecutionStatus::Completed => "completed",
                ExecutionStatus::Failed => "failed",
                ExecutionStatus::Timeout => "timeout",
            };
            *counts.entry(key.to_string()).or_default() += 1;
        }
        counts
    }

    /// Deliver a signal to a process. If the supervisor owns the pid the
    /// whole process group is signaled; otherwise the bare pid is attempted
    /// and the result notes `owned=false`.
    pub async fn signal(
        &self,
        process_id: u32,
        signal: SignalKind,
        force: bool,
    ) -> Result<SignalResult> {
        let owned = {
            let records = self.records.lock().await;
            records
                .values()
                .any(|r| r.process_id == Some(process_id) && r.status == ExecutionStatus::Running)
        };

        let delivered = send_signal(process_id, signal.to_nix(), owned).is_ok();
        let mut escalated = false;

        if force && signal != SignalKind::Kill {
            tokio::time::sleep(KILL_GRACE).await;
            if process_alive(process_id) {
                escalated = send_signal(process_id, nix::sys::signal::Signal::SIGKILL, owned).is_ok();
            }
        }

        tracing::info!(pid = process_id, ?signal, delivered, owned, escalated, "signal");
        Ok(SignalResult {
            process_id,
            signal,
            delivered,
            owned,
            escalated_to_kill: escalated,
        })
    }

    /// Replace the default working directory (checked against the allow-list).
    pub fn set_default_working_directory(&self, path: &str) -> Result<PathBuf> {
        let path = PathBuf::from(path);
        if !path.is_dir() {
            return Err(ServiceError::param(
                "WORKDIR_NOT_ACCESSIBLE",
                format!("'{}' is not a directory", path.display()),
            ));
        }
        self.settings.check_workdir(&path)?;
        *self
            .default_workdir
            .lock()
            .expect("workdir lock poisoned") = Some(path.clone());
        Ok(path)
    }

    /// The current default working directory.
    #[must_use]
    pub fn default_working_directory(&self) -> Option<PathBuf> {
        self.default_workdir
            .lock()
            .expect("workdir lock poisoned")
            .clone()
    }

    /// TERM every running owned child (graceful shutdown path).
    pub async fn shutdown(&self) {
        let pids: Vec<u32> = {
            let records = self.records.lock().await;
            records
                .values()
                .filter(|r| r.status == ExecutionStatus::Running && r.terminal_id.is_none())
                .filter_map(|r| r.process_id)
                .collect()
        };
        for pid in pids {
            let _ = send_signal(pid, nix::sys::signal::Signal::SIGTERM, true);
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn validate(&self, options: &ExecuteOptions) -> Result<()> {
        if options.command.trim().is_empty() {
            return Err(ServiceError::param("EMPTY_COMMAND", "command must not be empty"));
        }
        if options.stdin_data.is_some() && options.stdin_output_id.is_some() {
            return Err(ServiceError::param(
                "STDIN_CONFLICT",
                "stdin_data and stdin_output_id are mutually exclusive",
            ));
        }
        if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&options.timeout_seconds) {
            return Err(ServiceError::param(
                "TIMEOUT_OUT_OF_RANGE",
                format!(
                    "timeout_seconds must be within {MIN_TIMEOUT_SECONDS}..={MAX_TIMEOUT_SECONDS}"
                ),
            ));
        }
        if !(MIN_TIMEOUT_SECONDS..=MAX_FOREGROUND_TIMEOUT_SECONDS)
            .contains(&options.foreground_timeout_seconds)
        {
            return Err(ServiceError::param(
                "TIMEOUT_OUT_OF_RANGE",
                format!(
                    "foreground_timeout_seconds must be within \
                     {MIN_TIMEOUT_SECONDS}..={MAX_FOREGROUND_TIMEOUT_SECONDS}"
                ),
            ));
        }
        if !(MIN_OUTPUT_SIZE..=MAX_OUTPUT_SIZE).contains(&options.max_output_size) {
            return Err(ServiceError::param(
                "OUTPUT_SIZE_OUT_OF_RANGE",
                format!("max_output_size must be within {MIN_OUTPUT_SIZE}..={MAX_OUTPUT_SIZE}"),
            ));
        }
        if options.mode == ExecutionMode::Adaptive
            && options.timeout_seconds <= options.foreground_timeout_seconds
        {
            return Err(ServiceError::param(
                "TIMEOUT_OUT_OF_RANGE",
                "adaptive mode requires timeout_seconds > foreground_timeout_seconds",
            ));
        }
        Ok(())
    }

    fn resolve_workdir(&self, requested: Option<&str>) -> Result<PathBuf> {
        let path = match requested {
            Some(dir) => PathBuf::from(dir),
            None => match self.default_working_directory() {
                Some(dir) => dir,
                None => std::env::current_dir().map_err(|e| {
                    ServiceError::system("CWD_UNAVAILABLE", e.to_string())
                })?,
            },
        };
        if !path.is_dir() {
            return Err(ServiceError::execution(
                "WORKDIR_NOT_ACCESSIBLE",
                format!("working directory '{}' does not exist", path.display()),
            ));
        }
        self.settings.check_workdir(&path)?;
        Ok(path)
    }

    async fn spawn(
        &self,
        execution_id: &str,
        options: &ExecuteOptions,
        workdir: &PathBuf,
        stdin_bytes: Option<Vec<u8>>,
    ) -> Result<RunningChild> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&options.command);
        cmd.current_dir(workdir);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if stdin_bytes.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(false);

        for (key, _) in std::env::vars() {
            if self.settings.is_stripped_env(&key) {
                cmd.env_remove(&key);
            }
        }
        cmd.envs(&options.environment);

        // New process group so termination can take the whole tree. For
        // detached mode this also severs the controlling terminal.
        // SAFETY: pre_exec runs between fork and exec in the child.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            ServiceError::execution(
                "SPAWN_FAILED",
                format!("failed to spawn '{}': {e}", options.command),
            )
            .with_details(serde_json::json!({ "os_error": e.raw_os_error() }))
        })?;
        let pid = child.id().ok_or_else(|| {
            ServiceError::execution("SPAWN_FAILED", "child exited before it could be tracked")
        })?;

        if let (Some(bytes), Some(mut stdin)) = (stdin_bytes, child.stdin.take()) {
            // Feed stdin from a task so a child that never reads cannot
            // deadlock the supervisor; stdin closes at end-of-bytes.
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            });
        }

        let shared = Arc::new(CaptureShared {
            inline_stdout: Mutex::new(Vec::new()),
            inline_stderr: Mutex::new(Vec::new()),
            total_bytes: AtomicU64::new(0),
            truncated: AtomicBool::new(false),
            store_error: AtomicBool::new(false),
            size_exceeded: Notify::new(),
            size_tripped: AtomicBool::new(false),
            max_output_size: options.max_output_size,
            inline_cap: self.settings.inline_output_cap,
        });

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let mut readers = Vec::new();
        let mut handles = Vec::new();
        let primary_output_id;
        if options.capture_stderr {
            // One combined artifact; both streams share its writer.
            let combined = self
                .store
                .create(Some(execution_id), ArtifactKind::Combined, None)
                .await?;
            primary_output_id = combined.output_id().to_string();
            let handle = Arc::new(Mutex::new(combined));
            handles.push(handle.clone());
            readers.push(spawn_drain(stdout, handle.clone(), shared.clone(), true));
            readers.push(spawn_drain(stderr, handle, shared.clone(), false));
        } else {
            let out = self
                .store
                .create(Some(execution_id), ArtifactKind::Stdout, None)
                .await?;
            primary_output_id = out.output_id().to_string();
            let out_handle = Arc::new(Mutex::new(out));
            let err_handle = Arc::new(Mutex::new(
                self.store
                    .create(Some(execution_id), ArtifactKind::Stderr, None)
                    .await?,
            ));
            handles.push(out_handle.clone());
            handles.push(err_handle.clone());
            readers.push(spawn_drain(stdout, out_handle, shared.clone(), true));
            readers.push(spawn_drain(stderr, err_handle, shared.clone(), false));
        }

        Ok(RunningChild {
            execution_id: execution_id.to_string(),
            child,
            pid,
            readers,
            handles,
            primary_output_id,
            shared,
            started: Instant::now(),
        })
    }

    async fn wait_foreground(
        &self,
        mut run: RunningChild,
        options: &ExecuteOptions,
    ) -> Result<ExecutionRecord> {
        let deadline = Duration::from_secs(options.timeout_seconds);
        let execution_id = run.execution_id.clone();

        tokio::select! {
            status = run.child.wait() => {
                let outcome = match status {
                    Ok(status) => exit_outcome(status),
                    Err(e) => ExitOutcome::Lost(e.to_string()),
                };
                settle(&self.records, &mut run, outcome).await;
                self.get(&execution_id).await
            }
            () = tokio::time::sleep(deadline) => {
                tracing::warn!(execution_id = %execution_id, "foreground deadline expired");
                terminate_child(&mut run.child, run.pid).await;
                settle(&self.records, &mut run, ExitOutcome::TimedOut).await;
                if options.return_partial_on_timeout {
                    self.get(&execution_id).await
                } else {
                    Err(ServiceError::execution(
                        "EXECUTION_TIMEOUT",
                        format!(
                            "command did not finish within {}s",
                            options.timeout_seconds
                        ),
                    )
                    .with_details(serde_json::json!({ "execution_id": execution_id })))
                }
            }
        }
    }

    async fn wait_adaptive(
        &self,
        mut run: RunningChild,
        options: &ExecuteOptions,
    ) -> Result<ExecutionRecord> {
        let foreground = Duration::from_secs(options.foreground_timeout_seconds);
        let execution_id = run.execution_id.clone();
        let shared = run.shared.clone();

        let transition = tokio::select! {
            status = run.child.wait() => {
                let outcome = match status {
                    Ok(status) => exit_outcome(status),
                    Err(e) => ExitOutcome::Lost(e.to_string()),
                };
                settle(&self.records, &mut run, outcome).await;
                return self.get(&execution_id).await;
            }
            () = tokio::time::sleep(foreground) => TransitionReason::ForegroundTimeout,
            () = shared.size_exceeded.notified() => TransitionReason::OutputSizeLimit,
        };

        tracing::info!(execution_id = %execution_id, ?transition, "adaptive transition to background");

        // Mark the transition on the record, then snapshot it as the single
        // response: status stays running, the output id points at the
        // artifact the capture tasks keep feeding.
        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.get_mut(&execution_id) {
                record.transition_reason = Some(transition);
                record.output_status = OutputStatus {
                    complete: false,
                    reason: Some(IncompleteReason::BackgroundTransition),
                    available_via_output_id: true,
                };
                copy_inline(record, &run.shared).await;
            }
        }
        let snapshot = self.get(&execution_id).await?;

        let records = self.records.clone();
        let remaining = Duration::from_secs(options.timeout_seconds)
            .saturating_sub(run.started.elapsed());
        tokio::spawn(async move {
            finish_with_deadline(records, run, remaining).await;
        });

        Ok(snapshot)
    }
}

enum ExitOutcome {
    Exited(i32),
    TimedOut,
    Lost(String),
}

fn exit_outcome(status: std::process::ExitStatus) -> ExitOutcome {
    ExitOutcome::Exited(status.code().unwrap_or(-1))
}

/// Spawn a reader task draining one stream into an artifact handle and the
/// inline buffers.
fn spawn_drain(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    handle: Arc<Mutex<AppendHandle>>,
    shared: Arc<CaptureShared>,
    is_stdout: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = stream;
        let mut buf = [0u8; 8192];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            let chunk = &buf[..n];

            if let Err(e) = handle.lock().await.append(chunk).await {
                // Keep draining so the child doesn't block on a full pipe,
                // but remember that the artifact is short.
                if !shared.store_error.swap(true, Ordering::SeqCst) {
                    tracing::warn!(error = %e, "artifact append failed; output incomplete");
                }
            }

            {
                let mut inline = if is_stdout {
                    shared.inline_stdout.lock().await
                } else {
                    shared.inline_stderr.lock().await
                };
                if output::append_inline(&mut inline, chunk, shared.inline_cap) {
                    shared.truncated.store(true, Ordering::SeqCst);
                }
            }

            let total = shared
                .total_bytes
                .fetch_add(n as u64, Ordering::SeqCst)
                + n as u64;
            if total > shared.max_output_size
                && !shared.size_tripped.swap(true, Ordering::SeqCst)
            {
                // notify_one stores a permit, so the transition fires even if
                // the waiter hasn't been polled yet.
                shared.size_exceeded.notify_one();
            }
        }
    })
}

async fn finalize_handles(handles: &mut Vec<Arc<Mutex<AppendHandle>>>) {
    for handle in handles.drain(..) {
        if let Ok(mutex) = Arc::try_unwrap(handle) {
            if let Err(e) = mutex.into_inner().finalize().await {
                tracing::warn!(error = %e, "artifact finalize failed");
            }
        }
    }
}

/// Copy the inline capture buffers onto a record.
async fn copy_inline(record: &mut ExecutionRecord, shared: &Arc<CaptureShared>) {
    record.stdout = String::from_utf8_lossy(&shared.inline_stdout.lock().await).to_string();
    record.stderr = String::from_utf8_lossy(&shared.inline_stderr.lock().await).to_string();
    record.output_truncated = shared.truncated.load(Ordering::SeqCst);
    if record.output_truncated {
        record.output_status.available_via_output_id = true;
    }
}

/// Drive a child that already left the caller's control (background mode or
/// post-transition adaptive) to a terminal state, enforcing the remaining
/// deadline.
async fn finish_with_deadline(
    records: Arc<Mutex<HashMap<String, ExecutionRecord>>>,
    mut run: RunningChild,
    deadline: Duration,
) {
    let outcome = match tokio::time::timeout(deadline, run.child.wait()).await {
        Ok(Ok(status)) => exit_outcome(status),
        Ok(Err(e)) => ExitOutcome::Lost(e.to_string()),
        Err(_) => {
            tracing::warn!(execution_id = %run.execution_id, "deadline expired in background");
            terminate_child(&mut run.child, run.pid).await;
            ExitOutcome::TimedOut
        }
    };
    settle(&records, &mut run, outcome).await;
}

/// Join readers, finalize artifacts, and write the terminal record state.
async fn settle(
    records: &Arc<Mutex<HashMap<String, ExecutionRecord>>>,
    run: &mut RunningChild,
    outcome: ExitOutcome,
) {
    for reader in run.readers.drain(..) {
        let _ = reader.await;
    }
    finalize_handles(&mut run.handles).await;
    complete_record(records, run, outcome).await;
}

async fn complete_record(
    records: &Arc<Mutex<HashMap<String, ExecutionRecord>>>,
    run: &RunningChild,
    outcome: ExitOutcome,
) {
    let mut records = records.lock().await;
    let Some(record) = records.get_mut(&run.execution_id) else {
        return;
    };
    copy_inline(record, &run.shared).await;
    record.completed_at = Some(Utc::now());
    record.execution_time_ms = Some(run.started.elapsed().as_millis() as u64);

    let store_error = run.shared.store_error.load(Ordering::SeqCst);
    match outcome {
        ExitOutcome::Exited(code) => {
            record.status = if code == 0 {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            };
            record.exit_code = Some(code);
            record.output_status = OutputStatus {
                complete: !store_error,
                reason: store_error.then_some(IncompleteReason::Error),
                available_via_output_id: record.output_id.is_some(),
            };
        }
        ExitOutcome::TimedOut => {
            record.status = ExecutionStatus::Timeout;
            record.output_status = OutputStatus {
                complete: false,
                reason: Some(IncompleteReason::Timeout),
                available_via_output_id: record.output_id.is_some(),
            };
        }
        ExitOutcome::Lost(error) => {
            record.status = ExecutionStatus::Failed;
            record.output_status = OutputStatus {
                complete: false,
                reason: Some(IncompleteReason::Error),
                available_via_output_id: record.output_id.is_some(),
            };
            tracing::error!(execution_id = %record.execution_id, error = %error, "child wait failed");
        }
    }
    tracing::info!(
        execution_id = %record.execution_id,
        status = ?record.status,
        exit_code = ?record.exit_code,
        "execution settled"
    );
}

/// TERM the child's process group, escalate to KILL after the grace period.
async fn terminate_child(child: &mut tokio::process::Child, pid: u32) {
    let _ = send_signal(pid, nix::sys::signal::Signal::SIGTERM, true);
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = send_signal(pid, nix::sys::signal::Signal::SIGKILL, true);
        let _ = child.wait().await;
    }
}

/// Send a signal to a pid, or to its whole process group when owned (our
/// children call `setsid`, so the child pid is the group id).
fn send_signal(pid: u32, signal: nix::sys::signal::Signal, group: bool) -> nix::Result<()> {
    let raw = pid as i32;
    let target = if group { -raw } else { raw };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(target), signal)
}

/// Whether a process still exists (signal 0 probe).
fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}
