//! MCP server: tool definitions using rmcp macros.
//!
//! Defines `McpShellServer` with MCP tools for:
//! - Supervised execution: `shell_execute`, `process_get_execution`,
//!   `process_list`, `process_terminate`, `process_monitor`,
//!   `shell_set_default_workdir`
//! - Output artifacts: `list_execution_outputs`, `read_execution_output`,
//!   `delete_execution_outputs`
//! - PTY sessions: `terminal_create`, `terminal_list`, `terminal_get_info`,
//!   `terminal_send_input`, `terminal_get_output`, `terminal_resize`,
//!   `terminal_close`
//! - Safety and monitoring: `security_set_restrictions`, `monitoring_get_stats`
//!
//! Every tool validates its arguments, dispatches to a core component, and
//! wraps the result in a uniform `{success, ...}` envelope. Safety
//! short-circuits (`need_user_confirm` etc.) are status envelopes, not
//! errors; denials and failures are categorized error envelopes.

use crate::config::Settings;
use crate::error::ServiceError;
use crate::evaluator::{SafetyEvaluator, SafetyOutcome, SafetyResult};
use crate::history::{CommandHistory, HistoryEntry};
use crate::safety::{SafetyRestrictions, SecurityMode};
use crate::store::{ArtifactFilter, ArtifactKind, OutputStore};
use crate::supervisor::{
    ExecuteOptions, ExecutionFilter, ExecutionMode, ExecutionStatus, ExecutionSupervisor,
    SignalKind,
};
use crate::terminal::{
    CreateTerminalOptions, Dimensions, SendInputOptions, ShellType, TerminalManager,
};
use crate::procinfo::ProcScanner;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default execute timeout in seconds.
const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Default adaptive foreground deadline in seconds.
const DEFAULT_FOREGROUND_TIMEOUT_SECONDS: u64 = 30;

/// Default output-size cap in bytes.
const DEFAULT_MAX_OUTPUT_SIZE: u64 = 10 * 1024 * 1024;

/// Default scrollback lines per read.
const DEFAULT_LINE_COUNT: usize = 100;

/// Default bytes per artifact read.
const DEFAULT_READ_SIZE: u64 = 64 * 1024;

/// Cap on list page sizes.
const MAX_LIST_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `shell_execute` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ShellExecuteParams {
    /// The shell command to execute (passed to /bin/sh -c).
    pub command: String,
    /// Execution mode. Defaults to adaptive (foreground with automatic
    /// transition to background on deadline or output size).
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    /// Working directory for the command. Defaults to the configured default.
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub environment: Option<HashMap<String, String>>,
    /// Literal bytes written to the child's stdin. Mutually exclusive with
    /// stdin_output_id.
    #[serde(default)]
    pub stdin_data: Option<String>,
    /// Output artifact whose bytes become the child's stdin. Mutually
    /// exclusive with stdin_data.
    #[serde(default)]
    pub stdin_output_id: Option<String>,
    /// Overall timeout in seconds (1..=3600). Defaults to 300.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Adaptive foreground deadline in seconds (1..=300). Defaults to 30.
    #[serde(default)]
    pub foreground_timeout_seconds: Option<u64>,
    /// Output cap in bytes (1024..=104857600). Defaults to 10 MiB.
    #[serde(default)]
    pub max_output_size: Option<u64>,
    /// Merge stderr into the combined output stream. Defaults to true.
    #[serde(default)]
    pub capture_stderr: Option<bool>,
    /// On foreground timeout, return the partial output instead of an error.
    /// Defaults to true.
    #[serde(default)]
    pub return_partial_on_timeout: Option<bool>,
    /// Spawn the command into a new PTY session instead of a pipe.
    #[serde(default)]
    pub create_terminal: Option<bool>,
    /// Shell for the PTY session when create_terminal is set.
    #[serde(default)]
    pub terminal_shell: Option<ShellType>,
    /// Dimensions for the PTY session when create_terminal is set.
    #[serde(default)]
    pub terminal_dimensions: Option<Dimensions>,
    /// Free-form comment passed to the safety evaluator explaining intent.
    #[serde(default)]
    pub comment: Option<String>,
    /// Route the command to user confirmation regardless of classification.
    #[serde(default)]
    pub force_user_confirm: Option<bool>,
}

/// Parameters for the `process_get_execution` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct GetExecutionParams {
    /// ID of the execution to fetch.
    pub execution_id: String,
}

/// Parameters for the `shell_set_default_workdir` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SetDefaultWorkdirParams {
    /// New default working directory; must be inside the allowed list if one
    /// is configured.
    pub path: String,
}

/// Parameters for the `process_list` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ProcessListParams {
    /// Filter by status (running/completed/failed/timeout).
    #[serde(default)]
    pub status: Option<String>,
    /// Substring filter on the command string.
    #[serde(default)]
    pub command_pattern: Option<String>,
    /// Filter to executions attached to a terminal session.
    #[serde(default)]
    pub terminal_id: Option<String>,
    /// Page size (1..=100). Defaults to 20.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Page offset. Defaults to 0.
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Parameters for the `process_terminate` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ProcessTerminateParams {
    /// Target process id.
    pub process_id: u32,
    /// Signal to deliver. Defaults to TERM.
    #[serde(default)]
    pub signal: Option<SignalKind>,
    /// Escalate to KILL if the process survives the grace period.
    #[serde(default)]
    pub force: Option<bool>,
}

/// Parameters for the `process_monitor` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ProcessMonitorParams {
    /// ID of the execution to snapshot.
    pub execution_id: String,
    /// How many trailing inline output lines to include. Defaults to 20.
    #[serde(default)]
    pub tail_lines: Option<usize>,
}

/// Parameters for the `list_execution_outputs` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ListOutputsParams {
    /// Filter by originating execution.
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Filter by artifact kind.
    #[serde(default)]
    pub kind: Option<ArtifactKind>,
    /// Page size (1..=100). Defaults to 20.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Page offset. Defaults to 0.
    #[serde(default)]
    pub offset: Option<usize>,
    /// Include cleanup suggestions for large or old artifacts.
    #[serde(default)]
    pub include_cleanup_suggestions: Option<bool>,
    /// Size threshold in MiB for cleanup suggestions.
    #[serde(default)]
    pub cleanup_max_size_mb: Option<u64>,
    /// Age threshold in hours for cleanup suggestions.
    #[serde(default)]
    pub cleanup_max_age_hours: Option<u64>,
}

/// Parameters for the `read_execution_output` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ReadOutputParams {
    /// ID of the artifact to read.
    pub output_id: String,
    /// Byte offset to start at. Defaults to 0.
    #[serde(default)]
    pub offset: Option<u64>,
    /// Number of bytes to read. Defaults to 65536.
    #[serde(default)]
    pub size: Option<u64>,
    /// Output encoding: "utf-8" (lossy, default) or "hex".
    #[serde(default)]
    pub encoding: Option<String>,
}

/// Parameters for the `delete_execution_outputs` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct DeleteOutputsParams {
    /// IDs of the artifacts to delete.
    #[serde(default)]
    pub output_ids: Vec<String>,
    /// Must be true for anything to be removed.
    #[serde(default)]
    pub confirm: Option<bool>,
    /// Run age-based auto-cleanup instead of (or alongside) explicit ids.
    #[serde(default)]
    pub auto_cleanup: Option<bool>,
    /// Age threshold in hours for auto-cleanup. Defaults to 24.
    #[serde(default)]
    pub max_age_hours: Option<u64>,
    /// Report what auto-cleanup would remove without removing it.
    #[serde(default)]
    pub dry_run: Option<bool>,
    /// Keep at least this many newest artifacts. Defaults to 10.
    #[serde(default)]
    pub preserve_recent: Option<usize>,
}

/// Parameters for the `terminal_create` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TerminalCreateParams {
    /// Optional human-readable session name.
    #[serde(default)]
    pub session_name: Option<String>,
    /// Shell to run. Defaults to bash.
    #[serde(default)]
    pub shell_type: Option<ShellType>,
    /// Terminal dimensions. Defaults to 120x30.
    #[serde(default)]
    pub dimensions: Option<Dimensions>,
    /// Initial working directory.
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Extra environment variables for the shell.
    #[serde(default)]
    pub environment: Option<HashMap<String, String>>,
    /// Write scrollback to a history file when the session closes.
    #[serde(default)]
    pub auto_save_history: Option<bool>,
}

/// Parameters for the `terminal_list` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TerminalListParams {
    /// Filter by status (active/idle/closed).
    #[serde(default)]
    pub status: Option<String>,
}

/// Parameters for the `terminal_get_info` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TerminalGetInfoParams {
    /// ID of the terminal session.
    pub terminal_id: String,
}

/// Parameters for the `terminal_send_input` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TerminalSendInputParams {
    /// ID of the terminal session.
    pub terminal_id: String,
    /// The input to send.
    pub input: String,
    /// Append a newline so the shell executes the input. Defaults to true.
    #[serde(default)]
    pub execute: Option<bool>,
    /// Interpret the input as a control-code escape grammar (^C, \n, \xHH,
    /// \uHHHH). Implicitly bypasses the unread-output interlock.
    #[serde(default)]
    pub control_codes: Option<bool>,
    /// Interpret the input as a hex byte string.
    #[serde(default)]
    pub raw_bytes: Option<bool>,
    /// Program guard: "*", a process name, an absolute executable path,
    /// "pid:<N>", or "sessionleader:". Input is rejected unless the
    /// session's foreground process matches.
    #[serde(default)]
    pub send_to: Option<String>,
    /// Send even if prior output is unread.
    #[serde(default)]
    pub force_input: Option<bool>,
}

/// Parameters for the `terminal_get_output` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TerminalGetOutputParams {
    /// ID of the terminal session.
    pub terminal_id: String,
    /// Absolute line to start from. Omit to continue from the session's
    /// read cursor.
    #[serde(default)]
    pub start_line: Option<u64>,
    /// Lines to return (1..=10000). Defaults to 100.
    #[serde(default)]
    pub line_count: Option<usize>,
    /// Keep ANSI escape sequences in the returned lines. Defaults to false.
    #[serde(default)]
    pub include_ansi: Option<bool>,
    /// Attach a foreground-process snapshot. Defaults to false.
    #[serde(default)]
    pub include_foreground_process: Option<bool>,
}

/// Parameters for the `terminal_resize` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TerminalResizeParams {
    /// ID of the terminal session.
    pub terminal_id: String,
    /// New dimensions (1..=500 columns by 1..=200 rows).
    pub dimensions: Dimensions,
}

/// Parameters for the `terminal_close` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TerminalCloseParams {
    /// ID of the terminal session.
    pub terminal_id: String,
    /// Write scrollback to a history file before closing.
    #[serde(default)]
    pub save_history: Option<bool>,
}

/// Parameters for the `security_set_restrictions` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SetRestrictionsParams {
    /// Security posture: permissive, moderate, restrictive, custom,
    /// enhanced, or enhanced-fast.
    pub security_mode: SecurityMode,
    /// Only these command words may run (first-word match).
    #[serde(default)]
    pub allowed_commands: Option<Vec<String>>,
    /// These command words are always denied.
    #[serde(default)]
    pub blocked_commands: Option<Vec<String>>,
    /// Directories executions may run in.
    #[serde(default)]
    pub allowed_directories: Option<Vec<String>>,
    /// Cap on execution time in seconds.
    #[serde(default)]
    pub max_execution_time: Option<u64>,
    /// Cap on child memory in MiB (advisory).
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    /// Whether network-using commands are permitted.
    #[serde(default)]
    pub enable_network: Option<bool>,
}

/// Parameters for the `monitoring_get_stats` tool.
#[derive(Debug, Default, serde::Deserialize, schemars::JsonSchema)]
pub struct GetStatsParams {}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The mcp-shell MCP server: thin dispatch from tool calls to the core
/// components, which it holds by shared handle only.
#[derive(Clone)]
pub struct McpShellServer {
    supervisor: Arc<ExecutionSupervisor>,
    terminals: Arc<TerminalManager>,
    store: OutputStore,
    evaluator: Arc<SafetyEvaluator>,
    history: Arc<Mutex<CommandHistory>>,
    tool_router: ToolRouter<McpShellServer>,
}

impl McpShellServer {
    /// Build the server and its core components from settings.
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let store = OutputStore::open(settings.output_root.clone()).await?;
        let history = Arc::new(Mutex::new(CommandHistory::new(settings.max_history_entries)));
        let evaluator = Arc::new(SafetyEvaluator::new(
            history.clone(),
            settings.evaluator_timeout_seconds,
        ));
        let supervisor = Arc::new(ExecutionSupervisor::new(settings.clone(), store.clone()));
        let terminals = Arc::new(TerminalManager::new(Arc::new(ProcScanner::new())));

        let mut tool_router = Self::tool_router();
        for tool in &settings.disabled_tools {
            tool_router.remove_route(tool.as_str());
            tracing::info!(tool = %tool, "tool disabled via MCP_DISABLED_TOOLS");
        }

        Ok(Self {
            supervisor,
            terminals,
            store,
            evaluator,
            history,
            tool_router,
        })
    }

    /// The execution supervisor (shutdown path).
    #[must_use]
    pub fn supervisor(&self) -> Arc<ExecutionSupervisor> {
        self.supervisor.clone()
    }

    /// The terminal manager (shutdown path).
    #[must_use]
    pub fn terminals(&self) -> Arc<TerminalManager> {
        self.terminals.clone()
    }

    /// The safety evaluator (external callback registration).
    #[must_use]
    pub fn evaluator(&self) -> Arc<SafetyEvaluator> {
        self.evaluator.clone()
    }
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// Wrap a payload in the uniform success envelope.
fn ok_envelope(mut payload: serde_json::Value) -> Result<CallToolResult, McpError> {
    if let Some(object) = payload.as_object_mut() {
        object.insert("success".to_string(), serde_json::Value::Bool(true));
    }
    json_content(&payload)
}

/// Translate a core error into a categorized error envelope.
fn err_envelope(error: &ServiceError) -> Result<CallToolResult, McpError> {
    let body = serde_json::json!({
        "success": false,
        "error": error.envelope(),
    });
    let json = serde_json::to_string_pretty(&body)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::error(vec![Content::text(json)]))
}

/// Envelope for safety outcomes that suspend rather than deny.
fn safety_envelope(evaluation: &SafetyResult) -> Result<CallToolResult, McpError> {
    let status = match evaluation.outcome {
        SafetyOutcome::NeedUserConfirm => "need_user_confirm",
        SafetyOutcome::NeedAssistantConfirm => "need_assistant_confirm",
        SafetyOutcome::NeedMoreHistory => "need_more_history",
        SafetyOutcome::Allow | SafetyOutcome::Deny => "resolved",
    };
    json_content(&serde_json::json!({
        "success": false,
        "status": status,
        "evaluation": evaluation,
    }))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(20).clamp(1, MAX_LIST_LIMIT)
}

fn parse_execution_status(raw: &str) -> Option<ExecutionStatus> {
    match raw {
        "running" => Some(ExecutionStatus::Running),
        "completed" => Some(ExecutionStatus::Completed),
        "failed" => Some(ExecutionStatus::Failed),
        "timeout" => Some(ExecutionStatus::Timeout),
        _ => None,
    }
}

#[tool_router]
impl McpShellServer {
    #[tool(
        description = "Execute a shell command under supervision. Every command passes the safety evaluator first; only an allow verdict spawns. Modes: adaptive (default -- starts synchronous, automatically transitions to background if the foreground deadline or output size cap is crossed, returning status=running with an output_id to stream the rest), foreground (block until exit or timeout), background (return immediately), detached (own session, fire and forget). Pipe a previous execution's output into stdin with stdin_output_id. Returns the execution record with inline stdout/stderr prefix and an output_id for the complete bytes."
    )]
    async fn shell_execute(
        &self,
        Parameters(params): Parameters<ShellExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        if params.command.trim().is_empty() {
            return err_envelope(&ServiceError::param(
                "EMPTY_COMMAND",
                "command must not be empty",
            ));
        }

        let workdir_label = params
            .working_directory
            .clone()
            .or_else(|| {
                self.supervisor
                    .default_working_directory()
                    .map(|p| p.display().to_string())
            })
            .unwrap_or_default();

        tracing::info!(command = %params.command, "shell_execute");

        // Safety first: nothing spawns without an explicit allow.
        let evaluation = match self
            .evaluator
            .evaluate(
                &params.command,
                &workdir_label,
                params.comment.as_deref(),
                params.force_user_confirm.unwrap_or(false),
            )
            .await
        {
            Ok(evaluation) => evaluation,
            Err(e) => return err_envelope(&e),
        };

        let mut entry = HistoryEntry {
            execution_id: String::new(),
            command: params.command.clone(),
            timestamp: chrono::Utc::now(),
            working_directory: workdir_label.clone(),
            safety_classification: evaluation.classification.clone(),
            was_executed: false,
            resubmission_count: evaluation.resubmission_count,
            output_summary: None,
            user_confirmation_context: None,
        };

        match evaluation.outcome {
            SafetyOutcome::Allow => {}
            SafetyOutcome::Deny => {
                self.history.lock().await.add(entry);
                return err_envelope(
                    &ServiceError::security("COMMAND_DENIED", evaluation.reasoning.clone())
                        .with_details(serde_json::json!({ "evaluation": evaluation })),
                );
            }
            _ => {
                self.history.lock().await.add(entry);
                return safety_envelope(&evaluation);
            }
        }

        // PTY-backed execution: create the session and type the command as
        // its first input.
        if params.create_terminal.unwrap_or(false) {
            let created = self
                .terminals
                .create(CreateTerminalOptions {
                    session_name: None,
                    shell_type: params.terminal_shell,
                    dimensions: params.terminal_dimensions,
                    working_directory: params.working_directory.clone(),
                    environment: params.environment.clone().unwrap_or_default(),
                    auto_save_history: false,
                })
                .await;
            let info = match created {
                Ok(info) => info,
                Err(e) => return err_envelope(&e),
            };
            let sent = self
                .terminals
                .send_input(
                    &info.terminal_id,
                    SendInputOptions {
                        input: params.command.clone(),
                        execute: true,
                        force_input: true,
                        ..SendInputOptions::default()
                    },
                )
                .await;
            if let Err(e) = sent {
                return err_envelope(&e);
            }
            let record = self
                .supervisor
                .register_terminal_execution(
                    &params.command,
                    &info.terminal_id,
                    info.process_id,
                    &info.working_directory,
                )
                .await;
            entry.execution_id = record.execution_id.clone();
            entry.was_executed = true;
            self.history.lock().await.add(entry);
            return ok_envelope(serde_json::json!({
                "execution": record,
                "terminal": info,
            }));
        }

        let options = ExecuteOptions {
            command: params.command.clone(),
            mode: params.mode.unwrap_or(ExecutionMode::Adaptive),
            working_directory: params.working_directory.clone(),
            environment: params.environment.clone().unwrap_or_default(),
            stdin_data: params.stdin_data.clone(),
            stdin_output_id: params.stdin_output_id.clone(),
            timeout_seconds: params.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            foreground_timeout_seconds: params
                .foreground_timeout_seconds
                .unwrap_or(DEFAULT_FOREGROUND_TIMEOUT_SECONDS),
            max_output_size: params.max_output_size.unwrap_or(DEFAULT_MAX_OUTPUT_SIZE),
            capture_stderr: params.capture_stderr.unwrap_or(true),
            return_partial_on_timeout: params.return_partial_on_timeout.unwrap_or(true),
        };

        match self.supervisor.execute(options).await {
            Ok(record) => {
                entry.execution_id = record.execution_id.clone();
                entry.was_executed = true;
                entry.output_summary = record
                    .stdout
                    .lines()
                    .next()
                    .map(|l| l.chars().take(120).collect());
                self.history.lock().await.add(entry);
                ok_envelope(serde_json::json!({ "execution": record }))
            }
            Err(e) => {
                self.history.lock().await.add(entry);
                err_envelope(&e)
            }
        }
    }

    #[tool(
        description = "Fetch the current record of one execution by its execution_id: status (running/completed/failed/timeout), exit code, timing, inline output prefix, and the output_id holding the complete bytes."
    )]
    async fn process_get_execution(
        &self,
        Parameters(params): Parameters<GetExecutionParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.supervisor.get(&params.execution_id).await {
            Ok(record) => ok_envelope(serde_json::json!({ "execution": record })),
            Err(e) => err_envelope(&e),
        }
    }

    #[tool(
        description = "Set the default working directory used by executions that don't specify one. The path must be inside the configured allow-list."
    )]
    async fn shell_set_default_workdir(
        &self,
        Parameters(params): Parameters<SetDefaultWorkdirParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.supervisor.set_default_working_directory(&params.path) {
            Ok(path) => ok_envelope(serde_json::json!({
                "default_working_directory": path.display().to_string(),
            })),
            Err(e) => err_envelope(&e),
        }
    }

    #[tool(
        description = "List executions with optional filters (status, command substring, terminal session) and pagination. Returns records newest first plus the total match count."
    )]
    async fn process_list(
        &self,
        Parameters(params): Parameters<ProcessListParams>,
    ) -> Result<CallToolResult, McpError> {
        let status = match params.status.as_deref() {
            None => None,
            Some(raw) => match parse_execution_status(raw) {
                Some(status) => Some(status),
                None => {
                    return err_envelope(&ServiceError::param(
                        "INVALID_STATUS",
                        format!("unknown status '{raw}'"),
                    ));
                }
            },
        };
        let filter = ExecutionFilter {
            status,
            command_pattern: params.command_pattern,
            terminal_id: params.terminal_id,
            limit: clamp_limit(params.limit),
            offset: params.offset.unwrap_or(0),
        };
        let (records, total) = self.supervisor.list(&filter).await;
        ok_envelope(serde_json::json!({
            "executions": records,
            "total": total,
        }))
    }

    #[tool(
        description = "Send a signal (TERM, KILL, INT, HUP, USR1, USR2) to a process. force=true escalates to KILL if the process survives a ~2s grace period. Works on any pid, but the result notes whether this server owns it."
    )]
    async fn process_terminate(
        &self,
        Parameters(params): Parameters<ProcessTerminateParams>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .supervisor
            .signal(
                params.process_id,
                params.signal.unwrap_or(SignalKind::Term),
                params.force.unwrap_or(false),
            )
            .await;
        match result {
            Ok(result) => ok_envelope(serde_json::json!({ "signal": result })),
            Err(e) => err_envelope(&e),
        }
    }

    #[tool(
        description = "Non-blocking snapshot of one execution: status, runtime, recent inline output lines, pid, and output_id. Use to watch a background or transitioned-adaptive execution without fetching the full record."
    )]
    async fn process_monitor(
        &self,
        Parameters(params): Parameters<ProcessMonitorParams>,
    ) -> Result<CallToolResult, McpError> {
        let record = match self.supervisor.get(&params.execution_id).await {
            Ok(record) => record,
            Err(e) => return err_envelope(&e),
        };
        let tail_count = params.tail_lines.unwrap_or(20).clamp(1, 200);
        let lines: Vec<&str> = record.stdout.lines().collect();
        let tail: Vec<String> = lines
            .iter()
            .skip(lines.len().saturating_sub(tail_count))
            .map(|l| (*l).to_string())
            .collect();
        let runtime_ms = record.execution_time_ms.or_else(|| {
            record
                .started_at
                .map(|s| (chrono::Utc::now() - s).num_milliseconds().max(0) as u64)
        });
        ok_envelope(serde_json::json!({
            "execution_id": record.execution_id,
            "status": record.status,
            "runtime_ms": runtime_ms,
            "process_id": record.process_id,
            "output_id": record.output_id,
            "output_status": record.output_status,
            "tail_lines": tail,
        }))
    }

    #[tool(
        description = "List output artifacts (captured stdout/stderr/combined streams) with optional execution and kind filters. Set include_cleanup_suggestions to also get candidates for deletion (large or old artifacts, stale files from previous runs)."
    )]
    async fn list_execution_outputs(
        &self,
        Parameters(params): Parameters<ListOutputsParams>,
    ) -> Result<CallToolResult, McpError> {
        let filter = ArtifactFilter {
            execution_id: params.execution_id,
            kind: params.kind,
            limit: clamp_limit(params.limit),
            offset: params.offset.unwrap_or(0),
        };
        let (artifacts, total) = self.store.list(&filter).await;
        let mut body = serde_json::json!({
            "outputs": artifacts,
            "total": total,
        });
        if params.include_cleanup_suggestions.unwrap_or(false) {
            let (suggestions, warnings) = self
                .store
                .cleanup_suggestions(
                    params.cleanup_max_size_mb,
                    params.cleanup_max_age_hours,
                    true,
                )
                .await;
            if let Some(object) = body.as_object_mut() {
                object.insert(
                    "cleanup_suggestions".to_string(),
                    serde_json::to_value(&suggestions).unwrap_or_default(),
                );
                object.insert(
                    "warnings".to_string(),
                    serde_json::to_value(&warnings).unwrap_or_default(),
                );
            }
        }
        ok_envelope(body)
    }

    #[tool(
        description = "Read bytes from an output artifact by offset and size. Returns the requested slice (utf-8 lossy by default, or hex), the artifact's total size, and whether more bytes remain. Safe to call while the owning execution is still writing -- you'll see a consistent prefix."
    )]
    async fn read_execution_output(
        &self,
        Parameters(params): Parameters<ReadOutputParams>,
    ) -> Result<CallToolResult, McpError> {
        let offset = params.offset.unwrap_or(0);
        let size = params.size.unwrap_or(DEFAULT_READ_SIZE);
        let encoding = params.encoding.as_deref().unwrap_or("utf-8");
        if !matches!(encoding, "utf-8" | "hex") {
            return err_envelope(&ServiceError::param(
                "INVALID_ENCODING",
                format!("unsupported encoding '{encoding}' (use utf-8 or hex)"),
            ));
        }
        match self.store.read(&params.output_id, offset, size).await {
            Ok((bytes, total)) => {
                let data = if encoding == "hex" {
                    hex::encode(&bytes)
                } else {
                    String::from_utf8_lossy(&bytes).to_string()
                };
                ok_envelope(serde_json::json!({
                    "output_id": params.output_id,
                    "offset": offset,
                    "bytes_returned": bytes.len(),
                    "total_size": total,
                    "has_more": (offset + (bytes.len() as u64) < total),
                    "encoding": encoding,
                    "data": data,
                }))
            }
            Err(e) => err_envelope(&e),
        }
    }

    #[tool(
        description = "Delete output artifacts by id, or run age-based auto-cleanup with auto_cleanup=true (optionally dry_run). Nothing is removed unless confirm=true."
    )]
    async fn delete_execution_outputs(
        &self,
        Parameters(params): Parameters<DeleteOutputsParams>,
    ) -> Result<CallToolResult, McpError> {
        let confirm = params.confirm.unwrap_or(false);
        let dry_run = params.dry_run.unwrap_or(false);

        if params.auto_cleanup.unwrap_or(false) {
            if !confirm && !dry_run {
                return err_envelope(&ServiceError::param(
                    "DELETE_NOT_CONFIRMED",
                    "auto-cleanup requires confirm=true (or dry_run=true); nothing was removed",
                ));
            }
            let report = self
                .store
                .auto_cleanup(params.max_age_hours, dry_run, params.preserve_recent)
                .await;
            return ok_envelope(serde_json::json!({ "cleanup": report }));
        }

        if params.output_ids.is_empty() {
            return err_envelope(&ServiceError::param(
                "NO_OUTPUT_IDS",
                "output_ids must not be empty unless auto_cleanup is set",
            ));
        }
        match self.store.delete(&params.output_ids, confirm).await {
            Ok(outcomes) => ok_envelope(serde_json::json!({ "results": outcomes })),
            Err(e) => err_envelope(&e),
        }
    }

    // -----------------------------------------------------------------------
    // Terminal tools -- persistent PTY sessions
    // -----------------------------------------------------------------------

    #[tool(
        description = "Create a persistent PTY-backed shell session (bash by default). Programs see a real terminal (isatty=true), so interactive tools and colored output work. Scrollback is kept with a monotonic line counter; use terminal_send_input and terminal_get_output to drive it."
    )]
    async fn terminal_create(
        &self,
        Parameters(params): Parameters<TerminalCreateParams>,
    ) -> Result<CallToolResult, McpError> {
        let options = CreateTerminalOptions {
            session_name: params.session_name,
            shell_type: params.shell_type,
            dimensions: params.dimensions,
            working_directory: params.working_directory,
            environment: params.environment.unwrap_or_default(),
            auto_save_history: params.auto_save_history.unwrap_or(false),
        };
        match self.terminals.create(options).await {
            Ok(info) => ok_envelope(serde_json::json!({ "terminal": info })),
            Err(e) => err_envelope(&e),
        }
    }

    #[tool(description = "List PTY sessions with their status (active/idle/closed) and scrollback counters.")]
    async fn terminal_list(
        &self,
        Parameters(params): Parameters<TerminalListParams>,
    ) -> Result<CallToolResult, McpError> {
        let status = match params.status.as_deref() {
            None => None,
            Some("active") => Some(crate::terminal::SessionStatus::Active),
            Some("idle") => Some(crate::terminal::SessionStatus::Idle),
            Some("closed") => Some(crate::terminal::SessionStatus::Closed),
            Some(raw) => {
                return err_envelope(&ServiceError::param(
                    "INVALID_STATUS",
                    format!("unknown status '{raw}'"),
                ));
            }
        };
        let sessions = self.terminals.list(status).await;
        ok_envelope(serde_json::json!({ "terminals": sessions }))
    }

    #[tool(
        description = "Fetch one PTY session's info including a live foreground-process snapshot (which process would receive input right now)."
    )]
    async fn terminal_get_info(
        &self,
        Parameters(params): Parameters<TerminalGetInfoParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.terminals.get(&params.terminal_id).await {
            Ok(info) => ok_envelope(serde_json::json!({ "terminal": info })),
            Err(e) => err_envelope(&e),
        }
    }

    #[tool(
        description = "Send input to a PTY session. Three encodings: literal text (execute=true appends a newline), control_codes=true for an escape grammar (^C sends Ctrl-C, \\n, \\xHH, \\uHHHH), raw_bytes=true for hex. The send_to program guard restricts which foreground process may receive input ('*', a name, an absolute path, 'pid:<N>', 'sessionleader:') and fails closed if the foreground cannot be determined. If prior output is unread the send is refused unless force_input=true; control codes always go through."
    )]
    async fn terminal_send_input(
        &self,
        Parameters(params): Parameters<TerminalSendInputParams>,
    ) -> Result<CallToolResult, McpError> {
        let options = SendInputOptions {
            input: params.input,
            execute: params.execute.unwrap_or(true),
            control_codes: params.control_codes.unwrap_or(false),
            raw_bytes: params.raw_bytes.unwrap_or(false),
            send_to: params.send_to,
            force_input: params.force_input.unwrap_or(false),
        };
        match self.terminals.send_input(&params.terminal_id, options).await {
            Ok(result) if result.accepted => ok_envelope(serde_json::json!({ "input": result })),
            Ok(result) => json_content(&serde_json::json!({
                "success": false,
                "status": "unread_output",
                "input": result,
            })),
            Err(e) => err_envelope(&e),
        }
    }

    #[tool(
        description = "Read scrollback from a PTY session. Reads are continuous: omit start_line to resume from where the last read stopped; pass start_line to reposition. Returns lines (ANSI stripped unless include_ansi=true), total_lines, has_more, and next_start_line."
    )]
    async fn terminal_get_output(
        &self,
        Parameters(params): Parameters<TerminalGetOutputParams>,
    ) -> Result<CallToolResult, McpError> {
        let line_count = params.line_count.unwrap_or(DEFAULT_LINE_COUNT);
        if !(1..=10_000).contains(&line_count) {
            return err_envelope(&ServiceError::param(
                "LINE_COUNT_OUT_OF_RANGE",
                "line_count must be within 1..=10000",
            ));
        }
        let slice = self
            .terminals
            .get_output(
                &params.terminal_id,
                params.start_line,
                line_count,
                params.include_ansi.unwrap_or(false),
                params.include_foreground_process.unwrap_or(false),
            )
            .await;
        match slice {
            Ok(slice) => ok_envelope(serde_json::json!({ "output": slice })),
            Err(e) => err_envelope(&e),
        }
    }

    #[tool(description = "Resize a PTY session in place. Scrollback is unaffected.")]
    async fn terminal_resize(
        &self,
        Parameters(params): Parameters<TerminalResizeParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .terminals
            .resize(&params.terminal_id, params.dimensions)
            .await
        {
            Ok(info) => ok_envelope(serde_json::json!({ "terminal": info })),
            Err(e) => err_envelope(&e),
        }
    }

    #[tool(
        description = "Close a PTY session: graceful shell exit, then TERM, then KILL. Scrollback remains readable in memory; save_history=true also writes it to a history file (best effort)."
    )]
    async fn terminal_close(
        &self,
        Parameters(params): Parameters<TerminalCloseParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .terminals
            .close(&params.terminal_id, params.save_history.unwrap_or(false))
            .await
        {
            Ok(info) => ok_envelope(serde_json::json!({ "terminal": info })),
            Err(e) => err_envelope(&e),
        }
    }

    // -----------------------------------------------------------------------
    // Safety and monitoring
    // -----------------------------------------------------------------------

    #[tool(
        description = "Replace the active safety restrictions atomically. Modes: permissive, moderate (default), restrictive, custom (allow/block lists), enhanced (every non-prefiltered command goes to the external evaluator; pattern pre-filtering disabled), enhanced-fast (enhanced with pre-filtering enabled)."
    )]
    async fn security_set_restrictions(
        &self,
        Parameters(params): Parameters<SetRestrictionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let restrictions = SafetyRestrictions {
            security_mode: params.security_mode,
            allowed_commands: params.allowed_commands,
            blocked_commands: params.blocked_commands,
            allowed_directories: params.allowed_directories,
            max_execution_time: params.max_execution_time,
            max_memory_mb: params.max_memory_mb,
            enable_network: params.enable_network.unwrap_or(true),
            ..SafetyRestrictions::default()
        };
        let active = self.evaluator.set_restrictions(restrictions);
        ok_envelope(serde_json::json!({ "restrictions": &*active }))
    }

    #[tool(
        description = "Aggregate service statistics: execution counts by status, terminal session counts, output store usage, history stats, the active security mode, and uptime."
    )]
    async fn monitoring_get_stats(
        &self,
        Parameters(_params): Parameters<GetStatsParams>,
    ) -> Result<CallToolResult, McpError> {
        let executions = self.supervisor.status_counts().await;
        let terminals = self.terminals.status_counts().await;
        let (artifact_count, artifact_bytes) = self.store.stats().await;
        let history = self.history.lock().await.stats();
        let restrictions = self.evaluator.restrictions();
        ok_envelope(serde_json::json!({
            "uptime_seconds": self.supervisor.uptime_seconds(),
            "executions": executions,
            "terminals": terminals,
            "outputs": {
                "count": artifact_count,
                "total_bytes": artifact_bytes,
            },
            "history": history,
            "security": {
                "restriction_id": restrictions.restriction_id,
                "mode": restrictions.security_mode,
            },
        }))
    }
}

#[tool_handler]
impl ServerHandler for McpShellServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "mcp-shell".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "mcp-shell runs shell commands under supervision and drives persistent \
                 PTY sessions.\n\n\
                 EXECUTION: shell_execute runs a command (adaptive mode by default: it \
                 blocks briefly, and if the command outlives the foreground deadline or \
                 exceeds the output cap it keeps running in the background and you get \
                 status=running plus an output_id). Fetch progress with process_monitor \
                 or process_get_execution; the complete bytes are always available via \
                 read_execution_output. Chain commands by passing a previous result's \
                 output_id as stdin_output_id.\n\n\
                 TERMINALS: terminal_create starts a persistent PTY shell. Send input \
                 with terminal_send_input (send_to guards which foreground process may \
                 receive it; control_codes=true sends ^C and friends) and read \
                 scrollback with terminal_get_output (continuous reads resume from the \
                 session cursor). Unread output blocks new input unless forced.\n\n\
                 SAFETY: every command is evaluated before it runs. Denials and \
                 confirmation requests come back as structured envelopes with \
                 reasoning and alternatives; re-invoke with a comment to resubmit."
                    .to_string(),
            ),
        }
    }
}
