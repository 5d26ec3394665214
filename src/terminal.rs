//! Persistent PTY sessions with scrollback, program guard, and interlocks.
//!
//! Each session is a long-lived shell attached to a real PTY, so child
//! programs see `isatty()=true`. A dedicated reader task appends everything
//! the master delivers to a bounded scrollback ring with a monotonic line
//! counter; reads are continuous via a per-session cursor. Input passes two
//! interlocks before reaching the master: the program guard (which process
//! may receive input, matched against `/proc` foreground discovery, failing
//! closed when discovery fails) and the unread-output interlock (no new
//! input while prior output is unread, unless forced -- control codes force
//! implicitly because interrupts must not be blockable).

use crate::error::{Result, ServiceError};
use crate::output;
use crate::procinfo::{ForegroundProcess, ForegroundSnapshot, ProcScanner};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Scrollback capacity in lines.
const MAX_SCROLLBACK_LINES: usize = 10_000;

/// Sessions with no activity for this long report `idle`.
const IDLE_AFTER_SECONDS: i64 = 5 * 60;

/// Grace between TERM and KILL when closing a session.
const CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// Maximum concurrent sessions.
const MAX_SESSIONS: usize = 50;

/// Supported shells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ShellType {
    Bash,
    Zsh,
    Fish,
    Cmd,
    Powershell,
}

impl ShellType {
    fn program(self) -> &'static str {
        match self {
            ShellType::Bash => "/bin/bash",
            ShellType::Zsh => "/bin/zsh",
            ShellType::Fish => "/usr/bin/fish",
            ShellType::Cmd => "cmd.exe",
            ShellType::Powershell => "powershell.exe",
        }
    }
}

/// Terminal dimensions, width in columns and height in rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Dimensions {
    pub width: u16,
    pub height: u16,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            width: 120,
            height: 30,
        }
    }
}

impl Dimensions {
    /// Validate against the supported ranges.
    pub fn validate(self) -> Result<Self> {
        if !(1..=500).contains(&self.width) || !(1..=200).contains(&self.height) {
            return Err(ServiceError::param(
                "DIMENSIONS_OUT_OF_RANGE",
                "dimensions must be within 1..=500 columns by 1..=200 rows",
            ));
        }
        Ok(self)
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Closed,
}

/// Options for [`TerminalManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateTerminalOptions {
    pub session_name: Option<String>,
    pub shell_type: Option<ShellType>,
    pub dimensions: Option<Dimensions>,
    pub working_directory: Option<String>,
    pub environment: HashMap<String, String>,
    pub auto_save_history: bool,
}

/// Snapshot of one session for callers.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalInfo {
    pub terminal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub shell_type: ShellType,
    pub dimensions: Dimensions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    pub status: SessionStatus,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub total_lines: u64,
    pub next_start_line: u64,
    pub auto_save_history: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreground_process: Option<ForegroundSnapshot>,
}

/// Options for [`TerminalManager::send_input`].
#[derive(Debug, Clone, Default)]
pub struct SendInputOptions {
    pub input: String,
    /// Append a newline so the shell executes the input.
    pub execute: bool,
    /// Interpret the input through the control-code escape grammar.
    pub control_codes: bool,
    /// Interpret the input as a hex byte string.
    pub raw_bytes: bool,
    /// Program guard expression; `None` or `"*"` allows any foreground.
    pub send_to: Option<String>,
    /// Bypass the unread-output interlock.
    pub force_input: bool,
}

/// Result of an input send.
#[derive(Debug, Clone, Serialize)]
pub struct InputResult {
    pub terminal_id: String,
    pub accepted: bool,
    pub bytes_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// The unread slice that triggered an interlock rejection.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unread_lines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreground_process: Option<ForegroundProcess>,
}

/// A slice of scrollback returned by [`TerminalManager::get_output`].
#[derive(Debug, Clone, Serialize)]
pub struct OutputSlice {
    pub terminal_id: String,
    pub lines: Vec<String>,
    pub start_line: u64,
    pub line_count: usize,
    pub total_lines: u64,
    pub has_more: bool,
    pub next_start_line: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreground_process: Option<ForegroundSnapshot>,
}

/// Bounded scrollback ring with a monotonic line counter.
struct Scrollback {
    lines: VecDeque<String>,
    /// Absolute line number of `lines[0]`.
    base_line: u64,
    /// Unterminated trailing output (e.g. a prompt).
    partial: String,
    last_activity: DateTime<Utc>,
}

impl Scrollback {
    fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            base_line: 0,
            partial: String::new(),
            last_activity: Utc::now(),
        }
    }

    /// Append raw PTY bytes, splitting into lines and evicting past capacity.
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.last_activity = Utc::now();
        self.partial.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.truncate(line.trim_end_matches(['\n', '\r']).len());
            self.lines.push_back(line);
            if self.lines.len() > MAX_SCROLLBACK_LINES {
                self.lines.pop_front();
                self.base_line += 1;
            }
        }
    }

    /// Total lines ever produced, counting an in-progress partial line.
    fn total_lines(&self) -> u64 {
        self.base_line + self.lines.len() as u64 + u64::from(!self.partial.is_empty())
    }

    /// Render the absolute line range `[start, start+count)`.
    fn slice(&self, start: u64, count: usize, include_ansi: bool) -> Vec<String> {
        let mut out = Vec::new();
        let complete_end = self.base_line + self.lines.len() as u64;
        let mut line_no = start.max(self.base_line);
        while out.len() < count && line_no < complete_end {
            let idx = (line_no - self.base_line) as usize;
            if let Some(line) = self.lines.get(idx) {
                out.push(if include_ansi {
                    line.clone()
                } else {
                    output::strip_ansi(line)
                });
            }
            line_no += 1;
        }
        if out.len() < count && line_no == complete_end && !self.partial.is_empty() {
            out.push(if include_ansi {
                self.partial.clone()
            } else {
                output::strip_ansi(&self.partial)
            });
        }
        out
    }
}

struct TerminalSession {
    terminal_id: String,
    session_name: Option<String>,
    shell_type: ShellType,
    dimensions: Dimensions,
    child: tokio::process::Child,
    writer: Option<pty_process::OwnedWritePty>,
    reader_task: Option<JoinHandle<()>>,
    scrollback: Arc<Mutex<Scrollback>>,
    closed: bool,
    working_directory: String,
    created_at: DateTime<Utc>,
    /// Continuous-read cursor; also the unread watermark.
    next_start_line: u64,
    auto_save_history: bool,
    pid: Option<u32>,
}

impl TerminalSession {
    async fn info(&mut self, foreground: Option<ForegroundSnapshot>) -> TerminalInfo {
        let (total_lines, last_activity) = {
            let scrollback = self.scrollback.lock().await;
            (scrollback.total_lines(), scrollback.last_activity)
        };
        let status = if self.closed || matches!(self.child.try_wait(), Ok(Some(_))) {
            SessionStatus::Closed
        } else if (Utc::now() - last_activity).num_seconds() > IDLE_AFTER_SECONDS {
            SessionStatus::Idle
        } else {
            SessionStatus::Active
        };
        TerminalInfo {
            terminal_id: self.terminal_id.clone(),
            session_name: self.session_name.clone(),
            shell_type: self.shell_type,
            dimensions: self.dimensions,
            process_id: self.pid,
            status,
            working_directory: self.working_directory.clone(),
            created_at: self.created_at,
            last_activity,
            total_lines,
            next_start_line: self.next_start_line,
            auto_save_history: self.auto_save_history,
            foreground_process: foreground,
        }
    }
}

/// Manager of all PTY sessions. Exclusively owns session state.
pub struct TerminalManager {
    sessions: Arc<Mutex<HashMap<String, TerminalSession>>>,
    scanner: Arc<ProcScanner>,
}

impl TerminalManager {
    #[must_use]
    pub fn new(scanner: Arc<ProcScanner>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            scanner,
        }
    }

    /// Create a new PTY session running the requested shell.
    pub async fn create(&self, options: CreateTerminalOptions) -> Result<TerminalInfo> {
        let dimensions = options.dimensions.unwrap_or_default().validate()?;
        let shell_type = options.shell_type.unwrap_or(ShellType::Bash);

        {
            let sessions = self.sessions.lock().await;
            let open = sessions.values().filter(|s| !s.closed).count();
            if open >= MAX_SESSIONS {
                return Err(ServiceError::resource(
                    "TOO_MANY_SESSIONS",
                    format!("{open}/{MAX_SESSIONS} sessions already open"),
                ));
            }
        }

        let (pty, pts) = pty_process::open().map_err(|e| {
            ServiceError::execution("PTY_OPEN_FAILED", format!("failed to open PTY: {e}"))
        })?;
        pty.resize(pty_process::Size::new(dimensions.height, dimensions.width))
            .map_err(|e| {
                ServiceError::execution("PTY_RESIZE_FAILED", format!("failed to size PTY: {e}"))
            })?;

        let mut cmd = pty_process::Command::new(shell_type.program());
        if shell_type == ShellType::Bash {
            cmd = cmd.arg("--norc").arg("--noprofile");
        }
        if let Some(dir) = &options.working_directory {
            cmd = cmd.current_dir(dir);
        }
        for (key, value) in &options.environment {
            cmd = cmd.env(key, value);
        }

        let child = cmd.spawn(pts).map_err(|e| {
            ServiceError::execution(
                "SHELL_SPAWN_FAILED",
                format!("failed to spawn {} with PTY: {e}", shell_type.program()),
            )
        })?;
        let pid = child.id();

        let (read_pty, write_pty) = pty.into_split();
        let scrollback = Arc::new(Mutex::new(Scrollback::new()));

        // Reader task: everything the master delivers lands in scrollback,
        // in order, until EOF (shell exit).
        let scrollback_writer = scrollback.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = read_pty;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => scrollback_writer.lock().await.push_bytes(&buf[..n]),
                }
            }
        });

        let terminal_id = format!("term-{}", uuid::Uuid::new_v4());
        let working_directory = options
            .working_directory
            .clone()
            .or_else(|| std::env::current_dir().ok().map(|p| p.display().to_string()))
            .unwrap_or_default();

        let mut session = TerminalSession {
            terminal_id: terminal_id.clone(),
            session_name: options.session_name,
            shell_type,
            dimensions,
            child,
            writer: Some(write_pty),
            reader_task: Some(reader_task),
            scrollback,
            closed: false,
            working_directory,
            created_at: Utc::now(),
            next_start_line: 0,
            auto_save_history: options.auto_save_history,
            pid,
        };

        tracing::info!(terminal_id = %terminal_id, ?shell_type, pid, "terminal created");
        let info = session.info(None).await;
        self.sessions.lock().await.insert(terminal_id, session);
        Ok(info)
    }

    /// List sessions, optionally filtered by status.
    pub async fn list(&self, status: Option<SessionStatus>) -> Vec<TerminalInfo> {
        let mut sessions = self.sessions.lock().await;
        let mut out = Vec::new();
        for session in sessions.values_mut() {
            let info = session.info(None).await;
            if status.is_none_or(|s| info.status == s) {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Snapshot one session, including the foreground-process view.
    pub async fn get(&self, terminal_id: &str) -> Result<TerminalInfo> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(terminal_id).ok_or_else(|| {
            ServiceError::resource(
                "TERMINAL_NOT_FOUND",
                format!("no terminal with id '{terminal_id}'"),
            )
        })?;
        let foreground = session
            .pid
            .map(|pid| self.scanner.foreground(pid as i32));
        Ok(session.info(foreground).await)
    }

    /// Send input to a session, subject to the guard and the interlock.
    pub async fn send_input(
        &self,
        terminal_id: &str,
        options: SendInputOptions,
    ) -> Result<InputResult> {
        if options.control_codes && options.raw_bytes {
            return Err(ServiceError::param(
                "INPUT_MODE_CONFLICT",
                "control_codes and raw_bytes are mutually exclusive",
            ));
        }

        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(terminal_id).ok_or_else(|| {
            ServiceError::resource(
                "TERMINAL_NOT_FOUND",
                format!("no terminal with id '{terminal_id}'"),
            )
        })?;
        if session.closed {
            return Err(ServiceError::resource(
                "TERMINAL_CLOSED",
                format!("terminal '{terminal_id}' is closed"),
            ));
        }

        // Unread-output interlock. Control codes force implicitly: an
        // interrupt must never be blocked behind an unread prompt.
        let forced = options.force_input || options.control_codes;
        if !forced {
            let scrollback = session.scrollback.lock().await;
            let total = scrollback.total_lines();
            if total > session.next_start_line {
                let unread = scrollback.slice(
                    session.next_start_line,
                    (total - session.next_start_line) as usize,
                    false,
                );
                return Ok(InputResult {
                    terminal_id: terminal_id.to_string(),
                    accepted: false,
                    bytes_written: 0,
                    rejection_reason: Some(
                        "unread output pending; read it or set force_input".to_string(),
                    ),
                    unread_lines: unread,
                    foreground_process: None,
                });
            }
        }

        // Program guard: snapshot the foreground process and match. An
        // unavailable snapshot rejects -- unknown is not "allow".
        let mut foreground = None;
        if let Some(guard) = options.send_to.as_deref() {
            if guard != "*" {
                let pid = session.pid.ok_or_else(|| {
                    ServiceError::execution(
                        "GUARD_UNAVAILABLE",
                        "session has no tracked shell pid; guarded send rejected",
                    )
                })?;
                let snapshot = self.scanner.foreground(pid as i32);
                let Some(process) = snapshot.process.clone().filter(|_| snapshot.available)
                else {
                    return Err(ServiceError::execution(
                        "GUARD_UNAVAILABLE",
                        format!(
                            "foreground discovery failed ({}); guarded send rejected",
                            snapshot.error.as_deref().unwrap_or("unknown")
                        ),
                    ));
                };
                if !guard_allows(guard, &process) {
                    return Err(ServiceError::execution(
                        "GUARD_MISMATCH",
                        format!(
                            "foreground process '{}' (pid {}) does not match guard '{guard}'",
                            process.name, process.pid
                        ),
                    )
                    .with_details(serde_json::json!({
                        "foreground": process.name,
                        "foreground_pid": process.pid,
                    })));
                }
                foreground = Some(process);
            }
        }

        // Encode.
        let bytes = if options.raw_bytes {
            output::decode_hex(&options.input)
                .map_err(|e| ServiceError::param("INVALID_HEX_INPUT", e))?
        } else if options.control_codes {
            output::decode_control_codes(&options.input)
                .map_err(|e| ServiceError::param("INVALID_CONTROL_INPUT", e))?
        } else {
            let mut text = options.input.clone().into_bytes();
            if options.execute {
                text.push(b'\n');
            }
            text
        };

        let writer = session.writer.as_mut().ok_or_else(|| {
            ServiceError::resource(
                "TERMINAL_CLOSED",
                format!("terminal '{terminal_id}' has no writer"),
            )
        })?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| ServiceError::execution("PTY_WRITE_FAILED", e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| ServiceError::execution("PTY_WRITE_FAILED", e.to_string()))?;

        session.scrollback.lock().await.last_activity = Utc::now();
        if let Some(pid) = session.pid {
            self.scanner.invalidate(pid as i32);
        }

        tracing::debug!(terminal_id = %terminal_id, bytes = bytes.len(), "input sent");
        Ok(InputResult {
            terminal_id: terminal_id.to_string(),
            accepted: true,
            bytes_written: bytes.len(),
            rejection_reason: None,
            unread_lines: Vec::new(),
            foreground_process: foreground,
        })
    }

    /// Read scrollback. Omitting `start_line` resumes from the session's
    /// cursor; providing it repositions the cursor.
    pub async fn get_output(
        &self,
        terminal_id: &str,
        start_line: Option<u64>,
        line_count: usize,
        include_ansi: bool,
        include_foreground_process: bool,
    ) -> Result<OutputSlice> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(terminal_id).ok_or_else(|| {
            ServiceError::resource(
                "TERMINAL_NOT_FOUND",
                format!("no terminal with id '{terminal_id}'"),
            )
        })?;

        let scrollback = session.scrollback.lock().await;
        let total = scrollback.total_lines();
        let start = start_line.unwrap_or(session.next_start_line).min(total);
        let lines = scrollback.slice(start, line_count, include_ansi);
        drop(scrollback);

        let next = start + lines.len() as u64;
        session.next_start_line = next;

        let foreground = if include_foreground_process {
            session.pid.map(|pid| self.scanner.foreground(pid as i32))
        } else {
            None
        };

        Ok(OutputSlice {
            terminal_id: terminal_id.to_string(),
            line_count: lines.len(),
            lines,
            start_line: start,
            total_lines: total,
            has_more: next < total,
            next_start_line: next,
            foreground_process: foreground,
        })
    }

    /// Resize the PTY in place. Scrollback is unaffected.
    pub async fn resize(&self, terminal_id: &str, dimensions: Dimensions) -> Result<TerminalInfo> {
        let dimensions = dimensions.validate()?;
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(terminal_id).ok_or_else(|| {
            ServiceError::resource(
                "TERMINAL_NOT_FOUND",
                format!("no terminal with id '{terminal_id}'"),
            )
        })?;
        let writer = session.writer.as_ref().ok_or_else(|| {
            ServiceError::resource(
                "TERMINAL_CLOSED",
                format!("terminal '{terminal_id}' is closed"),
            )
        })?;
        writer
            .resize(pty_process::Size::new(dimensions.height, dimensions.width))
            .map_err(|e| {
                ServiceError::execution("PTY_RESIZE_FAILED", format!("resize failed: {e}"))
            })?;
        session.dimensions = dimensions;
        session.scrollback.lock().await.last_activity = Utc::now();
        Ok(session.info(None).await)
    }

    /// Close a session: graceful exit, TERM, then KILL. Scrollback survives
    /// in memory; the history file write is best-effort.
    pub async fn close(&self, terminal_id: &str, save_history: bool) -> Result<TerminalInfo> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(terminal_id).ok_or_else(|| {
            ServiceError::resource(
                "TERMINAL_NOT_FOUND",
                format!("no terminal with id '{terminal_id}'"),
            )
        })?;
        if session.closed {
            return Ok(session.info(None).await);
        }

        if let Some(mut writer) = session.writer.take() {
            let _ = writer.write_all(b"exit\n").await;
            let _ = writer.flush().await;
            // Dropping the master write half delivers SIGHUP to the shell,
            // which unblocks the wait below.
            drop(writer);
        }

        if tokio::time::timeout(CLOSE_GRACE, session.child.wait())
            .await
            .is_err()
        {
            let _ = session.child.start_kill();
            let _ = tokio::time::timeout(CLOSE_GRACE, session.child.wait()).await;
        }
        if let Some(task) = session.reader_task.take() {
            // Reader ends at EOF once the pts side is gone; abort covers the
            // case where the fd lingers.
            task.abort();
        }
        session.closed = true;

        if save_history || session.auto_save_history {
            let path = std::env::temp_dir().join(format!("mcp-shell-{terminal_id}.history"));
            let scrollback = session.scrollback.lock().await;
            let text: String = scrollback
                .slice(scrollback.base_line, scrollback.lines.len(), false)
                .join("\n");
            if let Err(e) = std::fs::write(&path, text) {
                tracing::warn!(terminal_id = %terminal_id, error = %e, "history save failed");
            }
        }

        tracing::info!(terminal_id = %terminal_id, "terminal closed");
        Ok(session.info(None).await)
    }

    /// Close every open session (graceful shutdown path).
    pub async fn close_all(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|s| !s.closed)
                .map(|s| s.terminal_id.clone())
                .collect()
        };
        for id in ids {
            let _ = self.close(&id, false).await;
        }
    }

    /// Session counts by status (monitoring).
    pub async fn status_counts(&self) -> HashMap<String, usize> {
        let mut sessions = self.sessions.lock().await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for session in sessions.values_mut() {
            let info = session.info(None).await;
            let key = match info.status {
                SessionStatus::Active => "active",
                SessionStatus::Idle => "idle",
                SessionStatus::Closed => "closed",
            };
            *counts.entry(key.to_string()).or_default() += 1;
        }
        counts
    }
}

/// Match a program-guard expression against a foreground process.
///
/// - `"*"` allows anything (handled by the caller before lookup)
/// - `pid:<N>` matches the foreground pid
/// - `sessionleader:` matches only the session leader
/// - an absolute path matches the executable path
/// - a bare name matches the comm basename
#[must_use]
pub fn guard_allows(guard: &str, process: &ForegroundProcess) -> bool {
    if guard == "*" {
        return true;
    }
    if guard == "sessionleader:" {
        return process.is_session_leader;
    }
    if let Some(pid) = guard.strip_prefix("pid:") {
        return pid.parse::<i32>().ok() == Some(process.pid);
    }
    if guard.starts_with('/') {
        return process.exe_path.as_deref() == Some(guard);
    }
    process.name == guard
}
