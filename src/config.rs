//! Startup settings parsed from the environment.
//!
//! The environment is read exactly once at startup into a [`Settings`] value
//! that is handed to the components that consume each field. Components never
//! read the environment themselves, so tests can construct `Settings`
//! directly.

use std::collections::HashSet;
use std::path::PathBuf;

/// Default cap on concurrently running executions.
const DEFAULT_MAX_CONCURRENT: usize = 50;

/// Default on-disk root for output artifacts.
const DEFAULT_OUTPUT_ROOT: &str = "/tmp/mcp-shell-outputs";

/// Default number of bytes of output copied inline into execution records.
const DEFAULT_INLINE_OUTPUT_CAP: usize = 1024 * 1024;

/// Default external-evaluator timeout in seconds.
const DEFAULT_EVALUATOR_TIMEOUT_SECONDS: u64 = 3;

/// Default command history capacity.
const DEFAULT_MAX_HISTORY_ENTRIES: usize = 1000;

/// Service-wide configuration assembled at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Startup default working directory for executions.
    pub default_workdir: Option<PathBuf>,
    /// Allow-list of working directories; empty means unrestricted.
    pub allowed_workdirs: Vec<PathBuf>,
    /// Cap on concurrently running executions.
    pub max_concurrent: usize,
    /// Tool names withheld from the advertised catalog.
    pub disabled_tools: HashSet<String>,
    /// Root directory for output artifacts.
    pub output_root: PathBuf,
    /// Bytes of output copied inline into execution records.
    pub inline_output_cap: usize,
    /// Hard timeout for external evaluator calls, seconds (clamped 1..=60).
    pub evaluator_timeout_seconds: u64,
    /// Command history ring capacity (clamped 100..=10000).
    pub max_history_entries: usize,
    /// Environment variable names stripped from child processes.
    pub strip_env: HashSet<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_workdir: None,
            allowed_workdirs: Vec::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            disabled_tools: HashSet::new(),
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            inline_output_cap: DEFAULT_INLINE_OUTPUT_CAP,
            evaluator_timeout_seconds: DEFAULT_EVALUATOR_TIMEOUT_SECONDS,
            max_history_entries: DEFAULT_MAX_HISTORY_ENTRIES,
            strip_env: HashSet::new(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// Malformed numeric values fall back to defaults with a warning rather
    /// than aborting startup.
    #[must_use]
    pub fn from_env() -> Self {
        let mut settings = Settings::default();

        if let Ok(dir) = std::env::var("MCP_SHELL_DEFAULT_WORKDIR") {
            if !dir.trim().is_empty() {
                settings.default_workdir = Some(PathBuf::from(dir.trim()));
            }
        }

        if let Ok(dirs) = std::env::var("MCP_SHELL_ALLOWED_WORKDIRS") {
            settings.allowed_workdirs = dirs
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Ok(raw) = std::env::var("MCP_SHELL_MAX_CONCURRENT") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => settings.max_concurrent = n,
                _ => {
                    tracing::warn!(value = %raw, "ignoring invalid MCP_SHELL_MAX_CONCURRENT");
                }
            }
        }

        if let Ok(tools) = std::env::var("MCP_DISABLED_TOOLS") {
            settings.disabled_tools = tools
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(root) = std::env::var("MCP_SHELL_OUTPUT_ROOT") {
            if !root.trim().is_empty() {
                settings.output_root = PathBuf::from(root.trim());
            }
        }

        if let Ok(raw) = std::env::var("MCP_SHELL_EVALUATOR_TIMEOUT") {
            match raw.trim().parse::<u64>() {
                Ok(n) => settings.evaluator_timeout_seconds = n.clamp(1, 60),
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring invalid MCP_SHELL_EVALUATOR_TIMEOUT");
                }
            }
        }

        if let Ok(raw) = std::env::var("MCP_SHELL_MAX_HISTORY") {
            match raw.trim().parse::<usize>() {
                Ok(n) => settings.max_history_entries = n.clamp(100, 10_000),
                Err(_) => {
                    tracing::warn!(value = %raw, "ignoring invalid MCP_SHELL_MAX_HISTORY");
                }
            }
        }

        if let Ok(names) = std::env::var("MCP_SHELL_STRIP_ENV") {
            settings.strip_env = names
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        settings
    }

    /// Whether an environment variable should be stripped from children.
    #[must_use]
    pub fn is_stripped_env(&self, name: &str) -> bool {
        !self.strip_env.is_empty() && self.strip_env.contains(&name.to_uppercase())
    }

    /// Check a working directory against the allow-list.
    ///
    /// An empty allow-list permits everything. Paths are canonicalized before
    /// the prefix match so symlinked aliases cannot escape the list.
    pub fn check_workdir(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if self.allowed_workdirs.is_empty() {
            return Ok(());
        }
        let canonical = path.canonicalize().map_err(|e| {
            crate::error::ServiceError::param(
                "WORKDIR_NOT_ACCESSIBLE",
                format!("working directory '{}' is not accessible: {e}", path.display()),
            )
        })?;
        let allowed = self.allowed_workdirs.iter().any(|allowed| {
            allowed
                .canonicalize()
                .map(|a| canonical.starts_with(&a))
                .unwrap_or(false)
        });
        if allowed {
            Ok(())
        } else {
            Err(crate::error::ServiceError::param(
                "WORKDIR_NOT_ALLOWED",
                format!(
                    "working directory '{}' is outside the allowed list",
                    path.display()
                ),
            ))
        }
    }
}
