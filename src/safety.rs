//! Safety classifier: ordered rule table, hard-deny patterns, restrictions.
//!
//! Classification is the cheap first stage of the safety pipeline. An ordered
//! regex table maps a command to `basic_safe` with a safety level (1..=5);
//! anything unmatched is `llm_required` and goes to the external evaluator.
//! Separately, a hard-deny table catches commands no evaluator should ever
//! be asked about (fork bombs, raw device writes, recursive deletes of
//! system paths).

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Result of pattern classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Matched a known-safe rule; level 1 is harmless, 5 borders on risky.
    BasicSafe { safety_level: u8 },
    /// No rule matched; route to the external evaluator.
    LlmRequired,
}

impl Classification {
    /// Short wire label for history entries and envelopes.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Classification::BasicSafe { safety_level } => {
                format!("basic_safe:{safety_level}")
            }
            Classification::LlmRequired => "llm_required".to_string(),
        }
    }
}

/// The active security posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityMode {
    Permissive,
    Moderate,
    Restrictive,
    Custom,
    Enhanced,
    EnhancedFast,
}

/// The active restriction set. Exactly one is live at a time; replacement is
/// an atomic swap in the evaluator.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyRestrictions {
    pub restriction_id: String,
    pub security_mode: SecurityMode,
    pub allowed_commands: Option<Vec<String>>,
    pub blocked_commands: Option<Vec<String>>,
    pub allowed_directories: Option<Vec<String>>,
    pub max_execution_time: Option<u64>,
    pub max_memory_mb: Option<u64>,
    pub enable_network: bool,
    pub configured_at: DateTime<Utc>,
}

impl Default for SafetyRestrictions {
    fn default() -> Self {
        Self {
            restriction_id: format!("restr-{}", uuid::Uuid::new_v4()),
            security_mode: SecurityMode::Moderate,
            allowed_commands: None,
            blocked_commands: None,
            allowed_directories: None,
            max_execution_time: None,
            max_memory_mb: None,
            enable_network: true,
            configured_at: Utc::now(),
        }
    }
}

impl SafetyRestrictions {
    /// Whether the enhanced evaluation path (contextual gates + external
    /// evaluator) is active.
    #[must_use]
    pub fn enhanced_mode_enabled(&self) -> bool {
        matches!(
            self.security_mode,
            SecurityMode::Enhanced | SecurityMode::EnhancedFast
        )
    }

    /// Whether pattern pre-filtering runs before the external evaluator.
    ///
    /// Defaults off for `enhanced` (every command goes to the evaluator);
    /// `enhanced-fast` re-enables it. All non-enhanced modes pre-filter.
    #[must_use]
    pub fn prefilter_enabled(&self) -> bool {
        match self.security_mode {
            SecurityMode::Enhanced => false,
            _ => true,
        }
    }
}

struct SafetyRule {
    regex: Regex,
    safety_level: u8,
}

/// Ordered rule table, first match wins. Anchored on the command word so
/// `echo rm -rf /` classifies as an echo, not a delete.
static SAFETY_RULES: LazyLock<Vec<SafetyRule>> = LazyLock::new(|| {
    let table: &[(&str, u8)] = &[
        // Pure read-only inspection.
        (
            r"^(pwd|whoami|id|uname|date|hostname|uptime|true|false)\s*$",
            1,
        ),
        (
            r"^(ls|cat|head|tail|wc|file|stat|du|df|echo|printf|which|type|env|printenv)\b[^|;&><]*$",
            1,
        ),
        // Read-only searching and paging.
        (r"^(grep|rg|find|locate|less|more|sort|uniq|cut|tr|diff)\b[^;&>]*$", 2),
        // Version-control inspection.
        (r"^git\s+(status|log|diff|show|branch|remote|stash\s+list)\b", 2),
        // Builds and tests: mutate the working tree but nothing else.
        (
            r"^(cargo|make|cmake|npm|yarn|pnpm|go|mvn|gradle|pytest|tox)\s+\S+",
            3,
        ),
        // Local file manipulation.
        (r"^(mkdir|touch|cp|mv|ln|tar|gzip|gunzip|zip|unzip)\b", 3),
        // Network fetches and process inspection.
        (r"^(curl|wget|ping|dig|nslookup|ps|top|free|lsof|netstat|ss)\b", 4),
        // Non-recursive single-file removal.
        (r"^rm\s+(?:-[fiv]+\s+)?[^-/\s][^\s]*\s*$", 4),
    ];
    table
        .iter()
        .map(|(pattern, level)| SafetyRule {
            regex: Regex::new(pattern).expect("invalid safety rule regex"),
            safety_level: *level,
        })
        .collect()
});

/// Classify a command against the ordered rule table.
#[must_use]
pub fn classify(command: &str) -> Classification {
    let trimmed = command.trim();
    for rule in SAFETY_RULES.iter() {
        if rule.regex.is_match(trimmed) {
            return Classification::BasicSafe {
                safety_level: rule.safety_level,
            };
        }
    }
    Classification::LlmRequired
}

// ---------------------------------------------------------------------------
// Hard-deny patterns
// ---------------------------------------------------------------------------

/// System-critical paths that should never be the target of recursive delete,
/// chmod, or chown operations.
const PROTECTED_PATHS: &[&str] = &[
    "/", "/*", "/bin", "/sbin", "/usr", "/etc", "/var", "/home", "/root", "/lib", "/lib64",
    "/opt", "/boot", "/dev", "/sys", "/proc",
];

static HARD_DENY_PATTERNS: LazyLock<Vec<DenyPattern>> = LazyLock::new(|| {
    vec![
        DenyPattern {
            regex: Regex::new(r":\(\)\s*\{.*\|.*&\s*\}\s*;").expect("invalid deny regex"),
            description: "fork bomb",
        },
        DenyPattern {
            regex: Regex::new(r"\bmkfs\b").expect("invalid deny regex"),
            description: "filesystem format (mkfs)",
        },
        DenyPattern {
            regex: Regex::new(r"\bdd\b.*\bof=/dev/").expect("invalid deny regex"),
            description: "raw write to block device (dd of=/dev/...)",
        },
        DenyPattern {
            regex: Regex::new(r">\s*/dev/(sd|nvme|hd|vd|xvd|disk|mapper/)")
                .expect("invalid deny regex"),
            description: "redirect to block device",
        },
        DenyPattern {
            regex: Regex::new(r"\b(shutdown|reboot|halt|poweroff)\b").expect("invalid deny regex"),
            description: "system shutdown/reboot",
        },
        DenyPattern {
            regex: Regex::new(r"\binit\s+[06]\b").expect("invalid deny regex"),
            description: "system halt/reboot via init",
        },
    ]
});

struct DenyPattern {
    regex: Regex,
    description: &'static str,
}

/// Check a command against the hard-deny table. Returns the reason if the
/// command is destructive enough to refuse without consulting any evaluator.
#[must_use]
pub fn hard_deny_reason(command: &str) -> Option<String> {
    for pattern in HARD_DENY_PATTERNS.iter() {
        if pattern.regex.is_match(command) {
            return Some(format!("destructive command ({})", pattern.description));
        }
    }

    for subcmd in split_subcommands(command.trim()) {
        let subcmd = subcmd.trim();
        if subcmd.is_empty() {
            continue;
        }
        if is_protected_recursive(subcmd, "rm", |a| {
            a == "-r" || a == "-R" || a == "--recursive" || short_flag_contains(a, &['r', 'R'])
        }) {
            return Some(format!(
                "destructive command (recursive delete targeting a protected system path): {subcmd}"
            ));
        }
        for tool in ["chmod", "chown"] {
            if is_protected_recursive(subcmd, tool, |a| {
                a == "-R" || a == "--recursive" || short_flag_contains(a, &['R'])
            }) {
                return Some(format!(
                    "destructive command (recursive {tool} on a protected system path): {subcmd}"
                ));
            }
        }
    }

    None
}

/// Split a command string on shell operators (;, &&, ||) to get individual
/// commands. Not a full shell parser; catches the common chains.
fn split_subcommands(cmd: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut remaining = cmd;
    while !remaining.is_empty() {
        if let Some(pos) = remaining
            .find("&&")
            .into_iter()
            .chain(remaining.find("||"))
            .chain(remaining.find(';'))
            .min()
        {
            parts.push(&remaining[..pos]);
            let sep_len =
                if remaining[pos..].starts_with("&&") || remaining[pos..].starts_with("||") {
                    2
                } else {
                    1
                };
            remaining = &remaining[pos + sep_len..];
        } else {
            parts.push(remaining);
            break;
        }
    }
    parts
}

fn short_flag_contains(arg: &str, letters: &[char]) -> bool {
    arg.starts_with('-') && !arg.starts_with("--") && arg.chars().any(|c| letters.contains(&c))
}

/// Whether `subcmd` invokes `tool` recursively against a protected path.
fn is_protected_recursive(
    subcmd: &str,
    tool: &str,
    is_recursive_flag: impl Fn(&str) -> bool,
) -> bool {
    let words: Vec<&str> = subcmd.split_whitespace().collect();
    let Some(pos) = words.iter().position(|w| *w == tool) else {
        return false;
    };
    let args = &words[pos + 1..];

    if !args.iter().any(|a| is_recursive_flag(a)) {
        return false;
    }

    for arg in args {
        if arg.starts_with('-') {
            continue;
        }
        if *arg == "/*" {
            return true;
        }
        let trimmed = arg.trim_end_matches('/');
        let candidate = if trimmed.is_empty() { "/" } else { trimmed };
        for protected in PROTECTED_PATHS {
            let p = protected.trim_end_matches('/');
            let p = if p.is_empty() { "/" } else { p };
            if candidate == p {
                return true;
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Contextual gates
// ---------------------------------------------------------------------------

/// Directories whose contents make any command more dangerous.
const SENSITIVE_DIRECTORIES: &[&str] = &["/etc", "/boot", "/sys", "/proc", "/usr", "/var"];

/// Whether the working directory sits inside a sensitive system tree.
#[must_use]
pub fn in_sensitive_directory(working_directory: &str) -> bool {
    let path = working_directory.trim_end_matches('/');
    SENSITIVE_DIRECTORIES
        .iter()
        .any(|d| path == *d || path.starts_with(&format!("{d}/")))
}

static ESCALATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[\s;|&])(sudo|su|doas)\b|chmod\s+(u\+s|[0-7]*[4567][0-7]{3})|\bsetcap\b")
        .expect("invalid escalation regex")
});

/// Whether the command attempts privilege escalation (sudo/su/setuid).
#[must_use]
pub fn is_escalation(command: &str) -> bool {
    ESCALATION.is_match(command)
}

/// First word of a command, for allow/block list matching.
#[must_use]
pub fn command_word(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}
