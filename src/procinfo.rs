//! Foreground-process discovery over Linux `/proc`.
//!
//! Given a PTY session's shell pid, find the process currently "in front":
//! the most recently started descendant sharing the shell's session id.
//! Process identity tuples are cached for 1 s and the foreground selection
//! for 5 s; an input send invalidates both for that shell. Any read failure
//! yields an unavailable snapshot, which makes guarded sends fail closed.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const IDENTITY_TTL: Duration = Duration::from_secs(1);
const SELECTION_TTL: Duration = Duration::from_secs(5);

/// Identity of one discovered process.
#[derive(Debug, Clone, Serialize)]
pub struct ForegroundProcess {
    pub pid: i32,
    /// Basename from `/proc/<pid>/comm`.
    pub name: String,
    /// Executable path from `/proc/<pid>/exe`, if readable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exe_path: Option<String>,
    pub parent_pid: i32,
    pub session_id: i32,
    pub is_session_leader: bool,
}

/// Result of a discovery attempt. `available=false` means callers relying on
/// the snapshot must fail closed.
#[derive(Debug, Clone, Serialize)]
pub struct ForegroundSnapshot {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ForegroundProcess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ForegroundSnapshot {
    fn unavailable(error: impl Into<String>) -> Self {
        Self {
            available: false,
            process: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
struct StatRow {
    ppid: i32,
    session_id: i32,
    start_ticks: u64,
}

#[derive(Clone)]
struct CachedIdentity {
    process: ForegroundProcess,
    read_at: Instant,
}

#[derive(Clone)]
struct CachedSelection {
    snapshot: ForegroundSnapshot,
    read_at: Instant,
}

/// Cached `/proc` scanner, one per service.
pub struct ProcScanner {
    identities: Mutex<HashMap<i32, CachedIdentity>>,
    selections: Mutex<HashMap<i32, CachedSelection>>,
}

impl ProcScanner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identities: Mutex::new(HashMap::new()),
            selections: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot the foreground process of the session rooted at `shell_pid`.
    pub fn foreground(&self, shell_pid: i32) -> ForegroundSnapshot {
        {
            let selections = self.selections.lock().expect("selection cache poisoned");
            if let Some(cached) = selections.get(&shell_pid) {
                if cached.read_at.elapsed() < SELECTION_TTL {
                    return cached.snapshot.clone();
                }
            }
        }

        let snapshot = self.discover(shell_pid);
        self.selections
            .lock()
            .expect("selection cache poisoned")
            .insert(
                shell_pid,
                CachedSelection {
                    snapshot: snapshot.clone(),
                    read_at: Instant::now(),
                },
            );
        snapshot
    }

    /// Drop cached state for a shell; called on every input send so the next
    /// guard check observes the post-input process tree.
    pub fn invalidate(&self, shell_pid: i32) {
        self.selections
            .lock()
            .expect("selection cache poisoned")
            .remove(&shell_pid);
        self.identities
            .lock()
            .expect("identity cache poisoned")
            .clear();
    }

    fn discover(&self, shell_pid: i32) -> ForegroundSnapshot {
        let table = match scan_stat_table() {
            Ok(table) => table,
            Err(e) => return ForegroundSnapshot::unavailable(e),
        };
        let Some(shell) = table.get(&shell_pid) else {
            return ForegroundSnapshot::unavailable(format!(
                "shell pid {shell_pid} not present in /proc"
            ));
        };
        let shell_session = shell.session_id;

        // Walk descendants of the shell, keeping those in the PTY's session.
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        for (pid, row) in &table {
            children.entry(row.ppid).or_default().push(*pid);
        }
        let mut frontier = vec![shell_pid];
        let mut candidate = (shell_pid, shell.start_ticks);
        while let Some(pid) = frontier.pop() {
            if let Some(kids) = children.get(&pid) {
                for kid in kids {
                    if let Some(row) = table.get(kid) {
                        if row.session_id == shell_session {
                            if row.start_ticks >= candidate.1 {
                                candidate = (*kid, row.start_ticks);
                            }
                            frontier.push(*kid);
                        }
                    }
                }
            }
        }

        match self.identity(candidate.0, &table) {
            Ok(process) => ForegroundSnapshot {
                available: true,
                process: Some(process),
                error: None,
            },
            Err(e) => ForegroundSnapshot::unavailable(e),
        }
    }

    fn identity(
        &self,
        pid: i32,
        table: &HashMap<i32, StatRow>,
    ) -> Result<ForegroundProcess, String> {
        {
            let identities = self.identities.lock().expect("identity cache poisoned");
            if let Some(cached) = identities.get(&pid) {
                if cached.read_at.elapsed() < IDENTITY_TTL {
                    return Ok(cached.process.clone());
                }
            }
        }

        let row = table
            .get(&pid)
            .ok_or_else(|| format!("pid {pid} vanished during discovery"))?;
        let comm = std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .map_err(|e| format!("cannot read /proc/{pid}/comm: {e}"))?;
        let exe_path = std::fs::read_link(format!("/proc/{pid}/exe"))
            .ok()
            .map(|p| p.to_string_lossy().to_string());

        let process = ForegroundProcess {
            pid,
            name: comm.trim().to_string(),
            exe_path,
            parent_pid: row.ppid,
            session_id: row.session_id,
            is_session_leader: row.session_id == pid,
        };
        self.identities
            .lock()
            .expect("identity cache poisoned")
            .insert(
                pid,
                CachedIdentity {
                    process: process.clone(),
                    read_at: Instant::now(),
                },
            );
        Ok(process)
    }
}

impl Default for ProcScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Read `/proc/<pid>/stat` for every live pid into a table.
fn scan_stat_table() -> Result<HashMap<i32, StatRow>, String> {
    let entries =
        std::fs::read_dir("/proc").map_err(|e| format!("cannot read /proc: {e}"))?;
    let mut table = HashMap::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        // Processes may exit mid-scan; skip unreadable rows silently.
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some(row) = parse_stat_row(&stat) {
            table.insert(pid, row);
        }
    }
    if table.is_empty() {
        return Err("empty /proc stat table".to_string());
    }
    Ok(table)
}

/// Parse the fields after the parenthesized comm in a stat line.
///
/// Field numbering per proc(5): (4) ppid, (6) session, (22) starttime. The
/// comm field can contain spaces and parens, so split on the LAST ')'.
fn parse_stat_row(stat: &str) -> Option<StatRow> {
    let rest = &stat[stat.rfind(')')? + 2..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // `rest` starts at field 3 (state), so ppid is index 1, session index 3,
    // starttime index 19.
    Some(StatRow {
        ppid: fields.get(1)?.parse().ok()?,
        session_id: fields.get(3)?.parse().ok()?,
        start_ticks: fields.get(19)?.parse().ok()?,
    })
}
