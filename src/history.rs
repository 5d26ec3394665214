//! Bounded in-memory command history with confirmation-pattern learning.
//!
//! The history is a ring, not a log: it never touches disk and evicts
//! oldest-first once full. Pattern learning groups entries by a normalized
//! command prefix and aggregates user-confirmation rates; the safety
//! evaluator consults those aggregates but they never gate execution on
//! their own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Allowed range for the ring capacity.
const MIN_ENTRIES: usize = 100;
const MAX_ENTRIES: usize = 10_000;

/// Recorded context from a user confirmation prompt.
#[derive(Debug, Clone, Serialize)]
pub struct UserConfirmationContext {
    pub prompt: String,
    pub response: bool,
    pub reasoning: String,
    /// 1 (guessing) .. 5 (certain).
    pub confidence: u8,
    pub timestamp: DateTime<Utc>,
}

/// One remembered command attempt.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub execution_id: String,
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub working_directory: String,
    pub safety_classification: String,
    pub was_executed: bool,
    pub resubmission_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_confirmation_context: Option<UserConfirmationContext>,
}

/// Aggregated confirmation behavior for one command prefix.
#[derive(Debug, Clone, Serialize)]
pub struct PatternStat {
    pub prefix: String,
    pub samples: usize,
    pub confirmed: usize,
    pub confirmation_rate: f64,
}

/// Prediction of whether the user would confirm a command.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationPrediction {
    pub likely: bool,
    pub confidence: f64,
    pub patterns: Vec<PatternStat>,
}

/// Aggregate history statistics for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total_entries: usize,
    pub capacity: usize,
    pub executed: usize,
    pub blocked: usize,
    pub distinct_prefixes: usize,
}

/// Normalize a command to its learning prefix: the first two words,
/// lowercased. `git push --force` and `git push origin` share a bucket.
#[must_use]
pub fn normalize_prefix(command: &str) -> String {
    command
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// The bounded history ring.
pub struct CommandHistory {
    entries: VecDeque<HistoryEntry>,
    max_entries: usize,
}

impl CommandHistory {
    /// Create a ring with the given capacity, clamped to the allowed range.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.clamp(MIN_ENTRIES, MAX_ENTRIES),
        }
    }

    /// Append an entry, evicting the oldest if the ring is full.
    pub fn add(&mut self, entry: HistoryEntry) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Mutate the newest entry matching `execution_id`. Returns whether an
    /// entry was found.
    pub fn update<F: FnOnce(&mut HistoryEntry)>(&mut self, execution_id: &str, f: F) -> bool {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.execution_id == execution_id)
        {
            f(entry);
            true
        } else {
            false
        }
    }

    /// Increment the resubmission counter on the newest entry for `command`,
    /// returning the new count (1 if no prior entry exists).
    pub fn bump_resubmission(&mut self, command: &str) -> u32 {
        if let Some(entry) = self.entries.iter_mut().rev().find(|e| e.command == command) {
            entry.resubmission_count += 1;
            entry.resubmission_count
        } else {
            1
        }
    }

    /// Substring search over commands, newest first, with pagination.
    pub fn search(&self, query: &str, limit: usize, offset: usize) -> (Vec<HistoryEntry>, usize) {
        let needle = query.to_lowercase();
        let matched: Vec<&HistoryEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|e| needle.is_empty() || e.command.to_lowercase().contains(&needle))
            .collect();
        let total = matched.len();
        let page = matched
            .into_iter()
            .skip(offset)
            .take(if limit == 0 { total } else { limit })
            .cloned()
            .collect();
        (page, total)
    }

    /// Entries sharing the normalized prefix of `command`, newest first.
    pub fn find_similar(&self, command: &str) -> Vec<HistoryEntry> {
        let prefix = normalize_prefix(command);
        if prefix.is_empty() {
            return Vec::new();
        }
        self.entries
            .iter()
            .rev()
            .filter(|e| normalize_prefix(&e.command) == prefix)
            .cloned()
            .collect()
    }

    /// The most recent `count` entries, newest first (evaluator context).
    pub fn recent(&self, count: usize) -> Vec<HistoryEntry> {
        self.entries.iter().rev().take(count).cloned().collect()
    }

    /// Predict whether the user would confirm `command` from learned
    /// confirmation patterns on its prefix bucket.
    pub fn predict_user_confirmation(&self, command: &str) -> ConfirmationPrediction {
        let prefix = normalize_prefix(command);
        let mut samples = 0usize;
        let mut confirmed = 0usize;
        for entry in &self.entries {
            if normalize_prefix(&entry.command) != prefix {
                continue;
            }
            if let Some(ctx) = &entry.user_confirmation_context {
                samples += 1;
                if ctx.response {
                    confirmed += 1;
                }
            }
        }

        let patterns = if samples > 0 {
            vec![PatternStat {
                prefix,
                samples,
                confirmed,
                confirmation_rate: confirmed as f64 / samples as f64,
            }]
        } else {
            Vec::new()
        };

        // Confidence grows with sample count, saturating at 0.9; with no
        // samples the prediction is a coin flip at zero confidence.
        let confidence = if samples == 0 {
            0.0
        } else {
            (samples as f64 / 10.0).min(0.9)
        };
        ConfirmationPrediction {
            likely: samples > 0 && confirmed * 2 >= samples,
            confidence,
            patterns,
        }
    }

    /// How many recent entries (newest `window`) share this command's prefix
    /// and were executed. Used by the evaluator's repeated-pattern gate.
    pub fn repeated_executions(&self, command: &str, window: usize) -> usize {
        let prefix = normalize_prefix(command);
        self.entries
            .iter()
            .rev()
            .take(window)
            .filter(|e| e.was_executed && normalize_prefix(&e.command) == prefix)
            .count()
    }

    /// Aggregate stats.
    pub fn stats(&self) -> HistoryStats {
        let executed = self.entries.iter().filter(|e| e.was_executed).count();
        let prefixes: HashMap<String, ()> = self
            .entries
            .iter()
            .map(|e| (normalize_prefix(&e.command), ()))
            .collect();
        HistoryStats {
            total_entries: self.entries.len(),
            capacity: self.max_entries,
            executed,
            blocked: self.entries.len() - executed,
            distinct_prefixes: prefixes.len(),
        }
    }

    /// Current ring length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
