//! Safety evaluator: classifier, contextual gates, external LLM callback.
//!
//! Every command passes through here before the supervisor may spawn it.
//! The pipeline is fail-closed: only an explicit ALLOW permits execution,
//! and any evaluator failure (timeout, transport, schema) is a SECURITY
//! error, never a silent allow. Prior denials are remembered so repeated
//! resubmissions of the same command are denied without re-querying the
//! external evaluator.

use crate::error::{Result, ServiceError};
use crate::history::CommandHistory;
use crate::safety::{self, Classification, SafetyRestrictions, SecurityMode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

/// History depth sent to the external evaluator by default.
const DEFAULT_HISTORY_DEPTH: usize = 5;

/// Window of recent entries scanned for repeated-pattern confidence.
const REPEAT_WINDOW: usize = 50;

/// The five safety outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyOutcome {
    Allow,
    Deny,
    NeedUserConfirm,
    NeedAssistantConfirm,
    NeedMoreHistory,
}

/// Full result of a safety evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyResult {
    pub outcome: SafetyOutcome,
    /// Wire label of the classifier verdict (`basic_safe:N` / `llm_required`).
    pub classification: String,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggested_alternatives: Vec<String>,
    /// Set when the outcome is `need_more_history`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_history_depth: Option<usize>,
    /// Whether re-invoking with more context can change the outcome.
    pub can_resubmit: bool,
    /// Times this exact command has been resubmitted after a denial.
    pub resubmission_count: u32,
    /// Evaluator confidence, adjusted by repeated-pattern detection.
    pub confidence: f64,
}

/// Request handed to the external LLM evaluator.
#[derive(Debug, Clone, Serialize)]
pub struct LlmEvaluationRequest {
    pub command: String,
    pub working_directory: String,
    /// Most recent command strings, newest first.
    pub recent_history: Vec<String>,
    /// Reasoning from the prior denial if this is a resubmission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_denial: Option<String>,
    /// Free-form caller comment explaining intent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Verdict the external evaluator must produce.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct LlmVerdict {
    pub outcome: SafetyOutcome,
    pub reasoning: String,
    #[serde(default)]
    pub suggested_alternatives: Vec<String>,
    /// Only meaningful with `need_more_history`.
    #[serde(default)]
    pub requested_history_depth: Option<usize>,
}

/// Boundary to the external language-model evaluator.
#[async_trait::async_trait]
pub trait LlmEvaluator: Send + Sync {
    async fn evaluate(&self, request: LlmEvaluationRequest) -> anyhow::Result<LlmVerdict>;
}

struct DenialRecord {
    reasoning: String,
    resubmissions: u32,
}

/// The safety evaluator. Owns the active restriction set (replaced by atomic
/// Arc swap) and the optional external callback.
pub struct SafetyEvaluator {
    restrictions: RwLock<Arc<SafetyRestrictions>>,
    callback: RwLock<Option<Arc<dyn LlmEvaluator>>>,
    history: Arc<Mutex<CommandHistory>>,
    evaluator_timeout: Duration,
    denials: Mutex<HashMap<String, DenialRecord>>,
}

impl SafetyEvaluator {
    pub fn new(history: Arc<Mutex<CommandHistory>>, evaluator_timeout_seconds: u64) -> Self {
        Self {
            restrictions: RwLock::new(Arc::new(SafetyRestrictions::default())),
            callback: RwLock::new(None),
            history,
            evaluator_timeout: Duration::from_secs(evaluator_timeout_seconds.clamp(1, 60)),
            denials: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the external LLM evaluator.
    pub fn register_callback(&self, callback: Arc<dyn LlmEvaluator>) {
        *self.callback.write().expect("callback lock poisoned") = Some(callback);
    }

    /// The live restriction set.
    #[must_use]
    pub fn restrictions(&self) -> Arc<SafetyRestrictions> {
        self.restrictions
            .read()
            .expect("restrictions lock poisoned")
            .clone()
    }

    /// Atomically replace the restriction set. Returns the new record.
    pub fn set_restrictions(&self, mut restrictions: SafetyRestrictions) -> Arc<SafetyRestrictions> {
        restrictions.restriction_id = format!("restr-{}", uuid::Uuid::new_v4());
        restrictions.configured_at = chrono::Utc::now();
        let arc = Arc::new(restrictions);
        *self.restrictions.write().expect("restrictions lock poisoned") = arc.clone();
        tracing::info!(
            restriction_id = %arc.restriction_id,
            mode = ?arc.security_mode,
            "safety restrictions replaced"
        );
        arc
    }

    /// Evaluate a command. Only an `Allow` outcome permits spawning.
    pub async fn evaluate(
        &self,
        command: &str,
        working_directory: &str,
        comment: Option<&str>,
        force_user_confirm: bool,
    ) -> Result<SafetyResult> {
        let restrictions = self.restrictions();
        let trimmed = command.trim();
        let classification = safety::classify(trimmed);
        let label = classification.label();

        // Hard-deny table: refuse outright, no evaluator consulted.
        if let Some(reason) = safety::hard_deny_reason(trimmed) {
            return Ok(self.deny(trimmed, label, reason, vec![]).await);
        }

        // Explicit block list.
        if let Some(blocked) = &restrictions.blocked_commands {
            let word = safety::command_word(trimmed);
            if blocked.iter().any(|b| b == word || trimmed.starts_with(b.as_str())) {
                return Ok(self
                    .deny(
                        trimmed,
                        label,
                        format!("command '{word}' is on the configured block list"),
                        vec![],
                    )
                    .await);
            }
        }

        // Explicit allow list: when configured, anything off-list is refused.
        if let Some(allowed) = &restrictions.allowed_commands {
            let word = safety::command_word(trimmed);
            if !allowed.iter().any(|a| a == word) {
                return Ok(self
                    .deny(
                        trimmed,
                        label,
                        format!("command '{word}' is not on the configured allow list"),
                        allowed.iter().take(5).cloned().collect(),
                    )
                    .await);
            }
        }

        // Prior denial: repeated resubmissions short-circuit to DENY.
        {
            let mut denials = self.denials.lock().await;
            if let Some(record) = denials.get_mut(trimmed) {
                record.resubmissions += 1;
                let count = self.history.lock().await.bump_resubmission(trimmed);
                return Ok(SafetyResult {
                    outcome: SafetyOutcome::Deny,
                    classification: label,
                    reasoning: format!(
                        "previously denied and unchanged: {}",
                        record.reasoning
                    ),
                    suggested_alternatives: vec![],
                    requested_history_depth: None,
                    can_resubmit: false,
                    resubmission_count: count.max(record.resubmissions),
                    confidence: 1.0,
                });
            }
        }

        if force_user_confirm {
            return Ok(SafetyResult {
                outcome: SafetyOutcome::NeedUserConfirm,
                classification: label,
                reasoning: "caller requested explicit user confirmation".to_string(),
                suggested_alternatives: vec![],
                requested_history_depth: None,
                can_resubmit: true,
                resubmission_count: 0,
                confidence: 1.0,
            });
        }

        let confidence = self.pattern_confidence(trimmed).await;

        // Pattern pre-filter (gated by mode): a basic_safe match resolves
        // without the external evaluator.
        if restrictions.prefilter_enabled() {
            if let Classification::BasicSafe { safety_level } = classification {
                let mut level = safety_level;
                if restrictions.enhanced_mode_enabled() {
                    if safety::in_sensitive_directory(working_directory) {
                        level = (level + 1).min(5);
                    }
                    if safety::is_escalation(trimmed) {
                        level = (level + 2).min(5);
                    }
                }
                if restrictions.enhanced_mode_enabled() && level >= 5 {
                    return Ok(SafetyResult {
                        outcome: SafetyOutcome::NeedUserConfirm,
                        classification: label,
                        reasoning:
                            "matched a safe pattern but contextual escalation heuristics raised \
                             the risk to the confirmation threshold"
                                .to_string(),
                        suggested_alternatives: vec![],
                        requested_history_depth: None,
                        can_resubmit: true,
                        resubmission_count: 0,
                        confidence,
                    });
                }
                return Ok(SafetyResult {
                    outcome: SafetyOutcome::Allow,
                    classification: label,
                    reasoning: format!("matched safe pattern (level {level})"),
                    suggested_alternatives: vec![],
                    requested_history_depth: None,
                    can_resubmit: false,
                    resubmission_count: 0,
                    confidence,
                });
            }
        }

        // Enhanced modes route everything unresolved to the external
        // evaluator; without one registered the answer is a hard failure,
        // never an allow.
        if restrictions.enhanced_mode_enabled() {
            return self
                .external_evaluate(trimmed, working_directory, comment, label, confidence)
                .await;
        }

        // Non-enhanced modes resolve unmatched commands by posture.
        let (outcome, reasoning) = match restrictions.security_mode {
            SecurityMode::Permissive => (
                SafetyOutcome::Allow,
                "permissive mode allows unclassified commands".to_string(),
            ),
            SecurityMode::Restrictive => (
                SafetyOutcome::NeedUserConfirm,
                "restrictive mode requires confirmation for unclassified commands".to_string(),
            ),
            _ => {
                if safety::is_escalation(trimmed)
                    || safety::in_sensitive_directory(working_directory)
                {
                    (
                        SafetyOutcome::NeedUserConfirm,
                        "privilege escalation or sensitive directory requires confirmation"
                            .to_string(),
                    )
                } else {
                    (
                        SafetyOutcome::Allow,
                        "no risk indicators for unclassified command".to_string(),
                    )
                }
            }
        };
        Ok(SafetyResult {
            outcome,
            classification: label,
            reasoning,
            suggested_alternatives: vec![],
            requested_history_depth: None,
            can_resubmit: outcome != SafetyOutcome::Allow,
            resubmission_count: 0,
            confidence,
        })
    }

    async fn external_evaluate(
        &self,
        command: &str,
        working_directory: &str,
        comment: Option<&str>,
        classification: String,
        confidence: f64,
    ) -> Result<SafetyResult> {
        let callback = self
            .callback
            .read()
            .expect("callback lock poisoned")
            .clone();
        let Some(callback) = callback else {
            return Err(ServiceError::security(
                "EVALUATOR_UNAVAILABLE",
                "enhanced mode requires an external evaluator and none is registered",
            )
            .with_details(serde_json::json!({ "fallback_evaluation": "DENY" })));
        };

        let recent_history: Vec<String> = {
            let history = self.history.lock().await;
            history
                .recent(DEFAULT_HISTORY_DEPTH)
                .into_iter()
                .map(|e| e.command)
                .collect()
        };
        let prior_denial = self
            .denials
            .lock()
            .await
            .get(command)
            .map(|d| d.reasoning.clone());

        let request = LlmEvaluationRequest {
            command: command.to_string(),
            working_directory: working_directory.to_string(),
            recent_history,
            prior_denial,
            comment: comment.map(str::to_string),
        };

        let verdict =
            match tokio::time::timeout(self.evaluator_timeout, callback.evaluate(request)).await {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "external evaluator failed");
                    return Err(ServiceError::security(
                        "EVALUATOR_ERROR",
                        format!("external evaluator failed: {e}"),
                    )
                    .with_details(serde_json::json!({ "fallback_evaluation": "DENY" })));
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_seconds = self.evaluator_timeout.as_secs(),
                        "external evaluator timed out"
                    );
                    return Err(ServiceError::security(
                        "EVALUATOR_TIMEOUT",
                        format!(
                            "external evaluator did not answer within {}s",
                            self.evaluator_timeout.as_secs()
                        ),
                    )
                    .with_details(serde_json::json!({ "fallback_evaluation": "DENY" })));
                }
            };

        if verdict.outcome == SafetyOutcome::Deny {
            return Ok(self
                .deny(
                    command,
                    classification,
                    verdict.reasoning,
                    verdict.suggested_alternatives,
                )
                .await);
        }

        let requested_history_depth = if verdict.outcome == SafetyOutcome::NeedMoreHistory {
            Some(
                verdict
                    .requested_history_depth
                    .unwrap_or(DEFAULT_HISTORY_DEPTH * 2),
            )
        } else {
            None
        };

        Ok(SafetyResult {
            can_resubmit: verdict.outcome != SafetyOutcome::Allow,
            outcome: verdict.outcome,
            classification,
            reasoning: verdict.reasoning,
            suggested_alternatives: verdict.suggested_alternatives,
            requested_history_depth,
            resubmission_count: 0,
            confidence,
        })
    }

    async fn deny(
        &self,
        command: &str,
        classification: String,
        reasoning: String,
        suggested_alternatives: Vec<String>,
    ) -> SafetyResult {
        self.denials.lock().await.insert(
            command.to_string(),
            DenialRecord {
                reasoning: reasoning.clone(),
                resubmissions: 0,
            },
        );
        tracing::info!(command = %command, reasoning = %reasoning, "command denied");
        SafetyResult {
            outcome: SafetyOutcome::Deny,
            classification,
            reasoning,
            suggested_alternatives,
            requested_history_depth: None,
            can_resubmit: false,
            resubmission_count: 0,
            confidence: 1.0,
        }
    }

    /// Confidence adjustment from repeated-pattern detection: commands the
    /// caller has run repeatedly score higher.
    async fn pattern_confidence(&self, command: &str) -> f64 {
        let repeats = self
            .history
            .lock()
            .await
            .repeated_executions(command, REPEAT_WINDOW);
        0.5 + (repeats as f64 * 0.1).min(0.4)
    }
}
