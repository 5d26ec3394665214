//! Integration tests for the safety evaluator pipeline: classifier routing,
//! posture-dependent outcomes, external callback handling, and the
//! fail-closed guarantees.

use mcp_shell::error::ErrorCategory;
use mcp_shell::evaluator::{
    LlmEvaluationRequest, LlmEvaluator, LlmVerdict, SafetyEvaluator, SafetyOutcome,
};
use mcp_shell::history::CommandHistory;
use mcp_shell::safety::{SafetyRestrictions, SecurityMode};
use std::sync::Arc;
use tokio::sync::Mutex;

fn evaluator() -> SafetyEvaluator {
    let history = Arc::new(Mutex::new(CommandHistory::new(100)));
    SafetyEvaluator::new(history, 1)
}

fn with_mode(evaluator: &SafetyEvaluator, mode: SecurityMode) {
    evaluator.set_restrictions(SafetyRestrictions {
        security_mode: mode,
        ..SafetyRestrictions::default()
    });
}

/// Stub external evaluator returning a fixed verdict.
struct FixedVerdict(LlmVerdict);

#[async_trait::async_trait]
impl LlmEvaluator for FixedVerdict {
    async fn evaluate(&self, _request: LlmEvaluationRequest) -> anyhow::Result<LlmVerdict> {
        Ok(self.0.clone())
    }
}

/// Stub external evaluator that never answers in time.
struct NeverAnswers;

#[async_trait::async_trait]
impl LlmEvaluator for NeverAnswers {
    async fn evaluate(&self, _request: LlmEvaluationRequest) -> anyhow::Result<LlmVerdict> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        unreachable!("the evaluator timeout should fire first")
    }
}

/// Stub external evaluator that always errors.
struct AlwaysFails;

#[async_trait::async_trait]
impl LlmEvaluator for AlwaysFails {
    async fn evaluate(&self, _request: LlmEvaluationRequest) -> anyhow::Result<LlmVerdict> {
        anyhow::bail!("provider unavailable")
    }
}

fn allow_verdict() -> LlmVerdict {
    LlmVerdict {
        outcome: SafetyOutcome::Allow,
        reasoning: "looks fine".to_string(),
        suggested_alternatives: vec![],
        requested_history_depth: None,
    }
}

// ---------------------------------------------------------------------------
// Classifier routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_safe_command_allowed_in_moderate_mode() {
    let evaluator = evaluator();
    let result = evaluator.evaluate("echo hello", "/tmp", None, false).await.unwrap();
    assert_eq!(result.outcome, SafetyOutcome::Allow);
    assert!(result.classification.starts_with("basic_safe"));
}

#[tokio::test]
async fn test_hard_deny_is_deny_with_destructive_reasoning() {
    let evaluator = evaluator();
    let result = evaluator.evaluate("rm -rf /", "/tmp", None, false).await.unwrap();
    assert_eq!(result.outcome, SafetyOutcome::Deny);
    assert!(result.reasoning.contains("destructive"));
    assert!(!result.can_resubmit);
}

#[tokio::test]
async fn test_unclassified_allowed_in_permissive() {
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::Permissive);
    let result = evaluator
        .evaluate("frobnicate --all", "/tmp", None, false)
        .await
        .unwrap();
    assert_eq!(result.outcome, SafetyOutcome::Allow);
}

#[tokio::test]
async fn test_unclassified_needs_confirm_in_restrictive() {
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::Restrictive);
    let result = evaluator
        .evaluate("frobnicate --all", "/tmp", None, false)
        .await
        .unwrap();
    assert_eq!(result.outcome, SafetyOutcome::NeedUserConfirm);
    assert!(result.can_resubmit);
}

#[tokio::test]
async fn test_escalation_needs_confirm_in_moderate() {
    let evaluator = evaluator();
    let result = evaluator
        .evaluate("sudo frobnicate", "/tmp", None, false)
        .await
        .unwrap();
    assert_eq!(result.outcome, SafetyOutcome::NeedUserConfirm);
}

#[tokio::test]
async fn test_force_user_confirm_overrides_allow() {
    let evaluator = evaluator();
    let result = evaluator.evaluate("echo hi", "/tmp", None, true).await.unwrap();
    assert_eq!(result.outcome, SafetyOutcome::NeedUserConfirm);
}

// ---------------------------------------------------------------------------
// Allow / block lists
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_block_list_denies_command_word() {
    let evaluator = evaluator();
    evaluator.set_restrictions(SafetyRestrictions {
        security_mode: SecurityMode::Custom,
        blocked_commands: Some(vec!["curl".to_string()]),
        ..SafetyRestrictions::default()
    });
    let result = evaluator
        .evaluate("curl https://example.com", "/tmp", None, false)
        .await
        .unwrap();
    assert_eq!(result.outcome, SafetyOutcome::Deny);
    assert!(result.reasoning.contains("block list"));
}

#[tokio::test]
async fn test_allow_list_denies_everything_else() {
    let evaluator = evaluator();
    evaluator.set_restrictions(SafetyRestrictions {
        security_mode: SecurityMode::Custom,
        allowed_commands: Some(vec!["ls".to_string(), "cat".to_string()]),
        ..SafetyRestrictions::default()
    });
    let ok = evaluator.evaluate("ls -la", "/tmp", None, false).await.unwrap();
    assert_eq!(ok.outcome, SafetyOutcome::Allow);
    let denied = evaluator.evaluate("make all", "/tmp", None, false).await.unwrap();
    assert_eq!(denied.outcome, SafetyOutcome::Deny);
}

// ---------------------------------------------------------------------------
// Resubmission memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_resubmitted_denied_command_stays_denied() {
    let evaluator = evaluator();
    let first = evaluator.evaluate("rm -rf /usr", "/tmp", None, false).await.unwrap();
    assert_eq!(first.outcome, SafetyOutcome::Deny);

    let second = evaluator.evaluate("rm -rf /usr", "/tmp", None, false).await.unwrap();
    assert_eq!(second.outcome, SafetyOutcome::Deny);
    assert!(second.reasoning.contains("previously denied"));
    assert!(second.resubmission_count >= 1);

    let third = evaluator.evaluate("rm -rf /usr", "/tmp", None, false).await.unwrap();
    assert!(third.resubmission_count >= 2);
}

// ---------------------------------------------------------------------------
// External evaluator: fail-closed guarantees
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_enhanced_without_callback_is_security_error() {
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::Enhanced);
    let err = evaluator
        .evaluate("frobnicate", "/tmp", None, false)
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Security);
    assert_eq!(err.code, "EVALUATOR_UNAVAILABLE");
}

#[tokio::test]
async fn test_enhanced_callback_timeout_is_security_error() {
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::Enhanced);
    evaluator.register_callback(Arc::new(NeverAnswers));
    let err = evaluator
        .evaluate("frobnicate", "/tmp", None, false)
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Security);
    assert_eq!(err.code, "EVALUATOR_TIMEOUT");
}

#[tokio::test]
async fn test_enhanced_callback_error_is_security_error() {
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::Enhanced);
    evaluator.register_callback(Arc::new(AlwaysFails));
    let err = evaluator
        .evaluate("frobnicate", "/tmp", None, false)
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::Security);
    assert_eq!(err.code, "EVALUATOR_ERROR");
}

#[tokio::test]
async fn test_enhanced_routes_even_safe_patterns_to_callback() {
    // Pattern pre-filtering is off in enhanced mode, so a command that
    // would normally be basic_safe still consults the callback.
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::Enhanced);
    evaluator.register_callback(Arc::new(FixedVerdict(LlmVerdict {
        outcome: SafetyOutcome::NeedAssistantConfirm,
        reasoning: "double-check".to_string(),
        suggested_alternatives: vec![],
        requested_history_depth: None,
    })));
    let result = evaluator.evaluate("echo hi", "/tmp", None, false).await.unwrap();
    assert_eq!(result.outcome, SafetyOutcome::NeedAssistantConfirm);
}

#[tokio::test]
async fn test_enhanced_fast_prefilters_safe_patterns() {
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::EnhancedFast);
    // No callback registered: a prefiltered command must still resolve.
    let result = evaluator.evaluate("echo hi", "/tmp", None, false).await.unwrap();
    assert_eq!(result.outcome, SafetyOutcome::Allow);
}

#[tokio::test]
async fn test_callback_allow_permits() {
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::Enhanced);
    evaluator.register_callback(Arc::new(FixedVerdict(allow_verdict())));
    let result = evaluator.evaluate("frobnicate", "/tmp", None, false).await.unwrap();
    assert_eq!(result.outcome, SafetyOutcome::Allow);
}

#[tokio::test]
async fn test_callback_deny_is_remembered() {
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::Enhanced);
    evaluator.register_callback(Arc::new(FixedVerdict(LlmVerdict {
        outcome: SafetyOutcome::Deny,
        reasoning: "too risky".to_string(),
        suggested_alternatives: vec!["use --dry-run".to_string()],
        requested_history_depth: None,
    })));
    let first = evaluator.evaluate("frobnicate", "/tmp", None, false).await.unwrap();
    assert_eq!(first.outcome, SafetyOutcome::Deny);
    assert_eq!(first.suggested_alternatives, vec!["use --dry-run".to_string()]);

    // The resubmission is denied from memory without consulting the callback
    // again; swap in a failing callback to prove it is not invoked.
    evaluator.register_callback(Arc::new(AlwaysFails));
    let second = evaluator.evaluate("frobnicate", "/tmp", None, false).await.unwrap();
    assert_eq!(second.outcome, SafetyOutcome::Deny);
}

#[tokio::test]
async fn test_callback_need_more_history_carries_depth() {
    let evaluator = evaluator();
    with_mode(&evaluator, SecurityMode::Enhanced);
    evaluator.register_callback(Arc::new(FixedVerdict(LlmVerdict {
        outcome: SafetyOutcome::NeedMoreHistory,
        reasoning: "need context".to_string(),
        suggested_alternatives: vec![],
        requested_history_depth: Some(25),
    })));
    let result = evaluator.evaluate("frobnicate", "/tmp", None, false).await.unwrap();
    assert_eq!(result.outcome, SafetyOutcome::NeedMoreHistory);
    assert_eq!(result.requested_history_depth, Some(25));
    assert!(result.can_resubmit);
}

// ---------------------------------------------------------------------------
// Restriction replacement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_set_restrictions_replaces_atomically() {
    let evaluator = evaluator();
    let before = evaluator.restrictions();
    let after = evaluator.set_restrictions(SafetyRestrictions {
        security_mode: SecurityMode::Restrictive,
        ..SafetyRestrictions::default()
    });
    assert_ne!(before.restriction_id, after.restriction_id);
    assert_eq!(
        evaluator.restrictions().security_mode,
        SecurityMode::Restrictive
    );
}
