//! Validation signals and the decision resolver
//!
//! Every failing rule becomes a [`ValidationSignal`]. The resolver maps each
//! signal to a protocol action through a fixed policy table, keeps the
//! highest-priority action across the step, and turns it into one
//! [`SignalDecision`] for the engine to act on.

use crate::types::{now, Params, Timestamp};
use crate::validation::{RuleCategory, RuleOutcome, Severity, ValidationCheckResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Protocol actions, lowest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolAction {
    /// Ignore this rule for the rest of the task
    IgnoreRule,
    /// Ignore this occurrence
    IgnoreOnce,
    /// Patch parameters and re-run the step
    FixAndRetry,
    /// Roll back and re-plan
    Rollback,
    /// Escalate to the user
    AskUser,
    /// Fail the task
    Abort,
}

impl fmt::Display for ProtocolAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolAction::IgnoreRule => "ignore_rule",
            ProtocolAction::IgnoreOnce => "ignore_once",
            ProtocolAction::FixAndRetry => "fix_and_retry",
            ProtocolAction::Rollback => "rollback",
            ProtocolAction::AskUser => "ask_user",
            ProtocolAction::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// How a signal was handled; written exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResolution {
    /// Action that was applied
    pub action: ProtocolAction,
    /// Whether applying it succeeded
    pub success: bool,
    /// Why
    pub reasoning: String,
}

/// A materialized rule failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSignal {
    /// Signal id
    pub id: Uuid,
    /// Rule that fired
    pub rule_id: String,
    /// Effective severity
    pub severity: Severity,
    /// Rule category
    pub category: RuleCategory,
    /// Rule output
    pub result: ValidationCheckResult,
    /// Plan step, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Tool being validated
    pub tool: String,
    /// Its parameters
    pub input: Params,
    /// Creation time
    pub created_at: Timestamp,
    resolution: Option<SignalResolution>,
}

impl ValidationSignal {
    /// Signal from a failing rule outcome
    pub fn from_outcome(
        outcome: &RuleOutcome,
        step_id: Option<String>,
        tool: &str,
        input: &Params,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id: outcome.rule_id.clone(),
            severity: outcome.severity,
            category: outcome.category,
            result: outcome.result.clone(),
            step_id,
            tool: tool.to_string(),
            input: input.clone(),
            created_at: now(),
            resolution: None,
        }
    }

    /// Rule message
    pub fn message(&self) -> &str {
        &self.result.message
    }

    /// Resolution, once set
    pub fn resolution(&self) -> Option<&SignalResolution> {
        self.resolution.as_ref()
    }

    /// Record the resolution; false if one was already recorded
    pub fn resolve(
        &mut self,
        action: ProtocolAction,
        success: bool,
        reasoning: impl Into<String>,
    ) -> bool {
        if self.resolution.is_some() {
            tracing::warn!(signal = %self.id, rule = %self.rule_id, "signal already resolved");
            return false;
        }
        self.resolution = Some(SignalResolution {
            action,
            success,
            reasoning: reasoning.into(),
        });
        true
    }
}

/// What the engine should do after a step's signals are resolved
#[derive(Debug, Clone, PartialEq)]
pub enum SignalDecision {
    /// Keep going
    Continue,
    /// Roll back the step, apply the patch, re-run
    FixAndRetry(Params),
    /// Roll back and re-plan the remainder
    RollbackAndReplan(String),
    /// Suspend and ask the user
    AskUser(String),
    /// Fail the task
    Abort(String),
}

/// Decision plus side effects on the task
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDecision {
    /// Winning action (`None` when there were no signals)
    pub action: Option<ProtocolAction>,
    /// Decision for the engine
    pub decision: SignalDecision,
    /// Rules to suppress for the rest of the task
    pub suppress: Vec<String>,
}

impl ResolvedDecision {
    /// Record the outcome of acting on this decision on every signal
    pub fn record(&self, signals: &mut [ValidationSignal], success: bool) {
        let Some(action) = self.action else {
            return;
        };
        for signal in signals.iter_mut() {
            let own = policy(signal);
            let reasoning = if own == action {
                format!("{} ({} {})", action, signal.severity, signal.category)
            } else {
                format!("{} overrides {}", action, own)
            };
            signal.resolve(action, success, reasoning);
        }
    }
}

/// Single-signal policy table
pub fn policy(signal: &ValidationSignal) -> ProtocolAction {
    use RuleCategory::*;
    use Severity::*;

    if signal.category == Parameter && signal.result.patch.is_some() {
        return ProtocolAction::FixAndRetry;
    }
    match (signal.severity, signal.category) {
        (Block, Integrity) => ProtocolAction::Abort,
        (Block, Safety) | (Warn, Safety) | (Warn, Integrity) => ProtocolAction::AskUser,
        (Block, Structural) | (Block, Parameter) | (Block, DataQuality) => ProtocolAction::Rollback,
        (Block, Cosmetic) => ProtocolAction::IgnoreRule,
        (Warn, Structural) | (Warn, Parameter) | (Warn, DataQuality) | (Warn, Cosmetic) => {
            ProtocolAction::IgnoreOnce
        }
    }
}

/// Combines a step's signals into one decision
#[derive(Debug, Clone, Default)]
pub struct DecisionResolver;

impl DecisionResolver {
    /// New resolver
    pub fn new() -> Self {
        Self
    }

    /// Decide for one step's signals
    pub fn decide(&self, signals: &[ValidationSignal]) -> ResolvedDecision {
        let actions: Vec<ProtocolAction> = signals.iter().map(policy).collect();
        let suppress: Vec<String> = signals
            .iter()
            .zip(&actions)
            .filter(|(_, a)| **a == ProtocolAction::IgnoreRule)
            .map(|(s, _)| s.rule_id.clone())
            .collect();

        let Some(top) = actions.iter().copied().max() else {
            return ResolvedDecision {
                action: None,
                decision: SignalDecision::Continue,
                suppress,
            };
        };

        let messages_for = |wanted: ProtocolAction| -> String {
            signals
                .iter()
                .zip(&actions)
                .filter(|(_, a)| **a == wanted)
                .map(|(s, _)| format!("{}: {}", s.rule_id, s.message()))
                .collect::<Vec<_>>()
                .join("; ")
        };

        let decision = match top {
            ProtocolAction::Abort => SignalDecision::Abort(messages_for(top)),
            ProtocolAction::AskUser => {
                let lines: Vec<String> = signals.iter().map(|s| format!("- {}", s.message())).collect();
                SignalDecision::AskUser(format!(
                    "Before continuing, please review:\n{}\nShould I proceed?",
                    lines.join("\n")
                ))
            }
            ProtocolAction::Rollback => SignalDecision::RollbackAndReplan(messages_for(top)),
            ProtocolAction::FixAndRetry => {
                let mut patch = Params::new();
                for (signal, action) in signals.iter().zip(&actions) {
                    if *action != ProtocolAction::FixAndRetry {
                        continue;
                    }
                    for (key, value) in signal.result.patch.iter().flatten() {
                        if let Some(previous) = patch.insert(key.clone(), value.clone()) {
                            if &previous != value {
                                tracing::warn!(key = %key, rule = %signal.rule_id, "conflicting patches, later rule wins");
                            }
                        }
                    }
                }
                SignalDecision::FixAndRetry(patch)
            }
            ProtocolAction::IgnoreOnce | ProtocolAction::IgnoreRule => SignalDecision::Continue,
        };

        tracing::debug!(action = %top, signals = signals.len(), "resolved validation signals");
        ResolvedDecision {
            action: Some(top),
            decision,
            suppress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::params_from;
    use crate::validation::RulePhase;
    use serde_json::json;

    fn signal(rule: &str, severity: Severity, category: RuleCategory) -> ValidationSignal {
        let outcome = RuleOutcome {
            rule_id: rule.to_string(),
            severity,
            category,
            phase: RulePhase::PostExecution,
            result: ValidationCheckResult::fail(format!("{} failed", rule)),
        };
        ValidationSignal::from_outcome(&outcome, Some("step-1".into()), "write_range", &Params::new())
    }

    #[test]
    fn policy_table() {
        use RuleCategory::*;
        use Severity::*;
        assert_eq!(policy(&signal("a", Block, Structural)), ProtocolAction::Rollback);
        assert_eq!(policy(&signal("a", Warn, Cosmetic)), ProtocolAction::IgnoreOnce);
        assert_eq!(policy(&signal("a", Block, Safety)), ProtocolAction::AskUser);
        assert_eq!(policy(&signal("a", Block, Integrity)), ProtocolAction::Abort);

        let mut patched = signal("a", Warn, Parameter);
        patched.result.patch = Some(params_from(json!({"range": "A1:B2"})));
        assert_eq!(policy(&patched), ProtocolAction::FixAndRetry);
    }

    #[test]
    fn highest_priority_wins() {
        let resolver = DecisionResolver::new();
        let signals = vec![
            signal("cosmetic", Severity::Warn, RuleCategory::Cosmetic),
            signal("structure", Severity::Block, RuleCategory::Structural),
            signal("safety", Severity::Block, RuleCategory::Safety),
        ];
        let resolved = resolver.decide(&signals);
        assert_eq!(resolved.action, Some(ProtocolAction::AskUser));
        match resolved.decision {
            SignalDecision::AskUser(question) => {
                assert!(question.contains("cosmetic failed"));
                assert!(question.contains("structure failed"));
                assert!(question.contains("safety failed"));
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn ignore_rule_continues_and_suppresses() {
        let resolved = DecisionResolver::new()
            .decide(&[signal("style", Severity::Block, RuleCategory::Cosmetic)]);
        assert_eq!(resolved.decision, SignalDecision::Continue);
        assert_eq!(resolved.suppress, vec!["style".to_string()]);
    }

    #[test]
    fn no_signals_continue() {
        let resolved = DecisionResolver::new().decide(&[]);
        assert_eq!(resolved.decision, SignalDecision::Continue);
        assert!(resolved.action.is_none());
    }

    #[test]
    fn resolution_is_set_once() {
        let mut signals = vec![signal("s", Severity::Block, RuleCategory::Structural)];
        let resolved = DecisionResolver::new().decide(&signals);
        resolved.record(&mut signals, true);
        assert_eq!(
            signals[0].resolution().map(|r| r.action),
            Some(ProtocolAction::Rollback)
        );
        assert!(!signals[0].resolve(ProtocolAction::Abort, false, "late"));
    }
}
