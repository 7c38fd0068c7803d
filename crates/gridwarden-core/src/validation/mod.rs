//! Validation rule engine
//!
//! Rules are registered once and run by phase. All rules of one phase run
//! concurrently; a rule that errors or panics counts as a failing result so
//! that a broken rule can never silently pass a step.

pub mod rules;
pub mod tracker;

use crate::config::ValidationConfig;
use crate::plan::StepRole;
use crate::resource::ResourceReader;
use crate::tool::{Target, ToolInvocationResult};
use crate::types::Params;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use uuid::Uuid;

pub use tracker::ValidationErrorTracker;

/// How serious a failing rule is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The step must not stand
    Block,
    /// Worth noting
    Warn,
}

/// When a rule runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePhase {
    /// Before the tool is invoked
    PreExecution,
    /// After a successful invocation
    PostExecution,
    /// After post-execution rules, on the written data
    DataQuality,
}

/// What kind of problem a rule detects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    /// Shape or derivation of the output is wrong
    Structural,
    /// Tool parameters are wrong
    Parameter,
    /// Data content is suspicious
    DataQuality,
    /// Presentation only
    Cosmetic,
    /// Risky or irreversible operation
    Safety,
    /// Document consistency is at risk
    Integrity,
}

macro_rules! snake_display {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_value(self) {
                    Ok(Value::String(s)) => f.write_str(&s),
                    _ => write!(f, "{:?}", self),
                }
            }
        }
    };
}

snake_display!(Severity);
snake_display!(RulePhase);
snake_display!(RuleCategory);

/// Everything a rule may look at
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// Owning task
    pub task_id: Uuid,
    /// Plan step, when running under the plan-driven engine
    pub step_id: Option<String>,
    /// Tool name
    pub tool: String,
    /// Tool parameters
    pub input: Params,
    /// Whether the tool mutates the resource
    pub mutating: bool,
    /// Resolved target
    pub target: Option<Target>,
    /// Expected role of the output
    pub role: Option<StepRole>,
    /// Tool result (post-execution phases only)
    pub result: Option<ToolInvocationResult>,
    /// The user explicitly confirmed this step
    pub confirmed: bool,
}

impl ValidationContext {
    /// Context for a tool call
    pub fn new(task_id: Uuid, tool: impl Into<String>, input: Params) -> Self {
        Self {
            task_id,
            step_id: None,
            tool: tool.into(),
            input,
            mutating: false,
            target: None,
            role: None,
            result: None,
            confirmed: false,
        }
    }
}

/// What a rule reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheckResult {
    /// Whether the check passed
    pub passed: bool,
    /// Human-readable message
    pub message: String,
    /// Structured evidence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Free-text fix suggestion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    /// Parameter overrides that would fix the problem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Params>,
}

impl ValidationCheckResult {
    /// Passing result
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: String::new(),
            details: None,
            suggested_fix: None,
            patch: None,
        }
    }

    /// Failing result
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            ..Self::pass()
        }
    }

    /// Attach evidence
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a fix suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_fix = Some(suggestion.into());
        self
    }

    /// Attach a parameter patch
    pub fn with_patch(mut self, patch: Params) -> Self {
        self.patch = Some(patch);
        self
    }
}

/// A pluggable check
#[async_trait]
pub trait ValidationRule: Send + Sync {
    /// Unique id
    fn id(&self) -> &str;

    /// Declared severity
    fn severity(&self) -> Severity;

    /// Phase the rule runs in
    fn phase(&self) -> RulePhase;

    /// Problem category
    fn category(&self) -> RuleCategory;

    /// One-line description
    fn description(&self) -> &str {
        ""
    }

    /// Run the check; the reader is `None` when no resource is attached
    async fn check(
        &self,
        ctx: &ValidationContext,
        reader: Option<&dyn ResourceReader>,
    ) -> anyhow::Result<ValidationCheckResult>;
}

/// Result of one rule run, with the effective severity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    /// Rule id
    pub rule_id: String,
    /// Severity after downgrades
    pub severity: Severity,
    /// Rule category
    pub category: RuleCategory,
    /// Phase it ran in
    pub phase: RulePhase,
    /// Check result
    pub result: ValidationCheckResult,
}

impl RuleOutcome {
    /// Whether the check failed
    pub fn failed(&self) -> bool {
        !self.result.passed
    }
}

/// Registered rule with its runtime switches
#[derive(Clone)]
struct RuleEntry {
    rule: Arc<dyn ValidationRule>,
    enabled: bool,
    downgraded: bool,
}

impl RuleEntry {
    fn effective_severity(&self) -> Severity {
        if self.downgraded {
            Severity::Warn
        } else {
            self.rule.severity()
        }
    }
}

/// Listing entry for a registered rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleInfo {
    /// Rule id
    pub id: String,
    /// Phase
    pub phase: RulePhase,
    /// Declared severity
    pub severity: Severity,
    /// Severity after downgrades
    pub effective_severity: Severity,
    /// Category
    pub category: RuleCategory,
    /// Per-rule switch
    pub enabled: bool,
    /// Description
    pub description: String,
}

#[derive(Default)]
struct EngineState {
    disabled: bool,
    entries: Vec<RuleEntry>,
}

/// Rule registry and runner
#[derive(Clone, Default)]
pub struct RuleEngine {
    state: Arc<RwLock<EngineState>>,
}

impl fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("RuleEngine")
            .field("enabled", &!state.disabled)
            .field("rules", &state.entries.len())
            .finish()
    }
}

impl RuleEngine {
    /// Engine without rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with the built-in rules, configured
    pub fn with_builtin_rules(config: &ValidationConfig) -> Self {
        let engine = Self::new();
        for rule in rules::builtin_rules(config) {
            engine.register(rule);
        }
        engine.apply_config(config);
        engine
    }

    /// Apply global switch, disabled and downgraded rule lists
    pub fn apply_config(&self, config: &ValidationConfig) {
        self.set_globally_enabled(config.enabled);
        for id in &config.disabled_rules {
            if !self.set_enabled(id, false) {
                tracing::warn!(rule = %id, "cannot disable unknown rule");
            }
        }
        for id in &config.downgraded_rules {
            if !self.downgrade(id) {
                tracing::warn!(rule = %id, "cannot downgrade unknown rule");
            }
        }
    }

    /// Register a rule; an existing rule with the same id is replaced
    pub fn register(&self, rule: Arc<dyn ValidationRule>) {
        let mut state = self.state.write();
        let id = rule.id().to_string();
        state.entries.retain(|e| e.rule.id() != id);
        tracing::debug!(rule = %id, phase = %rule.phase(), "registering validation rule");
        state.entries.push(RuleEntry {
            rule,
            enabled: true,
            downgraded: false,
        });
    }

    /// Turn every rule on or off
    pub fn set_globally_enabled(&self, enabled: bool) {
        self.state.write().disabled = !enabled;
    }

    /// Turn one rule on or off; false if the rule is unknown
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut state = self.state.write();
        match state.entries.iter_mut().find(|e| e.rule.id() == id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Downgrade a rule from block to warn; false if the rule is unknown
    pub fn downgrade(&self, id: &str) -> bool {
        let mut state = self.state.write();
        match state.entries.iter_mut().find(|e| e.rule.id() == id) {
            Some(entry) => {
                entry.downgraded = true;
                true
            }
            None => false,
        }
    }

    /// Registered rules in registration order
    pub fn rules(&self) -> Vec<RuleInfo> {
        self.state
            .read()
            .entries
            .iter()
            .map(|e| RuleInfo {
                id: e.rule.id().to_string(),
                phase: e.rule.phase(),
                severity: e.rule.severity(),
                effective_severity: e.effective_severity(),
                category: e.rule.category(),
                enabled: e.enabled,
                description: e.rule.description().to_string(),
            })
            .collect()
    }

    /// Run every enabled rule of a phase
    pub async fn run(
        &self,
        ctx: &ValidationContext,
        phase: RulePhase,
        reader: Option<&dyn ResourceReader>,
    ) -> Vec<RuleOutcome> {
        self.run_except(ctx, phase, reader, &HashSet::new()).await
    }

    /// Run every enabled rule of a phase, skipping the given rule ids
    pub async fn run_except(
        &self,
        ctx: &ValidationContext,
        phase: RulePhase,
        reader: Option<&dyn ResourceReader>,
        skip: &HashSet<String>,
    ) -> Vec<RuleOutcome> {
        let selected: Vec<RuleEntry> = {
            let state = self.state.read();
            if state.disabled {
                return Vec::new();
            }
            state
                .entries
                .iter()
                .filter(|e| e.enabled && e.rule.phase() == phase && !skip.contains(e.rule.id()))
                .cloned()
                .collect()
        };

        let checks = selected.iter().map(|entry| async move {
            let id = entry.rule.id().to_string();
            let outcome = AssertUnwindSafe(entry.rule.check(ctx, reader))
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    tracing::warn!(rule = %id, error = %err, "validation rule errored");
                    ValidationCheckResult::fail(format!("rule '{}' errored: {:#}", id, err))
                }
                Err(_) => {
                    tracing::error!(rule = %id, "validation rule panicked");
                    ValidationCheckResult::fail(format!("rule '{}' panicked", id))
                }
            };
            RuleOutcome {
                rule_id: id,
                severity: entry.effective_severity(),
                category: entry.rule.category(),
                phase,
                result,
            }
        });

        let outcomes = join_all(checks).await;
        for outcome in outcomes.iter().filter(|o| o.failed()) {
            tracing::info!(
                task_id = %ctx.task_id,
                rule = %outcome.rule_id,
                severity = %outcome.severity,
                message = %outcome.result.message,
                "validation rule failed"
            );
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        id: &'static str,
        phase: RulePhase,
        passed: bool,
    }

    #[async_trait]
    impl ValidationRule for Fixed {
        fn id(&self) -> &str {
            self.id
        }
        fn severity(&self) -> Severity {
            Severity::Block
        }
        fn phase(&self) -> RulePhase {
            self.phase
        }
        fn category(&self) -> RuleCategory {
            RuleCategory::Structural
        }
        async fn check(
            &self,
            _ctx: &ValidationContext,
            _reader: Option<&dyn ResourceReader>,
        ) -> anyhow::Result<ValidationCheckResult> {
            if self.passed {
                Ok(ValidationCheckResult::pass())
            } else {
                Ok(ValidationCheckResult::fail("bad"))
            }
        }
    }

    struct Broken;

    #[async_trait]
    impl ValidationRule for Broken {
        fn id(&self) -> &str {
            "broken"
        }
        fn severity(&self) -> Severity {
            Severity::Warn
        }
        fn phase(&self) -> RulePhase {
            RulePhase::PostExecution
        }
        fn category(&self) -> RuleCategory {
            RuleCategory::Cosmetic
        }
        async fn check(
            &self,
            _ctx: &ValidationContext,
            _reader: Option<&dyn ResourceReader>,
        ) -> anyhow::Result<ValidationCheckResult> {
            anyhow::bail!("lookup failed")
        }
    }

    fn ctx() -> ValidationContext {
        ValidationContext::new(Uuid::new_v4(), "write_range", Params::new())
    }

    #[tokio::test]
    async fn runs_only_the_requested_phase() {
        let engine = RuleEngine::new();
        engine.register(Arc::new(Fixed {
            id: "pre",
            phase: RulePhase::PreExecution,
            passed: false,
        }));
        engine.register(Arc::new(Fixed {
            id: "post",
            phase: RulePhase::PostExecution,
            passed: true,
        }));

        let outcomes = engine.run(&ctx(), RulePhase::PreExecution, None).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].rule_id, "pre");
        assert!(outcomes[0].failed());
    }

    #[tokio::test]
    async fn erroring_rule_fails_instead_of_passing() {
        let engine = RuleEngine::new();
        engine.register(Arc::new(Broken));
        let outcomes = engine.run(&ctx(), RulePhase::PostExecution, None).await;
        assert!(outcomes[0].failed());
        assert!(outcomes[0].result.message.contains("lookup failed"));
    }

    #[tokio::test]
    async fn switches_and_downgrades_apply() {
        let engine = RuleEngine::new();
        engine.register(Arc::new(Fixed {
            id: "a",
            phase: RulePhase::PostExecution,
            passed: false,
        }));
        engine.register(Arc::new(Fixed {
            id: "b",
            phase: RulePhase::PostExecution,
            passed: false,
        }));

        assert!(engine.downgrade("a"));
        assert!(engine.set_enabled("b", false));
        assert!(!engine.set_enabled("missing", false));

        let outcomes = engine.run(&ctx(), RulePhase::PostExecution, None).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].severity, Severity::Warn);

        engine.set_globally_enabled(false);
        assert!(engine.run(&ctx(), RulePhase::PostExecution, None).await.is_empty());
    }

    #[tokio::test]
    async fn skipped_rules_do_not_run() {
        let engine = RuleEngine::new();
        engine.register(Arc::new(Fixed {
            id: "a",
            phase: RulePhase::PostExecution,
            passed: false,
        }));
        let skip: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert!(engine
            .run_except(&ctx(), RulePhase::PostExecution, None, &skip)
            .await
            .is_empty());
    }
}
