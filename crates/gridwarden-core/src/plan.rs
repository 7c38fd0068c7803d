//! Execution plans
//!
//! A plan is the ordered list of steps proposed by the planner. Steps are
//! mutated only by the engine; once a step completes or fails only its
//! rollback status may change.

use crate::tool::ToolInvocationResult;
use crate::types::{param_str, Params};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Lifecycle of one plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started
    Pending,
    /// In flight
    Running,
    /// Succeeded (and verified, for writes)
    Completed,
    /// Failed
    Failed,
    /// Not executed (rejected by the user or made obsolete)
    Skipped,
}

impl StepStatus {
    /// Completed, failed or skipped
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Rollback overlay on a finished step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// The step's effect was reversed
    RolledBack,
    /// Reversal was attempted and failed
    RollbackFailed,
}

/// Expected role of a step's output, derived from its parameters or success condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    /// Output must be derived with formulas
    Formula,
    /// Output must aggregate distinct rows
    Aggregate,
}

impl StepRole {
    /// Role named by a `role` parameter
    pub fn from_params(params: &Params) -> Option<Self> {
        match param_str(params, "role") {
            Some("formula") => Some(StepRole::Formula),
            Some("aggregate") => Some(StepRole::Aggregate),
            _ => None,
        }
    }
}

/// One step of an execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique id inside the plan
    pub id: String,
    /// Position (1-based)
    pub order: u32,
    /// Tool name
    pub action: String,
    /// Tool parameters
    #[serde(default)]
    pub parameters: Params,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Declared by the planner as mutating
    #[serde(default)]
    pub is_write_operation: bool,
    /// Free-text success condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,
    /// Ids of steps this one depends on
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Current status
    #[serde(default = "default_status")]
    pub status: StepStatus,
    /// Tool result once run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolInvocationResult>,
    /// Ran through a degraded alternate tool
    #[serde(default)]
    pub semantically_changed: bool,
    /// Rollback overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_status: Option<RollbackStatus>,
}

fn default_status() -> StepStatus {
    StepStatus::Pending
}

impl PlanStep {
    /// New pending step
    pub fn new(order: u32, action: impl Into<String>, parameters: Params) -> Self {
        Self {
            id: format!("step-{}", order),
            order,
            action: action.into(),
            parameters,
            description: String::new(),
            is_write_operation: false,
            success_condition: None,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            semantically_changed: false,
            rollback_status: None,
        }
    }

    /// Set the id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark as declared write
    pub fn declared_write(mut self) -> Self {
        self.is_write_operation = true;
        self
    }

    /// Set the success condition
    pub fn with_success_condition(mut self, condition: impl Into<String>) -> Self {
        self.success_condition = Some(condition.into());
        self
    }

    /// Add dependencies
    pub fn depending_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Role requested by a `role` parameter or implied by the success condition
    pub fn role(&self) -> Option<StepRole> {
        if let Some(role) = StepRole::from_params(&self.parameters) {
            return Some(role);
        }
        let condition = self.success_condition.as_deref()?.to_lowercase();
        if condition.contains("formula") {
            Some(StepRole::Formula)
        } else if condition.contains("aggregate")
            || condition.contains("distinct")
            || condition.contains("unique")
        {
            Some(StepRole::Aggregate)
        } else {
            None
        }
    }

    /// Short label for logs and reports
    pub fn label(&self) -> String {
        if self.description.is_empty() {
            format!("{} ({})", self.id, self.action)
        } else {
            format!("{} ({}: {})", self.id, self.action, self.description)
        }
    }
}

/// Ordered plan proposed by the planner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// What the user wants, as understood by the planner
    #[serde(default)]
    pub intent: String,
    /// Steps in execution order
    pub steps: Vec<PlanStep>,
    /// Plan-level success conditions
    #[serde(default)]
    pub success_conditions: Vec<String>,
    /// Message shown on completion
    #[serde(default)]
    pub completion_message: String,
}

impl ExecutionPlan {
    /// Plan from steps; orders are normalized
    pub fn new(intent: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        let mut plan = Self {
            intent: intent.into(),
            steps,
            ..Default::default()
        };
        plan.renumber();
        plan
    }

    /// Set the completion message
    pub fn with_completion_message(mut self, message: impl Into<String>) -> Self {
        self.completion_message = message.into();
        self
    }

    /// Whether there are no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of a step by id
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Borrow a step by id
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Ids of completed steps
    pub fn completed_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Rewrite `order` to match positions
    pub fn renumber(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.order = i as u32 + 1;
        }
    }

    /// Replace every step from `index` onward with `replacement`.
    ///
    /// Replacement ids that collide with kept steps are rewritten, and
    /// dependencies on steps that no longer exist are dropped.
    pub fn splice_remaining(&mut self, index: usize, replacement: Vec<PlanStep>) {
        self.steps.truncate(index);
        let mut taken: HashSet<String> = self.steps.iter().map(|s| s.id.clone()).collect();
        let mut counter = self.steps.len() as u32;
        for mut step in replacement {
            counter += 1;
            if taken.contains(&step.id) {
                let mut suffix = 1;
                let base = step.id.clone();
                while taken.contains(&step.id) {
                    step.id = format!("{}-r{}", base, suffix);
                    suffix += 1;
                }
            }
            step.status = StepStatus::Pending;
            step.result = None;
            step.rollback_status = None;
            step.order = counter;
            taken.insert(step.id.clone());
            self.steps.push(step);
        }
        let ids: HashSet<String> = self.steps.iter().map(|s| s.id.clone()).collect();
        for step in &mut self.steps[index..] {
            step.depends_on.retain(|d| ids.contains(d));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::params_from;
    use serde_json::json;

    #[test]
    fn role_comes_from_param_or_condition() {
        let step = PlanStep::new(1, "write_range", params_from(json!({"role": "formula"})));
        assert_eq!(step.role(), Some(StepRole::Formula));

        let step = PlanStep::new(1, "write_range", Params::new())
            .with_success_condition("each row holds a distinct customer");
        assert_eq!(step.role(), Some(StepRole::Aggregate));

        assert_eq!(PlanStep::new(1, "read_range", Params::new()).role(), None);
    }

    #[test]
    fn splice_keeps_prefix_and_renames_collisions() {
        let mut plan = ExecutionPlan::new(
            "fill totals",
            vec![
                PlanStep::new(1, "read_range", Params::new()),
                PlanStep::new(2, "write_range", Params::new()),
            ],
        );
        plan.steps[0].status = StepStatus::Completed;

        plan.splice_remaining(
            1,
            vec![
                PlanStep::new(1, "set_formula", Params::new()).depending_on(["step-1", "gone"]),
            ],
        );

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].id, "step-1-r1");
        assert_eq!(plan.steps[1].order, 2);
        assert_eq!(plan.steps[1].depends_on, vec!["step-1".to_string()]);
        assert_eq!(plan.steps[0].status, StepStatus::Completed);
    }
}
