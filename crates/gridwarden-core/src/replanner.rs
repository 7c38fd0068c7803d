//! Replanner
//!
//! Sends the real failure context to the planner and returns replacement
//! steps for the remainder of the plan. The attempt bound lives here so both
//! executors share it.

use crate::error::{Result, WardenError};
use crate::plan::PlanStep;
use crate::planner::{parse_plan, PlannerGateway, PlannerRequest};
use crate::task::{StepEvent, Task};
use crate::tool::ToolMetadata;
use crate::types::{truncate_chars, Params};
use serde::Serialize;
use std::sync::Arc;

/// Output of a step that already ran
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedStep {
    /// Step id
    pub id: String,
    /// Tool used
    pub action: String,
    /// Truncated tool output
    pub output: String,
}

/// A step that has not run yet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemainingStep {
    /// Step id
    pub id: String,
    /// Tool
    pub action: String,
    /// What it was meant to do
    pub description: String,
}

/// Everything the planner needs to propose a recovery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureContext {
    /// The original request
    pub request: String,
    /// Action that failed
    pub failing_action: String,
    /// Its parameters
    pub parameters: Params,
    /// Raw error text
    pub error: String,
    /// Steps that completed, with truncated outputs
    pub completed: Vec<CompletedStep>,
    /// Steps that were still to run
    pub remaining: Vec<RemainingStep>,
    /// User's answer to a clarification question
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_answer: Option<String>,
}

impl FailureContext {
    /// Context for a failed step of the task's plan.
    ///
    /// `index` is the failing step; everything after it counts as remaining.
    pub fn for_step(task: &Task, index: usize, error: impl Into<String>, output_chars: usize) -> Self {
        let steps = task.plan.as_ref().map(|p| p.steps.as_slice()).unwrap_or_default();
        let (failing_action, parameters) = steps
            .get(index)
            .map(|s| (s.action.clone(), s.parameters.clone()))
            .unwrap_or_default();
        let completed = steps
            .iter()
            .filter(|s| s.status == crate::plan::StepStatus::Completed)
            .map(|s| CompletedStep {
                id: s.id.clone(),
                action: s.action.clone(),
                output: s
                    .result
                    .as_ref()
                    .map(|r| truncate_chars(&r.output, output_chars))
                    .unwrap_or_default(),
            })
            .collect();
        let remaining = steps
            .iter()
            .skip(index + 1)
            .filter(|s| !s.status.is_finished())
            .map(|s| RemainingStep {
                id: s.id.clone(),
                action: s.action.clone(),
                description: s.description.clone(),
            })
            .collect();
        Self {
            request: task.request.clone(),
            failing_action,
            parameters,
            error: error.into(),
            completed,
            remaining,
            user_answer: None,
        }
    }

    /// Attach the user's answer
    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.user_answer = Some(answer.into());
        self
    }

    fn to_message(&self) -> Result<String> {
        Ok(format!(
            "A step of the current plan failed. Propose replacement steps for everything \
             that has not completed yet, using the failure context below.\n{}",
            serde_json::to_string_pretty(self)?
        ))
    }
}

fn replan_prompt(catalog: &[ToolMetadata]) -> String {
    format!(
        "{}\nOnly include steps that still need to run; completed steps stay as they are.",
        crate::planner::plan_prompt(catalog)
    )
}

/// Asks the planner for replacement steps, at most `max_attempts` times per task
#[derive(Clone)]
pub struct Replanner {
    planner: Arc<dyn PlannerGateway>,
    max_attempts: u32,
}

impl std::fmt::Debug for Replanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replanner")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Replanner {
    /// Replanner over a planner gateway
    pub fn new(planner: Arc<dyn PlannerGateway>, max_attempts: u32) -> Self {
        Self {
            planner,
            max_attempts,
        }
    }

    /// Attempts allowed per task
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Request replacement steps; counts against the task's replan budget
    pub async fn replan(
        &self,
        task: &mut Task,
        context: &FailureContext,
        catalog: &[ToolMetadata],
    ) -> Result<Vec<PlanStep>> {
        if task.replan_attempts >= self.max_attempts {
            tracing::warn!(task_id = %task.id, attempts = task.replan_attempts, "replan budget exhausted");
            return Err(WardenError::ReplanExhausted {
                attempts: task.replan_attempts,
            });
        }
        task.replan_attempts += 1;
        tracing::info!(
            task_id = %task.id,
            attempt = task.replan_attempts,
            tool = %context.failing_action,
            "requesting replan"
        );

        let request = PlannerRequest::json(replan_prompt(catalog), context.to_message()?);
        let response = self
            .planner
            .complete(request)
            .await
            .map_err(|e| WardenError::PlannerUnavailable(format!("{:#}", e)))?;
        if response.truncated {
            tracing::warn!(task_id = %task.id, "replan response was truncated");
        }

        let parsed = parse_plan(&response.message)?;
        for repair in &parsed.repairs {
            task.log(None, StepEvent::Note, format!("replan response repaired: {}", repair));
        }
        if parsed.plan.steps.is_empty() {
            return Err(WardenError::InvalidPlan(
                "planner proposed no recovery steps".to_string(),
            ));
        }
        task.log(
            None,
            StepEvent::Replanned,
            format!(
                "attempt {}: {} replacement step(s)",
                task.replan_attempts,
                parsed.plan.steps.len()
            ),
        );
        Ok(parsed.plan.steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ExecutionPlan, StepStatus};
    use crate::planner::ScriptedPlanner;
    use crate::tool::ToolInvocationResult;
    use crate::types::params_from;
    use serde_json::json;

    fn task_with_plan() -> Task {
        let mut task = Task::new("copy totals");
        let mut plan = ExecutionPlan::new(
            "copy",
            vec![
                PlanStep::new(1, "read_range", params_from(json!({"sheet": "S", "range": "A1"}))),
                PlanStep::new(2, "write_range", params_from(json!({"sheet": "S", "range": "B1"}))),
                PlanStep::new(3, "set_formula", Params::new()).with_description("total"),
            ],
        );
        plan.steps[0].status = StepStatus::Completed;
        plan.steps[0].result = Some(ToolInvocationResult::ok("x".repeat(50)));
        plan.steps[1].status = StepStatus::Failed;
        task.plan = Some(plan);
        task
    }

    #[test]
    fn test_context_captures_progress() {
        let task = task_with_plan();
        let ctx = FailureContext::for_step(&task, 1, "sheet locked", 10).with_answer("use sheet T");
        assert_eq!(ctx.failing_action, "write_range");
        assert_eq!(ctx.completed.len(), 1);
        assert_eq!(ctx.completed[0].output.chars().count(), 10);
        assert_eq!(ctx.remaining.len(), 1);
        assert_eq!(ctx.remaining[0].description, "total");
        assert!(ctx.to_message().unwrap().contains("use sheet T"));
    }

    #[tokio::test]
    async fn test_replan_is_bounded() {
        let planner = Arc::new(ScriptedPlanner::new(vec![
            r#"{"steps": [{"order": 1, "action": "read_range", "parameters": {}}]}"#;
            3
        ]));
        let replanner = Replanner::new(planner.clone(), 2);
        let mut task = task_with_plan();
        let ctx = FailureContext::for_step(&task, 1, "boom", 100);

        assert_eq!(replanner.replan(&mut task, &ctx, &[]).await.unwrap().len(), 1);
        assert!(replanner.replan(&mut task, &ctx, &[]).await.is_ok());
        let err = replanner.replan(&mut task, &ctx, &[]).await.unwrap_err();
        assert!(matches!(err, WardenError::ReplanExhausted { attempts: 2 }));
        assert_eq!(planner.remaining(), 1);
        assert!(planner.requests()[0].message.contains("boom"));
    }

    #[tokio::test]
    async fn test_empty_replan_is_an_error() {
        let planner = Arc::new(ScriptedPlanner::new(vec![r#"{"steps": []}"#]));
        let replanner = Replanner::new(planner, 3);
        let mut task = task_with_plan();
        let ctx = FailureContext::for_step(&task, 1, "boom", 100);
        assert!(matches!(
            replanner.replan(&mut task, &ctx, &[]).await,
            Err(WardenError::InvalidPlan(_))
        ));
    }
}
