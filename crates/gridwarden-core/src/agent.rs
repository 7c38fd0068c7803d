//! Agent façade
//!
//! One entry point per request: classify, plan, validate the plan, then run it
//! with the plan-driven engine. Read-only questions, unparseable plans and
//! structurally broken plans go to the reactive loop instead.

use crate::config::WardenConfig;
use crate::engine::{ExecutionEngine, Toolbox};
use crate::error::Result;
use crate::intent::{IntentClassifier, KeywordClassifier};
use crate::ledger::{FileLedgerStore, LedgerPersistence, LedgerStore};
use crate::plan::ExecutionPlan;
use crate::plan_validator::PlanValidator;
use crate::planner::{parse_plan, plan_prompt, PlannerGateway, PlannerRequest};
use crate::reactive::ReactiveLoop;
use crate::replanner::Replanner;
use crate::resource::ResourceAccess;
use crate::task::{Outcome, StepEvent, Task, UserReply};
use crate::tool::{ToolInvoker, ToolRegistry};
use crate::validation::{RuleEngine, ValidationErrorTracker};
use std::sync::Arc;

/// Minimum confidence for running a query without write tools
const READ_ONLY_CONFIDENCE: f64 = 0.6;

/// Routes requests to the engine or the reactive loop
pub struct Agent {
    config: WardenConfig,
    classifier: Box<dyn IntentClassifier>,
    planner: Arc<dyn PlannerGateway>,
    validator: PlanValidator,
    engine: ExecutionEngine,
    reactive: ReactiveLoop,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("engine", &self.engine)
            .field("reactive", &self.reactive)
            .finish()
    }
}

impl Agent {
    /// Agent over a tool registry, an optional resource and a planner.
    ///
    /// Ledgers are persisted to `config.ledger.dir` when it is set.
    pub fn new(
        config: WardenConfig,
        registry: ToolRegistry,
        resource: Option<Arc<dyn ResourceAccess>>,
        planner: Arc<dyn PlannerGateway>,
    ) -> Self {
        let rules = RuleEngine::with_builtin_rules(&config.validation);
        let toolbox = Toolbox::new(ToolInvoker::new(registry.clone()), rules, resource);
        let replanner = Replanner::new(planner.clone(), config.engine.max_replan_attempts);
        let mut engine = ExecutionEngine::new(toolbox.clone(), replanner, config.engine.clone());
        let mut reactive = ReactiveLoop::new(toolbox, planner.clone(), config.reactive.clone())
            .with_rollback_on_failure(config.engine.rollback_on_failure);

        if let Some(dir) = &config.ledger.dir {
            let store: Arc<dyn LedgerStore> = Arc::new(FileLedgerStore::new(dir));
            let persistence = LedgerPersistence::new(
                store,
                config.ledger.max_records,
                chrono::Duration::hours(config.ledger.retention_hours),
            );
            engine = engine.with_persistence(persistence.clone());
            reactive = reactive.with_persistence(persistence);
        }

        Self {
            config,
            classifier: Box::new(KeywordClassifier::new()),
            planner,
            validator: PlanValidator::new(registry),
            engine,
            reactive,
        }
    }

    /// Replace the intent classifier
    pub fn with_classifier(mut self, classifier: Box<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Persist ledgers through a custom store
    pub fn with_persistence(mut self, persistence: LedgerPersistence) -> Self {
        self.engine = self.engine.with_persistence(persistence.clone());
        self.reactive = self.reactive.with_persistence(persistence);
        self
    }

    /// Plan-driven engine
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Fresh task carrying the configured error ceiling
    pub fn new_task(&self, request: &str) -> Task {
        Task::new(request).with_error_tracker(ValidationErrorTracker::new(
            self.config.validation.max_identical_errors,
            self.config.validation.max_consecutive_failures,
        ))
    }

    /// Handle one request from start to its first stop
    pub async fn handle(&self, request: &str) -> (Task, Outcome) {
        let mut task = self.new_task(request);
        tracing::info!(task_id = %task.id, "handling request");

        let classification = self.classifier.classify(request);
        task.log(
            None,
            StepEvent::Note,
            format!("intent {} ({:.2})", classification.intent, classification.confidence),
        );
        if classification.is_confident_query(READ_ONLY_CONFIDENCE) {
            tracing::info!(task_id = %task.id, "read-only request, using the reactive loop");
            let outcome = self.reactive.clone().read_only(true).run(&mut task).await;
            return (task, outcome);
        }

        let outcome = match self.plan(&mut task).await {
            Some(plan) => self.engine.execute(&mut task, plan).await,
            None => self.reactive.run(&mut task).await,
        };
        (task, outcome)
    }

    /// Continue a suspended task
    pub async fn resume(&self, task: &mut Task, reply: UserReply) -> Result<Outcome> {
        if task.plan.is_some() {
            return self.engine.resume(task, reply).await;
        }
        let read_only = self
            .classifier
            .classify(&task.request)
            .is_confident_query(READ_ONLY_CONFIDENCE);
        self.reactive.clone().read_only(read_only).resume(task, reply).await
    }

    /// Ask for a plan and validate it; `None` sends the task to the reactive loop
    async fn plan(&self, task: &mut Task) -> Option<ExecutionPlan> {
        let catalog = self.engine.toolbox().catalog();
        let request = PlannerRequest::json(plan_prompt(&catalog), task.request.clone());
        let response = match self.planner.complete(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %format!("{:#}", err), "planning failed");
                task.log(None, StepEvent::Note, format!("planning failed: {:#}", err));
                return None;
            }
        };
        if response.truncated {
            tracing::warn!(task_id = %task.id, "plan response was truncated");
        }

        let parsed = match parse_plan(&response.message) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "no plan could be parsed");
                task.log(None, StepEvent::Note, format!("no usable plan: {}", err));
                return None;
            }
        };
        for repair in &parsed.repairs {
            task.log(None, StepEvent::Note, format!("plan response repaired: {}", repair));
        }
        for dropped in &parsed.dropped {
            task.note_issue(format!("dropped step without an action: {}", dropped));
        }
        if parsed.plan.steps.is_empty() {
            task.log(None, StepEvent::Note, "plan has no steps");
            return None;
        }

        let report = self
            .validator
            .full_check(&parsed.plan, self.engine.toolbox().reader())
            .await;
        for issue in &report.issues {
            let step = issue.step_id.as_deref().unwrap_or("plan");
            task.note_issue(format!("{} [{}]: {}", issue.rule_name, step, issue.message));
        }
        if report.is_structurally_broken() {
            tracing::warn!(task_id = %task.id, issues = report.issues.len(), "plan is structurally broken");
            task.log(None, StepEvent::Note, "plan is structurally broken, working step by step");
            return None;
        }
        tracing::info!(task_id = %task.id, steps = parsed.plan.steps.len(), issues = report.issues.len(), "plan accepted");
        Some(parsed.plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ScriptedPlanner;
    use crate::task::TaskStatus;
    use crate::workbook::{register_reference_tools, Workbook, WorkbookHandle};

    fn agent(responses: Vec<&str>) -> (Agent, Arc<ScriptedPlanner>) {
        let book = WorkbookHandle::new(Workbook::with_sheets(["Sales"]));
        let registry = ToolRegistry::new();
        register_reference_tools(&registry, &book);
        let planner = Arc::new(ScriptedPlanner::new(responses));
        let access: Arc<dyn ResourceAccess> = Arc::new(book);
        let agent = Agent::new(WardenConfig::default(), registry, Some(access), planner.clone());
        (agent, planner)
    }

    #[tokio::test]
    async fn test_queries_skip_planning() {
        let (agent, planner) = agent(vec![r#"{"action": "complete", "message": "B4 is empty"}"#]);
        let (task, outcome) = agent.handle("What is in B4?").await;
        assert_eq!(outcome, Outcome::Completed("B4 is empty".into()));
        assert!(task.plan.is_none());
        assert!(planner.requests()[0].system_prompt.contains("one action at a time"));
        assert!(!planner.requests()[0].system_prompt.contains("write_range"));
    }

    #[tokio::test]
    async fn test_unparseable_plan_falls_back_to_reactive() {
        let (agent, planner) = agent(vec![
            "I would start by looking at the sheet.",
            r#"{"action": "complete", "message": "nothing to do"}"#,
        ]);
        let (task, outcome) = agent.handle("Tidy the Sales sheet").await;
        assert!(matches!(outcome, Outcome::Completed(_)));
        assert!(task.plan.is_none());
        assert_eq!(planner.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_broken_plan_is_not_executed() {
        let (agent, _) = agent(vec![
            r#"{"steps": [{"order": 1, "action": "melt_sheet", "parameters": {}}]}"#,
            r#"{"action": "ask_user", "question": "what should change?"}"#,
        ]);
        let (task, outcome) = agent.handle("Fix the Sales sheet").await;
        assert_eq!(task.status(), TaskStatus::PendingClarification);
        assert!(outcome.is_suspended());
        assert!(task.issues.iter().any(|i| i.contains("unknown_tool")));
    }
}
