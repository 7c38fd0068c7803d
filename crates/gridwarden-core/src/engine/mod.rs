//! Plan-driven execution engine
//!
//! Runs an [`ExecutionPlan`] step by step against the resource. Every
//! mutating call is snapshotted and recorded in the task ledger, every step
//! is checked by the rule engine, and failing signals are turned into a
//! decision by the [`DecisionResolver`]. Tool failures go through local
//! parameter repair, then the tool's alternate, then the [`Replanner`].

pub mod repair;
pub mod verify;

pub use repair::{repair_params, ParamRepair};
pub use verify::verify_write;

use crate::config::EngineConfig;
use crate::error::{BudgetKind, Result, WardenError};
use crate::ledger::{LedgerPersistence, OperationResult, RollbackData};
use crate::plan::{ExecutionPlan, PlanStep, StepRole, StepStatus};
use crate::replanner::{FailureContext, Replanner};
use crate::resource::{ResourceAccess, ResourceReader};
use crate::signal::{DecisionResolver, SignalDecision, ValidationSignal};
use crate::snapshot::SnapshotManager;
use crate::task::{ControlState, Outcome, PendingQuestion, StepEvent, Task, TaskStatus, UserReply};
use crate::tool::{
    Target, TargetSpec, ToolEffect, ToolInvocationResult, ToolInvoker, ToolMetadata,
};
use crate::types::Params;
use crate::validation::{RuleEngine, RulePhase, ValidationContext};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Result of one tracked tool call
#[derive(Debug, Clone)]
pub struct ToolRun {
    /// What the tool returned
    pub result: ToolInvocationResult,
    /// Ledger record of a mutating call
    pub operation: Option<Uuid>,
    /// Pre-state captured before a mutating call
    pub before: Option<RollbackData>,
    /// Served from the read cache
    pub cached: bool,
}

/// Machinery shared by the plan-driven engine and the reactive loop
#[derive(Clone)]
pub struct Toolbox {
    invoker: ToolInvoker,
    rules: RuleEngine,
    snapshots: SnapshotManager,
    resource: Option<Arc<dyn ResourceAccess>>,
    resolver: DecisionResolver,
}

impl std::fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolbox")
            .field("tools", &self.invoker.registry().names())
            .field("has_resource", &self.resource.is_some())
            .finish()
    }
}

impl Toolbox {
    /// Toolbox over an invoker, a rule engine and an optional resource
    pub fn new(
        invoker: ToolInvoker,
        rules: RuleEngine,
        resource: Option<Arc<dyn ResourceAccess>>,
    ) -> Self {
        Self {
            snapshots: SnapshotManager::new(resource.clone(), invoker.clone()),
            invoker,
            rules,
            resource,
            resolver: DecisionResolver::new(),
        }
    }

    /// Tool invoker
    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    /// Rule engine
    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    /// Snapshot manager
    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Resource as a reader, when one is attached
    pub fn reader(&self) -> Option<&dyn ResourceReader> {
        self.resource.as_deref().map(|r| r.as_reader())
    }

    /// Tool metadata
    pub fn metadata(&self, tool: &str) -> Option<ToolMetadata> {
        self.invoker.registry().metadata(tool)
    }

    /// Every tool's metadata, sorted by name
    pub fn catalog(&self) -> Vec<ToolMetadata> {
        self.invoker.registry().catalog()
    }

    /// Sheet names of the resource, empty when unavailable
    pub async fn sheet_names(&self) -> Vec<String> {
        match self.reader() {
            Some(reader) => reader.sheet_names().await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Run a tool on behalf of a task.
    ///
    /// Reads are served from the task cache when possible. Mutating calls are
    /// snapshotted first and appended to the ledger. Fails only when the call
    /// budget `limit` is spent or the tool is unknown.
    pub async fn run_tool(
        &self,
        task: &mut Task,
        meta: &ToolMetadata,
        input: &Params,
        step_id: Option<&str>,
        limit: u32,
    ) -> Result<ToolRun> {
        if !meta.is_mutating() {
            if let Some(result) = task.read_cache.get(&meta.name, input) {
                tracing::debug!(task_id = %task.id, tool = %meta.name, "read served from cache");
                return Ok(ToolRun {
                    result,
                    operation: None,
                    before: None,
                    cached: true,
                });
            }
        }
        if task.tool_calls >= limit {
            return Err(WardenError::BudgetExceeded {
                kind: BudgetKind::ToolCalls,
                limit,
            });
        }

        let before = self.snapshots.snapshot(meta, input).await;
        task.tool_calls += 1;
        let result = self.invoker.invoke(&meta.name, input).await?;
        let target = meta.target.resolve(input);

        let operation = if meta.is_mutating() {
            let outcome = if result.success {
                OperationResult::Success
            } else {
                OperationResult::Failed
            };
            let id = task.ledger.append(
                &meta.name,
                input,
                outcome,
                step_id.map(str::to_string),
                before.clone(),
            );
            if result.success {
                match &target {
                    Some(target) => task.read_cache.invalidate_sheet(target.sheet()),
                    None => task.read_cache.clear(),
                }
            }
            Some(id)
        } else {
            if result.success {
                task.read_cache.put(
                    &meta.name,
                    input,
                    target.as_ref().map(Target::sheet),
                    result.clone(),
                );
            }
            None
        };

        tracing::debug!(
            task_id = %task.id,
            step_id = step_id.unwrap_or("-"),
            tool = %meta.name,
            success = result.success,
            "tool invoked"
        );
        Ok(ToolRun {
            result,
            operation,
            before,
            cached: false,
        })
    }

    /// Validation context for a call
    pub fn context(
        task: &Task,
        step_id: Option<&str>,
        meta: &ToolMetadata,
        input: &Params,
        role: Option<StepRole>,
    ) -> ValidationContext {
        let mut ctx = ValidationContext::new(task.id, meta.name.clone(), input.clone());
        ctx.step_id = step_id.map(str::to_string);
        ctx.mutating = meta.is_mutating();
        ctx.target = meta.target.resolve(input);
        ctx.role = role;
        ctx.confirmed = step_id.map_or(false, |id| task.confirmed_steps.contains(id));
        ctx
    }

    /// Run the given phases and turn failing outcomes into signals
    pub async fn validate(
        &self,
        task: &Task,
        ctx: &ValidationContext,
        phases: &[RulePhase],
    ) -> Vec<ValidationSignal> {
        let mut signals = Vec::new();
        for phase in phases {
            let outcomes = self
                .rules
                .run_except(ctx, *phase, self.reader(), &task.ignored_rules)
                .await;
            for outcome in outcomes.iter().filter(|o| o.failed()) {
                tracing::info!(
                    task_id = %task.id,
                    step_id = ctx.step_id.as_deref().unwrap_or("-"),
                    tool = %ctx.tool,
                    rule = %outcome.rule_id,
                    severity = %outcome.severity,
                    message = %outcome.result.message,
                    "validation signal"
                );
                signals.push(ValidationSignal::from_outcome(
                    outcome,
                    ctx.step_id.clone(),
                    &ctx.tool,
                    &ctx.input,
                ));
            }
        }
        signals
    }

    /// Resolve signals into one decision and record them on the task
    pub fn resolve(&self, task: &mut Task, mut signals: Vec<ValidationSignal>) -> SignalDecision {
        if signals.is_empty() {
            return SignalDecision::Continue;
        }
        let resolved = self.resolver.decide(&signals);
        for rule in &resolved.suppress {
            tracing::info!(task_id = %task.id, rule = %rule, "rule ignored for the rest of the task");
            task.ignored_rules.insert(rule.clone());
        }
        resolved.record(&mut signals, true);
        let step_id = signals.first().and_then(|s| s.step_id.clone());
        let summary: Vec<String> = signals
            .iter()
            .map(|s| format!("{}: {}", s.rule_id, s.message()))
            .collect();
        task.log(
            step_id.as_deref(),
            StepEvent::Validation,
            format!("{:?} -> {}", resolved.action, summary.join("; ")),
        );
        tracing::info!(task_id = %task.id, action = ?resolved.action, signals = signals.len(), "signals resolved");
        task.signals.extend(signals);
        resolved.decision
    }
}

enum Flow {
    Next,
    Done(Outcome),
}

/// A step that ran successfully, possibly through a repair or alternate
struct Executed {
    meta: ToolMetadata,
    input: Params,
    run: ToolRun,
}

fn step_mut(task: &mut Task, index: usize) -> Option<&mut PlanStep> {
    task.plan.as_mut()?.steps.get_mut(index)
}

fn set_status(task: &mut Task, index: usize, status: StepStatus) {
    if let Some(step) = step_mut(task, index) {
        step.status = status;
    }
}

fn next_pending(task: &Task) -> Option<usize> {
    task.plan
        .as_ref()?
        .steps
        .iter()
        .position(|s| s.status == StepStatus::Pending)
}

fn preview(step: &PlanStep) -> String {
    format!(
        "{} with {}",
        step.action,
        Value::Object(step.parameters.clone())
    )
}

/// Executes plans for tasks
pub struct ExecutionEngine {
    toolbox: Toolbox,
    replanner: Replanner,
    config: EngineConfig,
    persistence: Option<LedgerPersistence>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("toolbox", &self.toolbox)
            .field("config", &self.config)
            .finish()
    }
}

impl ExecutionEngine {
    /// Engine over a toolbox and a replanner
    pub fn new(toolbox: Toolbox, replanner: Replanner, config: EngineConfig) -> Self {
        Self {
            toolbox,
            replanner,
            config,
            persistence: None,
        }
    }

    /// Save the task ledger whenever a run stops
    pub fn with_persistence(mut self, persistence: LedgerPersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Shared machinery
    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a plan for a pending task
    pub async fn execute(&self, task: &mut Task, mut plan: ExecutionPlan) -> Outcome {
        if let Err(err) = task.transition(TaskStatus::Running) {
            return Outcome::Failed(task.failure_report(
                err.to_string(),
                "submit the request as a new task",
                Some(err.kind()),
            ));
        }
        if self.config.forced_perception {
            self.insert_perception(&mut plan);
        }
        tracing::info!(task_id = %task.id, steps = plan.steps.len(), intent = %plan.intent, "executing plan");
        task.plan = Some(plan);
        self.run(task).await
    }

    /// Continue a suspended task with the user's reply
    pub async fn resume(&self, task: &mut Task, reply: UserReply) -> Result<Outcome> {
        let status = task.status();
        if !status.is_suspended() {
            return Err(WardenError::InvalidInput(format!(
                "task {} is {}, not waiting for a reply",
                task.id, status
            )));
        }
        let pending = task.pending.take();
        task.transition(TaskStatus::Running)?;
        let step_id = pending.as_ref().and_then(|p| p.step_id.clone());
        let index = step_id
            .as_deref()
            .and_then(|id| task.plan.as_ref()?.position(id));
        tracing::info!(task_id = %task.id, step_id = step_id.as_deref().unwrap_or("-"), reply = ?reply, "resuming task");

        match reply {
            UserReply::Confirm => {
                if let Some(id) = &step_id {
                    task.confirmed_steps.insert(id.clone());
                }
                task.log(step_id.as_deref(), StepEvent::Note, "confirmed by the user");
            }
            UserReply::Reject => {
                if let Some(index) = index {
                    self.reject_step(task, index).await;
                }
            }
            UserReply::Answer(answer) => {
                let index = match index.or_else(|| next_pending(task)) {
                    Some(index) => index,
                    None => return Ok(self.complete(task).await),
                };
                if task.plan.as_ref().map_or(false, |p| p.steps[index].status == StepStatus::Pending) {
                    set_status(task, index, StepStatus::Skipped);
                }
                let question = pending.map(|p| p.question).unwrap_or_default();
                let context = FailureContext::for_step(
                    task,
                    index,
                    format!("paused for the user: {}", question),
                    self.config.replan_output_chars,
                )
                .with_answer(answer);
                if let Flow::Done(outcome) = self.replan(task, index, context).await {
                    return Ok(outcome);
                }
            }
        }
        Ok(self.run(task).await)
    }

    async fn reject_step(&self, task: &mut Task, index: usize) {
        let Some(step) = task.plan.as_ref().map(|p| p.steps[index].clone()) else {
            return;
        };
        if step.status == StepStatus::Completed {
            let first = task
                .ledger
                .records()
                .iter()
                .find(|r| {
                    r.step_id.as_deref() == Some(step.id.as_str())
                        && r.result == OperationResult::Success
                })
                .map(|r| r.id);
            if let Some(first) = first {
                self.toolbox.snapshots().rollback(task, Some(first)).await;
            }
        } else {
            set_status(task, index, StepStatus::Skipped);
        }
        task.log(Some(step.id.as_str()), StepEvent::Skipped, "rejected by the user");
    }

    fn insert_perception(&self, plan: &mut ExecutionPlan) {
        let mut first_write = None;
        for (index, step) in plan.steps.iter().enumerate() {
            let Some(meta) = self.toolbox.metadata(&step.action) else {
                continue;
            };
            if !meta.is_mutating() {
                return;
            }
            first_write = Some((index, meta));
            break;
        }
        let Some((index, meta)) = first_write else {
            return;
        };
        let Some(Target::Region(region)) = meta.target.resolve(&plan.steps[index].parameters) else {
            return;
        };
        let Some((reader, sheet_param, range_param)) =
            self.toolbox.catalog().into_iter().find_map(|m| match m.target {
                TargetSpec::Range {
                    sheet_param,
                    range_param,
                } if m.effect == ToolEffect::Read => Some((m.name, sheet_param, range_param)),
                _ => None,
            })
        else {
            return;
        };

        let mut params = Params::new();
        params.insert(sheet_param.to_string(), Value::String(region.sheet.clone()));
        params.insert(range_param.to_string(), Value::String(region.range.to_string()));
        let mut id = "perceive".to_string();
        while plan.position(&id).is_some() {
            id.push('_');
        }
        let step = PlanStep::new(0, reader, params)
            .with_id(id)
            .with_description(format!("read {} before writing", region));
        tracing::debug!(region = %region, "inserting read before first write");
        plan.steps.insert(index, step);
        plan.renumber();
    }

    async fn run(&self, task: &mut Task) -> Outcome {
        loop {
            if task.control.state() == ControlState::Paused {
                if task.transition(TaskStatus::Paused).is_ok() {
                    tracing::info!(task_id = %task.id, "task paused");
                }
            }
            let control = task.control.checkpoint().await;
            if task.status() == TaskStatus::Paused {
                let _ = task.transition(TaskStatus::Running);
            }
            if control == ControlState::Cancelled {
                return self.cancel(task).await;
            }

            let Some(index) = next_pending(task) else {
                return self.complete(task).await;
            };
            if let Flow::Done(outcome) = self.run_step(task, index).await {
                return outcome;
            }
        }
    }

    async fn run_step(&self, task: &mut Task, index: usize) -> Flow {
        let Some(step) = task.plan.as_ref().map(|p| p.steps[index].clone()) else {
            return Flow::Done(self.complete(task).await);
        };

        let blocked_by = step.depends_on.iter().find(|dep| {
            task.plan
                .as_ref()
                .and_then(|p| p.step(dep))
                .map_or(false, |d| matches!(d.status, StepStatus::Failed | StepStatus::Skipped))
        });
        if let Some(dep) = blocked_by {
            let message = format!("skipped because {} did not complete", dep);
            set_status(task, index, StepStatus::Skipped);
            task.log(Some(step.id.as_str()), StepEvent::Skipped, message);
            return Flow::Next;
        }

        let Some(meta) = self.toolbox.metadata(&step.action) else {
            set_status(task, index, StepStatus::Failed);
            let error = WardenError::ToolNotFound(step.action.clone()).to_string();
            task.log(Some(step.id.as_str()), StepEvent::Failed, error.clone());
            return self.recover(task, index, error).await;
        };

        if meta.effect == ToolEffect::Destructive
            && !step.is_write_operation
            && !task.confirmed_steps.contains(&step.id)
        {
            tracing::warn!(task_id = %task.id, step_id = %step.id, tool = %meta.name, "undeclared destructive step needs confirmation");
            let question = format!(
                "{} uses {}, which can destroy data, but was not declared as a write. Proceed?",
                step.label(),
                meta.name
            );
            return Flow::Done(
                self.suspend(
                    task,
                    TaskStatus::PendingConfirmation,
                    question,
                    Some(preview(&step)),
                    Some(step.id.clone()),
                )
                .await,
            );
        }

        set_status(task, index, StepStatus::Running);
        task.log(Some(step.id.as_str()), StepEvent::Started, step.label());
        tracing::info!(task_id = %task.id, step_id = %step.id, tool = %meta.name, "step started");

        let mut input = step.parameters.clone();
        let ctx = Toolbox::context(task, Some(step.id.as_str()), &meta, &input, step.role());
        let signals = self
            .toolbox
            .validate(task, &ctx, &[RulePhase::PreExecution])
            .await;
        match self.toolbox.resolve(task, signals) {
            SignalDecision::Continue => {}
            SignalDecision::FixAndRetry(patch) => {
                let keys: Vec<&String> = patch.keys().collect();
                task.log(Some(step.id.as_str()), StepEvent::Repaired, format!("patched {:?} before running", keys));
                input.extend(patch);
            }
            SignalDecision::AskUser(question) => {
                set_status(task, index, StepStatus::Pending);
                return Flow::Done(
                    self.suspend(
                        task,
                        TaskStatus::PendingConfirmation,
                        question,
                        Some(preview(&step)),
                        Some(step.id.clone()),
                    )
                    .await,
                );
            }
            SignalDecision::RollbackAndReplan(reason) => {
                set_status(task, index, StepStatus::Failed);
                return self.recover(task, index, reason).await;
            }
            SignalDecision::Abort(reason) => {
                set_status(task, index, StepStatus::Failed);
                return Flow::Done(
                    self.fail(task, reason, "change the request so it passes validation", Some("validation_block"))
                        .await,
                );
            }
        }

        let Executed { meta, input, run } = match self.execute_with_recovery(task, index, &step, &meta, input).await {
            Ok(executed) => executed,
            Err(flow) => return flow,
        };

        if let Some(current) = step_mut(task, index) {
            current.status = StepStatus::Completed;
            current.result = Some(run.result.clone());
            current.parameters = input.clone();
        }
        let event = if run.cached {
            StepEvent::Cached
        } else {
            StepEvent::Succeeded
        };
        task.log(Some(step.id.as_str()), event, run.result.output.clone());
        if run.cached {
            return Flow::Next;
        }

        let mut ctx = Toolbox::context(task, Some(step.id.as_str()), &meta, &input, step.role());
        ctx.result = Some(run.result.clone());
        let signals = self
            .toolbox
            .validate(task, &ctx, &[RulePhase::PostExecution, RulePhase::DataQuality])
            .await;
        let decision = self.toolbox.resolve(task, signals);
        if decision == SignalDecision::Continue {
            task.error_tracker.record_success();
            return Flow::Next;
        }

        // Fix-and-retry is bounded per step by max_fix_retries, not by the tracker
        let message = match &decision {
            SignalDecision::RollbackAndReplan(m) | SignalDecision::AskUser(m) | SignalDecision::Abort(m) => {
                Some(m.as_str())
            }
            SignalDecision::FixAndRetry(_) | SignalDecision::Continue => None,
        };
        if let Some(reason) = message.and_then(|m| task.error_tracker.record_failure(m)) {
            if let Some(operation) = run.operation {
                self.toolbox.snapshots().rollback(task, Some(operation)).await;
            }
            set_status(task, index, StepStatus::Failed);
            return Flow::Done(
                self.fail(task, reason, "the same problem keeps coming back; rephrase the request", Some("validation_block"))
                    .await,
            );
        }

        match decision {
            SignalDecision::Continue => Flow::Next,
            SignalDecision::FixAndRetry(patch) => {
                let retries = task.step_retries.entry(step.id.clone()).or_insert(0);
                *retries += 1;
                if *retries > self.config.max_fix_retries {
                    tracing::warn!(task_id = %task.id, step_id = %step.id, "fix-and-retry limit reached, continuing");
                    task.note_issue(format!("{}: fix-and-retry limit reached", step.id));
                    return Flow::Next;
                }
                if let Some(operation) = run.operation {
                    self.toolbox.snapshots().rollback(task, Some(operation)).await;
                }
                if let Some(current) = step_mut(task, index) {
                    current.parameters.extend(patch);
                    current.status = StepStatus::Pending;
                    current.result = None;
                }
                task.log(Some(step.id.as_str()), StepEvent::Repaired, "retrying with patched parameters");
                Flow::Next
            }
            SignalDecision::RollbackAndReplan(reason) => {
                if let Some(operation) = run.operation {
                    self.toolbox.snapshots().rollback(task, Some(operation)).await;
                }
                set_status(task, index, StepStatus::Failed);
                self.recover(task, index, reason).await
            }
            SignalDecision::AskUser(question) => Flow::Done(
                self.suspend(
                    task,
                    TaskStatus::PendingClarification,
                    question,
                    None,
                    Some(step.id.clone()),
                )
                .await,
            ),
            SignalDecision::Abort(reason) => {
                set_status(task, index, StepStatus::Failed);
                Flow::Done(
                    self.fail(task, reason, "the result violates an integrity rule", Some("validation_block"))
                        .await,
                )
            }
        }
    }

    /// First attempt, then local repair, then the alternate tool, then the replanner
    async fn execute_with_recovery(
        &self,
        task: &mut Task,
        index: usize,
        step: &PlanStep,
        meta: &ToolMetadata,
        input: Params,
    ) -> std::result::Result<Executed, Flow> {
        let run = self.call(task, &step.id, meta, &input).await?;
        let mut failure = match self.check(task, meta, &input, &run).await {
            Ok(()) => {
                return Ok(Executed {
                    meta: meta.clone(),
                    input,
                    run,
                })
            }
            Err(failure) => failure,
        };
        let mut last = run.result;

        let sheets = self.toolbox.sheet_names().await;
        if let Some(repair) = repair_params(&input, &sheets) {
            task.log(Some(step.id.as_str()), StepEvent::Repaired, repair.notes.join("; "));
            tracing::info!(task_id = %task.id, step_id = %step.id, notes = ?repair.notes, "retrying with repaired parameters");
            let run = self.call(task, &step.id, meta, &repair.params).await?;
            match self.check(task, meta, &repair.params, &run).await {
                Ok(()) => {
                    return Ok(Executed {
                        meta: meta.clone(),
                        input: repair.params,
                        run,
                    })
                }
                Err(err) => {
                    failure = format!("{}; after repair: {}", failure, err);
                    last = run.result;
                }
            }
        }

        if let Some(alternate) = &meta.alternate {
            let adapted = (alternate.adapt)(&input);
            if let (Some(alt_meta), Some(alt_input)) = (self.toolbox.metadata(alternate.tool), adapted) {
                task.log(
                    Some(step.id.as_str()),
                    StepEvent::Alternate,
                    format!("falling back from {} to {}", meta.name, alt_meta.name),
                );
                tracing::info!(task_id = %task.id, step_id = %step.id, tool = %alt_meta.name, "trying alternate tool");
                let run = self.call(task, &step.id, &alt_meta, &alt_input).await?;
                match self.check(task, &alt_meta, &alt_input, &run).await {
                    Ok(()) => {
                        if let Some(current) = step_mut(task, index) {
                            current.semantically_changed = true;
                            current.action = alt_meta.name.clone();
                        }
                        return Ok(Executed {
                            meta: alt_meta,
                            input: alt_input,
                            run,
                        });
                    }
                    Err(err) => {
                        failure = format!("{}; alternate {}: {}", failure, alt_meta.name, err);
                        last = run.result;
                    }
                }
            }
        }

        if let Some(current) = step_mut(task, index) {
            current.status = StepStatus::Failed;
            current.result = Some(last);
        }
        task.log(Some(step.id.as_str()), StepEvent::Failed, failure.clone());
        Err(self.recover(task, index, failure).await)
    }

    async fn call(
        &self,
        task: &mut Task,
        step_id: &str,
        meta: &ToolMetadata,
        input: &Params,
    ) -> std::result::Result<ToolRun, Flow> {
        match self
            .toolbox
            .run_tool(task, meta, input, Some(step_id), self.config.max_tool_calls)
            .await
        {
            Ok(run) => Ok(run),
            Err(err) if err.is_terminal() => {
                set_status_by_id(task, step_id, StepStatus::Failed);
                Err(Flow::Done(
                    self.fail(
                        task,
                        format!("this request is too complex to finish: {}", err),
                        "split the request into smaller ones",
                        Some(err.kind()),
                    )
                    .await,
                ))
            }
            Err(err) => Ok(ToolRun {
                result: ToolInvocationResult::failure(err.to_string()),
                operation: None,
                before: None,
                cached: false,
            }),
        }
    }

    /// Tool success and, for writes, an observable effect
    async fn check(
        &self,
        task: &mut Task,
        meta: &ToolMetadata,
        input: &Params,
        run: &ToolRun,
    ) -> std::result::Result<(), String> {
        if !run.result.success {
            return Err(run.result.error_message());
        }
        if !meta.is_mutating() {
            return Ok(());
        }
        let Some(reader) = self.toolbox.reader() else {
            return Ok(());
        };
        if let Err(reason) = verify_write(meta, input, run.before.as_ref(), reader).await {
            tracing::warn!(task_id = %task.id, tool = %meta.name, reason = %reason, "write verification failed");
            if let Some(operation) = run.operation {
                self.toolbox.snapshots().rollback(task, Some(operation)).await;
            }
            return Err(format!("verification failed: {}", reason));
        }
        Ok(())
    }

    async fn recover(&self, task: &mut Task, index: usize, error: String) -> Flow {
        let context = FailureContext::for_step(task, index, error, self.config.replan_output_chars);
        self.replan(task, index, context).await
    }

    async fn replan(&self, task: &mut Task, index: usize, context: FailureContext) -> Flow {
        let catalog = self.toolbox.catalog();
        match self.replanner.replan(task, &context, &catalog).await {
            Ok(steps) => {
                tracing::info!(task_id = %task.id, replacement = steps.len(), "plan remainder replaced");
                if let Some(plan) = task.plan.as_mut() {
                    plan.splice_remaining(index + 1, steps);
                }
                Flow::Next
            }
            Err(err) => {
                let reason = match &err {
                    WardenError::ReplanExhausted { attempts } => format!(
                        "could not recover after {} replan attempt(s): {}",
                        attempts, context.error
                    ),
                    _ => format!("{}; recovery failed: {}", context.error, err),
                };
                Flow::Done(
                    self.fail(task, reason, "check the failing step and try again", Some(err.kind()))
                        .await,
                )
            }
        }
    }

    async fn suspend(
        &self,
        task: &mut Task,
        status: TaskStatus,
        question: String,
        preview: Option<String>,
        step_id: Option<String>,
    ) -> Outcome {
        task.pending = Some(PendingQuestion {
            question: question.clone(),
            preview: preview.clone(),
            step_id: step_id.clone(),
        });
        if let Err(err) = task.transition(status) {
            tracing::warn!(task_id = %task.id, error = %err, "could not suspend task");
        }
        task.log(step_id.as_deref(), StepEvent::Note, format!("waiting for the user: {}", question));
        self.persist(task).await;
        match status {
            TaskStatus::PendingConfirmation => Outcome::PendingConfirmation {
                question,
                preview: preview.unwrap_or_default(),
            },
            _ => Outcome::PendingClarification { question },
        }
    }

    async fn complete(&self, task: &mut Task) -> Outcome {
        if let Err(err) = task.transition(TaskStatus::Completed) {
            tracing::warn!(task_id = %task.id, error = %err, "could not complete task");
        }
        let (attempted, succeeded) = task.step_summary();
        let summary = match task.plan.as_ref().map(|p| p.completion_message.trim()) {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => format!("{} of {} step(s) succeeded", succeeded.len(), attempted.len()),
        };
        tracing::info!(task_id = %task.id, tool_calls = task.tool_calls, "task completed");
        task.log(None, StepEvent::Note, format!("completed: {}", summary));
        self.persist(task).await;
        Outcome::Completed(summary)
    }

    async fn cancel(&self, task: &mut Task) -> Outcome {
        tracing::info!(task_id = %task.id, "task cancelled");
        if self.config.rollback_on_failure && task.ledger.applied_count() > 0 {
            self.toolbox.snapshots().rollback(task, None).await;
        }
        if let Err(err) = task.transition(TaskStatus::Cancelled) {
            tracing::warn!(task_id = %task.id, error = %err, "could not cancel task");
        }
        self.persist(task).await;
        Outcome::Cancelled(task.failure_report("cancelled by the caller", "resubmit the request when ready", None))
    }

    async fn fail(
        &self,
        task: &mut Task,
        reason: String,
        recommendation: &str,
        error_kind: Option<&str>,
    ) -> Outcome {
        tracing::error!(task_id = %task.id, reason = %reason, "task failed");
        if self.config.rollback_on_failure && task.ledger.applied_count() > 0 {
            let report = self.toolbox.snapshots().rollback(task, None).await;
            if let Some(err) = report.error() {
                task.note_issue(err.to_string());
            }
        }
        if let Err(err) = task.transition(TaskStatus::Failed) {
            tracing::warn!(task_id = %task.id, error = %err, "could not mark task failed");
        }
        task.log(None, StepEvent::Failed, reason.clone());
        self.persist(task).await;
        Outcome::Failed(task.failure_report(reason, recommendation, error_kind))
    }

    async fn persist(&self, task: &Task) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Err(err) = persistence.save(task.id, &task.ledger).await {
            tracing::warn!(task_id = %task.id, error = %err, "could not persist ledger");
        }
    }
}

fn set_status_by_id(task: &mut Task, step_id: &str, status: StepStatus) {
    if let Some(step) = task
        .plan
        .as_mut()
        .and_then(|p| p.steps.iter_mut().find(|s| s.id == step_id))
    {
        step.status = status;
    }
}
