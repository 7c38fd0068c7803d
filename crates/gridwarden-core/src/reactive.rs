//! Reactive loop
//!
//! Fallback executor used when no usable plan exists: the planner is asked for
//! one move at a time (think), the move is carried out (act) and its result is
//! fed back (observe). Every run is bounded by an iteration limit and a tool
//! call budget; writes go through the same snapshot and ledger path as the
//! plan-driven engine.

use crate::config::ReactiveConfig;
use crate::engine::{verify_write, Toolbox};
use crate::error::{BudgetKind, Result, WardenError};
use crate::ledger::LedgerPersistence;
use crate::plan::StepRole;
use crate::planner::{parse_decision, step_prompt, NextDecision, PlannerGateway, PlannerRequest};
use crate::signal::SignalDecision;
use crate::task::{ControlState, Outcome, PendingQuestion, StepEvent, Task, TaskStatus, UserReply};
use crate::tool::ToolMetadata;
use crate::types::{invocation_key, truncate_chars, Params};
use crate::validation::RulePhase;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

lazy_static! {
    static ref LOOSE_COMPLETION: Regex = Regex::new(
        r"(?i)\b(task (is )?(complete|completed|done|finished)|all done|completed successfully|i have (completed|finished))\b"
    )
    .unwrap();
}

/// Who produced a context entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    /// The user's request or replies
    User,
    /// Planner turns
    Assistant,
    /// Tool results and loop feedback
    Observation,
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextRole::User => write!(f, "user"),
            ContextRole::Assistant => write!(f, "assistant"),
            ContextRole::Observation => write!(f, "observation"),
        }
    }
}

/// One entry of the context window
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    /// Producer
    pub role: ContextRole,
    /// Text, already truncated
    pub content: String,
}

/// Rolling conversation context with the original request pinned on top
#[derive(Debug, Clone)]
pub struct ContextWindow {
    request: ContextEntry,
    entries: VecDeque<ContextEntry>,
    max_entries: usize,
    max_chars: usize,
}

impl ContextWindow {
    /// Window holding at most `max_entries` entries of `max_chars` each
    pub fn new(request: &str, max_entries: usize, max_chars: usize) -> Self {
        Self {
            request: ContextEntry {
                role: ContextRole::User,
                content: request.to_string(),
            },
            entries: VecDeque::with_capacity(max_entries),
            max_entries,
            max_chars,
        }
    }

    /// Append an entry, evicting the oldest one when full
    pub fn push(&mut self, role: ContextRole, content: impl AsRef<str>) -> Option<ContextEntry> {
        let evicted = if self.entries.len() >= self.max_entries {
            self.entries.pop_front()
        } else {
            None
        };
        if self.max_entries > 0 {
            self.entries.push_back(ContextEntry {
                role,
                content: truncate_chars(content.as_ref(), self.max_chars),
            });
        }
        evicted
    }

    /// The pinned request
    pub fn request(&self) -> &ContextEntry {
        &self.request
    }

    /// Entries after the request, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries.iter()
    }

    /// Number of entries after the request
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries besides the request
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as planner input
    pub fn render(&self) -> String {
        std::iter::once(&self.request)
            .chain(self.entries.iter())
            .map(|e| format!("[{}] {}", e.role, e.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

enum Turn {
    Continue,
    Done(Outcome),
}

/// Counters that persist across the turns of one run
#[derive(Debug, Default)]
struct Streaks {
    idle: u32,
    tool_failures: u32,
}

/// Think/act/observe executor
#[derive(Clone)]
pub struct ReactiveLoop {
    toolbox: Toolbox,
    planner: Arc<dyn PlannerGateway>,
    config: ReactiveConfig,
    read_only: bool,
    rollback_on_failure: bool,
    persistence: Option<LedgerPersistence>,
}

impl fmt::Debug for ReactiveLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveLoop")
            .field("config", &self.config)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl ReactiveLoop {
    /// Loop over a toolbox and a planner
    pub fn new(toolbox: Toolbox, planner: Arc<dyn PlannerGateway>, config: ReactiveConfig) -> Self {
        Self {
            toolbox,
            planner,
            config,
            read_only: false,
            rollback_on_failure: true,
            persistence: None,
        }
    }

    /// Reject every mutating tool call
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Roll back applied operations when the task fails
    pub fn with_rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }

    /// Persist the ledger whenever the task stops
    pub fn with_persistence(mut self, persistence: LedgerPersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Whether mutating calls are rejected
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Loop configuration
    pub fn config(&self) -> &ReactiveConfig {
        &self.config
    }

    /// Work on a task until it completes, fails or needs the user
    pub async fn run(&self, task: &mut Task) -> Outcome {
        if task.status() == TaskStatus::Pending {
            if let Err(err) = task.transition(TaskStatus::Running) {
                tracing::warn!(task_id = %task.id, error = %err, "could not start task");
            }
        }
        self.run_with(task, None).await
    }

    /// Continue a suspended task with the user's reply
    pub async fn resume(&self, task: &mut Task, reply: UserReply) -> Result<Outcome> {
        if !task.status().is_suspended() {
            return Err(WardenError::InvalidInput(format!(
                "task {} is {}, not waiting for the user",
                task.id,
                task.status()
            )));
        }
        let pending = task.pending.take();
        task.transition(TaskStatus::Running)?;

        let asked = pending
            .as_ref()
            .map(|p| format!("You asked: {} ", p.question))
            .unwrap_or_default();
        let note = match reply {
            UserReply::Confirm => {
                if let Some(id) = pending.and_then(|p| p.step_id) {
                    task.confirmed_steps.insert(id);
                }
                format!("{}The user confirmed. Go ahead with that call.", asked)
            }
            UserReply::Reject => format!(
                "{}The user declined. Do not make that call; find another way or complete.",
                asked
            ),
            UserReply::Answer(answer) => format!("{}The user answered: {}", asked, answer),
        };
        task.log(None, StepEvent::Note, note.clone());
        Ok(self.run_with(task, Some(note)).await)
    }

    async fn run_with(&self, task: &mut Task, note: Option<String>) -> Outcome {
        let mut window = ContextWindow::new(&task.request, self.config.context_window, self.config.entry_max_chars);
        if let Some(note) = note {
            window.push(ContextRole::User, note);
        }
        let catalog: Vec<ToolMetadata> = self
            .toolbox
            .catalog()
            .into_iter()
            .filter(|t| !self.read_only || !t.is_mutating())
            .collect();
        let system_prompt = step_prompt(&catalog);
        let mut streaks = Streaks::default();

        for iteration in 1..=self.config.max_iterations {
            if task.control.checkpoint().await == ControlState::Cancelled {
                return self.cancel(task).await;
            }
            tracing::debug!(task_id = %task.id, iteration, context = window.len(), "reactive turn");

            let request = PlannerRequest::json(system_prompt.clone(), window.render());
            let response = match self.planner.complete(request).await {
                Ok(response) => response,
                Err(err) => {
                    let err = WardenError::PlannerUnavailable(format!("{:#}", err));
                    return self
                        .fail(task, err.to_string(), "try again once the planner is reachable", Some(err.kind()))
                        .await;
                }
            };
            if response.truncated {
                tracing::warn!(task_id = %task.id, iteration, "planner turn was truncated");
            }

            let decision = parse_decision(&response.message).or_else(|| {
                (self.config.loose_text_completion && LOOSE_COMPLETION.is_match(&response.message))
                    .then(|| NextDecision::Complete(response.message.trim().to_string()))
            });
            let turn = match decision {
                None => {
                    window.push(ContextRole::Assistant, &response.message);
                    window.push(
                        ContextRole::Observation,
                        "That reply had no action. Answer with exactly one JSON action.",
                    );
                    self.idle(task, &mut streaks).await
                }
                Some(NextDecision::Respond(text)) => {
                    window.push(ContextRole::Assistant, &text);
                    task.log(None, StepEvent::Note, text);
                    self.idle(task, &mut streaks).await
                }
                Some(NextDecision::Complete(summary)) => Turn::Done(self.complete(task, summary).await),
                Some(NextDecision::AskUser(question)) => Turn::Done(
                    self.suspend(task, TaskStatus::PendingClarification, question, None, None)
                        .await,
                ),
                Some(NextDecision::ToolCall { tool, input }) => {
                    streaks.idle = 0;
                    window.push(
                        ContextRole::Assistant,
                        format!("call {} with {}", tool, Value::Object(input.clone())),
                    );
                    self.act(task, &mut window, &mut streaks, &tool, input).await
                }
            };
            if let Turn::Done(outcome) = turn {
                return outcome;
            }
        }

        let err = WardenError::BudgetExceeded {
            kind: BudgetKind::Iterations,
            limit: self.config.max_iterations,
        };
        self.fail(
            task,
            format!("this request is too complex to finish: {}", err),
            "split the request into smaller ones",
            Some(err.kind()),
        )
        .await
    }

    async fn idle(&self, task: &mut Task, streaks: &mut Streaks) -> Turn {
        streaks.idle += 1;
        if streaks.idle < self.config.idle_threshold {
            return Turn::Continue;
        }
        tracing::info!(task_id = %task.id, turns = streaks.idle, "no actionable turns, asking the user");
        Turn::Done(
            self.suspend(
                task,
                TaskStatus::PendingClarification,
                "I could not work out the next step. Could you say more precisely what you want?".to_string(),
                None,
                None,
            )
            .await,
        )
    }

    async fn tool_failed(
        &self,
        task: &mut Task,
        window: &mut ContextWindow,
        streaks: &mut Streaks,
        tool: &str,
        error: String,
    ) -> Turn {
        streaks.tool_failures += 1;
        tracing::warn!(task_id = %task.id, tool = %tool, failures = streaks.tool_failures, error = %error, "reactive tool call failed");
        task.log(None, StepEvent::Failed, format!("{}: {}", tool, error));
        window.push(ContextRole::Observation, format!("{} failed: {}", tool, error));
        if streaks.tool_failures < self.config.tool_failure_threshold {
            return Turn::Continue;
        }
        Turn::Done(
            self.fail(
                task,
                format!("{} tool call(s) failed in a row; last error: {}", streaks.tool_failures, error),
                "check the sheet names and ranges in the request and try again",
                Some("tool_execution_failure"),
            )
            .await,
        )
    }

    async fn act(
        &self,
        task: &mut Task,
        window: &mut ContextWindow,
        streaks: &mut Streaks,
        tool: &str,
        mut input: Params,
    ) -> Turn {
        let Some(meta) = self.toolbox.metadata(tool) else {
            let error = WardenError::ToolNotFound(tool.to_string()).to_string();
            return self.tool_failed(task, window, streaks, tool, error).await;
        };
        if self.read_only && meta.is_mutating() {
            let error = format!("{} changes the sheet, but this request is read-only", meta.name);
            return self.tool_failed(task, window, streaks, tool, error).await;
        }

        let call_id = invocation_key(&meta.name, &input);
        let role = StepRole::from_params(&input);
        let ctx = Toolbox::context(task, Some(call_id.as_str()), &meta, &input, role);
        let signals = self
            .toolbox
            .validate(task, &ctx, &[RulePhase::PreExecution])
            .await;
        match self.toolbox.resolve(task, signals) {
            SignalDecision::Continue => {}
            SignalDecision::FixAndRetry(patch) => input.extend(patch),
            SignalDecision::AskUser(question) => {
                let preview = format!("{} with {}", meta.name, Value::Object(input.clone()));
                return Turn::Done(
                    self.suspend(task, TaskStatus::PendingConfirmation, question, Some(preview), Some(call_id))
                        .await,
                );
            }
            SignalDecision::RollbackAndReplan(reason) => {
                window.push(ContextRole::Observation, format!("{} was not run: {}", meta.name, reason));
                return self.record_validation_failure(task, &reason).await;
            }
            SignalDecision::Abort(reason) => {
                return Turn::Done(
                    self.fail(task, reason, "change the request so it passes validation", Some("validation_block"))
                        .await,
                )
            }
        }

        let run = match self
            .toolbox
            .run_tool(task, &meta, &input, Some(call_id.as_str()), self.config.tool_call_budget)
            .await
        {
            Ok(run) => run,
            Err(err) if err.is_terminal() => {
                return Turn::Done(
                    self.fail(
                        task,
                        format!("this request is too complex to finish: {}", err),
                        "split the request into smaller ones",
                        Some(err.kind()),
                    )
                    .await,
                )
            }
            Err(err) => return self.tool_failed(task, window, streaks, tool, err.to_string()).await,
        };
        if !run.result.success {
            let error = run.result.error_message();
            return self.tool_failed(task, window, streaks, tool, error).await;
        }
        if meta.is_mutating() {
            if let Some(reader) = self.toolbox.reader() {
                if let Err(reason) = verify_write(&meta, &input, run.before.as_ref(), reader).await {
                    if let Some(operation) = run.operation {
                        self.toolbox.snapshots().rollback(task, Some(operation)).await;
                    }
                    let error = format!("verification failed: {}", reason);
                    return self.tool_failed(task, window, streaks, tool, error).await;
                }
            }
        }
        streaks.tool_failures = 0;
        let event = if run.cached {
            StepEvent::Cached
        } else {
            StepEvent::Succeeded
        };
        task.log(None, event, format!("{}: {}", meta.name, run.result.output));
        if run.cached {
            window.push(ContextRole::Observation, format!("{} (cached): {}", meta.name, run.result.output));
            return Turn::Continue;
        }

        let mut ctx = Toolbox::context(task, Some(call_id.as_str()), &meta, &input, role);
        ctx.result = Some(run.result.clone());
        let signals = self
            .toolbox
            .validate(task, &ctx, &[RulePhase::PostExecution, RulePhase::DataQuality])
            .await;
        match self.toolbox.resolve(task, signals) {
            SignalDecision::Continue => {
                task.error_tracker.record_success();
                window.push(ContextRole::Observation, format!("{}: {}", meta.name, run.result.output));
                Turn::Continue
            }
            SignalDecision::FixAndRetry(patch) => {
                if let Some(operation) = run.operation {
                    self.toolbox.snapshots().rollback(task, Some(operation)).await;
                }
                let message = format!("fix needed: {}", Value::Object(patch));
                window.push(
                    ContextRole::Observation,
                    format!("{} was rolled back; call it again with {}", meta.name, message),
                );
                self.record_validation_failure(task, &message).await
            }
            SignalDecision::RollbackAndReplan(reason) => {
                if let Some(operation) = run.operation {
                    self.toolbox.snapshots().rollback(task, Some(operation)).await;
                }
                window.push(ContextRole::Observation, format!("{} was rolled back: {}", meta.name, reason));
                self.record_validation_failure(task, &reason).await
            }
            SignalDecision::AskUser(question) => Turn::Done(
                self.suspend(task, TaskStatus::PendingClarification, question, None, Some(call_id))
                    .await,
            ),
            SignalDecision::Abort(reason) => Turn::Done(
                self.fail(task, reason, "the result violates an integrity rule", Some("validation_block"))
                    .await,
            ),
        }
    }

    async fn record_validation_failure(&self, task: &mut Task, message: &str) -> Turn {
        match task.error_tracker.record_failure(message) {
            Some(reason) => Turn::Done(
                self.fail(
                    task,
                    reason,
                    "the same problem keeps coming back; rephrase the request",
                    Some("validation_block"),
                )
                .await,
            ),
            None => Turn::Continue,
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
            step_id,
        });
        if let Err(err) = task.transition(status) {
            tracing::warn!(task_id = %task.id, error = %err, "could not suspend task");
        }
        task.log(None, StepEvent::Note, format!("waiting for the user: {}", question));
        self.persist(task).await;
        match status {
            TaskStatus::PendingConfirmation => Outcome::PendingConfirmation {
                question,
                preview: preview.unwrap_or_default(),
            },
            _ => Outcome::PendingClarification { question },
        }
    }

    async fn complete(&self, task: &mut Task, summary: String) -> Outcome {
        if let Err(err) = task.transition(TaskStatus::Completed) {
            tracing::warn!(task_id = %task.id, error = %err, "could not complete task");
        }
        let summary = if summary.trim().is_empty() {
            format!("done after {} tool call(s)", task.tool_calls)
        } else {
            summary
        };
        tracing::info!(task_id = %task.id, tool_calls = task.tool_calls, "task completed");
        task.log(None, StepEvent::Note, format!("completed: {}", summary));
        self.persist(task).await;
        Outcome::Completed(summary)
    }

    async fn cancel(&self, task: &mut Task) -> Outcome {
        tracing::info!(task_id = %task.id, "task cancelled");
        if self.rollback_on_failure && task.ledger.applied_count() > 0 {
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
        if self.rollback_on_failure && task.ledger.applied_count() > 0 {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::planner::ScriptedPlanner;
    use crate::resource::{CellRange, RegionRef, ResourceAccess, ResourceReader};
    use crate::tool::{ToolInvoker, ToolRegistry};
    use crate::validation::RuleEngine;
    use crate::workbook::{register_reference_tools, Workbook, WorkbookHandle};
    use serde_json::json;

    fn fixture(config: ReactiveConfig, responses: Vec<String>) -> (WorkbookHandle, Arc<ScriptedPlanner>, ReactiveLoop) {
        let mut book = Workbook::with_sheets(["Sales"]);
        book.write_values(
            &RegionRef::new("Sales", CellRange::parse("A1:A3").unwrap()),
            &[vec![json!(10)], vec![json!(20)], vec![json!(30)]],
        )
        .unwrap();
        let book = WorkbookHandle::new(book);
        let registry = ToolRegistry::new();
        register_reference_tools(&registry, &book);
        let access: Arc<dyn ResourceAccess> = Arc::new(book.clone());
        let toolbox = Toolbox::new(
            ToolInvoker::new(registry),
            RuleEngine::with_builtin_rules(&ValidationConfig::default()),
            Some(access),
        );
        let planner = Arc::new(ScriptedPlanner::new(responses));
        let reactive = ReactiveLoop::new(toolbox, planner.clone(), config);
        (book, planner, reactive)
    }

    fn read(range: &str) -> String {
        json!({"action": "tool_call", "tool": "read_range", "input": {"sheet": "Sales", "range": range}}).to_string()
    }

    #[test]
    fn test_window_pins_request_and_evicts_oldest() {
        let mut window = ContextWindow::new("sum column A", 2, 5);
        assert!(window.push(ContextRole::Assistant, "first").is_none());
        window.push(ContextRole::Observation, "second entry");
        let evicted = window.push(ContextRole::Assistant, "third").unwrap();
        assert_eq!(evicted.content, "first");
        assert_eq!(window.len(), 2);
        let rendered = window.render();
        assert!(rendered.starts_with("[user] sum column A"));
        assert!(!rendered.contains("second entry"));
    }

    #[tokio::test]
    async fn test_reads_then_completes() {
        let responses = vec![read("A1:A3"), r#"{"action": "complete", "message": "total is 60"}"#.to_string()];
        let (_, planner, reactive) = fixture(ReactiveConfig::default(), responses);
        let mut task = Task::new("what is the total of A1:A3?");

        let outcome = reactive.run(&mut task).await;
        assert_eq!(outcome, Outcome::Completed("total is 60".into()));
        assert_eq!(task.tool_calls, 1);
        assert!(planner.requests()[1].message.contains("read_range"));
    }

    #[tokio::test]
    async fn test_tool_budget_is_terminal() {
        let config = ReactiveConfig {
            tool_call_budget: 2,
            ..ReactiveConfig::default()
        };
        let responses = vec![read("A1"), read("A2"), read("A3"), read("A4")];
        let (_, _, reactive) = fixture(config, responses);
        let mut task = Task::new("look around");

        let Outcome::Failed(report) = reactive.run(&mut task).await else {
            panic!("expected failure");
        };
        assert_eq!(report.error_kind.as_deref(), Some("budget_exceeded"));
        assert!(report.reason.contains("too complex"));
        assert_eq!(task.tool_calls, 2);
    }

    #[tokio::test]
    async fn test_iterations_are_bounded() {
        let config = ReactiveConfig {
            max_iterations: 3,
            idle_threshold: 10,
            ..ReactiveConfig::default()
        };
        let respond = r#"{"action": "respond", "message": "thinking"}"#.to_string();
        let (_, _, reactive) = fixture(config, vec![respond; 5]);
        let mut task = Task::new("ponder");

        let Outcome::Failed(report) = reactive.run(&mut task).await else {
            panic!("expected failure");
        };
        assert_eq!(report.error_kind.as_deref(), Some("budget_exceeded"));
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_idle_turns_ask_for_clarification() {
        let (_, _, reactive) = fixture(ReactiveConfig::default(), vec!["hmm".to_string(); 3]);
        let mut task = Task::new("do the thing");
        let outcome = reactive.run(&mut task).await;
        assert!(matches!(outcome, Outcome::PendingClarification { .. }));
        assert_eq!(task.status(), TaskStatus::PendingClarification);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let write = json!({"action": "tool_call", "tool": "write_range",
            "input": {"sheet": "Sales", "range": "B1", "values": [[1]]}})
        .to_string();
        let (book, _, reactive) = fixture(ReactiveConfig::default(), vec![write; 3]);
        let reactive = reactive.read_only(true);
        let mut task = Task::new("what is in B1?");

        let Outcome::Failed(report) = reactive.run(&mut task).await else {
            panic!("expected failure");
        };
        assert!(report.reason.contains("read-only"));
        assert_eq!(task.tool_calls, 0);
        let b1 = book
            .read_region(&RegionRef::new("Sales", CellRange::parse("B1").unwrap()))
            .await
            .unwrap();
        assert!(b1.is_blank());
    }

    #[tokio::test]
    async fn test_loose_completion_is_opt_in() {
        let config = ReactiveConfig {
            loose_text_completion: true,
            ..ReactiveConfig::default()
        };
        let (_, _, reactive) = fixture(config, vec!["All done, the totals are in place.".to_string()]);
        let mut task = Task::new("total it");
        assert!(matches!(reactive.run(&mut task).await, Outcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_answer_resumes_the_loop() {
        let responses = vec![
            r#"{"action": "ask_user", "question": "which sheet?"}"#.to_string(),
            r#"{"action": "complete", "message": "ok"}"#.to_string(),
        ];
        let (_, planner, reactive) = fixture(ReactiveConfig::default(), responses);
        let mut task = Task::new("clean it up");
        assert!(reactive.run(&mut task).await.is_suspended());

        let outcome = reactive
            .resume(&mut task, UserReply::Answer("Sales".into()))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Completed("ok".into()));
        assert!(planner.requests()[1].message.contains("The user answered: Sales"));
    }
}
