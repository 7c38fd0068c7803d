//! Task lifecycle
//!
//! A [`Task`] is one request from start to finish. It is owned exclusively by
//! whichever executor is processing it and is passed around as `&mut Task`.

use crate::error::{Result, WardenError};
use crate::ledger::OperationLedger;
use crate::plan::ExecutionPlan;
use crate::signal::ValidationSignal;
use crate::tool::ToolInvocationResult;
use crate::types::{invocation_key, now, Params, Timestamp};
use crate::validation::ValidationErrorTracker;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not started
    Pending,
    /// Executing
    Running,
    /// Suspended at a checkpoint
    Paused,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Stopped by the caller
    Cancelled,
    /// Waiting for an answer from the user
    PendingClarification,
    /// Waiting for the user to confirm a risky step
    PendingConfirmation,
}

impl TaskStatus {
    /// No further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Waiting for the user
    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            TaskStatus::PendingClarification | TaskStatus::PendingConfirmation
        )
    }

    fn can_become(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Running, Running) => false,
            (Running, _) => next != Pending,
            (Paused, Running) | (Paused, Cancelled) => true,
            (PendingClarification, Running)
            | (PendingClarification, Cancelled)
            | (PendingClarification, Failed)
            | (PendingConfirmation, Running)
            | (PendingConfirmation, Cancelled)
            | (PendingConfirmation, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::PendingClarification => "pending_clarification",
            TaskStatus::PendingConfirmation => "pending_confirmation",
        };
        f.write_str(name)
    }
}

/// What happened in a step log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvent {
    /// Step began
    Started,
    /// Step succeeded
    Succeeded,
    /// Step or tool failed
    Failed,
    /// Served from the read cache
    Cached,
    /// Parameters were repaired locally
    Repaired,
    /// An alternate tool was used
    Alternate,
    /// Validation produced signals
    Validation,
    /// Operations were rolled back
    RolledBack,
    /// Remaining steps were re-planned
    Replanned,
    /// Step was skipped
    Skipped,
    /// Anything else worth keeping
    Note,
}

/// One entry of the task's step log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    /// When
    pub timestamp: Timestamp,
    /// Plan step, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Event kind
    pub event: StepEvent,
    /// Message
    pub message: String,
}

/// User-facing description of a failed or cancelled task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// What went wrong
    pub reason: String,
    /// Steps that were attempted
    pub attempted: Vec<String>,
    /// Steps that succeeded
    pub succeeded: Vec<String>,
    /// Suggested next move
    pub recommendation: String,
    /// Whether applied operations were reversed
    pub rolled_back: bool,
    /// Error kind, when the failure came from an error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// How a run ended (or paused)
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Done; carries the completion summary
    Completed(String),
    /// Failed
    Failed(FailureReport),
    /// A risky step needs explicit confirmation
    PendingConfirmation {
        /// Question for the user
        question: String,
        /// What would happen
        preview: String,
    },
    /// More information is needed
    PendingClarification {
        /// Question for the user
        question: String,
    },
    /// Stopped by the caller
    Cancelled(FailureReport),
}

impl Outcome {
    /// Waiting for the user
    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            Outcome::PendingConfirmation { .. } | Outcome::PendingClarification { .. }
        )
    }

    /// One-line description
    pub fn summary(&self) -> String {
        match self {
            Outcome::Completed(summary) => format!("completed: {}", summary),
            Outcome::Failed(report) => format!("failed: {}", report.reason),
            Outcome::PendingConfirmation { question, .. } => {
                format!("needs confirmation: {}", question)
            }
            Outcome::PendingClarification { question } => format!("needs clarification: {}", question),
            Outcome::Cancelled(report) => format!("cancelled: {}", report.reason),
        }
    }
}

/// Reply to a suspended task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserReply {
    /// Go ahead with the gated step
    Confirm,
    /// Skip the gated step
    Reject,
    /// Free-text answer to a clarification question
    Answer(String),
}

/// What the task is waiting for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    /// Question text
    pub question: String,
    /// Preview of the gated operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Step the question is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedRead {
    sheet: Option<String>,
    result: ToolInvocationResult,
}

/// Per-task cache of read-only tool results
#[derive(Debug, Clone, Default)]
pub struct ReadCache {
    entries: HashMap<String, CachedRead>,
    hits: u32,
}

impl ReadCache {
    /// Cached result for a read
    pub fn get(&mut self, tool: &str, params: &Params) -> Option<ToolInvocationResult> {
        let hit = self
            .entries
            .get(&invocation_key(tool, params))
            .map(|e| e.result.clone());
        if hit.is_some() {
            self.hits += 1;
        }
        hit
    }

    /// Store a successful read; `sheet` drives invalidation
    pub fn put(
        &mut self,
        tool: &str,
        params: &Params,
        sheet: Option<&str>,
        result: ToolInvocationResult,
    ) {
        self.entries.insert(
            invocation_key(tool, params),
            CachedRead {
                sheet: sheet.map(str::to_string),
                result,
            },
        );
    }

    /// Drop reads of one sheet; reads without a known sheet are dropped too
    pub fn invalidate_sheet(&mut self, sheet: &str) {
        self.entries
            .retain(|_, e| e.sheet.as_deref().map_or(false, |s| s != sheet));
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cache hits so far
    pub fn hits(&self) -> u32 {
        self.hits
    }

    /// Number of cached reads
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Requested run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Keep going
    Running,
    /// Stop at the next checkpoint and wait
    Paused,
    /// Stop at the next checkpoint for good
    Cancelled,
}

/// Cooperative pause/cancel handle.
///
/// Clones share state. Executors only observe it at checkpoints.
#[derive(Debug, Clone)]
pub struct TaskControl {
    tx: Arc<watch::Sender<ControlState>>,
}

impl Default for TaskControl {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(ControlState::Running);
        Self { tx: Arc::new(tx) }
    }
}

impl TaskControl {
    /// New control in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pause
    pub fn pause(&self) {
        self.set(ControlState::Paused);
    }

    /// Resume after a pause
    pub fn resume(&self) {
        self.set(ControlState::Running);
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.set(ControlState::Cancelled);
    }

    fn set(&self, state: ControlState) {
        let previous = self.tx.send_replace(state);
        // cancellation is final
        if previous == ControlState::Cancelled {
            self.tx.send_replace(ControlState::Cancelled);
        }
    }

    /// Current state
    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    /// Wait while paused; returns the state to act on (`Running` or `Cancelled`)
    pub async fn checkpoint(&self) -> ControlState {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ControlState::Running | ControlState::Cancelled => return state,
                ControlState::Paused => {
                    if rx.changed().await.is_err() {
                        return ControlState::Cancelled;
                    }
                }
            }
        }
    }
}

/// One request lifecycle
#[derive(Debug, Clone)]
pub struct Task {
    /// Task id
    pub id: Uuid,
    /// Original request text
    pub request: String,
    status: TaskStatus,
    /// Ordered step log
    pub step_log: Vec<StepLogEntry>,
    /// Operations applied on behalf of this task
    pub ledger: OperationLedger,
    /// Issues found along the way (validator findings, warnings)
    pub issues: Vec<String>,
    /// Plan being executed
    pub plan: Option<ExecutionPlan>,
    /// Some operations were rolled back
    pub rolled_back: bool,
    /// Replans so far
    pub replan_attempts: u32,
    /// Fix-and-retry attempts per step
    pub step_retries: HashMap<String, u32>,
    /// Read-only tool results
    pub read_cache: ReadCache,
    /// Repeated-error ceiling
    pub error_tracker: ValidationErrorTracker,
    /// Steps the user confirmed
    pub confirmed_steps: HashSet<String>,
    /// Rules suppressed for the rest of the task
    pub ignored_rules: HashSet<String>,
    /// Every validation signal raised
    pub signals: Vec<ValidationSignal>,
    /// What the task is waiting for, when suspended
    pub pending: Option<PendingQuestion>,
    /// Tool invocations so far
    pub tool_calls: u32,
    /// Cooperative pause/cancel
    pub control: TaskControl,
    /// Creation time
    pub created_at: Timestamp,
    /// Last status change
    pub updated_at: Timestamp,
}

impl Task {
    /// New pending task
    pub fn new(request: impl Into<String>) -> Self {
        let created_at = now();
        Self {
            id: Uuid::new_v4(),
            request: request.into(),
            status: TaskStatus::Pending,
            step_log: Vec::new(),
            ledger: OperationLedger::new(),
            issues: Vec::new(),
            plan: None,
            rolled_back: false,
            replan_attempts: 0,
            step_retries: HashMap::new(),
            read_cache: ReadCache::default(),
            error_tracker: ValidationErrorTracker::default(),
            confirmed_steps: HashSet::new(),
            ignored_rules: HashSet::new(),
            signals: Vec::new(),
            pending: None,
            tool_calls: 0,
            control: TaskControl::new(),
            created_at,
            updated_at: created_at,
        }
    }

    /// Use a configured repeated-error tracker
    pub fn with_error_tracker(mut self, tracker: ValidationErrorTracker) -> Self {
        self.error_tracker = tracker;
        self
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Move to another status
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_become(next) {
            return Err(WardenError::InvalidInput(format!(
                "task {} cannot go from {} to {}",
                self.id, self.status, next
            )));
        }
        tracing::debug!(task_id = %self.id, from = %self.status, to = %next, "task transition");
        self.status = next;
        self.updated_at = now();
        Ok(())
    }

    /// Append to the step log
    pub fn log(&mut self, step_id: Option<&str>, event: StepEvent, message: impl Into<String>) {
        self.step_log.push(StepLogEntry {
            timestamp: now(),
            step_id: step_id.map(str::to_string),
            event,
            message: message.into(),
        });
    }

    /// Record a discovered issue
    pub fn note_issue(&mut self, issue: impl Into<String>) {
        let issue = issue.into();
        if !self.issues.contains(&issue) {
            self.issues.push(issue);
        }
    }

    /// Labels of attempted and succeeded plan steps
    pub fn step_summary(&self) -> (Vec<String>, Vec<String>) {
        let Some(plan) = &self.plan else {
            let attempted = self
                .ledger
                .records()
                .iter()
                .map(|r| r.tool_name.clone())
                .collect();
            return (attempted, Vec::new());
        };
        let attempted = plan
            .steps
            .iter()
            .filter(|s| s.status != crate::plan::StepStatus::Pending)
            .map(|s| s.label())
            .collect();
        let succeeded = plan
            .steps
            .iter()
            .filter(|s| s.status == crate::plan::StepStatus::Completed)
            .map(|s| s.label())
            .collect();
        (attempted, succeeded)
    }

    /// Build a failure report from the task's current state
    pub fn failure_report(
        &self,
        reason: impl Into<String>,
        recommendation: impl Into<String>,
        error_kind: Option<&str>,
    ) -> FailureReport {
        let (attempted, succeeded) = self.step_summary();
        FailureReport {
            reason: reason.into(),
            attempted,
            succeeded,
            recommendation: recommendation.into(),
            rolled_back: self.rolled_back,
            error_kind: error_kind.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::params_from;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn transitions_follow_the_state_machine() {
        let mut task = Task::new("sum column B");
        assert!(task.transition(TaskStatus::Completed).is_err());
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::PendingConfirmation).unwrap();
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.status().is_terminal());
        assert!(task.transition(TaskStatus::Running).is_err());
    }

    #[test]
    fn cache_is_invalidated_per_sheet() {
        let mut cache = ReadCache::default();
        let a = params_from(json!({"sheet": "A", "range": "A1"}));
        let b = params_from(json!({"sheet": "B", "range": "A1"}));
        cache.put("read_range", &a, Some("A"), ToolInvocationResult::ok("a"));
        cache.put("read_range", &b, Some("B"), ToolInvocationResult::ok("b"));
        cache.put("list_sheets", &Params::new(), None, ToolInvocationResult::ok("A, B"));

        cache.invalidate_sheet("A");
        assert!(cache.get("read_range", &a).is_none());
        assert!(cache.get("read_range", &b).is_some());
        assert!(cache.get("list_sheets", &Params::new()).is_none());
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test]
    async fn paused_checkpoint_waits_for_resume() {
        let control = TaskControl::new();
        control.pause();

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        control.resume();
        assert_eq!(handle.await.unwrap(), ControlState::Running);
    }

    #[tokio::test]
    async fn cancel_is_final() {
        let control = TaskControl::new();
        control.cancel();
        control.resume();
        assert_eq!(control.checkpoint().await, ControlState::Cancelled);
    }
}
