//! Snapshot and rollback
//!
//! Before a mutating tool runs, its pre-state is captured as [`RollbackData`].
//! Rollback replays captured state in reverse chronological order and keeps
//! going past individual failures.

use crate::error::WardenError;
use crate::ledger::{OperationResult, RollbackData};
use crate::plan::RollbackStatus;
use crate::resource::{ResourceAccess, ResourceReader};
use crate::task::{StepEvent, Task};
use crate::tool::{Target, ToolInvoker, ToolMetadata};
use crate::types::Params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Result of a rollback sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Records that were reversed, in the order they were reversed
    pub reversed: Vec<Uuid>,
    /// One message per record that could not be reversed
    pub failures: Vec<String>,
}

impl RollbackReport {
    /// Every selected record was reversed
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// The partial-failure error, if any
    pub fn error(&self) -> Option<WardenError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(WardenError::RollbackPartialFailure {
                failed: self.failures.len(),
                details: self.failures.clone(),
            })
        }
    }
}

/// Captures pre-state and reverses operations
#[derive(Clone)]
pub struct SnapshotManager {
    access: Option<Arc<dyn ResourceAccess>>,
    invoker: ToolInvoker,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("has_resource", &self.access.is_some())
            .finish()
    }
}

impl SnapshotManager {
    /// Manager over a resource (optional) and the tool invoker used for compensations
    pub fn new(access: Option<Arc<dyn ResourceAccess>>, invoker: ToolInvoker) -> Self {
        Self { access, invoker }
    }

    /// Capture the pre-state of a mutating call; `None` when nothing can be captured
    pub async fn snapshot(&self, meta: &ToolMetadata, input: &Params) -> Option<RollbackData> {
        if !meta.is_mutating() {
            return None;
        }
        let captured = match (meta.target.resolve(input), &self.access) {
            (Some(Target::Region(region)), Some(access)) => {
                match access.read_region(&region).await {
                    Ok(state) => Some(RollbackData::Region { state }),
                    Err(err) => {
                        tracing::warn!(tool = %meta.name, region = %region, error = %err, "region snapshot failed");
                        None
                    }
                }
            }
            (Some(Target::Sheet(sheet)), Some(access)) => match access.read_sheet(&sheet).await {
                Ok(state) => Some(RollbackData::Sheet { sheet, state }),
                Err(err) => {
                    tracing::warn!(tool = %meta.name, sheet = %sheet, error = %err, "sheet snapshot failed");
                    None
                }
            },
            _ => None,
        };

        captured.or_else(|| {
            let call = meta.compensation.and_then(|build| build(input));
            if call.is_none() {
                tracing::warn!(tool = %meta.name, "mutating call has no rollback data");
            }
            call.map(|call| RollbackData::Compensation { call })
        })
    }

    /// Reverse one captured operation
    pub async fn restore(&self, data: &RollbackData) -> crate::error::Result<()> {
        match data {
            RollbackData::Region { state } => self.require_access()?.write_region(state).await,
            RollbackData::Sheet { sheet, state } => {
                self.require_access()?
                    .restore_sheet(sheet, state.as_ref())
                    .await
            }
            RollbackData::Compensation { call } => {
                let result = self.invoker.invoke(&call.tool, &call.input).await?;
                if result.success {
                    Ok(())
                } else {
                    Err(WardenError::ToolExecutionFailure {
                        tool: call.tool.clone(),
                        message: result.error_message(),
                    })
                }
            }
        }
    }

    fn require_access(&self) -> crate::error::Result<&Arc<dyn ResourceAccess>> {
        self.access
            .as_ref()
            .ok_or_else(|| WardenError::Resource("no resource attached for restore".to_string()))
    }

    /// Reverse successful operations, newest first.
    ///
    /// With `from`, only that operation and everything after it are reversed;
    /// otherwise every successful operation is. `task.rolled_back` is set
    /// whatever happens.
    pub async fn rollback(&self, task: &mut Task, from: Option<Uuid>) -> RollbackReport {
        let start = match from {
            Some(id) => match task.ledger.position(id) {
                Some(index) => index,
                None => {
                    tracing::warn!(task_id = %task.id, operation = %id, "rollback start not in ledger");
                    task.ledger.len()
                }
            },
            None => 0,
        };

        let selected: Vec<(Uuid, String, Option<String>, Option<RollbackData>)> = task.ledger.records()
            [start..]
            .iter()
            .filter(|r| r.result == OperationResult::Success)
            .rev()
            .map(|r| (r.id, r.tool_name.clone(), r.step_id.clone(), r.rollback_data.clone()))
            .collect();

        let mut report = RollbackReport::default();
        for (id, tool, step_id, data) in selected {
            let outcome = match &data {
                Some(data) => self.restore(data).await,
                None => Err(WardenError::Resource(format!("no rollback data for {}", tool))),
            };
            let status = match outcome {
                Ok(()) => {
                    task.ledger.mark_rolled_back(id);
                    report.reversed.push(id);
                    RollbackStatus::RolledBack
                }
                Err(err) => {
                    tracing::warn!(task_id = %task.id, operation = %id, tool = %tool, error = %err, "rollback of operation failed");
                    report.failures.push(format!("{} ({}): {}", tool, id, err));
                    RollbackStatus::RollbackFailed
                }
            };
            if let (Some(step_id), Some(plan)) = (&step_id, task.plan.as_mut()) {
                if let Some(step) = plan.steps.iter_mut().find(|s| &s.id == step_id) {
                    step.rollback_status = Some(status);
                }
            }
        }

        task.rolled_back = true;
        task.read_cache.clear();
        if let Some(err) = report.error() {
            tracing::error!(task_id = %task.id, error = %err, "rollback incomplete");
        }
        task.log(
            None,
            StepEvent::RolledBack,
            format!(
                "rolled back {} operation(s), {} failure(s)",
                report.reversed.len(),
                report.failures.len()
            ),
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{CellRange, RegionRef};
    use crate::tool::ToolRegistry;
    use crate::types::params_from;
    use crate::workbook::{register_reference_tools, Workbook, WorkbookHandle};
    use serde_json::json;

    struct Fixture {
        book: WorkbookHandle,
        invoker: ToolInvoker,
        snapshots: SnapshotManager,
    }

    fn fixture() -> Fixture {
        let mut book = Workbook::with_sheets(["S"]);
        book.write_values(
            &RegionRef::new("S", CellRange::parse("A1:A3").unwrap()),
            &[vec![json!(1)], vec![json!(2)], vec![json!(3)]],
        )
        .unwrap();
        let book = WorkbookHandle::new(book);
        let registry = ToolRegistry::new();
        register_reference_tools(&registry, &book);
        let invoker = ToolInvoker::new(registry);
        let access: Arc<dyn ResourceAccess> = Arc::new(book.clone());
        Fixture {
            snapshots: SnapshotManager::new(Some(access), invoker.clone()),
            book,
            invoker,
        }
    }

    async fn apply(f: &Fixture, task: &mut Task, tool: &str, input: serde_json::Value) -> Uuid {
        let input = params_from(input);
        let meta = f.invoker.registry().metadata(tool).unwrap();
        let data = f.snapshots.snapshot(&meta, &input).await;
        let result = f.invoker.invoke(tool, &input).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        task.ledger
            .append(tool, &input, OperationResult::Success, None, data)
    }

    #[tokio::test]
    async fn rollback_restores_in_reverse_order() {
        let f = fixture();
        let before = f.book.snapshot();
        let mut task = Task::new("test");

        apply(&f, &mut task, "write_range", json!({"sheet": "S", "range": "A1:A3", "values": [[9], [9], [9]]})).await;
        apply(&f, &mut task, "clear_range", json!({"sheet": "S", "range": "A2"})).await;
        apply(&f, &mut task, "add_sheet", json!({"name": "Extra"})).await;
        apply(&f, &mut task, "insert_rows", json!({"sheet": "S", "at": 1, "count": 2})).await;

        let report = f.snapshots.rollback(&mut task, None).await;
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(report.reversed.len(), 4);
        assert_eq!(f.book.snapshot(), before);
        assert!(task.rolled_back);
        assert_eq!(task.ledger.applied_count(), 0);
    }

    #[tokio::test]
    async fn rollback_from_an_operation_keeps_earlier_ones() {
        let f = fixture();
        let mut task = Task::new("test");

        apply(&f, &mut task, "write_range", json!({"sheet": "S", "range": "B1", "values": [["kept"]]})).await;
        let second = apply(&f, &mut task, "write_range", json!({"sheet": "S", "range": "A1", "values": [[100]]})).await;

        f.snapshots.rollback(&mut task, Some(second)).await;

        let region = RegionRef::new("S", CellRange::parse("A1:B1").unwrap());
        let values = f.book.read_region(&region).await.unwrap().values();
        assert_eq!(values, vec![vec![json!(1), json!("kept")]]);
        assert_eq!(task.ledger.applied_count(), 1);
    }

    #[tokio::test]
    async fn missing_rollback_data_is_reported_but_sweep_continues() {
        let f = fixture();
        let mut task = Task::new("test");
        apply(&f, &mut task, "write_range", json!({"sheet": "S", "range": "A1", "values": [[50]]})).await;
        task.ledger
            .append("mystery", &Params::new(), OperationResult::Success, None, None);

        let report = f.snapshots.rollback(&mut task, None).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.reversed.len(), 1);
        assert!(matches!(
            report.error(),
            Some(WardenError::RollbackPartialFailure { failed: 1, .. })
        ));
        assert!(task.rolled_back);
    }
}
