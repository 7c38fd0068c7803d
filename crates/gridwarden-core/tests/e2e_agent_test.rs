//! E2E Test: agent routing
//!
//! Drives whole requests through `Agent::handle`, with a scripted planner
//! standing in for the model.

use gridwarden_core::config::ReactiveConfig;
use gridwarden_core::resource::{CellRange, RegionRef};
use gridwarden_core::workbook::{register_reference_tools, Workbook, WorkbookHandle};
use gridwarden_core::{
    Agent, Outcome, ResourceAccess, ResourceReader, ScriptedPlanner, TaskStatus, ToolRegistry,
    UserReply, WardenConfig,
};
use serde_json::json;
use std::sync::Arc;

fn sales_book(rows: u32) -> WorkbookHandle {
    let mut book = Workbook::with_sheets(["Sales"]);
    let values: Vec<Vec<serde_json::Value>> = (1..=rows).map(|n| vec![json!(n)]).collect();
    let range = CellRange::parse(&format!("A1:A{}", rows)).unwrap();
    book.write_values(&RegionRef::new("Sales", range), &values).unwrap();
    WorkbookHandle::new(book)
}

fn agent(book: &WorkbookHandle, config: WardenConfig, responses: Vec<String>) -> (Agent, Arc<ScriptedPlanner>) {
    let registry = ToolRegistry::new();
    register_reference_tools(&registry, book);
    let planner = Arc::new(ScriptedPlanner::new(responses));
    let access: Arc<dyn ResourceAccess> = Arc::new(book.clone());
    (Agent::new(config, registry, Some(access), planner.clone()), planner)
}

/// E2E test: an undeclared bulk delete waits for confirmation
///
/// This test validates:
/// 1. The plan validator flags the undeclared high-risk step
/// 2. Nothing is deleted before the user answers
/// 3. Confirming runs the deletion and records it in the ledger
#[tokio::test]
async fn e2e_undeclared_bulk_delete_needs_confirmation() {
    let book = sales_book(600);
    let plan = json!({
        "intent": "trim",
        "steps": [{"order": 1, "action": "delete_rows", "description": "drop old rows",
                   "parameters": {"sheet": "Sales", "start": 1, "count": 500}}],
        "completionMessage": "rows removed"
    })
    .to_string();
    let (agent, _) = agent(&book, WardenConfig::default(), vec![plan]);

    let (mut task, outcome) = agent.handle("Remove the first 500 rows of Sales").await;

    let Outcome::PendingConfirmation { question, preview } = outcome else {
        panic!("expected a confirmation request, got {:?}", outcome);
    };
    assert!(question.contains("delete_rows"));
    assert!(preview.contains("500"));
    assert_eq!(task.status(), TaskStatus::PendingConfirmation);
    assert!(task.issues.iter().any(|i| i.contains("undeclared_high_risk")));
    assert_eq!(task.tool_calls, 0);
    assert!(task.ledger.is_empty());
    assert_eq!(book.with(|b| b.sheet("Sales").map(|s| s.populated())), Some(600));

    let outcome = agent.resume(&mut task, UserReply::Confirm).await.unwrap();
    assert_eq!(outcome, Outcome::Completed("rows removed".into()));
    assert_eq!(task.ledger.applied_count(), 1);
    assert_eq!(book.with(|b| b.sheet("Sales").map(|s| s.populated())), Some(100));
}

/// E2E test: the reactive fallback enforces its tool budget
#[tokio::test]
async fn e2e_reactive_fallback_respects_tool_budget() {
    let book = sales_book(10);
    let config = WardenConfig::new().with_reactive(ReactiveConfig {
        tool_call_budget: 3,
        ..ReactiveConfig::default()
    });
    let mut responses = vec!["Let me think about the sheet first.".to_string()];
    responses.extend((1..=6).map(|n| {
        json!({"action": "tool_call", "tool": "read_range", "input": {"sheet": "Sales", "range": format!("A{}", n)}})
            .to_string()
    }));
    let (agent, planner) = agent(&book, config, responses);

    let (task, outcome) = agent.handle("Tidy up the Sales sheet").await;

    let Outcome::Failed(report) = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(report.error_kind.as_deref(), Some("budget_exceeded"));
    assert!(task.plan.is_none());
    assert_eq!(task.tool_calls, 3);
    assert_eq!(planner.remaining(), 2);
}

/// E2E test: read-only questions cannot write
#[tokio::test]
async fn e2e_query_cannot_write() {
    let book = sales_book(3);
    let write = json!({"action": "tool_call", "tool": "clear_range",
        "input": {"sheet": "Sales", "range": "A1:A3"}})
    .to_string();
    let done = json!({"action": "complete", "message": "A1:A3 holds 1, 2 and 3"}).to_string();
    let (agent, _) = agent(&book, WardenConfig::default(), vec![write, done]);

    let (task, outcome) = agent.handle("What is in A1:A3 of Sales?").await;

    assert!(matches!(outcome, Outcome::Completed(_)), "{:?}", outcome);
    assert_eq!(task.tool_calls, 0);
    let state = book
        .read_region(&RegionRef::new("Sales", CellRange::parse("A1:A3").unwrap()))
        .await
        .unwrap();
    assert_eq!(state.values(), vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]);
}
