//! Property-based tests for snapshot and rollback
//!
//! Random sequences of mutating tool calls are applied through the toolbox
//! (snapshot, invoke, ledger) and then rolled back.
//!
//! # Coverage
//!
//! - full rollback restores the starting workbook
//! - a second rollback changes nothing
//! - rolling back from an operation keeps everything before it

use gridwarden_core::config::ValidationConfig;
use gridwarden_core::ledger::OperationResult;
use gridwarden_core::types::params_from;
use gridwarden_core::workbook::{register_reference_tools, Workbook, WorkbookDocument, WorkbookHandle};
use gridwarden_core::{ResourceAccess, RuleEngine, Task, ToolInvoker, ToolRegistry, Toolbox};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Write { col: char, row: u32, value: i64 },
    Formula { col: char, row: u32 },
    Clear { col: char, rows: u32 },
    InsertRows { at: u32, count: u32 },
    DeleteRows { start: u32, count: u32 },
    AddSheet,
}

impl Op {
    fn call(&self) -> (&'static str, Value) {
        match self {
            Op::Write { col, row, value } => (
                "write_range",
                json!({"sheet": "Data", "range": format!("{}{}", col, row), "values": [[value]]}),
            ),
            Op::Formula { col, row } => (
                "set_formula",
                json!({"sheet": "Data", "range": format!("{}{}", col, row), "formula": "=A{row}+1"}),
            ),
            Op::Clear { col, rows } => (
                "clear_range",
                json!({"sheet": "Data", "range": format!("{}1:{}{}", col, col, rows)}),
            ),
            Op::InsertRows { at, count } => ("insert_rows", json!({"sheet": "Data", "at": at, "count": count})),
            Op::DeleteRows { start, count } => ("delete_rows", json!({"sheet": "Data", "start": start, "count": count})),
            Op::AddSheet => ("add_sheet", json!({"name": "Scratch"})),
        }
    }
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let col = prop::sample::select(vec!['A', 'B', 'C']);
    prop_oneof![
        (col.clone(), 1..8u32, -100..100i64).prop_map(|(col, row, value)| Op::Write { col, row, value }),
        (col.clone(), 1..8u32).prop_map(|(col, row)| Op::Formula { col, row }),
        (col, 1..8u32).prop_map(|(col, rows)| Op::Clear { col, rows }),
        (1..8u32, 1..3u32).prop_map(|(at, count)| Op::InsertRows { at, count }),
        (1..8u32, 1..3u32).prop_map(|(start, count)| Op::DeleteRows { start, count }),
        Just(Op::AddSheet),
    ]
}

fn seeded() -> (WorkbookHandle, Toolbox) {
    let doc: WorkbookDocument = serde_json::from_value(json!({
        "sheets": [{"name": "Data", "cells": {"A1": 1, "A2": 2, "B1": "=A1*2", "C3": "note"}}]
    }))
    .unwrap();
    let book = WorkbookHandle::new(Workbook::from_document(doc).unwrap());
    let registry = ToolRegistry::new();
    register_reference_tools(&registry, &book);
    let access: Arc<dyn ResourceAccess> = Arc::new(book.clone());
    let toolbox = Toolbox::new(
        ToolInvoker::new(registry),
        RuleEngine::with_builtin_rules(&ValidationConfig::default()),
        Some(access),
    );
    (book, toolbox)
}

async fn apply(toolbox: &Toolbox, task: &mut Task, ops: &[Op]) {
    for op in ops {
        let (tool, input) = op.call();
        let meta = toolbox.metadata(tool).unwrap();
        toolbox
            .run_tool(task, &meta, &params_from(input), None, u32::MAX)
            .await
            .unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: rolling back everything restores the starting workbook
    #[test]
    fn prop_full_rollback_restores_start(ops in prop::collection::vec(op_strategy(), 1..12)) {
        let (book, toolbox) = seeded();
        let start = book.snapshot().to_document();
        let mut task = Task::new("random edits");

        tokio_test::block_on(async {
            apply(&toolbox, &mut task, &ops).await;
            let report = toolbox.snapshots().rollback(&mut task, None).await;
            assert!(report.is_complete(), "{:?}", report.failures);
        });

        prop_assert_eq!(
            serde_json::to_value(book.snapshot().to_document()).unwrap(),
            serde_json::to_value(start).unwrap()
        );
        prop_assert_eq!(task.ledger.applied_count(), 0);
    }

    /// Property: a second rollback reverses nothing and changes nothing
    #[test]
    fn prop_rollback_is_idempotent(ops in prop::collection::vec(op_strategy(), 1..12)) {
        let (book, toolbox) = seeded();
        let mut task = Task::new("random edits");

        let second = tokio_test::block_on(async {
            apply(&toolbox, &mut task, &ops).await;
            toolbox.snapshots().rollback(&mut task, None).await;
            let after_first = serde_json::to_value(book.snapshot().to_document()).unwrap();
            let report = toolbox.snapshots().rollback(&mut task, None).await;
            (after_first, report)
        });

        prop_assert_eq!(second.1.reversed.len(), 0);
        prop_assert_eq!(serde_json::to_value(book.snapshot().to_document()).unwrap(), second.0);
    }

    /// Property: rolling back from an operation keeps the earlier ones
    #[test]
    fn prop_partial_rollback_keeps_prefix(
        ops in prop::collection::vec(op_strategy(), 2..10),
        split in any::<prop::sample::Index>(),
    ) {
        let (book, toolbox) = seeded();
        let mut task = Task::new("random edits");
        let cut = split.index(ops.len() - 1) + 1;

        let expected = tokio_test::block_on(async {
            apply(&toolbox, &mut task, &ops[..cut]).await;
            let expected = serde_json::to_value(book.snapshot().to_document()).unwrap();
            apply(&toolbox, &mut task, &ops[cut..]).await;
            expected
        });
        let from = task.ledger.records()[cut..]
            .iter()
            .find(|r| r.result == OperationResult::Success)
            .map(|r| r.id);

        if let Some(from) = from {
            tokio_test::block_on(toolbox.snapshots().rollback(&mut task, Some(from)));
            prop_assert_eq!(serde_json::to_value(book.snapshot().to_document()).unwrap(), expected);
        }
    }
}
