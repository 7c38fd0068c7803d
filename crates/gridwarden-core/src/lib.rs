//! Gridwarden Core - plan-driven execution for spreadsheet agents
//!
//! Gridwarden takes a natural-language request, asks a planner for an
//! execution plan, validates it, and executes it step by step against a
//! spreadsheet-like resource. Every mutation is snapshotted and recorded so a
//! failed task can be rolled back.
//!
//! # Architecture
//!
//! 1. **Tools** (`tool`): registry and invoker for named operations with declared effects
//! 2. **Planner** (`planner`): gateway trait, lenient plan parsing, prompts
//! 3. **Plan validation** (`plan_validator`): static checks before anything runs
//! 4. **Validation rules** (`validation`, `signal`): pre/post/data-quality rules and
//!    the resolver that turns their signals into one decision
//! 5. **Snapshots and ledger** (`snapshot`, `ledger`): pre-state capture, reverse
//!    chronological rollback, persisted operation history
//! 6. **Executors** (`engine`, `reactive`, `replanner`): the plan-driven engine, the
//!    bounded think/act/observe fallback, and failure-driven replanning
//! 7. **Façade** (`agent`): routes each request to the right executor
//!
//! # Quick Start
//!
//! ```
//! use gridwarden_core::{Agent, Outcome, ResourceAccess, ScriptedPlanner, ToolRegistry, WardenConfig};
//! use gridwarden_core::workbook::{register_reference_tools, Workbook, WorkbookHandle};
//! use std::sync::Arc;
//!
//! let book = WorkbookHandle::new(Workbook::with_sheets(["Sales"]));
//! let registry = ToolRegistry::new();
//! register_reference_tools(&registry, &book);
//!
//! let planner = Arc::new(ScriptedPlanner::new(vec![
//!     r#"{"intent": "label", "steps": [{"order": 1, "action": "write_range",
//!        "parameters": {"sheet": "Sales", "range": "A1", "values": [["Total"]]},
//!        "isWriteOperation": true}], "completionMessage": "labelled"}"#,
//! ]));
//! let access: Arc<dyn ResourceAccess> = Arc::new(book);
//! let agent = Agent::new(WardenConfig::default(), registry, Some(access), planner);
//!
//! let (task, outcome) = tokio_test::block_on(agent.handle("Put a Total label in A1 of Sales"));
//! assert_eq!(outcome, Outcome::Completed("labelled".into()));
//! assert_eq!(task.ledger.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod intent;
pub mod ledger;
pub mod plan;
pub mod plan_validator;
pub mod planner;
pub mod reactive;
pub mod replanner;
pub mod resource;
pub mod signal;
pub mod snapshot;
pub mod task;
pub mod tool;
pub mod types;
pub mod validation;
pub mod workbook;

// Re-export commonly used types for convenience
pub use agent::Agent;
pub use config::WardenConfig;
pub use engine::{ExecutionEngine, Toolbox};
pub use error::{Result, WardenError};
pub use intent::{Intent, IntentClassification, IntentClassifier, KeywordClassifier};
pub use ledger::{
    FileLedgerStore, LedgerPersistence, LedgerStore, MemoryLedgerStore, OperationLedger,
    OperationRecord,
};
pub use plan::{ExecutionPlan, PlanStep, StepStatus};
pub use plan_validator::{PlanValidationReport, PlanValidator};
pub use planner::{PlannerGateway, PlannerRequest, PlannerResponse, ScriptedPlanner};
pub use reactive::ReactiveLoop;
pub use replanner::Replanner;
pub use resource::{ResourceAccess, ResourceReader};
pub use signal::SignalDecision;
pub use snapshot::SnapshotManager;
pub use task::{Outcome, Task, TaskStatus, UserReply};
pub use tool::{Tool, ToolInvoker, ToolMetadata, ToolRegistry};
pub use types::Params;
pub use validation::{RuleEngine, ValidationRule};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
