use crate::files;
use anyhow::{Context, Result};
use gridwarden_core::ledger::{FileLedgerStore, LedgerPersistence, LedgerStore};
use gridwarden_core::planner::parse_plan;
use gridwarden_core::workbook::{register_reference_tools, Workbook, WorkbookHandle};
use gridwarden_core::{
    Agent, Outcome, PlanValidator, PlannerGateway, ResourceAccess, ResourceReader, RuleEngine,
    ScriptedPlanner, Task, ToolRegistry, UserReply, WardenConfig,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Confirmations given by `--yes` before giving up
const MAX_AUTO_CONFIRMATIONS: usize = 32;

pub struct RunArgs {
    pub workbook: PathBuf,
    pub request: String,
    pub plan: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub yes: bool,
    pub save: Option<PathBuf>,
    pub ledger_out: Option<PathBuf>,
    pub json: bool,
}

fn planner_for(config: &WardenConfig, args: &RunArgs) -> Result<Arc<dyn PlannerGateway>> {
    if let Some(script) = &args.script {
        return Ok(Arc::new(ScriptedPlanner::new(files::load_script(script)?)));
    }
    match gridwarden_agent::connect(&config.planner) {
        Ok(planner) => Ok(planner),
        Err(err) if args.plan.is_some() => {
            tracing::warn!(error = %err, "no planner available, replanning disabled");
            Ok(Arc::new(ScriptedPlanner::new(Vec::<String>::new())))
        }
        Err(err) => Err(err).context("A planner is required unless --plan or --script is given"),
    }
}

pub async fn run(config: WardenConfig, args: RunArgs) -> Result<()> {
    let book = WorkbookHandle::new(files::load_workbook(&args.workbook)?);
    let registry = ToolRegistry::new();
    register_reference_tools(&registry, &book);
    let planner = planner_for(&config, &args)?;
    let access: Arc<dyn ResourceAccess> = Arc::new(book.clone());
    let agent = Agent::new(config, registry, Some(access), planner);

    let (mut task, mut outcome) = match &args.plan {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read plan {}", path.display()))?;
            let parsed = parse_plan(&text)?;
            let mut task = agent.new_task(&args.request);
            let outcome = agent.engine().execute(&mut task, parsed.plan).await;
            (task, outcome)
        }
        None => agent.handle(&args.request).await,
    };

    let mut confirmations = 0;
    while args.yes && matches!(outcome, Outcome::PendingConfirmation { .. }) {
        if confirmations == MAX_AUTO_CONFIRMATIONS {
            tracing::warn!(task_id = %task.id, "stopped confirming after {} steps", confirmations);
            break;
        }
        if let Outcome::PendingConfirmation { question, .. } = &outcome {
            tracing::info!(task_id = %task.id, question = %question, "confirming");
        }
        outcome = agent.resume(&mut task, UserReply::Confirm).await?;
        confirmations += 1;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome_json(&task, &outcome))?);
    } else {
        print_outcome(&task, &outcome);
    }

    if let Some(path) = &args.save {
        files::save_workbook(path, &book.snapshot())?;
        tracing::info!(path = %path.display(), "workbook saved");
    }
    if let Some(path) = &args.ledger_out {
        std::fs::write(path, serde_json::to_string_pretty(&task.ledger)?)
            .with_context(|| format!("Failed to write ledger {}", path.display()))?;
    }
    Ok(())
}

fn outcome_json(task: &Task, outcome: &Outcome) -> serde_json::Value {
    let mut value = json!({
        "task_id": task.id,
        "status": task.status().to_string(),
        "summary": outcome.summary(),
        "tool_calls": task.tool_calls,
        "operations": task.ledger.len(),
        "rolled_back": task.rolled_back,
        "issues": task.issues,
    });
    match outcome {
        Outcome::Failed(report) | Outcome::Cancelled(report) => {
            value["failure"] = serde_json::to_value(report).unwrap_or_default();
        }
        Outcome::PendingConfirmation { question, preview } => {
            value["question"] = json!(question);
            value["preview"] = json!(preview);
        }
        Outcome::PendingClarification { question } => value["question"] = json!(question),
        Outcome::Completed(_) => {}
    }
    value
}

fn print_outcome(task: &Task, outcome: &Outcome) {
    println!("TASK: {}", task.id);
    println!("STATUS: {}", task.status());
    println!("{}", outcome.summary());
    match outcome {
        Outcome::Failed(report) | Outcome::Cancelled(report) => {
            if !report.succeeded.is_empty() {
                println!("  succeeded: {}", report.succeeded.join(", "));
            }
            if !report.attempted.is_empty() {
                println!("  attempted: {}", report.attempted.join(", "));
            }
            println!("  rolled back: {}", report.rolled_back);
            println!("  next: {}", report.recommendation);
        }
        Outcome::PendingConfirmation { preview, .. } => {
            println!("  preview: {}", preview);
            println!("  re-run with --yes to confirm");
        }
        _ => {}
    }
    for issue in &task.issues {
        println!("  note: {}", issue);
    }
    println!(
        "TOOL CALLS: {}  OPERATIONS: {} ({} applied)",
        task.tool_calls,
        task.ledger.len(),
        task.ledger.applied_count()
    );
}

/// Print the validator report; false when the plan cannot run as written
pub async fn validate(plan: &Path, workbook: Option<&Path>, json: bool) -> Result<bool> {
    let text = std::fs::read_to_string(plan)
        .with_context(|| format!("Failed to read plan {}", plan.display()))?;
    let parsed = parse_plan(&text)?;

    let book = match workbook {
        Some(path) => Some(WorkbookHandle::new(files::load_workbook(path)?)),
        None => None,
    };
    let registry = ToolRegistry::new();
    let catalog_book = book
        .clone()
        .unwrap_or_else(|| WorkbookHandle::new(Workbook::new()));
    register_reference_tools(&registry, &catalog_book);
    let reader = book.as_ref().map(|b| b as &dyn ResourceReader);
    let report = PlanValidator::new(registry).full_check(&parsed.plan, reader).await;

    if json {
        let value = json!({
            "steps": parsed.plan.steps.len(),
            "repairs": parsed.repairs.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            "dropped": parsed.dropped,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("STEPS: {}", parsed.plan.steps.len());
        for repair in &parsed.repairs {
            println!("  repaired: {}", repair);
        }
        for dropped in &parsed.dropped {
            println!("  dropped: {}", dropped);
        }
        if report.passed {
            println!("OK: no issues");
        }
        for issue in &report.issues {
            println!(
                "  [{}] {}{}",
                issue.rule_name,
                issue.message,
                issue
                    .step_id
                    .as_ref()
                    .map(|s| format!(" ({})", s))
                    .unwrap_or_default()
            );
        }
    }
    Ok(!report.is_structurally_broken())
}

pub fn rules(config: &WardenConfig, json: bool) -> Result<()> {
    let rules = RuleEngine::with_builtin_rules(&config.validation).rules();
    if json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(());
    }
    if !config.validation.enabled {
        println!("validation is disabled globally");
    }
    for rule in rules {
        let severity = if rule.effective_severity == rule.severity {
            rule.severity.to_string()
        } else {
            format!("{} -> {}", rule.severity, rule.effective_severity)
        };
        println!(
            "{:<28} {:<6} {:<14} {:<13} {}{}",
            rule.id,
            rule.phase,
            severity,
            rule.category,
            rule.description,
            if rule.enabled { "" } else { " (disabled)" }
        );
    }
    Ok(())
}

pub async fn ledger(config: &WardenConfig, task_id: Uuid, dir: Option<PathBuf>) -> Result<()> {
    let dir = dir
        .or_else(|| config.ledger.dir.clone().map(PathBuf::from))
        .context("No ledger directory: pass --dir or set ledger.dir")?;
    let store: Arc<dyn LedgerStore> = Arc::new(FileLedgerStore::new(dir));
    let persistence = LedgerPersistence::new(
        store,
        config.ledger.max_records,
        chrono::Duration::hours(config.ledger.retention_hours),
    );
    let Some(ledger) = persistence.load(task_id).await? else {
        anyhow::bail!("No ledger saved for task {}", task_id);
    };

    println!("TASK: {}", ledger.task_id);
    println!("SAVED: {}", ledger.saved_at.to_rfc3339());
    for record in &ledger.records {
        println!(
            "  {} {:<14} {:<11} {}{}",
            record.timestamp.to_rfc3339(),
            record.tool_name,
            serde_json::to_value(record.result)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            serde_json::to_string(&record.tool_input)?,
            record
                .step_id
                .as_ref()
                .map(|s| format!(" [{}]", s))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub fn render_config(config: &WardenConfig) -> Result<String> {
    Ok(config.to_toml()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_run_plan_and_save() {
        let dir = TempDir::new().unwrap();
        let workbook = write(&dir, "book.json", r#"{"sheets": [{"name": "Sales", "cells": {"A1": 1}}]}"#);
        let plan = write(
            &dir,
            "plan.json",
            r#"{"steps": [{"order": 1, "action": "write_range", "isWriteOperation": true,
                "parameters": {"sheet": "Sales", "range": "B1", "values": [[7]]}}],
                "completionMessage": "wrote B1"}"#,
        );
        let ledger_out = dir.path().join("ledger.json");

        let args = RunArgs {
            workbook: workbook.clone(),
            request: "put 7 in B1".into(),
            plan: Some(plan),
            script: None,
            yes: false,
            save: Some(workbook.clone()),
            ledger_out: Some(ledger_out.clone()),
            json: true,
        };
        run(WardenConfig::default(), args).await.unwrap();

        let saved = files::load_workbook(&workbook).unwrap();
        assert_eq!(saved.sheet("Sales").map(|s| s.populated()), Some(2));
        let ledger: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(ledger_out).unwrap()).unwrap();
        assert_eq!(ledger["records"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_validate_flags_unknown_sheet() {
        let dir = TempDir::new().unwrap();
        let workbook = write(&dir, "book.json", r#"{"sheets": [{"name": "Sales"}]}"#);
        let plan = write(
            &dir,
            "plan.json",
            r#"{"steps": [{"order": 1, "action": "read_range", "parameters": {"sheet": "Ghost", "range": "A1"}}]}"#,
        );

        assert!(!validate(&plan, Some(&workbook), true).await.unwrap());
        assert!(validate(&plan, None, false).await.unwrap());
    }

    #[test]
    fn test_config_renders_as_toml() {
        let text = render_config(&WardenConfig::default()).unwrap();
        assert!(text.contains("[engine]"));
        assert!(text.contains("[planner]"));
    }
}
