//! Plan validator
//!
//! Structural checks on a planner-proposed [`ExecutionPlan`] before anything
//! runs. Failing is never fatal by itself; the agent decides what to do with
//! the report.

use crate::plan::{ExecutionPlan, PlanStep, StepRole};
use crate::resource::ResourceReader;
use crate::tool::{Target, ToolEffect, ToolMetadata, ToolRegistry, VerifyKind};
use crate::types::values_matrix;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

lazy_static! {
    static ref BULK_WORDING: Regex =
        Regex::new(r"(?i)\b(each|every|all)\b[^.]*\b(rows?|cells?|records?|lines?)\b")
            .expect("static regex");
}

/// Which check produced an issue, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Unknown, forward, self or duplicate references between steps
    Dependency,
    /// Unknown tool or sheet
    Reference,
    /// Formula-role step writes literal values
    Role,
    /// Bulk wording on a single-cell target
    Bulk,
    /// Destructive tool not declared as a write
    UndeclaredHighRisk,
}

impl IssueKind {
    /// Dependency and reference problems make the plan unrunnable as a plan
    pub fn is_structural(&self) -> bool {
        matches!(self, IssueKind::Dependency | IssueKind::Reference)
    }
}

/// One finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanIssue {
    /// Name of the check
    pub rule_name: String,
    /// What is wrong
    pub message: String,
    /// Offending step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Check family
    pub kind: IssueKind,
}

impl PlanIssue {
    fn new(kind: IssueKind, rule_name: &str, step: Option<&PlanStep>, message: String) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            message,
            step_id: step.map(|s| s.id.clone()),
            kind,
        }
    }
}

/// Validator output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanValidationReport {
    /// No issues were found
    pub passed: bool,
    /// Findings, highest priority first
    pub issues: Vec<PlanIssue>,
}

impl PlanValidationReport {
    fn from_issues(mut issues: Vec<PlanIssue>) -> Self {
        issues.sort_by_key(|i| i.kind);
        Self {
            passed: issues.is_empty(),
            issues,
        }
    }

    /// Some issue makes the plan structurally broken
    pub fn is_structurally_broken(&self) -> bool {
        self.issues.iter().any(|i| i.kind.is_structural())
    }

    /// Issues of one kind
    pub fn of_kind(&self, kind: IssueKind) -> impl Iterator<Item = &PlanIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }
}

/// Checks plans against the tool catalog and, optionally, the resource
#[derive(Debug, Clone)]
pub struct PlanValidator {
    registry: ToolRegistry,
}

impl PlanValidator {
    /// Validator over a tool registry
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    /// Dependency, role and high-risk checks; needs no resource
    pub fn quick_check(&self, plan: &ExecutionPlan) -> PlanValidationReport {
        let catalog = self.catalog(plan);
        let mut issues = check_dependencies(plan);
        issues.extend(check_roles(plan));
        issues.extend(check_high_risk(plan, &catalog));
        PlanValidationReport::from_issues(issues)
    }

    /// Every check, reading sheet names from the resource when one is given
    pub async fn full_check(
        &self,
        plan: &ExecutionPlan,
        reader: Option<&dyn ResourceReader>,
    ) -> PlanValidationReport {
        let catalog = self.catalog(plan);
        let existing = match reader {
            Some(reader) => match reader.sheet_names().await {
                Ok(names) => Some(names),
                Err(err) => {
                    tracing::warn!(error = %err, "could not list sheets, skipping sheet references");
                    None
                }
            },
            None => None,
        };

        let mut issues = check_dependencies(plan);
        issues.extend(check_references(plan, &catalog, existing.as_deref()));
        issues.extend(check_roles(plan));
        issues.extend(check_bulk(plan, &catalog));
        issues.extend(check_high_risk(plan, &catalog));
        let report = PlanValidationReport::from_issues(issues);
        tracing::debug!(steps = plan.steps.len(), issues = report.issues.len(), "plan validated");
        report
    }

    fn catalog(&self, plan: &ExecutionPlan) -> HashMap<String, ToolMetadata> {
        plan.steps
            .iter()
            .filter_map(|s| self.registry.metadata(&s.action).map(|m| (s.action.clone(), m)))
            .collect()
    }
}

fn check_dependencies(plan: &ExecutionPlan) -> Vec<PlanIssue> {
    let mut issues = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let all: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &plan.steps {
        if !seen.insert(step.id.as_str()) {
            issues.push(PlanIssue::new(
                IssueKind::Dependency,
                "duplicate_step_id",
                Some(step),
                format!("step id '{}' is used more than once", step.id),
            ));
        }
        for dep in &step.depends_on {
            let message = if dep == &step.id {
                format!("{} depends on itself", step.id)
            } else if !all.contains(dep.as_str()) {
                format!("{} depends on unknown step '{}'", step.id, dep)
            } else if !seen.contains(dep.as_str()) {
                format!("{} depends on later step '{}'", step.id, dep)
            } else {
                continue;
            };
            issues.push(PlanIssue::new(
                IssueKind::Dependency,
                "dependency_completeness",
                Some(step),
                message,
            ));
        }
    }
    issues
}

fn check_references(
    plan: &ExecutionPlan,
    catalog: &HashMap<String, ToolMetadata>,
    existing: Option<&[String]>,
) -> Vec<PlanIssue> {
    let mut issues = Vec::new();
    let mut known: Option<HashSet<String>> =
        existing.map(|names| names.iter().cloned().collect());

    for step in &plan.steps {
        let Some(meta) = catalog.get(&step.action) else {
            issues.push(PlanIssue::new(
                IssueKind::Reference,
                "unknown_tool",
                Some(step),
                format!("{} uses unknown tool '{}'", step.id, step.action),
            ));
            continue;
        };
        let Some(target) = meta.target.resolve(&step.parameters) else {
            continue;
        };
        let Some(known) = known.as_mut() else {
            continue;
        };
        let sheet = target.sheet().to_string();
        if meta.verify == VerifyKind::SheetExists {
            known.insert(sheet);
        } else if !known.contains(&sheet) {
            issues.push(PlanIssue::new(
                IssueKind::Reference,
                "sheet_exists",
                Some(step),
                format!("{} targets sheet '{}' which does not exist", step.id, sheet),
            ));
        }
    }
    issues
}

fn is_literal(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.starts_with('='),
        _ => true,
    }
}

fn check_roles(plan: &ExecutionPlan) -> Vec<PlanIssue> {
    plan.steps
        .iter()
        .filter(|step| step.role() == Some(StepRole::Formula))
        .filter_map(|step| {
            let values = step.parameters.get("values")?;
            let literals = values_matrix(values)
                .iter()
                .flatten()
                .filter(|v| is_literal(v))
                .count();
            (literals > 0).then(|| {
                PlanIssue::new(
                    IssueKind::Role,
                    "formula_role_literals",
                    Some(step),
                    format!(
                        "{} should produce formulas but writes {} literal value(s)",
                        step.id, literals
                    ),
                )
            })
        })
        .collect()
}

fn check_bulk(plan: &ExecutionPlan, catalog: &HashMap<String, ToolMetadata>) -> Vec<PlanIssue> {
    plan.steps
        .iter()
        .filter(|step| {
            let wording = format!(
                "{} {}",
                step.description,
                step.success_condition.as_deref().unwrap_or_default()
            );
            BULK_WORDING.is_match(&wording)
        })
        .filter_map(|step| {
            let meta = catalog.get(&step.action)?;
            match meta.target.resolve(&step.parameters)? {
                Target::Region(region) if region.range.is_single_cell() => Some(PlanIssue::new(
                    IssueKind::Bulk,
                    "missing_bulk_behavior",
                    Some(step),
                    format!(
                        "{} describes a bulk change but only targets {}",
                        step.id, region
                    ),
                )),
                _ => None,
            }
        })
        .collect()
}

fn check_high_risk(
    plan: &ExecutionPlan,
    catalog: &HashMap<String, ToolMetadata>,
) -> Vec<PlanIssue> {
    plan.steps
        .iter()
        .filter(|step| !step.is_write_operation)
        .filter(|step| {
            catalog
                .get(&step.action)
                .map_or(false, |m| m.effect == ToolEffect::Destructive)
        })
        .map(|step| {
            PlanIssue::new(
                IssueKind::UndeclaredHighRisk,
                "undeclared_high_risk",
                Some(step),
                format!(
                    "{} runs destructive tool '{}' without declaring a write",
                    step.id, step.action
                ),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::params_from;
    use crate::workbook::{register_reference_tools, Workbook, WorkbookHandle};
    use serde_json::json;

    fn setup() -> (PlanValidator, WorkbookHandle) {
        let book = WorkbookHandle::new(Workbook::with_sheets(["Data"]));
        let registry = ToolRegistry::new();
        register_reference_tools(&registry, &book);
        (PlanValidator::new(registry), book)
    }

    fn step(order: u32, action: &str, params: Value) -> PlanStep {
        PlanStep::new(order, action, params_from(params))
    }

    #[test]
    fn test_dependency_problems() {
        let (validator, _) = setup();
        let plan = ExecutionPlan::new(
            "deps",
            vec![
                step(1, "read_range", json!({"sheet": "Data", "range": "A1"})).depending_on(["step-2"]),
                step(2, "read_range", json!({"sheet": "Data", "range": "A2"})).depending_on(["step-2", "ghost"]),
                step(3, "read_range", json!({"sheet": "Data", "range": "A3"})).with_id("step-1"),
            ],
        );
        let report = validator.quick_check(&plan);
        assert!(!report.passed);
        assert!(report.is_structurally_broken());
        let messages: Vec<&str> = report.issues.iter().map(|i| i.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("later step")));
        assert!(messages.iter().any(|m| m.contains("itself")));
        assert!(messages.iter().any(|m| m.contains("unknown step 'ghost'")));
        assert!(messages.iter().any(|m| m.contains("more than once")));
    }

    #[tokio::test]
    async fn test_sheet_created_earlier_is_known() {
        let (validator, book) = setup();
        let plan = ExecutionPlan::new(
            "new sheet",
            vec![
                step(1, "add_sheet", json!({"name": "Summary"})).declared_write(),
                step(2, "write_range", json!({"sheet": "Summary", "range": "A1", "values": [[1]]})).declared_write(),
                step(3, "read_range", json!({"sheet": "Missing", "range": "A1"})),
                step(4, "teleport", json!({})),
            ],
        );
        let report = validator.full_check(&plan, Some(&book as &dyn ResourceReader)).await;
        let refs: Vec<&PlanIssue> = report.of_kind(IssueKind::Reference).collect();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].step_id.as_deref(), Some("step-3"));
        assert_eq!(refs[1].rule_name, "unknown_tool");
    }

    #[tokio::test]
    async fn test_role_bulk_and_risk_findings() {
        let (validator, book) = setup();
        let plan = ExecutionPlan::new(
            "mixed",
            vec![
                step(1, "write_range", json!({"sheet": "Data", "range": "C1:C2", "values": [[1], ["=A2*2"]], "role": "formula"}))
                    .declared_write(),
                step(2, "set_formula", json!({"sheet": "Data", "range": "D1", "formula": "=A1"}))
                    .with_description("fill every row with the total")
                    .declared_write(),
                step(3, "delete_rows", json!({"sheet": "Data", "start": 1, "count": 500})),
            ],
        );
        let report = validator.full_check(&plan, Some(&book as &dyn ResourceReader)).await;
        assert!(!report.is_structurally_broken());
        let kinds: Vec<IssueKind> = report.issues.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![IssueKind::Role, IssueKind::Bulk, IssueKind::UndeclaredHighRisk]
        );
        assert!(report.issues[0].message.contains("1 literal value"));
    }

    #[test]
    fn test_clean_plan_passes() {
        let (validator, _) = setup();
        let plan = ExecutionPlan::new(
            "read",
            vec![step(1, "read_range", json!({"sheet": "Data", "range": "A1:B2"}))],
        );
        assert!(validator.quick_check(&plan).passed);
    }
}
