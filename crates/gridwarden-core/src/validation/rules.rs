//! Built-in validation rules

use super::{
    RuleCategory, RulePhase, Severity, ValidationCheckResult, ValidationContext, ValidationRule,
};
use crate::config::ValidationConfig;
use crate::plan::StepRole;
use crate::resource::{CellRange, CellRef, RegionState, ResourceReader};
use crate::tool::Target;
use crate::types::{param_str, param_u32, values_matrix, Params};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// The default rule set
pub fn builtin_rules(config: &ValidationConfig) -> Vec<Arc<dyn ValidationRule>> {
    vec![
        Arc::new(FormulaColumnLiterals),
        Arc::new(AggregateRowsDistinct),
        Arc::new(RangeShapeMismatch),
        Arc::new(BulkDeleteGuard {
            threshold: config.bulk_delete_threshold,
        }),
        Arc::new(NumbersStoredAsText),
    ]
}

async fn written_region(
    ctx: &ValidationContext,
    reader: Option<&dyn ResourceReader>,
) -> anyhow::Result<Option<RegionState>> {
    if !ctx.mutating {
        return Ok(None);
    }
    let (Some(Target::Region(region)), Some(reader)) = (&ctx.target, reader) else {
        return Ok(None);
    };
    Ok(Some(reader.read_region(region).await?))
}

fn cell_at(state: &RegionState, r: usize, c: usize) -> CellRef {
    let start = state.region.range.start;
    CellRef::new(start.row + r as u32, start.col + c as u32)
}

fn cell_list(cells: &[CellRef]) -> String {
    let shown: Vec<String> = cells.iter().take(5).map(|c| c.to_string()).collect();
    if cells.len() > 5 {
        format!("{} and {} more", shown.join(", "), cells.len() - 5)
    } else {
        shown.join(", ")
    }
}

/// A formula-role target must not end up holding hard-coded numbers
pub struct FormulaColumnLiterals;

#[async_trait]
impl ValidationRule for FormulaColumnLiterals {
    fn id(&self) -> &str {
        "formula_column_literals"
    }
    fn severity(&self) -> Severity {
        Severity::Block
    }
    fn phase(&self) -> RulePhase {
        RulePhase::PostExecution
    }
    fn category(&self) -> RuleCategory {
        RuleCategory::Structural
    }
    fn description(&self) -> &str {
        "formula-role target contains literal numbers"
    }

    async fn check(
        &self,
        ctx: &ValidationContext,
        reader: Option<&dyn ResourceReader>,
    ) -> anyhow::Result<ValidationCheckResult> {
        if ctx.role != Some(StepRole::Formula) {
            return Ok(ValidationCheckResult::pass());
        }
        let Some(state) = written_region(ctx, reader).await? else {
            return Ok(ValidationCheckResult::pass());
        };
        let literals: Vec<CellRef> = state
            .cells
            .iter()
            .enumerate()
            .flat_map(|(r, row)| {
                row.iter()
                    .enumerate()
                    .filter(|(_, cell)| cell.is_literal_number())
                    .map(move |(c, _)| (r, c))
            })
            .map(|(r, c)| cell_at(&state, r, c))
            .collect();
        if literals.is_empty() {
            return Ok(ValidationCheckResult::pass());
        }
        Ok(ValidationCheckResult::fail(format!(
            "{} must be computed with formulas but holds hard-coded numbers in {}",
            state.region,
            cell_list(&literals)
        ))
        .with_details(json!({ "cells": literals.iter().map(|c| c.to_string()).collect::<Vec<_>>() }))
        .with_suggestion("use set_formula instead of writing computed values"))
    }
}

/// An aggregate-role target must not repeat identical rows
pub struct AggregateRowsDistinct;

#[async_trait]
impl ValidationRule for AggregateRowsDistinct {
    fn id(&self) -> &str {
        "aggregate_rows_distinct"
    }
    fn severity(&self) -> Severity {
        Severity::Block
    }
    fn phase(&self) -> RulePhase {
        RulePhase::PostExecution
    }
    fn category(&self) -> RuleCategory {
        RuleCategory::Structural
    }
    fn description(&self) -> &str {
        "aggregate-role target has identical rows"
    }

    async fn check(
        &self,
        ctx: &ValidationContext,
        reader: Option<&dyn ResourceReader>,
    ) -> anyhow::Result<ValidationCheckResult> {
        if ctx.role != Some(StepRole::Aggregate) {
            return Ok(ValidationCheckResult::pass());
        }
        let Some(state) = written_region(ctx, reader).await? else {
            return Ok(ValidationCheckResult::pass());
        };
        let rows: Vec<(u32, Vec<Value>)> = state
            .cells
            .iter()
            .enumerate()
            .filter(|(_, row)| row.iter().any(|c| !c.is_empty()))
            .map(|(r, row)| {
                let key = row
                    .iter()
                    .map(|c| c.formula.clone().map(Value::String).unwrap_or(c.value.clone()))
                    .collect();
                (state.region.range.start.row + r as u32, key)
            })
            .collect();
        for (i, (row_a, a)) in rows.iter().enumerate() {
            if let Some((row_b, _)) = rows[i + 1..].iter().find(|(_, b)| b == a) {
                return Ok(ValidationCheckResult::fail(format!(
                    "{} should aggregate distinct rows but rows {} and {} are identical",
                    state.region, row_a, row_b
                ))
                .with_details(json!({ "rows": [row_a, row_b] })));
            }
        }
        Ok(ValidationCheckResult::pass())
    }
}

fn matrix_shape(values: &Value) -> (u32, u32) {
    let rows = values_matrix(values);
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    (rows.len() as u32, width as u32)
}

/// A values matrix must match the dimensions of its range
pub struct RangeShapeMismatch;

#[async_trait]
impl ValidationRule for RangeShapeMismatch {
    fn id(&self) -> &str {
        "range_shape_mismatch"
    }
    fn severity(&self) -> Severity {
        Severity::Warn
    }
    fn phase(&self) -> RulePhase {
        RulePhase::PreExecution
    }
    fn category(&self) -> RuleCategory {
        RuleCategory::Parameter
    }
    fn description(&self) -> &str {
        "values matrix does not match the range dimensions"
    }

    async fn check(
        &self,
        ctx: &ValidationContext,
        _reader: Option<&dyn ResourceReader>,
    ) -> anyhow::Result<ValidationCheckResult> {
        let (Some(values), Some(range_text)) = (ctx.input.get("values"), param_str(&ctx.input, "range"))
        else {
            return Ok(ValidationCheckResult::pass());
        };
        let Ok(range) = CellRange::parse(range_text) else {
            return Ok(ValidationCheckResult::pass());
        };
        let (height, width) = matrix_shape(values);
        if height == 0 || width == 0 || (height == range.height() && width == range.width()) {
            return Ok(ValidationCheckResult::pass());
        }
        let resized = range.resized(height, width);
        let mut patch = Params::new();
        patch.insert("range".into(), Value::String(resized.to_string()));
        Ok(ValidationCheckResult::fail(format!(
            "values are {}x{} but range {} is {}x{}",
            height,
            width,
            range,
            range.height(),
            range.width()
        ))
        .with_suggestion(format!("write to {} instead", resized))
        .with_patch(patch))
    }
}

/// Large row deletions need explicit confirmation
pub struct BulkDeleteGuard {
    /// Row count above which confirmation is required
    pub threshold: u32,
}

#[async_trait]
impl ValidationRule for BulkDeleteGuard {
    fn id(&self) -> &str {
        "bulk_delete_guard"
    }
    fn severity(&self) -> Severity {
        Severity::Block
    }
    fn phase(&self) -> RulePhase {
        RulePhase::PreExecution
    }
    fn category(&self) -> RuleCategory {
        RuleCategory::Safety
    }
    fn description(&self) -> &str {
        "row deletion above the bulk threshold without confirmation"
    }

    async fn check(
        &self,
        ctx: &ValidationContext,
        _reader: Option<&dyn ResourceReader>,
    ) -> anyhow::Result<ValidationCheckResult> {
        if ctx.tool != "delete_rows" || ctx.confirmed {
            return Ok(ValidationCheckResult::pass());
        }
        let count = param_u32(&ctx.input, "count").unwrap_or(0);
        if count <= self.threshold {
            return Ok(ValidationCheckResult::pass());
        }
        let sheet = param_str(&ctx.input, "sheet").unwrap_or("?");
        Ok(ValidationCheckResult::fail(format!(
            "deleting {} rows from '{}' exceeds the limit of {} rows without confirmation",
            count, sheet, self.threshold
        ))
        .with_details(json!({ "count": count, "threshold": self.threshold })))
    }
}

/// Written cells should not hold numbers as text
pub struct NumbersStoredAsText;

#[async_trait]
impl ValidationRule for NumbersStoredAsText {
    fn id(&self) -> &str {
        "numbers_stored_as_text"
    }
    fn severity(&self) -> Severity {
        Severity::Warn
    }
    fn phase(&self) -> RulePhase {
        RulePhase::DataQuality
    }
    fn category(&self) -> RuleCategory {
        RuleCategory::Cosmetic
    }
    fn description(&self) -> &str {
        "numeric-looking text in written cells"
    }

    async fn check(
        &self,
        ctx: &ValidationContext,
        reader: Option<&dyn ResourceReader>,
    ) -> anyhow::Result<ValidationCheckResult> {
        let Some(state) = written_region(ctx, reader).await? else {
            return Ok(ValidationCheckResult::pass());
        };
        let texty: Vec<CellRef> = state
            .cells
            .iter()
            .enumerate()
            .flat_map(|(r, row)| {
                row.iter()
                    .enumerate()
                    .filter(|(_, cell)| cell.is_numeric_text())
                    .map(move |(c, _)| (r, c))
            })
            .map(|(r, c)| cell_at(&state, r, c))
            .collect();
        if texty.is_empty() {
            return Ok(ValidationCheckResult::pass());
        }
        Ok(ValidationCheckResult::fail(format!(
            "numbers stored as text in {}",
            cell_list(&texty)
        ))
        .with_suggestion("write numeric values instead of strings"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::RegionRef;
    use crate::types::params_from;
    use crate::workbook::{Workbook, WorkbookHandle};
    use uuid::Uuid;

    fn write_ctx(tool: &str, input: Value, role: Option<StepRole>) -> ValidationContext {
        let input = params_from(input);
        let target = Some(Target::Region(RegionRef::new(
            param_str(&input, "sheet").unwrap_or("S"),
            CellRange::parse(param_str(&input, "range").unwrap_or("A1")).unwrap(),
        )));
        let mut ctx = ValidationContext::new(Uuid::new_v4(), tool, input);
        ctx.mutating = true;
        ctx.target = target;
        ctx.role = role;
        ctx
    }

    fn book(values: Value) -> WorkbookHandle {
        let mut book = Workbook::with_sheets(["S"]);
        let rows: Vec<Vec<Value>> = serde_json::from_value(values).unwrap();
        let range = CellRange::new(
            CellRef::new(1, 1),
            CellRef::new(rows.len() as u32, rows[0].len() as u32),
        );
        book.write_values(&RegionRef::new("S", range), &rows).unwrap();
        WorkbookHandle::new(book)
    }

    #[tokio::test]
    async fn literal_numbers_in_formula_column_block() {
        let handle = book(json!([[1], ["=A1+1"], [3]]));
        let ctx = write_ctx(
            "write_range",
            json!({"sheet": "S", "range": "A1:A3"}),
            Some(StepRole::Formula),
        );
        let result = FormulaColumnLiterals.check(&ctx, Some(&handle as &dyn ResourceReader)).await.unwrap();
        assert!(!result.passed);
        assert!(result.message.contains("A1, A3"));
    }

    #[tokio::test]
    async fn formula_rule_ignores_other_roles() {
        let handle = book(json!([[1]]));
        let ctx = write_ctx("write_range", json!({"sheet": "S", "range": "A1"}), None);
        assert!(FormulaColumnLiterals.check(&ctx, Some(&handle as &dyn ResourceReader)).await.unwrap().passed);
    }

    #[tokio::test]
    async fn duplicate_aggregate_rows_block() {
        let handle = book(json!([["north", 10], ["south", 4], ["north", 10]]));
        let ctx = write_ctx(
            "write_range",
            json!({"sheet": "S", "range": "A1:B3"}),
            Some(StepRole::Aggregate),
        );
        let result = AggregateRowsDistinct.check(&ctx, Some(&handle as &dyn ResourceReader)).await.unwrap();
        assert!(!result.passed);
        assert!(result.message.contains("rows 1 and 3"));
    }

    #[tokio::test]
    async fn shape_mismatch_offers_resized_range() {
        let ctx = write_ctx(
            "write_range",
            json!({"sheet": "S", "range": "B2:B10", "values": [[1, 2], [3, 4]]}),
            None,
        );
        let result = RangeShapeMismatch.check(&ctx, None).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.patch.unwrap()["range"], json!("B2:C3"));
    }

    #[tokio::test]
    async fn bulk_delete_requires_confirmation() {
        let guard = BulkDeleteGuard { threshold: 100 };
        let mut ctx = ValidationContext::new(
            Uuid::new_v4(),
            "delete_rows",
            params_from(json!({"sheet": "S", "start": 1, "count": 500})),
        );
        assert!(!guard.check(&ctx, None).await.unwrap().passed);

        ctx.confirmed = true;
        assert!(guard.check(&ctx, None).await.unwrap().passed);
    }

    #[tokio::test]
    async fn numeric_text_is_flagged() {
        let handle = book(json!([["1,200", "abc"]]));
        let ctx = write_ctx("write_range", json!({"sheet": "S", "range": "A1:B1"}), None);
        let result = NumbersStoredAsText.check(&ctx, Some(&handle as &dyn ResourceReader)).await.unwrap();
        assert!(!result.passed);
        assert!(result.message.contains("A1"));
        assert!(!result.message.contains("B1"));
    }
}
