//! Reference tools over the in-memory workbook

use super::WorkbookHandle;
use crate::resource::{CellRange, RegionRef};
use crate::tool::{
    AlternateTool, TargetSpec, Tool, ToolCall, ToolEffect, ToolInvocationResult, ToolMetadata,
    ToolRegistry, VerifyKind,
};
use crate::types::{param_str, param_u32, values_matrix, Params};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

const RANGE_TARGET: TargetSpec = TargetSpec::Range {
    sheet_param: "sheet",
    range_param: "range",
};

/// Which operation a [`WorkbookTool`] performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkbookOp {
    /// `list_sheets {}`
    ListSheets,
    /// `read_range {sheet, range}`
    ReadRange,
    /// `write_range {sheet, range, values}`
    WriteRange,
    /// `set_formula {sheet, range, formula}`
    SetFormula,
    /// `clear_range {sheet, range}`
    ClearRange,
    /// `format_range {sheet, range, format}`
    FormatRange,
    /// `insert_rows {sheet, at, count}`
    InsertRows,
    /// `delete_rows {sheet, start, count}`
    DeleteRows,
    /// `add_sheet {name}`
    AddSheet,
}

impl WorkbookOp {
    /// Every reference operation
    pub const ALL: [WorkbookOp; 9] = [
        WorkbookOp::ListSheets,
        WorkbookOp::ReadRange,
        WorkbookOp::WriteRange,
        WorkbookOp::SetFormula,
        WorkbookOp::ClearRange,
        WorkbookOp::FormatRange,
        WorkbookOp::InsertRows,
        WorkbookOp::DeleteRows,
        WorkbookOp::AddSheet,
    ];

    fn metadata(self) -> ToolMetadata {
        match self {
            WorkbookOp::ListSheets => ToolMetadata::read("list_sheets", "List sheet names"),
            WorkbookOp::ReadRange => {
                ToolMetadata::read("read_range", "Read values and formulas of {sheet, range}")
                    .with_target(RANGE_TARGET)
            }
            WorkbookOp::WriteRange => ToolMetadata::write(
                "write_range",
                "Write a values matrix {sheet, range, values}; strings starting with '=' are formulas",
            )
            .with_target(RANGE_TARGET)
            .with_verify(VerifyKind::ValuesMatch {
                values_param: "values",
            }),
            WorkbookOp::SetFormula => ToolMetadata::write(
                "set_formula",
                "Fill {sheet, range} with a formula; '{row}' is replaced by each row number",
            )
            .with_target(RANGE_TARGET)
            .with_verify(VerifyKind::FormulaPresent)
            .with_alternate(AlternateTool {
                tool: "write_range",
                adapt: formula_as_values,
            }),
            WorkbookOp::ClearRange => {
                ToolMetadata::write("clear_range", "Clear values, formulas and formats of {sheet, range}")
                    .with_effect(ToolEffect::Destructive)
                    .with_target(RANGE_TARGET)
                    .with_verify(VerifyKind::Cleared)
            }
            WorkbookOp::FormatRange => {
                ToolMetadata::write("format_range", "Apply a number format {sheet, range, format}")
                    .with_target(RANGE_TARGET)
            }
            WorkbookOp::InsertRows => ToolMetadata::write(
                "insert_rows",
                "Insert {count} empty rows before row {at} in {sheet}",
            )
            .with_compensation(insert_rows_inverse),
            WorkbookOp::DeleteRows => ToolMetadata::write(
                "delete_rows",
                "Delete {count} rows starting at row {start} in {sheet}",
            )
            .with_effect(ToolEffect::Destructive)
            .with_target(TargetSpec::Sheet {
                sheet_param: "sheet",
            })
            .with_verify(VerifyKind::Changed),
            WorkbookOp::AddSheet => ToolMetadata::write("add_sheet", "Add an empty sheet {name}")
                .with_target(TargetSpec::Sheet { sheet_param: "name" })
                .with_verify(VerifyKind::SheetExists),
        }
    }
}

/// One reference operation bound to a workbook
#[derive(Debug, Clone)]
pub struct WorkbookTool {
    op: WorkbookOp,
    book: WorkbookHandle,
}

impl WorkbookTool {
    /// Bind an operation to a workbook
    pub fn new(op: WorkbookOp, book: WorkbookHandle) -> Self {
        Self { op, book }
    }
}

fn region(input: &Params) -> anyhow::Result<RegionRef> {
    let sheet = param_str(input, "sheet").ok_or_else(|| anyhow!("missing parameter 'sheet'"))?;
    let range = param_str(input, "range").ok_or_else(|| anyhow!("missing parameter 'range'"))?;
    let range = CellRange::parse(range)?;
    Ok(RegionRef::new(sheet, range))
}

fn values(input: &Params) -> anyhow::Result<Vec<Vec<Value>>> {
    let values = input
        .get("values")
        .ok_or_else(|| anyhow!("missing parameter 'values'"))?;
    Ok(values_matrix(values))
}

fn count(input: &Params, key: &str) -> anyhow::Result<u32> {
    param_u32(input, key).ok_or_else(|| anyhow!("missing or invalid parameter '{}'", key))
}

fn formula_as_values(input: &Params) -> Option<Params> {
    let formula = param_str(input, "formula")?;
    let range = CellRange::parse(param_str(input, "range")?).ok()?;
    let rows: Vec<Value> = (range.start.row..=range.end.row)
        .map(|row| {
            let cell = Value::String(formula.replace("{row}", &row.to_string()));
            Value::Array(vec![cell; range.width() as usize])
        })
        .collect();
    let mut adapted = input.clone();
    adapted.remove("formula");
    adapted.insert("values".into(), Value::Array(rows));
    Some(adapted)
}

fn insert_rows_inverse(input: &Params) -> Option<ToolCall> {
    let sheet = param_str(input, "sheet")?;
    let at = param_u32(input, "at")?;
    let count = param_u32(input, "count")?;
    let mut params = Params::new();
    params.insert("sheet".into(), json!(sheet));
    params.insert("start".into(), json!(at));
    params.insert("count".into(), json!(count));
    Some(ToolCall::new("delete_rows", params))
}

#[async_trait]
impl Tool for WorkbookTool {
    fn metadata(&self) -> ToolMetadata {
        self.op.metadata()
    }

    async fn execute(&self, input: &Params) -> anyhow::Result<ToolInvocationResult> {
        match self.op {
            WorkbookOp::ListSheets => {
                let names = self.book.with(|b| b.sheet_names());
                Ok(ToolInvocationResult::ok_with_data(names.join(", "), json!(names)))
            }
            WorkbookOp::ReadRange => {
                let region = region(input)?;
                let state = self.book.with(|b| b.read(&region))?;
                let formulas: Vec<Vec<Value>> = state
                    .cells
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|c| c.formula.clone().map(Value::String).unwrap_or(Value::Null))
                            .collect()
                    })
                    .collect();
                let values = state.values();
                Ok(ToolInvocationResult::ok_with_data(
                    format!("read {} ({} rows)", region, values.len()),
                    json!({ "values": values, "formulas": formulas }),
                ))
            }
            WorkbookOp::WriteRange => {
                let region = region(input)?;
                let values = values(input)?;
                self.book
                    .with_mut(|b| b.write_values(&region, &values))
                    .with_context(|| format!("writing {}", region))?;
                Ok(ToolInvocationResult::ok(format!("wrote {}", region)))
            }
            WorkbookOp::SetFormula => {
                let region = region(input)?;
                let formula = param_str(input, "formula")
                    .ok_or_else(|| anyhow!("missing parameter 'formula'"))?;
                self.book.with_mut(|b| b.set_formula(&region, formula))?;
                Ok(ToolInvocationResult::ok(format!("set formula on {}", region)))
            }
            WorkbookOp::ClearRange => {
                let region = region(input)?;
                self.book.with_mut(|b| b.clear(&region))?;
                Ok(ToolInvocationResult::ok(format!("cleared {}", region)))
            }
            WorkbookOp::FormatRange => {
                let region = region(input)?;
                let format = param_str(input, "format")
                    .ok_or_else(|| anyhow!("missing parameter 'format'"))?;
                self.book.with_mut(|b| b.format(&region, format))?;
                Ok(ToolInvocationResult::ok(format!("formatted {}", region)))
            }
            WorkbookOp::InsertRows => {
                let sheet =
                    param_str(input, "sheet").ok_or_else(|| anyhow!("missing parameter 'sheet'"))?;
                let at = count(input, "at")?;
                let n = count(input, "count")?;
                self.book.with_mut(|b| b.insert_rows(sheet, at, n))?;
                Ok(ToolInvocationResult::ok(format!("inserted {} rows at {}", n, at)))
            }
            WorkbookOp::DeleteRows => {
                let sheet =
                    param_str(input, "sheet").ok_or_else(|| anyhow!("missing parameter 'sheet'"))?;
                let start = count(input, "start")?;
                let n = count(input, "count")?;
                self.book.with_mut(|b| b.delete_rows(sheet, start, n))?;
                Ok(ToolInvocationResult::ok(format!(
                    "deleted rows {}-{}",
                    start,
                    start.saturating_add(n) - 1
                )))
            }
            WorkbookOp::AddSheet => {
                let name =
                    param_str(input, "name").ok_or_else(|| anyhow!("missing parameter 'name'"))?;
                self.book.with_mut(|b| b.add_sheet(name))?;
                Ok(ToolInvocationResult::ok(format!("added sheet {}", name)))
            }
        }
    }
}

/// Register every reference tool against one workbook
pub fn register_reference_tools(registry: &ToolRegistry, book: &WorkbookHandle) {
    for op in WorkbookOp::ALL {
        registry.register(Arc::new(WorkbookTool::new(op, book.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolInvoker;
    use crate::types::params_from;
    use crate::workbook::Workbook;

    fn setup() -> (ToolInvoker, WorkbookHandle) {
        let book = WorkbookHandle::new(Workbook::with_sheets(["Sheet1"]));
        let registry = ToolRegistry::new();
        register_reference_tools(&registry, &book);
        (ToolInvoker::new(registry), book)
    }

    #[tokio::test]
    async fn write_then_read_through_tools() {
        let (invoker, _book) = setup();
        let write = invoker
            .invoke(
                "write_range",
                &params_from(json!({"sheet": "Sheet1", "range": "A1:A2", "values": [[1], [2]]})),
            )
            .await
            .unwrap();
        assert!(write.success, "{:?}", write.error);

        let read = invoker
            .invoke(
                "read_range",
                &params_from(json!({"sheet": "Sheet1", "range": "A1:A2"})),
            )
            .await
            .unwrap();
        assert_eq!(read.data.unwrap()["values"], json!([[1], [2]]));
    }

    #[tokio::test]
    async fn unknown_sheet_is_a_failure_result() {
        let (invoker, _book) = setup();
        let result = invoker
            .invoke(
                "clear_range",
                &params_from(json!({"sheet": "sheet1", "range": "A1"})),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error_message().contains("does not exist"));
    }

    #[test]
    fn formula_alternate_expands_per_row() {
        let adapted = formula_as_values(&params_from(
            json!({"sheet": "S", "range": "C2:C3", "formula": "=A{row}*B{row}"}),
        ))
        .unwrap();
        assert_eq!(adapted["values"], json!([["=A2*B2"], ["=A3*B3"]]));
        assert!(!adapted.contains_key("formula"));
    }

    #[test]
    fn insert_rows_compensates_with_delete() {
        let call = insert_rows_inverse(&params_from(json!({"sheet": "S", "at": 4, "count": 2})))
            .unwrap();
        assert_eq!(call.tool, "delete_rows");
        assert_eq!(call.input["start"], json!(4));
    }
}
