//! Post-write verification: re-read the target and confirm the mutation is
//! observable

use crate::ledger::RollbackData;
use crate::resource::{CellContent, ResourceReader};
use crate::tool::{Target, ToolMetadata, VerifyKind};
use crate::types::{values_matrix, Params};
use serde_json::Value;

fn cell_matches(cell: &CellContent, expected: &Value) -> bool {
    match expected {
        Value::String(text) if text.starts_with('=') => cell.formula.as_deref() == Some(text.as_str()),
        Value::Null => cell.value.is_null() && cell.formula.is_none(),
        other => &cell.value == other,
    }
}

/// Check that a successful write left the expected trace.
///
/// `before` is the snapshot taken before the call. Returns the reason when the
/// write is not observable; a write with nothing to compare against passes.
pub async fn verify_write(
    meta: &ToolMetadata,
    input: &Params,
    before: Option<&RollbackData>,
    reader: &dyn ResourceReader,
) -> Result<(), String> {
    let target = meta.target.resolve(input);
    match (meta.verify, target) {
        (VerifyKind::None, _) | (_, None) => Ok(()),

        (VerifyKind::SheetExists, Some(target)) => {
            let names = reader.sheet_names().await.map_err(|e| e.to_string())?;
            if names.iter().any(|n| n == target.sheet()) {
                Ok(())
            } else {
                Err(format!("sheet '{}' is not present after {}", target.sheet(), meta.name))
            }
        }

        (VerifyKind::Changed, Some(target)) => {
            let Some(RollbackData::Sheet {
                state: Some(previous),
                ..
            }) = before
            else {
                return Ok(());
            };
            if previous.cells.is_empty() {
                return Ok(());
            }
            let current = reader
                .read_sheet(target.sheet())
                .await
                .map_err(|e| e.to_string())?;
            if current.as_ref() == Some(previous) {
                Err(format!("{} left sheet '{}' unchanged", meta.name, target.sheet()))
            } else {
                Ok(())
            }
        }

        (kind, Some(Target::Region(region))) => {
            let state = reader.read_region(&region).await.map_err(|e| e.to_string())?;
            let cells = state.cells.iter().flatten();
            match kind {
                VerifyKind::ValuesMatch { values_param } => {
                    let Some(values) = input.get(values_param) else {
                        return Ok(());
                    };
                    for (r, row) in values_matrix(values).iter().enumerate() {
                        for (c, expected) in row.iter().enumerate() {
                            let Some(cell) = state.cells.get(r).and_then(|cells| cells.get(c)) else {
                                continue;
                            };
                            if !cell_matches(cell, expected) {
                                return Err(format!(
                                    "{} reads back {} at row {} column {} of {}, expected {}",
                                    meta.name,
                                    cell.formula.clone().map(Value::String).unwrap_or(cell.value.clone()),
                                    r + 1,
                                    c + 1,
                                    region,
                                    expected
                                ));
                            }
                        }
                    }
                    Ok(())
                }
                VerifyKind::FormulaPresent => {
                    let missing = cells.filter(|cell| cell.formula.is_none()).count();
                    if missing == 0 {
                        Ok(())
                    } else {
                        Err(format!("{} cell(s) of {} have no formula", missing, region))
                    }
                }
                VerifyKind::Cleared => {
                    let left = cells.filter(|cell| !cell.is_empty()).count();
                    if left == 0 {
                        Ok(())
                    } else {
                        Err(format!("{} cell(s) of {} are not cleared", left, region))
                    }
                }
                _ => Ok(()),
            }
        }

        (_, Some(Target::Sheet(_))) => Ok(()),
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

    fn fixture() -> (WorkbookHandle, ToolRegistry) {
        let book = WorkbookHandle::new(Workbook::with_sheets(["S"]));
        let registry = ToolRegistry::new();
        register_reference_tools(&registry, &book);
        (book, registry)
    }

    #[tokio::test]
    async fn values_must_read_back() {
        let (book, registry) = fixture();
        let meta = registry.metadata("write_range").unwrap();
        let input = params_from(json!({"sheet": "S", "range": "A1:A2", "values": [[1], ["=A1*2"]]}));

        let err = verify_write(&meta, &input, None, &book).await.unwrap_err();
        assert!(err.contains("expected 1"));

        book.with_mut(|b| {
            b.write_values(
                &RegionRef::new("S", CellRange::parse("A1:A2").unwrap()),
                &[vec![json!(1)], vec![json!("=A1*2")]],
            )
        })
        .unwrap();
        assert!(verify_write(&meta, &input, None, &book).await.is_ok());
    }

    #[tokio::test]
    async fn formulas_and_clears_are_checked() {
        let (book, registry) = fixture();
        let input = params_from(json!({"sheet": "S", "range": "B1", "formula": "=A1"}));
        let formula = registry.metadata("set_formula").unwrap();
        assert!(verify_write(&formula, &input, None, &book).await.is_err());

        let clear = registry.metadata("clear_range").unwrap();
        assert!(verify_write(&clear, &input, None, &book).await.is_ok());
    }

    #[tokio::test]
    async fn unchanged_sheet_fails_only_with_a_populated_snapshot() {
        let (book, registry) = fixture();
        let meta = registry.metadata("delete_rows").unwrap();
        let input = params_from(json!({"sheet": "S", "start": 1, "count": 1}));

        let empty = book.read_sheet("S").await.unwrap();
        let before = RollbackData::Sheet { sheet: "S".into(), state: empty };
        assert!(verify_write(&meta, &input, Some(&before), &book).await.is_ok());

        book.with_mut(|b| {
            b.write_values(&RegionRef::new("S", CellRange::parse("A5").unwrap()), &[vec![json!(1)]])
        })
        .unwrap();
        let populated = book.read_sheet("S").await.unwrap();
        let before = RollbackData::Sheet { sheet: "S".into(), state: populated };
        assert!(verify_write(&meta, &input, Some(&before), &book).await.is_err());
    }
}
