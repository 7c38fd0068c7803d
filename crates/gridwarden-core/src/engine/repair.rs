//! Local parameter repair
//!
//! When a tool call fails, the engine first tries to fix the obvious
//! parameter mistakes planners make and retries once before involving the
//! replanner.

use crate::resource::address::split_qualified;
use crate::resource::CellRange;
use crate::types::{param_str, Params};
use serde_json::Value;

const ALIASES: &[(&str, &str)] = &[
    ("sheetName", "sheet"),
    ("sheet_name", "sheet"),
    ("worksheet", "sheet"),
    ("address", "range"),
    ("cell", "range"),
    ("cells", "range"),
    ("data", "values"),
];

const COUNT_PARAMS: &[&str] = &["at", "start", "count"];

/// Repaired parameters and what was changed
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRepair {
    /// Parameters to retry with
    pub params: Params,
    /// One note per change
    pub notes: Vec<String>,
}

/// Try to repair parameters; `None` when nothing could be changed
pub fn repair_params(input: &Params, sheets: &[String]) -> Option<ParamRepair> {
    let mut params = input.clone();
    let mut notes = Vec::new();

    for (from, to) in ALIASES {
        if params.contains_key(*to) {
            continue;
        }
        if let Some(value) = params.remove(*from) {
            params.insert(to.to_string(), value);
            notes.push(format!("renamed '{}' to '{}'", from, to));
        }
    }

    if let Some(range) = param_str(&params, "range").map(str::to_string) {
        let mut range_text = range.clone();
        if let Some((sheet, bare)) = split_qualified(&range) {
            if param_str(&params, "sheet").is_none() {
                params.insert("sheet".into(), Value::String(sheet.clone()));
                notes.push(format!("took sheet '{}' from the range", sheet));
            }
            range_text = bare;
        }
        let cleaned: String = range_text
            .chars()
            .filter(|c| *c != '$' && !c.is_whitespace())
            .collect();
        if let Ok(parsed) = CellRange::parse(&cleaned) {
            range_text = parsed.to_string();
        }
        if range_text != range {
            notes.push(format!("normalized range '{}' to '{}'", range, range_text));
            params.insert("range".into(), Value::String(range_text));
        }
    }

    if let Some(sheet) = param_str(&params, "sheet").map(str::to_string) {
        if !sheets.contains(&sheet) {
            let wanted = sheet.trim().to_lowercase();
            if let Some(found) = sheets.iter().find(|s| s.to_lowercase() == wanted) {
                notes.push(format!("matched sheet '{}' to '{}'", sheet, found));
                params.insert("sheet".into(), Value::String(found.clone()));
            }
        }
    }

    for key in COUNT_PARAMS {
        let Some(Value::String(text)) = params.get(*key) else {
            continue;
        };
        if let Ok(number) = text.trim().parse::<u32>() {
            notes.push(format!("parsed '{}' as a number", key));
            params.insert(key.to_string(), Value::from(number));
        }
    }

    if notes.is_empty() {
        None
    } else {
        Some(ParamRepair { params, notes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::params_from;
    use serde_json::json;

    fn sheets() -> Vec<String> {
        vec!["Sales".to_string(), "Summary".to_string()]
    }

    #[test]
    fn fixes_aliases_and_qualified_ranges() {
        let input = params_from(json!({"sheetName": "sales ", "address": "Sales!$B$4:A1"}));
        let repair = repair_params(&input, &sheets()).unwrap();
        assert_eq!(repair.params["sheet"], json!("Sales"));
        assert_eq!(repair.params["range"], json!("A1:B4"));
        assert!(!repair.params.contains_key("address"));
        assert!(repair.notes.len() >= 3);
    }

    #[test]
    fn qualified_sheet_fills_a_missing_sheet() {
        let input = params_from(json!({"range": "Summary!C2", "count": "3"}));
        let repair = repair_params(&input, &sheets()).unwrap();
        assert_eq!(repair.params["sheet"], json!("Summary"));
        assert_eq!(repair.params["range"], json!("C2"));
        assert_eq!(repair.params["count"], json!(3));
    }

    #[test]
    fn nothing_to_repair() {
        let input = params_from(json!({"sheet": "Sales", "range": "A1:B2"}));
        assert!(repair_params(&input, &sheets()).is_none());
    }
}
