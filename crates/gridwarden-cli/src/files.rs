use anyhow::{Context, Result};
use gridwarden_core::workbook::{Workbook, WorkbookDocument};
use serde_json::Value;
use std::path::Path;

pub fn load_workbook(path: &Path) -> Result<Workbook> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workbook {}", path.display()))?;
    let doc: WorkbookDocument = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a workbook document", path.display()))?;
    Ok(Workbook::from_document(doc)?)
}

pub fn save_workbook(path: &Path, book: &Workbook) -> Result<()> {
    let content = serde_json::to_string_pretty(&book.to_document())?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write workbook {}", path.display()))?;
    Ok(())
}

/// Planner responses from a JSON array; objects are replayed as their JSON text
pub fn load_script(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    let Value::Array(items) = value else {
        anyhow::bail!("{} must hold a JSON array of responses", path.display());
    };
    Ok(items
        .into_iter()
        .map(|item| match item {
            Value::String(text) => text,
            other => other.to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_script_accepts_text_and_objects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(&path, r#"["thinking...", {"action": "complete", "message": "done"}]"#).unwrap();

        let script = load_script(&path).unwrap();
        assert_eq!(script.len(), 2);
        assert_eq!(script[0], "thinking...");
        assert!(script[1].contains("\"complete\""));
    }

    #[test]
    fn test_script_must_be_an_array() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(&path, r#"{"action": "complete"}"#).unwrap();
        assert!(load_script(&path).is_err());
    }

    #[test]
    fn test_workbook_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.json");
        std::fs::write(&path, r#"{"sheets": [{"name": "Sales", "cells": {"A1": 3, "B1": "=A1*2"}}]}"#).unwrap();

        let book = load_workbook(&path).unwrap();
        assert_eq!(book.sheet_names(), vec!["Sales".to_string()]);
        save_workbook(&path, &book).unwrap();

        let again = load_workbook(&path).unwrap();
        assert_eq!(again.sheet("Sales").map(|s| s.populated()), Some(2));
    }
}
