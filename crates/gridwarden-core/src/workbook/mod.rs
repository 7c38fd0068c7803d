//! In-memory workbook
//!
//! A small spreadsheet model used as the reference resource for
//! tests and the CLI. Formulas are stored, not evaluated.

pub mod tools;

use crate::error::{Result, WardenError};
use crate::resource::{
    CellContent, CellRange, CellRef, RegionRef, RegionState, ResourceAccess, ResourceReader,
    SheetCell, SheetState,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use tools::register_reference_tools;

/// One sheet: sparse, row-major cell map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    /// Sheet name
    pub name: String,
    cells: BTreeMap<CellRef, CellContent>,
}

impl Sheet {
    /// Empty sheet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
        }
    }

    /// Cell content (empty when unset)
    pub fn cell(&self, at: CellRef) -> CellContent {
        self.cells.get(&at).cloned().unwrap_or_default()
    }

    /// Set a cell; empty content removes it
    pub fn set(&mut self, at: CellRef, content: CellContent) {
        if content.is_empty() {
            self.cells.remove(&at);
        } else {
            self.cells.insert(at, content);
        }
    }

    /// Smallest range covering every populated cell
    pub fn used_range(&self) -> Option<CellRange> {
        let first = self.cells.keys().next()?;
        let (mut min_row, mut max_row) = (first.row, first.row);
        let (mut min_col, mut max_col) = (first.col, first.col);
        for at in self.cells.keys() {
            min_row = min_row.min(at.row);
            max_row = max_row.max(at.row);
            min_col = min_col.min(at.col);
            max_col = max_col.max(at.col);
        }
        Some(CellRange::new(
            CellRef::new(min_row, min_col),
            CellRef::new(max_row, max_col),
        ))
    }

    /// Number of populated cells
    pub fn populated(&self) -> usize {
        self.cells.len()
    }

    fn read(&self, range: &CellRange) -> Vec<Vec<CellContent>> {
        (range.start.row..=range.end.row)
            .map(|row| {
                (range.start.col..=range.end.col)
                    .map(|col| self.cell(CellRef::new(row, col)))
                    .collect()
            })
            .collect()
    }

    fn shift_rows(&mut self, from_row: u32, delta: i64) {
        let moved: Vec<(CellRef, CellContent)> = self
            .cells
            .iter()
            .filter(|(at, _)| at.row >= from_row)
            .map(|(at, c)| (*at, c.clone()))
            .collect();
        for (at, _) in &moved {
            self.cells.remove(at);
        }
        for (at, content) in moved {
            let row = at.row as i64 + delta;
            if row >= 1 {
                self.cells.insert(CellRef::new(row as u32, at.col), content);
            }
        }
    }

    fn snapshot(&self) -> SheetState {
        SheetState {
            name: self.name.clone(),
            cells: self
                .cells
                .iter()
                .map(|(at, content)| SheetCell {
                    at: *at,
                    content: content.clone(),
                })
                .collect(),
        }
    }

    fn from_snapshot(state: &SheetState) -> Self {
        Self {
            name: state.name.clone(),
            cells: state
                .cells
                .iter()
                .map(|c| (c.at, c.content.clone()))
                .collect(),
        }
    }
}

/// Ordered collection of sheets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    sheets: Vec<Sheet>,
}

impl Workbook {
    /// Empty workbook
    pub fn new() -> Self {
        Self::default()
    }

    /// Workbook with empty sheets of the given names
    pub fn with_sheets<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sheets: names.into_iter().map(Sheet::new).collect(),
        }
    }

    /// Sheet names in order
    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    /// Borrow a sheet
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    /// Borrow a sheet mutably
    pub fn sheet_mut(&mut self, name: &str) -> Result<&mut Sheet> {
        self.sheets
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| WardenError::Resource(format!("sheet '{}' does not exist", name)))
    }

    fn sheet_or_err(&self, name: &str) -> Result<&Sheet> {
        self.sheet(name)
            .ok_or_else(|| WardenError::Resource(format!("sheet '{}' does not exist", name)))
    }

    /// Add an empty sheet
    pub fn add_sheet(&mut self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(WardenError::InvalidInput("sheet name is empty".to_string()));
        }
        if self.sheet(name).is_some() {
            return Err(WardenError::Resource(format!("sheet '{}' already exists", name)));
        }
        self.sheets.push(Sheet::new(name));
        Ok(())
    }

    /// Remove a sheet (no-op when absent)
    pub fn remove_sheet(&mut self, name: &str) {
        self.sheets.retain(|s| s.name != name);
    }

    /// Read a region
    pub fn read(&self, region: &RegionRef) -> Result<RegionState> {
        let sheet = self.sheet_or_err(&region.sheet)?;
        Ok(RegionState {
            region: region.clone(),
            cells: sheet.read(&region.range),
        })
    }

    /// Write a values matrix; strings starting with `=` become formulas.
    ///
    /// The matrix must match the range shape exactly.
    pub fn write_values(&mut self, region: &RegionRef, values: &[Vec<Value>]) -> Result<()> {
        let range = region.range;
        if values.len() as u32 != range.height()
            || values.iter().any(|row| row.len() as u32 != range.width())
        {
            return Err(WardenError::InvalidInput(format!(
                "values shape {}x{} does not match range {} ({}x{})",
                values.len(),
                values.first().map(|r| r.len()).unwrap_or(0),
                range,
                range.height(),
                range.width()
            )));
        }
        let sheet = self.sheet_mut(&region.sheet)?;
        for (r, row) in values.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                let at = CellRef::new(range.start.row + r as u32, range.start.col + c as u32);
                let format = sheet.cell(at).format;
                let mut content = match value {
                    Value::String(s) if s.starts_with('=') => CellContent::formula(s.clone()),
                    other => CellContent::literal(other.clone()),
                };
                content.format = format;
                sheet.set(at, content);
            }
        }
        Ok(())
    }

    /// Put a formula into every cell of the range; `{row}` is replaced per row
    pub fn set_formula(&mut self, region: &RegionRef, template: &str) -> Result<()> {
        if !template.starts_with('=') {
            return Err(WardenError::InvalidInput(format!(
                "formula must start with '=': {}",
                template
            )));
        }
        let range = region.range;
        let sheet = self.sheet_mut(&region.sheet)?;
        for row in range.start.row..=range.end.row {
            for col in range.start.col..=range.end.col {
                let at = CellRef::new(row, col);
                let format = sheet.cell(at).format;
                let mut content = CellContent::formula(template.replace("{row}", &row.to_string()));
                content.format = format;
                sheet.set(at, content);
            }
        }
        Ok(())
    }

    /// Clear values, formulas and formats
    pub fn clear(&mut self, region: &RegionRef) -> Result<()> {
        let range = region.range;
        let sheet = self.sheet_mut(&region.sheet)?;
        for row in range.start.row..=range.end.row {
            for col in range.start.col..=range.end.col {
                sheet.set(CellRef::new(row, col), CellContent::default());
            }
        }
        Ok(())
    }

    /// Apply a format tag to every cell
    pub fn format(&mut self, region: &RegionRef, format: &str) -> Result<()> {
        let range = region.range;
        let sheet = self.sheet_mut(&region.sheet)?;
        for row in range.start.row..=range.end.row {
            for col in range.start.col..=range.end.col {
                let at = CellRef::new(row, col);
                let mut content = sheet.cell(at);
                content.format = Some(format.to_string());
                sheet.set(at, content);
            }
        }
        Ok(())
    }

    /// Insert `count` empty rows before row `at`
    pub fn insert_rows(&mut self, sheet: &str, at: u32, count: u32) -> Result<()> {
        if at == 0 || count == 0 {
            return Err(WardenError::InvalidInput("row and count must be positive".into()));
        }
        self.sheet_mut(sheet)?.shift_rows(at, count as i64);
        Ok(())
    }

    /// Delete `count` rows starting at row `start`
    pub fn delete_rows(&mut self, sheet: &str, start: u32, count: u32) -> Result<()> {
        if start == 0 || count == 0 {
            return Err(WardenError::InvalidInput("row and count must be positive".into()));
        }
        let sheet = self.sheet_mut(sheet)?;
        let end = start.saturating_add(count);
        sheet.cells.retain(|at, _| at.row < start || at.row >= end);
        sheet.shift_rows(end, -(count as i64));
        Ok(())
    }

    /// Load from the JSON document format
    pub fn from_document(doc: WorkbookDocument) -> Result<Self> {
        let mut book = Workbook::new();
        for sheet_doc in doc.sheets {
            book.add_sheet(&sheet_doc.name)?;
            let sheet = book.sheet_mut(&sheet_doc.name)?;
            for (address, value) in sheet_doc.cells {
                let at = CellRef::parse(&address)?;
                let content = match value {
                    Value::String(s) if s.starts_with('=') => CellContent::formula(s),
                    other => CellContent::literal(other),
                };
                sheet.set(at, content);
            }
        }
        Ok(book)
    }

    /// Convert to the JSON document format (formats are not persisted)
    pub fn to_document(&self) -> WorkbookDocument {
        WorkbookDocument {
            sheets: self
                .sheets
                .iter()
                .map(|sheet| SheetDocument {
                    name: sheet.name.clone(),
                    cells: sheet
                        .cells
                        .iter()
                        .filter(|(_, c)| c.formula.is_some() || !c.value.is_null())
                        .map(|(at, c)| {
                            let value = match &c.formula {
                                Some(f) => Value::String(f.clone()),
                                None => c.value.clone(),
                            };
                            (at.to_string(), value)
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Serialized workbook: `{"sheets": [{"name": "Sheet1", "cells": {"A1": 5, "B1": "=A1*2"}}]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkbookDocument {
    /// Sheets in order
    pub sheets: Vec<SheetDocument>,
}

/// One serialized sheet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SheetDocument {
    /// Sheet name
    pub name: String,
    /// A1 address → value (formulas as `=` strings)
    #[serde(default)]
    pub cells: BTreeMap<String, Value>,
}

/// Shared handle implementing the resource traits
#[derive(Debug, Clone, Default)]
pub struct WorkbookHandle {
    inner: Arc<RwLock<Workbook>>,
}

impl WorkbookHandle {
    /// Wrap a workbook
    pub fn new(book: Workbook) -> Self {
        Self {
            inner: Arc::new(RwLock::new(book)),
        }
    }

    /// Run a closure with shared access
    pub fn with<R>(&self, f: impl FnOnce(&Workbook) -> R) -> R {
        f(&self.inner.read())
    }

    /// Run a closure with exclusive access
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Workbook) -> R) -> R {
        f(&mut self.inner.write())
    }

    /// Clone of the current workbook
    pub fn snapshot(&self) -> Workbook {
        self.inner.read().clone()
    }
}

#[async_trait]
impl ResourceReader for WorkbookHandle {
    async fn sheet_names(&self) -> Result<Vec<String>> {
        Ok(self.with(|b| b.sheet_names()))
    }

    async fn read_region(&self, region: &RegionRef) -> Result<RegionState> {
        self.with(|b| b.read(region))
    }

    async fn read_sheet(&self, sheet: &str) -> Result<Option<SheetState>> {
        Ok(self.with(|b| b.sheet(sheet).map(Sheet::snapshot)))
    }
}

#[async_trait]
impl ResourceAccess for WorkbookHandle {
    async fn write_region(&self, state: &RegionState) -> Result<()> {
        self.with_mut(|b| {
            let range = state.region.range;
            let sheet = b.sheet_mut(&state.region.sheet)?;
            for (r, row) in state.cells.iter().enumerate() {
                for (c, content) in row.iter().enumerate() {
                    let at = CellRef::new(range.start.row + r as u32, range.start.col + c as u32);
                    sheet.set(at, content.clone());
                }
            }
            Ok(())
        })
    }

    async fn restore_sheet(&self, sheet: &str, state: Option<&SheetState>) -> Result<()> {
        self.with_mut(|b| {
            match state {
                None => b.remove_sheet(sheet),
                Some(state) => {
                    let restored = Sheet::from_snapshot(state);
                    match b.sheets.iter_mut().find(|s| s.name == sheet) {
                        Some(existing) => *existing = restored,
                        None => b.sheets.push(restored),
                    }
                }
            }
            Ok(())
        })
    }

    fn as_reader(&self) -> &dyn ResourceReader {
        self
    }
}
