//! External resource interface
//!
//! The engine never touches the document directly except through these two
//! traits: [`ResourceReader`] for real verification (rules, post-write checks)
//! and [`ResourceAccess`] for snapshot capture and restore.

pub mod address;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use address::{CellRange, CellRef};

/// A sheet-qualified range
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionRef {
    /// Sheet name
    pub sheet: String,
    /// Range inside the sheet
    pub range: CellRange,
}

impl RegionRef {
    /// Create a region reference
    pub fn new(sheet: impl Into<String>, range: CellRange) -> Self {
        Self {
            sheet: sheet.into(),
            range,
        }
    }
}

impl std::fmt::Display for RegionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}!{}", self.sheet, self.range)
    }
}

/// Content of one cell: literal value, derivation expression, presentation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellContent {
    /// Literal or last computed value
    pub value: Value,
    /// Formula text including the leading `=`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Number format or style tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl CellContent {
    /// A literal value cell
    pub fn literal(value: Value) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    /// A formula cell
    pub fn formula(formula: impl Into<String>) -> Self {
        Self {
            value: Value::Null,
            formula: Some(formula.into()),
            format: None,
        }
    }

    /// No value, no formula, no format
    pub fn is_empty(&self) -> bool {
        self.value.is_null() && self.formula.is_none() && self.format.is_none()
    }

    /// A hard-coded number with no formula behind it
    pub fn is_literal_number(&self) -> bool {
        self.formula.is_none() && self.value.is_number()
    }

    /// Text that looks like a number (e.g. `"1,200"`)
    pub fn is_numeric_text(&self) -> bool {
        match (&self.formula, &self.value) {
            (None, Value::String(s)) => {
                let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
                !cleaned.is_empty() && cleaned.parse::<f64>().is_ok()
            }
            _ => false,
        }
    }
}

/// Captured state of a region, row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionState {
    /// Region the cells were read from
    pub region: RegionRef,
    /// `cells[r][c]` is the cell at `start + (r, c)`
    pub cells: Vec<Vec<CellContent>>,
}

impl RegionState {
    /// Whether every cell is empty
    pub fn is_blank(&self) -> bool {
        self.cells.iter().flatten().all(CellContent::is_empty)
    }

    /// Iterate over the cells of one column (0-based offset inside the region)
    pub fn column(&self, offset: usize) -> impl Iterator<Item = &CellContent> {
        self.cells.iter().filter_map(move |row| row.get(offset))
    }

    /// Values only, as a JSON matrix
    pub fn values(&self) -> Vec<Vec<Value>> {
        self.cells
            .iter()
            .map(|row| row.iter().map(|c| c.value.clone()).collect())
            .collect()
    }
}

/// One populated cell of a sheet snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetCell {
    /// Position
    pub at: CellRef,
    /// Content
    pub content: CellContent,
}

/// Full captured state of a sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetState {
    /// Sheet name
    pub name: String,
    /// Populated cells in row-major order
    pub cells: Vec<SheetCell>,
}

/// Read-only view of the external document
#[async_trait]
pub trait ResourceReader: Send + Sync {
    /// Names of all sheets, in document order
    async fn sheet_names(&self) -> Result<Vec<String>>;

    /// Values and formulas of a region
    async fn read_region(&self, region: &RegionRef) -> Result<RegionState>;

    /// Whole-sheet state, `None` when the sheet does not exist
    async fn read_sheet(&self, sheet: &str) -> Result<Option<SheetState>>;
}

/// Read/write view used for snapshot capture and restore
#[async_trait]
pub trait ResourceAccess: ResourceReader {
    /// Write a captured region back verbatim
    async fn write_region(&self, state: &RegionState) -> Result<()>;

    /// Restore a sheet to a captured state; `None` removes the sheet
    async fn restore_sheet(&self, sheet: &str, state: Option<&SheetState>) -> Result<()>;

    /// This resource as a plain reader
    fn as_reader(&self) -> &dyn ResourceReader;
}
