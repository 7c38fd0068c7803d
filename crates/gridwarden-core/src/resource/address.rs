//! A1-style addressing: `B7`, `A1:D10`, `Sheet1!A1:B2`

use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single cell position (1-based). Ordering is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    /// Row number, starting at 1
    pub row: u32,
    /// Column number, starting at 1 (A = 1)
    pub col: u32,
}

impl CellRef {
    /// Create a cell reference
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Parse `B7` (absolute markers such as `$B$7` are accepted)
    pub fn parse(text: &str) -> Result<Self> {
        let cleaned: String = text.trim().chars().filter(|c| *c != '$').collect();
        let split = cleaned
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| WardenError::InvalidInput(format!("missing row in cell '{}'", text)))?;
        let (letters, digits) = cleaned.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(WardenError::InvalidInput(format!("invalid column in cell '{}'", text)));
        }
        let row: u32 = digits
            .parse()
            .map_err(|_| WardenError::InvalidInput(format!("invalid row in cell '{}'", text)))?;
        if row == 0 {
            return Err(WardenError::InvalidInput(format!("row 0 in cell '{}'", text)));
        }
        Ok(Self {
            row,
            col: column_number(letters)?,
        })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_letters(self.col), self.row)
    }
}

/// Inclusive rectangular range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRange {
    /// Top-left corner
    pub start: CellRef,
    /// Bottom-right corner
    pub end: CellRef,
}

impl CellRange {
    /// Build a range, normalizing the corners
    pub fn new(a: CellRef, b: CellRef) -> Self {
        Self {
            start: CellRef::new(a.row.min(b.row), a.col.min(b.col)),
            end: CellRef::new(a.row.max(b.row), a.col.max(b.col)),
        }
    }

    /// Parse `A1:D10` or a single cell `B2`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(WardenError::InvalidInput("empty range".to_string()));
        }
        match text.split_once(':') {
            Some((a, b)) => Ok(Self::new(CellRef::parse(a)?, CellRef::parse(b)?)),
            None => {
                let cell = CellRef::parse(text)?;
                Ok(Self::new(cell, cell))
            }
        }
    }

    /// Number of rows covered
    pub fn height(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    /// Number of columns covered
    pub fn width(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    /// Whether this range is a single cell
    pub fn is_single_cell(&self) -> bool {
        self.start == self.end
    }

    /// Whether a cell lies inside the range
    pub fn contains(&self, cell: CellRef) -> bool {
        (self.start.row..=self.end.row).contains(&cell.row)
            && (self.start.col..=self.end.col).contains(&cell.col)
    }

    /// Range with the same top-left corner and a new shape
    pub fn resized(&self, height: u32, width: u32) -> Self {
        let height = height.max(1);
        let width = width.max(1);
        Self {
            start: self.start,
            end: CellRef::new(self.start.row + height - 1, self.start.col + width - 1),
        }
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_cell() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// Split `Sheet1!A1:B2` into its sheet and range parts
pub fn split_qualified(text: &str) -> Option<(String, String)> {
    let (sheet, range) = text.rsplit_once('!')?;
    let sheet = sheet.trim().trim_matches('\'');
    if sheet.is_empty() || range.trim().is_empty() {
        return None;
    }
    Some((sheet.to_string(), range.trim().to_string()))
}

/// `A` → 1, `Z` → 26, `AA` → 27
pub fn column_number(letters: &str) -> Result<u32> {
    let mut col: u32 = 0;
    for c in letters.chars() {
        let digit = (c.to_ascii_uppercase() as u32)
            .checked_sub('A' as u32)
            .filter(|d| *d < 26)
            .ok_or_else(|| WardenError::InvalidInput(format!("invalid column '{}'", letters)))?;
        col = col
            .checked_mul(26)
            .and_then(|v| v.checked_add(digit + 1))
            .ok_or_else(|| WardenError::InvalidInput(format!("column '{}' out of range", letters)))?;
    }
    Ok(col)
}

/// 1 → `A`, 27 → `AA`
pub fn column_letters(mut col: u32) -> String {
    let mut out = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        out.push((b'A' + rem as u8) as char);
        col = (col - 1) / 26;
    }
    out.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_cells() {
        let range = CellRange::parse("A1:D10").unwrap();
        assert_eq!(range.height(), 10);
        assert_eq!(range.width(), 4);
        assert_eq!(range.to_string(), "A1:D10");

        let single = CellRange::parse("$B$7").unwrap();
        assert!(single.is_single_cell());
        assert_eq!(single.to_string(), "B7");
    }

    #[test]
    fn reversed_corners_are_normalized() {
        let range = CellRange::parse("C5:A1").unwrap();
        assert_eq!(range.to_string(), "A1:C5");
    }

    #[test]
    fn column_conversion_handles_multi_letter() {
        assert_eq!(column_number("AA").unwrap(), 27);
        assert_eq!(column_letters(27), "AA");
        assert_eq!(column_letters(702), "ZZ");
    }

    #[test]
    fn rejects_garbage() {
        assert!(CellRange::parse("").is_err());
        assert!(CellRange::parse("A0").is_err());
        assert!(CellRange::parse("11").is_err());
        assert!(CellRange::parse("A1:").is_err());
    }

    #[test]
    fn splits_sheet_qualified_ranges() {
        assert_eq!(
            split_qualified("'Q1 Sales'!A1:B2"),
            Some(("Q1 Sales".to_string(), "A1:B2".to_string()))
        );
        assert_eq!(split_qualified("A1:B2"), None);
    }
}
