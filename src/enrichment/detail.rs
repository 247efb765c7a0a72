// 🔎 Detail Source - optional extra text shown next to a key before the operator answers
// Failures are never fatal: the operator sees the error text instead.

use crate::record::Record;
use anyhow::{bail, Result};

pub trait DetailSource {
    /// Extra text for a key. `Ok(None)` means nothing to show.
    fn fetch(&self, natural_key: &str, rows: &[&Record]) -> Result<Option<String>>;
}

/// No detail at all
pub struct NoDetail;

impl DetailSource for NoDetail {
    fn fetch(&self, _natural_key: &str, _rows: &[&Record]) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Distinct values of one column across the key's rows (e.g. a free-text description)
pub struct ColumnDetail {
    pub column: String,
}

impl ColumnDetail {
    pub fn new(column: impl Into<String>) -> Self {
        ColumnDetail {
            column: column.into(),
        }
    }
}

impl DetailSource for ColumnDetail {
    fn fetch(&self, _natural_key: &str, rows: &[&Record]) -> Result<Option<String>> {
        let mut values: Vec<String> = Vec::new();
        for row in rows {
            let Some(value) = row.field_text(&self.column) else {
                bail!("column '{}' not present on row {}", self.column, row.entity_id);
            };
            let value = value.trim().to_string();
            if !value.is_empty() && !values.contains(&value) {
                values.push(value);
            }
        }

        if values.is_empty() {
            Ok(None)
        } else {
            Ok(Some(values.join(" | ")))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
