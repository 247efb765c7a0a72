// 🏷️ Translator - static lookup tables as data
// unit → cost center, role → category, category → code. Tables are JSON objects on disk.

use crate::config::TranslationStep;
use crate::error::{MappingError, TranslateError};
use crate::record::RecordSet;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

// ============================================================================
// LOOKUP TABLE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupTable {
    entries: BTreeMap<String, String>,
}

impl LookupTable {
    /// Create a new empty table
    pub fn new() -> Self {
        LookupTable::default()
    }

    /// Load a table from a JSON object file. Number values (cost center codes) become text.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read lookup table: {:?}", path.as_ref()))?;

        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse lookup table JSON: {:?}", path.as_ref()))?;

        let mut table = LookupTable::new();
        for (key, value) in raw {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => {
                    warn!(key = %key, "lookup entry without value skipped");
                    continue;
                }
                other => other.to_string(),
            };
            table.insert(key, value);
        }

        Ok(table)
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        LookupTable {
            entries: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// TRANSLATOR
// ============================================================================

/// Strict: every record must hit the table. The first miss aborts with nothing applied.
pub fn translate(
    records: &RecordSet,
    table: &LookupTable,
    source_attr: &str,
    target_attr: &str,
) -> Result<RecordSet, TranslateError> {
    let mut translated = records.clone();
    translated.schema.add_attribute(target_attr);

    for record in &mut translated.records {
        let value = record.attribute(source_attr)?;
        let mapped = table.get(value).ok_or_else(|| MappingError {
            attribute: source_attr.to_string(),
            value: value.to_string(),
        })?;
        let mapped = mapped.to_string();
        record.set_attribute(target_attr, mapped);
    }

    Ok(translated)
}

/// Lenient: misses leave `target_attr` blank so the enrichment cache can ask for them.
/// Returns the distinct missed values in first-seen order. Existing non-blank targets are kept.
pub fn translate_partial(
    records: &RecordSet,
    table: &LookupTable,
    source_attr: &str,
    target_attr: &str,
) -> Result<(RecordSet, Vec<String>), TranslateError> {
    let mut translated = records.clone();
    translated.schema.add_attribute(target_attr);

    let mut seen = BTreeSet::new();
    let mut missed = Vec::new();
    for record in &mut translated.records {
        if !record.is_unset(target_attr) {
            continue;
        }
        let value = record.attribute(source_attr)?.to_string();
        match table.get(&value) {
            Some(mapped) => record.set_attribute(target_attr, mapped),
            None => {
                record.set_attribute(target_attr, "");
                if seen.insert(value.clone()) {
                    missed.push(value);
                }
            }
        }
    }

    Ok((translated, missed))
}

// ============================================================================
// CONFIGURED TRANSLATION
// ============================================================================

/// A lookup table bound to its source and target attributes
#[derive(Debug, Clone)]
pub struct Translation {
    pub source: String,
    pub target: String,
    pub table: LookupTable,
}

impl Translation {
    pub fn new(source: impl Into<String>, target: impl Into<String>, table: LookupTable) -> Self {
        Translation {
            source: source.into(),
            target: target.into(),
            table,
        }
    }

    pub fn load(step: &TranslationStep) -> Result<Self> {
        let table = LookupTable::from_file(&step.table)?;
        info!(
            source = %step.source,
            target = %step.target,
            entries = table.len(),
            "loaded lookup table"
        );
        Ok(Translation::new(step.source.clone(), step.target.clone(), table))
    }

    pub fn apply(&self, records: &RecordSet) -> Result<RecordSet, TranslateError> {
        translate(records, &self.table, &self.source, &self.target)
    }

    pub fn apply_partial(&self, records: &RecordSet) -> Result<(RecordSet, Vec<String>), TranslateError> {
        translate_partial(records, &self.table, &self.source, &self.target)
    }
}

/// Apply a chain of strict translations in order
pub fn translate_all(records: &RecordSet, steps: &[Translation]) -> Result<RecordSet, TranslateError> {
    let mut current = records.clone();
    for step in steps {
        current = step.apply(&current)?;
    }
    Ok(current)
}

// ============================================================================
// TESTS
// ============================================================================
