// 📥 Record Loader - source extracts into canonical record sets
// Maps source headers to canonical names, builds composite entity ids, adds constants,
// drops non-positive rows when asked, then normalizes keys.

use crate::config::{EntityIdSpec, SourceConfig};
use crate::error::SchemaError;
use crate::normalize::normalize;
use crate::record::{parse_amount, Record, RecordSet, Schema};
use anyhow::{Context, Result};
use csv::StringRecord;
use rust_decimal::Decimal;
use std::path::Path;
use tracing::info;

/// Canonical schema of a source: entity id, mapped attributes, constants, amounts
pub fn schema_for(source: &SourceConfig) -> Schema {
    let mut schema = Schema::new(source.entity_id.column_name());
    for name in source.attribute_names() {
        schema.add_attribute(name);
    }
    for name in source.amount_names() {
        schema = schema.with_amount(name);
    }
    schema
}

/// Load and concatenate every file of a source
pub fn load_source(source: &SourceConfig) -> Result<RecordSet> {
    let schema = schema_for(source);
    let mut records = Vec::new();

    for file in &source.files {
        let loaded = load_file(file, source)?;
        info!(source = %source.name, file = %file.display(), rows = loaded.len(), "loaded extract");
        records.extend(loaded);
    }

    let mut set = RecordSet::from_records(schema, records);

    if let Some(amount) = &source.positive_amount {
        let before = set.len();
        let mut kept = Vec::with_capacity(before);
        for record in set.records {
            if record.amount(amount)? > Decimal::ZERO {
                kept.push(record);
            }
        }
        set.records = kept;
        info!(source = %source.name, dropped = before - set.len(), "non-positive rows dropped");
    }

    Ok(normalize(&set, &source.normalize)?)
}

fn load_file(path: &Path, source: &SourceConfig) -> Result<Vec<Record>> {
    let source_name = path.display().to_string();
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", source_name))?;
    let headers = rdr
        .headers()
        .with_context(|| format!("Failed to read CSV header: {}", source_name))?
        .clone();

    let position = |column: &str| -> Result<usize, SchemaError> {
        headers
            .iter()
            .position(|h| h.trim() == column)
            .ok_or_else(|| SchemaError::MissingColumn {
                source_name: source_name.clone(),
                column: column.to_string(),
            })
    };

    let id_positions = source
        .entity_id
        .source_columns()
        .into_iter()
        .map(|column| position(column))
        .collect::<Result<Vec<_>, _>>()?;
    let attribute_positions = source
        .attributes
        .iter()
        .map(|a| position(a.source_column()).map(|p| (a.name.clone(), p)))
        .collect::<Result<Vec<_>, _>>()?;
    let amount_positions = source
        .amounts
        .iter()
        .map(|a| position(a.source_column()).map(|p| (a.name.clone(), p)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::new();
    for result in rdr.records() {
        let row = result.with_context(|| format!("Failed to read CSV row: {}", source_name))?;
        let line = row.position().map_or(0, |p| p.line());

        let mut record = Record::new(entity_id(&source.entity_id, &row, &id_positions));
        for (name, pos) in &attribute_positions {
            record.set_attribute(name, cell(&row, *pos));
        }
        for (name, value) in &source.constants {
            record.set_attribute(name, value.clone());
        }
        for (name, pos) in &amount_positions {
            let value = parse_amount(cell(&row, *pos), &source_name, line, name)?;
            record.amounts.insert(name.clone(), value);
        }
        records.push(record);
    }

    Ok(records)
}

fn cell<'a>(row: &'a StringRecord, position: usize) -> &'a str {
    row.get(position).unwrap_or("")
}

fn entity_id(layout: &EntityIdSpec, row: &StringRecord, positions: &[usize]) -> String {
    match layout {
        EntityIdSpec::Column(_) => cell(row, positions[0]).trim().to_string(),
        EntityIdSpec::Composite { separator, .. } => positions
            .iter()
            .map(|&p| cell(row, p).trim())
            .collect::<Vec<_>>()
            .join(separator),
    }
}

// ============================================================================
// TESTS
// ============================================================================
