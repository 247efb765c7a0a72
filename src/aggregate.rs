// ➕ Aggregator - group records and sum every amount
// `aggregate` keeps the entity in the group (one row per person and attribute values);
// `aggregate_by_attributes` drops it and re-keys rows on the first group attribute.

use crate::error::SchemaError;
use crate::record::{Record, RecordSet, Schema};
use rust_decimal::Decimal;
use std::collections::HashMap;

// ============================================================================
// AGGREGATION
// ============================================================================

/// Group records by (entity_id, group attributes) and sum every amount field.
/// Output rows follow first-seen order; attributes not listed are dropped.
pub fn aggregate(records: &RecordSet, group_attributes: &[String]) -> Result<RecordSet, SchemaError> {
    let mut schema = Schema::new(records.schema.entity_column.clone());
    for attribute in group_attributes {
        schema.add_attribute(attribute.clone());
    }
    schema.amounts = records.schema.amounts.clone();

    let rows = sum_groups(records, &schema.amounts, |record| {
        let values = values_of(record, group_attributes)?;
        let mut row = Record::new(record.entity_id.clone());
        for (attribute, value) in group_attributes.iter().zip(&values) {
            row.set_attribute(attribute, value.clone());
        }
        Ok((record.entity_id.clone(), values, row))
    })?;

    Ok(RecordSet::from_records(schema, rows))
}

/// Group records by the listed attributes only and sum every amount field.
/// The first group attribute becomes the entity column of the output, so
/// per-row ids collapse into per-cost-center totals. With no attributes
/// every record lands in a single row with an empty id.
pub fn aggregate_by_attributes(
    records: &RecordSet,
    group_attributes: &[String],
) -> Result<RecordSet, SchemaError> {
    let (entity_column, rest) = match group_attributes.split_first() {
        Some((first, rest)) => (first.clone(), rest),
        None => (records.schema.entity_column.clone(), group_attributes),
    };

    let mut schema = Schema::new(entity_column);
    for attribute in rest {
        schema.add_attribute(attribute.clone());
    }
    schema.amounts = records.schema.amounts.clone();

    let keyed = !group_attributes.is_empty();
    let rows = sum_groups(records, &schema.amounts, |record| {
        let values = values_of(record, group_attributes)?;
        let entity_id = if keyed { values[0].clone() } else { String::new() };
        let mut row = Record::new(entity_id.clone());
        for (attribute, value) in rest.iter().zip(values.iter().skip(1)) {
            row.set_attribute(attribute, value.clone());
        }
        Ok((entity_id, values, row))
    })?;

    Ok(RecordSet::from_records(schema, rows))
}

fn values_of(record: &Record, attributes: &[String]) -> Result<Vec<String>, SchemaError> {
    attributes
        .iter()
        .map(|a| record.attribute(a).map(str::to_string))
        .collect()
}

/// Shared group-and-sum loop. `group` returns the group key and a fresh output row
/// (amounts are filled here) for a record.
fn sum_groups<F>(records: &RecordSet, amounts: &[String], mut group: F) -> Result<Vec<Record>, SchemaError>
where
    F: FnMut(&Record) -> Result<(String, Vec<String>, Record), SchemaError>,
{
    let mut rows: Vec<Record> = Vec::new();
    let mut index: HashMap<(String, Vec<String>), usize> = HashMap::new();

    for record in &records.records {
        let (entity_id, values, mut row) = group(record)?;
        let key = (entity_id, values);

        let slot = match index.get(&key) {
            Some(&slot) => slot,
            None => {
                for amount in amounts {
                    row.amounts.insert(amount.clone(), Decimal::ZERO);
                }
                rows.push(row);
                index.insert(key, rows.len() - 1);
                rows.len() - 1
            }
        };

        for amount in amounts {
            let value = record.amount(amount)?;
            *rows[slot].amounts.entry(amount.clone()).or_default() += value;
        }
    }

    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================
