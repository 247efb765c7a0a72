// ✂️ Normalizer - trim and upper-case key attributes before resolution
// "  cardiología " and "CARDIOLOGÍA" must group as the same value.

use crate::error::SchemaError;
use crate::record::RecordSet;

/// Returns a copy of `records` with the entity id and every listed attribute trimmed and
/// upper-cased.
pub fn normalize(records: &RecordSet, attributes: &[String]) -> Result<RecordSet, SchemaError> {
    let mut normalized = records.clone();

    for record in &mut normalized.records {
        record.entity_id = fold(&record.entity_id);
        for attribute in attributes {
            let value = fold(record.attribute(attribute)?);
            record.set_attribute(attribute, value);
        }
    }

    Ok(normalized)
}

fn fold(value: &str) -> String {
    value.trim().to_uppercase()
}
