// 🧾 Record Model - entity-keyed rows with named attributes and exact amounts
// A RecordSet is an arena of records plus the schema that fixes column order.

use crate::error::SchemaError;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

// ============================================================================
// SCHEMA
// ============================================================================

/// Column layout of a record set: the entity id column, then attributes, then amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub entity_column: String,
    pub attributes: Vec<String>,
    pub amounts: Vec<String>,
}

impl Schema {
    pub fn new(entity_column: impl Into<String>) -> Self {
        Schema {
            entity_column: entity_column.into(),
            attributes: Vec::new(),
            amounts: Vec::new(),
        }
    }

    /// Builder: append an attribute column
    pub fn with_attribute(mut self, name: impl Into<String>) -> Self {
        self.add_attribute(name);
        self
    }

    /// Builder: append an amount column
    pub fn with_amount(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.amounts.contains(&name) {
            self.amounts.push(name);
        }
        self
    }

    /// Append an attribute column unless it is already present
    pub fn add_attribute(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.attributes.contains(&name) {
            self.attributes.push(name);
        }
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a == name)
    }

    pub fn has_amount(&self, name: &str) -> bool {
        self.amounts.iter().any(|a| a == name)
    }

    /// CSV header in column order
    pub fn headers(&self) -> Vec<&str> {
        std::iter::once(self.entity_column.as_str())
            .chain(self.attributes.iter().map(String::as_str))
            .chain(self.amounts.iter().map(String::as_str))
            .collect()
    }
}

// ============================================================================
// RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub entity_id: String,
    pub attributes: BTreeMap<String, String>,
    pub amounts: BTreeMap<String, Decimal>,
}

impl Record {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Record {
            entity_id: entity_id.into(),
            attributes: BTreeMap::new(),
            amounts: BTreeMap::new(),
        }
    }

    /// Builder: set an attribute value
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder: set an amount value
    pub fn with_amount(mut self, name: impl Into<String>, value: Decimal) -> Self {
        self.amounts.insert(name.into(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Result<&str, SchemaError> {
        self.attributes
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| SchemaError::MissingAttribute {
                entity_id: self.entity_id.clone(),
                attribute: name.to_string(),
            })
    }

    pub fn amount(&self, name: &str) -> Result<Decimal, SchemaError> {
        self.amounts
            .get(name)
            .copied()
            .ok_or_else(|| SchemaError::MissingAmount {
                entity_id: self.entity_id.clone(),
                field: name.to_string(),
            })
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    /// Absent or blank
    pub fn is_unset(&self, name: &str) -> bool {
        self.attributes
            .get(name)
            .map_or(true, |value| value.trim().is_empty())
    }

    /// Attribute or amount rendered as text, for operator context and keys
    pub fn field_text(&self, name: &str) -> Option<String> {
        if let Some(value) = self.attributes.get(name) {
            return Some(value.clone());
        }
        self.amounts.get(name).map(Decimal::to_string)
    }
}

// ============================================================================
// RECORD SET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSet {
    pub schema: Schema,
    pub records: Vec<Record>,
}

impl RecordSet {
    pub fn new(schema: Schema) -> Self {
        RecordSet {
            schema,
            records: Vec::new(),
        }
    }

    pub fn from_records(schema: Schema, records: Vec<Record>) -> Self {
        RecordSet { schema, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Positions of each entity's records, keyed by entity id
    pub fn entity_index(&self) -> HashMap<&str, Vec<usize>> {
        let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
        for (position, record) in self.records.iter().enumerate() {
            index.entry(record.entity_id.as_str()).or_default().push(position);
        }
        index
    }

    /// Sum of one amount field per entity
    pub fn totals_by_entity(&self, field: &str) -> Result<BTreeMap<String, Decimal>, SchemaError> {
        let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
        for record in &self.records {
            *totals.entry(record.entity_id.clone()).or_default() += record.amount(field)?;
        }
        Ok(totals)
    }

    /// Append another set with the same attributes. Amount columns are unioned and
    /// records lacking one of them carry zero for it.
    pub fn concat(self, other: RecordSet) -> Result<RecordSet, SchemaError> {
        let mut left_attrs = self.schema.attributes.clone();
        let mut right_attrs = other.schema.attributes.clone();
        left_attrs.sort();
        right_attrs.sort();
        if left_attrs != right_attrs {
            return Err(SchemaError::IncompatibleSchemas {
                left: self.schema.attributes,
                right: other.schema.attributes,
            });
        }

        let mut schema = self.schema;
        for amount in &other.schema.amounts {
            if !schema.has_amount(amount) {
                schema.amounts.push(amount.clone());
            }
        }

        let mut records = self.records;
        records.extend(other.records);
        for record in &mut records {
            for amount in &schema.amounts {
                record.amounts.entry(amount.clone()).or_insert(Decimal::ZERO);
            }
        }

        Ok(RecordSet { schema, records })
    }

    // ========================================================================
    // CSV
    // ========================================================================

    /// Read a CSV whose header contains every column of `schema`. Extra columns are ignored.
    pub fn read_csv(path: &Path, schema: &Schema) -> Result<RecordSet> {
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

        let entity_pos = position(&schema.entity_column)?;
        let attribute_pos = schema
            .attributes
            .iter()
            .map(|a| position(a).map(|p| (a.clone(), p)))
            .collect::<Result<Vec<_>, _>>()?;
        let amount_pos = schema
            .amounts
            .iter()
            .map(|a| position(a).map(|p| (a.clone(), p)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::new();
        for result in rdr.records() {
            let row = result.with_context(|| format!("Failed to read CSV row: {}", source_name))?;
            let line = row.position().map_or(0, |p| p.line());
            let cell = |pos: usize| row.get(pos).unwrap_or("");

            let mut record = Record::new(cell(entity_pos));
            for (name, pos) in &attribute_pos {
                record.attributes.insert(name.clone(), cell(*pos).to_string());
            }
            for (name, pos) in &amount_pos {
                let value = parse_amount(cell(*pos), &source_name, line, name)?;
                record.amounts.insert(name.clone(), value);
            }
            records.push(record);
        }

        debug!(file = %source_name, rows = records.len(), "read record set");
        Ok(RecordSet::from_records(schema.clone(), records))
    }

    /// Serialize as CSV in schema column order
    pub fn write_to<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(self.schema.headers())?;

        for record in &self.records {
            let mut row: Vec<String> = Vec::with_capacity(self.schema.headers().len());
            row.push(record.entity_id.clone());
            for attribute in &self.schema.attributes {
                row.push(record.attributes.get(attribute).cloned().unwrap_or_default());
            }
            for amount in &self.schema.amounts {
                row.push(record.amounts.get(amount).map(Decimal::to_string).unwrap_or_default());
            }
            wtr.write_record(&row)?;
        }

        wtr.flush()?;
        Ok(())
    }

    /// Replace `path` atomically: the file is either the previous version or this one,
    /// never a partial write.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        self.write_to(tmp.as_file_mut())?;
        tmp.as_file()
            .sync_all()
            .context("Failed to sync temporary CSV file")?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        Ok(())
    }

    /// SHA-256 of the CSV rendition; equal fingerprints mean identical record sets
    pub fn fingerprint(&self) -> Result<String> {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer)?;
        let mut hasher = Sha256::new();
        hasher.update(&buffer);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Blank cells count as zero, the way the source spreadsheets treat empty amounts.
pub fn parse_amount(raw: &str, source_name: &str, line: u64, column: &str) -> Result<Decimal, SchemaError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        warn!(file = %source_name, line, column, "blank amount treated as zero");
        return Ok(Decimal::ZERO);
    }

    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| SchemaError::InvalidAmount {
            source_name: source_name.to_string(),
            line,
            column: column.to_string(),
            value: raw.to_string(),
        })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn create_test_schema() -> Schema {
        Schema::new("RUT-DV")
            .with_attribute("unit")
            .with_amount("salary")
    }

    fn create_test_record(entity_id: &str, unit: &str, salary: i64) -> Record {
        Record::new(entity_id)
            .with_attribute("unit", unit)
            .with_amount("salary", Decimal::from(salary))
    }

    #[test]
    fn test_missing_attribute_is_schema_error() {
        let record = Record::new("1-9");

        assert_eq!(
            record.attribute("unit"),
            Err(SchemaError::MissingAttribute {
                entity_id: "1-9".to_string(),
                attribute: "unit".to_string(),
            })
        );
        assert!(record.amount("salary").is_err());
        assert!(record.is_unset("unit"));
    }

    #[test]
    fn test_csv_write_then_read_keeps_exact_amounts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let set = RecordSet::from_records(
            create_test_schema(),
            vec![
                create_test_record("1-9", "CARDIOLOGIA", 100),
                Record::new("2-7")
                    .with_attribute("unit", "UCI")
                    .with_amount("salary", Decimal::new(12345, 2)),
            ],
        );
        set.write_csv(&path).unwrap();

        let loaded = RecordSet::read_csv(&path, &create_test_schema()).unwrap();
        assert_eq!(loaded, set);
        assert_eq!(loaded.records[1].amount("salary").unwrap(), Decimal::new(12345, 2));
        assert_eq!(loaded.fingerprint().unwrap(), set.fingerprint().unwrap());
    }

    #[test]
    fn test_read_csv_reports_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "RUT-DV,salary").unwrap();
        writeln!(file, "1-9,100").unwrap();

        let err = RecordSet::read_csv(&path, &create_test_schema()).unwrap_err();
        match err.downcast_ref::<SchemaError>() {
            Some(SchemaError::MissingColumn { column, .. }) => assert_eq!(column, "unit"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_read_csv_rejects_bad_amount_and_zeroes_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "RUT-DV,unit,salary").unwrap();
        writeln!(file, "1-9,UCI,").unwrap();
        drop(file);

        let loaded = RecordSet::read_csv(&path, &create_test_schema()).unwrap();
        assert_eq!(loaded.records[0].amount("salary").unwrap(), Decimal::ZERO);

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "2-7,UCI,mucho").unwrap();
        drop(file);

        let err = RecordSet::read_csv(&path, &create_test_schema()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_concat_unions_amounts_with_zero_fill() {
        let left = RecordSet::from_records(
            create_test_schema(),
            vec![create_test_record("1-9", "UCI", 100)],
        );
        let right = RecordSet::from_records(
            create_test_schema().with_amount("hours"),
            vec![create_test_record("2-7", "UCI", 50).with_amount("hours", Decimal::from(44))],
        );

        let combined = left.concat(right).unwrap();

        assert_eq!(combined.len(), 2);
        assert_eq!(combined.schema.amounts, vec!["salary", "hours"]);
        assert_eq!(combined.records[0].amount("hours").unwrap(), Decimal::ZERO);
        assert_eq!(combined.records[1].amount("hours").unwrap(), Decimal::from(44));
    }

    #[test]
    fn test_concat_rejects_different_attributes() {
        let left = RecordSet::new(create_test_schema());
        let right = RecordSet::new(create_test_schema().with_attribute("role"));

        assert!(matches!(
            left.concat(right),
            Err(SchemaError::IncompatibleSchemas { .. })
        ));
    }

    #[test]
    fn test_totals_by_entity() {
        let set = RecordSet::from_records(
            create_test_schema(),
            vec![
                create_test_record("1-9", "UCI", 100),
                create_test_record("2-7", "UCI", 30),
                create_test_record("1-9", "CARDIO", 50),
            ],
        );

        let totals = set.totals_by_entity("salary").unwrap();
        assert_eq!(totals["1-9"], Decimal::from(150));
        assert_eq!(totals["2-7"], Decimal::from(30));
        assert_eq!(set.entity_index()["1-9"], vec![0, 2]);
    }
}
