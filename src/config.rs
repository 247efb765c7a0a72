// ⚙️ Pipeline Config - which files, which columns, which passes
// One TOML file drives both workflows. Relative paths resolve against the file's directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub payroll: Option<PayrollConfig>,
    #[serde(default)]
    pub enrichment: Vec<EnrichmentConfig>,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&content, base)
            .with_context(|| format!("Invalid config: {}", path.display()))
    }

    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self> {
        let mut config: PipelineConfig =
            toml::from_str(content).context("Failed to parse pipeline TOML")?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn payroll(&self) -> Result<&PayrollConfig> {
        match &self.payroll {
            Some(payroll) => Ok(payroll),
            None => bail!("config has no [payroll] section"),
        }
    }

    pub fn enrichment(&self, name: &str) -> Result<&EnrichmentConfig> {
        match self.enrichment.iter().find(|e| e.name == name) {
            Some(enrichment) => Ok(enrichment),
            None => {
                let known: Vec<&str> = self.enrichment.iter().map(|e| e.name.as_str()).collect();
                bail!("no enrichment named '{}' (configured: {})", name, known.join(", "))
            }
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        if let Some(payroll) = &mut self.payroll {
            payroll.statutory.source.resolve_paths(base);
            payroll.fee_based.source.resolve_paths(base);
            for step in &mut payroll.translate {
                step.table = resolve(base, &step.table);
            }
            payroll.output = resolve(base, &payroll.output);
        }

        for enrichment in &mut self.enrichment {
            enrichment.input.resolve_paths(base);
            if let CodeSource::Table { table, .. } = &mut enrichment.codes {
                *table = resolve(base, table);
            }
            if let Some(step) = &mut enrichment.prefill {
                step.table = resolve(base, &step.table);
            }
            for step in &mut enrichment.translate {
                step.table = resolve(base, &step.table);
            }
            enrichment.checkpoint = resolve(base, &enrichment.checkpoint);
            enrichment.ledger = resolve(base, &enrichment.ledger);
            enrichment.output = resolve(base, &enrichment.output);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(payroll) = &self.payroll {
            payroll.validate().context("[payroll]")?;
        }

        let mut names = HashSet::new();
        for enrichment in &self.enrichment {
            if !names.insert(enrichment.name.as_str()) {
                bail!("duplicate enrichment name '{}'", enrichment.name);
            }
            enrichment
                .validate()
                .with_context(|| format!("[[enrichment]] '{}'", enrichment.name))?;
        }

        Ok(())
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

// ---------------------------------------------------------------------------
// Source extracts
// ---------------------------------------------------------------------------

/// Entity id taken from one column, or built from several (e.g. RUT + DV)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EntityIdSpec {
    Column(String),
    Composite {
        columns: Vec<String>,
        #[serde(default = "default_id_separator")]
        separator: String,
    },
}

impl EntityIdSpec {
    /// Name of the entity id column in loaded and written record sets
    pub fn column_name(&self) -> String {
        match self {
            EntityIdSpec::Column(column) => column.clone(),
            EntityIdSpec::Composite { columns, separator } => columns.join(separator),
        }
    }

    pub fn source_columns(&self) -> Vec<&str> {
        match self {
            EntityIdSpec::Column(column) => vec![column.as_str()],
            EntityIdSpec::Composite { columns, .. } => columns.iter().map(String::as_str).collect(),
        }
    }
}

fn default_id_separator() -> String {
    "-".to_string()
}

/// Canonical field name and the source header it is read from (same name if omitted)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ColumnMap {
    pub name: String,
    #[serde(default)]
    pub column: Option<String>,
}

impl ColumnMap {
    pub fn source_column(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub files: Vec<PathBuf>,
    pub entity_id: EntityIdSpec,
    #[serde(default)]
    pub attributes: Vec<ColumnMap>,
    #[serde(default)]
    pub amounts: Vec<ColumnMap>,
    /// Attributes with a fixed value for every row of this source
    #[serde(default)]
    pub constants: BTreeMap<String, String>,
    /// Attributes trimmed and upper-cased after loading (the entity id always is)
    #[serde(default)]
    pub normalize: Vec<String>,
    /// Keep only rows where this amount is strictly positive
    #[serde(default)]
    pub positive_amount: Option<String>,
}

impl SourceConfig {
    fn resolve_paths(&mut self, base: &Path) {
        for file in &mut self.files {
            *file = resolve(base, file);
        }
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes
            .iter()
            .map(|a| a.name.clone())
            .chain(self.constants.keys().cloned())
            .collect()
    }

    pub fn amount_names(&self) -> Vec<String> {
        self.amounts.iter().map(|a| a.name.clone()).collect()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name) || self.constants.contains_key(name)
    }

    pub fn has_amount(&self, name: &str) -> bool {
        self.amounts.iter().any(|a| a.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            bail!("source '{}' lists no files", self.name);
        }
        if self.entity_id.source_columns().is_empty() {
            bail!("source '{}' has an empty entity id", self.name);
        }

        let mut seen = HashSet::new();
        for name in self.attribute_names().iter().chain(self.amount_names().iter()) {
            if !seen.insert(name.clone()) {
                bail!("source '{}' maps '{}' twice", self.name, name);
            }
        }

        for name in &self.normalize {
            if !self.has_attribute(name) {
                bail!("source '{}' normalizes unknown attribute '{}'", self.name, name);
            }
        }
        if let Some(amount) = &self.positive_amount {
            if !self.has_amount(amount) {
                bail!("source '{}' filters on unknown amount '{}'", self.name, amount);
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TranslationStep {
    pub source: String,
    pub target: String,
    /// JSON object file: source value → target value
    pub table: PathBuf,
}

// ---------------------------------------------------------------------------
// Payroll
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PopulationConfig {
    /// Value of the marker attribute for this population's rows
    pub marker: String,
    #[serde(flatten)]
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayrollConfig {
    /// Amount whose per-value sum decides the canonical value
    pub rank_amount: String,
    /// Attributes resolved in both rounds, in order
    pub resolve: Vec<String>,
    #[serde(default = "default_marker_attribute")]
    pub marker_attribute: String,
    /// Marker forced on entities present in both populations (statutory marker if unset)
    #[serde(default)]
    pub marker_override: Option<String>,
    pub statutory: PopulationConfig,
    pub fee_based: PopulationConfig,
    #[serde(default)]
    pub translate: Vec<TranslationStep>,
    pub output: PathBuf,
}

fn default_marker_attribute() -> String {
    "contract_type".to_string()
}

impl PayrollConfig {
    pub fn effective_marker_override(&self) -> &str {
        self.marker_override
            .as_deref()
            .unwrap_or(&self.statutory.marker)
    }

    fn validate(&self) -> Result<()> {
        if self.resolve.is_empty() {
            bail!("'resolve' lists no attributes");
        }
        if self.resolve.contains(&self.marker_attribute) {
            bail!(
                "marker attribute '{}' is resolved separately; remove it from 'resolve'",
                self.marker_attribute
            );
        }
        if self.statutory.marker == self.fee_based.marker {
            bail!("both populations use marker '{}'", self.statutory.marker);
        }

        for population in [&self.statutory, &self.fee_based] {
            let source = &population.source;
            source.validate()?;
            if !source.has_amount(&self.rank_amount) {
                bail!(
                    "source '{}' has no amount '{}' to rank by",
                    source.name,
                    self.rank_amount
                );
            }
            for attribute in &self.resolve {
                if !source.has_attribute(attribute) {
                    bail!("source '{}' has no attribute '{}'", source.name, attribute);
                }
            }
            if source.has_attribute(&self.marker_attribute) {
                bail!(
                    "source '{}' already has the marker attribute '{}'",
                    source.name,
                    self.marker_attribute
                );
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Allowed answers: an inline list, or the keys/values of a lookup table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CodeSource {
    List(Vec<String>),
    Table {
        table: PathBuf,
        #[serde(default)]
        side: TableSide,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSide {
    Keys,
    #[default]
    Values,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    /// Also the ledger namespace
    pub name: String,
    pub input: SourceConfig,
    /// Attribute the operator fills
    pub target: String,
    /// Columns forming the natural key
    pub key: Vec<String>,
    #[serde(default = "default_key_separator")]
    pub key_separator: String,
    pub codes: CodeSource,
    /// Lookup applied first; only its misses reach the operator
    #[serde(default)]
    pub prefill: Option<TranslationStep>,
    #[serde(default)]
    pub context: Vec<String>,
    /// Column whose distinct values are shown as extra detail
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub translate: Vec<TranslationStep>,
    /// Output totals per these attributes (first one keys the rows); empty keeps one row per input row
    #[serde(default)]
    pub aggregate_by: Vec<String>,
    pub checkpoint: PathBuf,
    pub ledger: PathBuf,
    pub output: PathBuf,
}

fn default_key_separator() -> String {
    " | ".to_string()
}

impl EnrichmentConfig {
    fn validate(&self) -> Result<()> {
        self.input.validate()?;

        if self.key.is_empty() {
            bail!("'key' lists no columns");
        }
        if self.key.contains(&self.target) {
            bail!("target '{}' cannot be part of its own key", self.target);
        }
        for column in &self.key {
            if !self.input.has_attribute(column) && !self.input.has_amount(column) {
                bail!("key column '{}' is not loaded from the input", column);
            }
        }
        if let CodeSource::List(codes) = &self.codes {
            if codes.iter().all(|c| c.trim().is_empty()) {
                bail!("'codes' is empty");
            }
        }
        if let Some(step) = &self.prefill {
            if step.target != self.target {
                bail!(
                    "prefill writes '{}' but the enrichment target is '{}'",
                    step.target,
                    self.target
                );
            }
        }
        if self.checkpoint == self.output {
            bail!("checkpoint and output must be different files");
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[payroll]
rank_amount = "salary"
resolve = ["name", "role", "unit", "law_code"]
output = "out/payroll.csv"

[payroll.statutory]
name = "leyes"
marker = "1"
files = ["in/leyes.csv"]
entity_id = { columns = ["RUT", "DV"] }
attributes = [
    { name = "name", column = "NOMBRE" },
    { name = "role", column = "CARGO" },
    { name = "unit", column = "UNIDAD" },
    { name = "law_code", column = "LEY" },
]
amounts = [{ name = "salary", column = "TOTAL HABER" }]
normalize = ["unit"]

[payroll.fee_based]
name = "honorarios"
marker = "2"
files = ["in/honorarios.csv"]
entity_id = "RUT-DV"
attributes = [
    { name = "name", column = "NOMBRE" },
    { name = "role", column = "CARGO" },
    { name = "unit", column = "UNIDAD" },
]
amounts = [{ name = "salary", column = "BRUTO" }]
constants = { law_code = "" }

[[enrichment]]
name = "supplies"
target = "destination"
key = ["item"]
codes = { table = "tables/destinations.json", side = "keys" }
checkpoint = "state/supplies.csv"
ledger = "state/ledger.db"
output = "out/supplies.csv"

[enrichment.input]
name = "cartola"
files = ["in/cartola.csv"]
entity_id = "ID"
attributes = [{ name = "item", column = "ARTICULO" }]
amounts = [{ name = "total", column = "TOTAL" }]
positive_amount = "total"
"#;

    #[test]
    fn test_parse_sample_and_resolve_paths() {
        let config = PipelineConfig::from_toml_str(SAMPLE, Path::new("/data/run")).unwrap();

        let payroll = config.payroll().unwrap();
        assert_eq!(payroll.marker_attribute, "contract_type");
        assert_eq!(payroll.effective_marker_override(), "1");
        assert_eq!(payroll.output, PathBuf::from("/data/run/out/payroll.csv"));
        assert_eq!(payroll.statutory.source.entity_id.column_name(), "RUT-DV");
        assert_eq!(
            payroll.fee_based.source.entity_id,
            EntityIdSpec::Column("RUT-DV".to_string())
        );
        assert_eq!(
            payroll.fee_based.source.attribute_names(),
            vec!["name", "role", "unit", "law_code"]
        );

        let supplies = config.enrichment("supplies").unwrap();
        assert_eq!(
            supplies.codes,
            CodeSource::Table {
                table: PathBuf::from("/data/run/tables/destinations.json"),
                side: TableSide::Keys,
            }
        );
        assert_eq!(supplies.key_separator, " | ");
        assert_eq!(supplies.input.files[0], PathBuf::from("/data/run/in/cartola.csv"));
        assert!(config.enrichment("expenses").is_err());
    }

    #[test]
    fn test_rejects_unranked_population() {
        let broken = SAMPLE.replace(r#"amounts = [{ name = "salary", column = "BRUTO" }]"#, r#"amounts = [{ name = "fee", column = "BRUTO" }]"#);

        let err = PipelineConfig::from_toml_str(&broken, Path::new(".")).unwrap_err();

        assert!(format!("{:#}", err).contains("no amount 'salary' to rank by"));
    }

    #[test]
    fn test_rejects_missing_resolve_attribute() {
        let broken = SAMPLE.replace(r#"constants = { law_code = "" }"#, "");

        let err = PipelineConfig::from_toml_str(&broken, Path::new(".")).unwrap_err();

        assert!(format!("{:#}", err).contains("has no attribute 'law_code'"));
    }

    #[test]
    fn test_rejects_key_containing_target() {
        let broken = SAMPLE.replace(r#"key = ["item"]"#, r#"key = ["item", "destination"]"#);

        let err = PipelineConfig::from_toml_str(&broken, Path::new(".")).unwrap_err();

        assert!(format!("{:#}", err).contains("cannot be part of its own key"));
    }

    #[test]
    fn test_enrichment_only_config() {
        let config = PipelineConfig::from_toml_str(
            r#"
[[enrichment]]
name = "expenses"
target = "account"
key = ["provider", "concept"]
codes = ["410", "420"]
checkpoint = "expenses.checkpoint.csv"
ledger = "ledger.db"
output = "expenses.csv"

[enrichment.input]
name = "facturas"
files = ["facturas.csv"]
entity_id = "FOLIO"
attributes = [{ name = "provider" }, { name = "concept" }]
"#,
            Path::new("."),
        )
        .unwrap();

        assert!(config.payroll.is_none());
        assert!(config.payroll().is_err());
        let expenses = config.enrichment("expenses").unwrap();
        assert_eq!(expenses.codes, CodeSource::List(vec!["410".into(), "420".into()]));
        assert_eq!(expenses.input.attributes[0].source_column(), "provider");
    }
}
