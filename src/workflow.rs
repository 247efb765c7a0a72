// 🔄 Workflows - the passes wired together
//
// Payroll:         resolve per population → aggregate → tag marker → concat →
//                  resolve jointly (marker override) → aggregate → conservation check → translate
// Classification:  partial translate → enrich (operator) → strict translate → aggregate

use crate::aggregate::{aggregate, aggregate_by_attributes};
use crate::config::{CodeSource, EnrichmentConfig, PayrollConfig, PopulationConfig, TableSide};
use crate::conservation::{ConservationCheck, ConservationReport};
use crate::enrichment::{
    CodeSet, ColumnDetail, ColumnKey, EnrichmentCache, EnrichmentStore, EnrichmentSummary,
    Prompter, ReopenOutcome,
};
use crate::loader::load_source;
use crate::record::{RecordSet, Schema};
use crate::resolver::{AttributeRule, RedundancyResolver, ResolutionReport};
use crate::translate::{translate_all, LookupTable, Translation};
use anyhow::{bail, Result};
use tracing::{info, warn};

// ============================================================================
// PAYROLL
// ============================================================================

/// One payroll population and the marker its rows carry after round 1
#[derive(Debug, Clone)]
pub struct Population {
    pub records: RecordSet,
    pub marker: String,
}

impl Population {
    pub fn new(records: RecordSet, marker: impl Into<String>) -> Self {
        Population {
            records,
            marker: marker.into(),
        }
    }

    pub fn load(config: &PopulationConfig) -> Result<Self> {
        Ok(Population::new(load_source(&config.source)?, config.marker.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct PayrollOutcome {
    /// One row per entity
    pub records: RecordSet,
    pub round_one: Vec<ResolutionReport>,
    pub round_two: Vec<ResolutionReport>,
    pub conservation: ConservationReport,
}

pub struct PayrollWorkflow {
    resolver: RedundancyResolver,
    attributes: Vec<String>,
    marker_attribute: String,
    marker_override: Option<String>,
    translations: Vec<Translation>,
}

impl PayrollWorkflow {
    pub fn new(rank_amount: impl Into<String>, attributes: Vec<String>) -> Self {
        PayrollWorkflow {
            resolver: RedundancyResolver::new(rank_amount),
            attributes,
            marker_attribute: "contract_type".to_string(),
            marker_override: None,
            translations: Vec::new(),
        }
    }

    pub fn with_marker_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.marker_attribute = attribute.into();
        self
    }

    /// Marker forced on entities found in both populations. Defaults to the statutory marker.
    pub fn with_marker_override(mut self, marker: impl Into<String>) -> Self {
        self.marker_override = Some(marker.into());
        self
    }

    pub fn with_translations(mut self, translations: Vec<Translation>) -> Self {
        self.translations = translations;
        self
    }

    pub fn from_config(config: &PayrollConfig) -> Result<Self> {
        let translations = config
            .translate
            .iter()
            .map(Translation::load)
            .collect::<Result<Vec<_>>>()?;

        Ok(PayrollWorkflow::new(config.rank_amount.clone(), config.resolve.clone())
            .with_marker_attribute(config.marker_attribute.clone())
            .with_marker_override(config.effective_marker_override())
            .with_translations(translations))
    }

    pub fn run(&self, statutory: Population, fee_based: Population) -> Result<PayrollOutcome> {
        // Per-entity totals before any pass, for the conservation check
        let before = aggregate(&statutory.records, &[])?.concat(aggregate(&fee_based.records, &[])?)?;

        // Round 1: attribute-major, each population on its own
        let mut round_one = Vec::new();
        let mut statutory_records = statutory.records;
        let mut fee_based_records = fee_based.records;
        for attribute in &self.attributes {
            let (next, report) = self.resolver.resolve(&statutory_records, attribute, None)?;
            statutory_records = next;
            round_one.push(report);

            let (next, report) = self.resolver.resolve(&fee_based_records, attribute, None)?;
            fee_based_records = next;
            round_one.push(report);
        }

        let statutory_records = self.tag(aggregate(&statutory_records, &self.attributes)?, &statutory.marker);
        let fee_based_records = self.tag(aggregate(&fee_based_records, &self.attributes)?, &fee_based.marker);
        let combined = statutory_records.concat(fee_based_records)?;

        // Round 2: jointly, the marker last and overridden
        let marker_override = self
            .marker_override
            .clone()
            .unwrap_or_else(|| statutory.marker.clone());
        let mut plan: Vec<AttributeRule> = self.attributes.iter().map(AttributeRule::ranked).collect();
        plan.push(AttributeRule::with_override(&self.marker_attribute, marker_override));
        let (current, round_two) = self.resolver.resolve_all(&combined, &plan)?;

        let mut group_by = self.attributes.clone();
        group_by.push(self.marker_attribute.clone());
        let consolidated = aggregate(&current, &group_by)?;

        let conservation = ConservationCheck::for_schema(&before).verify(&before, &consolidated)?;
        if !conservation.is_conserved() {
            bail!("{}", conservation.summary());
        }
        info!("{}", conservation.summary());

        if let Some((entity_id, rows)) = consolidated
            .entity_index()
            .into_iter()
            .find(|(_, rows)| rows.len() > 1)
        {
            bail!("entity {} still has {} rows after consolidation", entity_id, rows.len());
        }

        let records = translate_all(&consolidated, &self.translations)?;
        info!(rows = records.len(), "payroll consolidated");

        Ok(PayrollOutcome {
            records,
            round_one,
            round_two,
            conservation,
        })
    }

    fn tag(&self, mut records: RecordSet, marker: &str) -> RecordSet {
        records.schema.add_attribute(self.marker_attribute.clone());
        for record in &mut records.records {
            record.set_attribute(&self.marker_attribute, marker);
        }
        records
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClassificationOutcome {
    pub records: RecordSet,
    pub summary: EnrichmentSummary,
    /// Distinct values the prefill table did not know
    pub prefill_misses: Vec<String>,
}

pub struct ClassificationWorkflow<S> {
    cache: EnrichmentCache<S>,
    key: ColumnKey,
    codes: CodeSet,
    prefill: Option<Translation>,
    translations: Vec<Translation>,
    aggregate_by: Vec<String>,
}

impl<S: EnrichmentStore> ClassificationWorkflow<S> {
    pub fn new(cache: EnrichmentCache<S>, key: ColumnKey, codes: CodeSet) -> Self {
        ClassificationWorkflow {
            cache,
            key,
            codes,
            prefill: None,
            translations: Vec::new(),
            aggregate_by: Vec::new(),
        }
    }

    pub fn with_prefill(mut self, prefill: Translation) -> Self {
        self.prefill = Some(prefill);
        self
    }

    pub fn with_translations(mut self, translations: Vec<Translation>) -> Self {
        self.translations = translations;
        self
    }

    /// Totals per listed attributes; row ids are dropped and the first attribute keys the output
    pub fn with_aggregation(mut self, attributes: Vec<String>) -> Self {
        self.aggregate_by = attributes;
        self
    }

    pub fn from_config(config: &EnrichmentConfig, store: S) -> Result<Self> {
        let codes = match &config.codes {
            CodeSource::List(codes) => CodeSet::new(codes.iter().cloned()),
            CodeSource::Table { table, side } => {
                let table = LookupTable::from_file(table)?;
                match side {
                    TableSide::Keys => CodeSet::new(table.keys()),
                    TableSide::Values => CodeSet::new(table.values()),
                }
            }
        };
        if codes.is_empty() {
            bail!("enrichment '{}' has no allowed codes", config.name);
        }

        let mut cache = EnrichmentCache::new(store, config.target.clone())
            .with_context_columns(config.context.clone());
        if let Some(column) = &config.detail {
            cache = cache.with_detail(Box::new(ColumnDetail::new(column.clone())));
        }

        let key = ColumnKey::new(config.key.iter().cloned()).with_separator(config.key_separator.clone());
        let translations = config
            .translate
            .iter()
            .map(Translation::load)
            .collect::<Result<Vec<_>>>()?;

        let mut workflow = ClassificationWorkflow::new(cache, key, codes)
            .with_translations(translations)
            .with_aggregation(config.aggregate_by.clone());
        if let Some(step) = &config.prefill {
            workflow = workflow.with_prefill(Translation::load(step)?);
        }

        Ok(workflow)
    }

    pub fn run<P: Prompter + ?Sized>(
        &mut self,
        records: &RecordSet,
        prompter: &mut P,
    ) -> Result<ClassificationOutcome> {
        let (prefilled, prefill_misses) = match &self.prefill {
            Some(prefill) => prefill.apply_partial(records)?,
            None => (records.clone(), Vec::new()),
        };
        if !prefill_misses.is_empty() {
            warn!(
                misses = prefill_misses.len(),
                target_attribute = %self.cache.target(),
                "values missing from the prefill table go to the operator"
            );
        }

        let (enriched, summary) = self
            .cache
            .enrich(&prefilled, &self.key, &self.codes, prompter)?;

        let translated = translate_all(&enriched, &self.translations)?;
        let records = if self.aggregate_by.is_empty() {
            translated
        } else {
            aggregate_by_attributes(&translated, &self.aggregate_by)?
        };

        Ok(ClassificationOutcome {
            records,
            summary,
            prefill_misses,
        })
    }

    /// Reopen a key against the checkpoint written for `input_schema`
    pub fn reopen(&mut self, input_schema: &Schema, natural_key: &str) -> Result<ReopenOutcome> {
        self.cache.reopen(input_schema, &self.key, natural_key)
    }

    pub fn store(&self) -> &S {
        self.cache.store()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::{FileStore, MemoryStore, ScriptedPrompter};
    use crate::error::{MappingError, TranslateError};
    use crate::record::Record;
    use rust_decimal::Decimal;

    const ATTRIBUTES: [&str; 2] = ["name", "unit"];

    fn attributes() -> Vec<String> {
        ATTRIBUTES.iter().map(|a| a.to_string()).collect()
    }

    fn create_test_record(entity_id: &str, name: &str, unit: &str, salary: i64) -> Record {
        Record::new(entity_id)
            .with_attribute("name", name)
            .with_attribute("unit", unit)
            .with_amount("salary", Decimal::from(salary))
    }

    fn create_test_population(records: Vec<Record>, marker: &str) -> Population {
        let schema = Schema::new("RUT-DV")
            .with_attribute("name")
            .with_attribute("unit")
            .with_amount("salary");
        Population::new(RecordSet::from_records(schema, records), marker)
    }

    #[test]
    fn test_end_to_end_statutory_and_fee_based() {
        let statutory = create_test_population(
            vec![create_test_record("12345678-9", "ANA PEREZ", "CARDIOLOGIA", 100)],
            "1",
        );
        let fee_based = create_test_population(
            vec![create_test_record("12345678-9", "ANA PEREZ", "CARDIO", 50)],
            "2",
        );

        let outcome = PayrollWorkflow::new("salary", attributes())
            .run(statutory, fee_based)
            .unwrap();

        assert_eq!(outcome.records.len(), 1);
        let row = &outcome.records.records[0];
        assert_eq!(row.attribute("unit").unwrap(), "CARDIOLOGIA");
        assert_eq!(row.attribute("contract_type").unwrap(), "1");
        assert_eq!(row.amount("salary").unwrap(), Decimal::from(150));
        assert!(outcome.conservation.is_conserved());

        println!("✅ {}", outcome.conservation.summary());
    }

    #[test]
    fn test_marker_override_beats_larger_amount() {
        let statutory = create_test_population(vec![create_test_record("1-9", "ANA", "UCI", 100)], "1");
        let fee_based = create_test_population(vec![create_test_record("1-9", "ANA", "UCI", 500)], "2");

        let outcome = PayrollWorkflow::new("salary", attributes())
            .run(statutory, fee_based)
            .unwrap();

        let row = &outcome.records.records[0];
        assert_eq!(row.attribute("contract_type").unwrap(), "1");
        assert_eq!(row.amount("salary").unwrap(), Decimal::from(600));

        assert_eq!(outcome.round_two.len(), ATTRIBUTES.len() + 1);
        let marker_pass = outcome.round_two.last().unwrap();
        assert_eq!(marker_pass.attribute, "contract_type");
        assert!(marker_pass.duplicated[0].overridden);
    }

    #[test]
    fn test_round_one_collapses_within_population() {
        let statutory = create_test_population(
            vec![
                create_test_record("1-9", "ANA", "UCI", 30),
                create_test_record("1-9", "ANA", "PABELLON", 70),
                create_test_record("2-7", "LUIS", "UCI", 10),
            ],
            "1",
        );
        let fee_based = create_test_population(vec![create_test_record("3-5", "EVA", "UCI", 5)], "2");

        let outcome = PayrollWorkflow::new("salary", attributes())
            .run(statutory, fee_based)
            .unwrap();

        assert_eq!(outcome.round_one.len(), 4);
        assert_eq!(outcome.records.len(), 3);
        let first = &outcome.records.records[0];
        assert_eq!(first.attribute("unit").unwrap(), "PABELLON");
        assert_eq!(first.amount("salary").unwrap(), Decimal::from(100));
        let fee_row = &outcome.records.records[2];
        assert_eq!(fee_row.attribute("contract_type").unwrap(), "2");
    }

    #[test]
    fn test_fee_based_only_amount_is_zero_filled() {
        let statutory = create_test_population(vec![create_test_record("1-9", "ANA", "UCI", 100)], "1");
        let mut fee_based = create_test_population(
            vec![create_test_record("1-9", "ANA", "UCI", 50).with_amount("fee", Decimal::from(7))],
            "2",
        );
        fee_based.records.schema = fee_based.records.schema.clone().with_amount("fee");

        let outcome = PayrollWorkflow::new("salary", attributes())
            .run(statutory, fee_based)
            .unwrap();

        let row = &outcome.records.records[0];
        assert_eq!(row.amount("fee").unwrap(), Decimal::from(7));
        assert_eq!(row.amount("salary").unwrap(), Decimal::from(150));
    }

    #[test]
    fn test_payroll_translation_miss_fails() {
        let statutory = create_test_population(vec![create_test_record("1-9", "ANA", "UCI", 100)], "1");
        let fee_based = create_test_population(vec![], "2");
        let workflow = PayrollWorkflow::new("salary", attributes()).with_translations(vec![
            Translation::new("unit", "cost_center", LookupTable::from_pairs(vec![("CARDIOLOGIA", "15105")])),
        ]);

        let err = workflow.run(statutory, fee_based).unwrap_err();

        assert_eq!(
            err.downcast_ref::<TranslateError>(),
            Some(&TranslateError::Mapping(MappingError {
                attribute: "unit".to_string(),
                value: "UCI".to_string(),
            }))
        );
    }

    #[test]
    fn test_demo_pipeline_payroll() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/pipeline.toml");
        let config = crate::config::PipelineConfig::from_file(&path).unwrap();
        let payroll = config.payroll().unwrap();

        let outcome = PayrollWorkflow::from_config(payroll)
            .unwrap()
            .run(
                Population::load(&payroll.statutory).unwrap(),
                Population::load(&payroll.fee_based).unwrap(),
            )
            .unwrap();

        assert_eq!(outcome.records.len(), 3);
        let ana = outcome
            .records
            .iter()
            .find(|r| r.entity_id == "12345678-9")
            .unwrap();
        assert_eq!(ana.attribute("unit").unwrap(), "CARDIOLOGIA");
        assert_eq!(ana.attribute("law_code").unwrap(), "18834");
        assert_eq!(ana.attribute("contract_type").unwrap(), "1");
        assert_eq!(ana.attribute("cost_center").unwrap(), "15105");
        assert_eq!(ana.amount("salary").unwrap(), Decimal::from(150));
        assert_eq!(ana.amount("hours").unwrap(), Decimal::from(44));

        println!("✅ Demo payroll: {} rows", outcome.records.len());
    }

    fn create_supplies() -> RecordSet {
        let schema = Schema::new("ID").with_attribute("item").with_amount("total");
        RecordSet::from_records(
            schema,
            vec![
                Record::new("1").with_attribute("item", "GASA").with_amount("total", Decimal::from(10)),
                Record::new("2").with_attribute("item", "ALCOHOL").with_amount("total", Decimal::from(5)),
                Record::new("3").with_attribute("item", "JERINGA").with_amount("total", Decimal::from(3)),
                Record::new("4").with_attribute("item", "GASA").with_amount("total", Decimal::from(2)),
            ],
        )
    }

    fn create_classification<S: EnrichmentStore>(store: S) -> ClassificationWorkflow<S> {
        ClassificationWorkflow::new(
            EnrichmentCache::new(store, "destination"),
            ColumnKey::new(vec!["item"]),
            CodeSet::new(vec!["PABELLON", "UCI"]),
        )
        .with_prefill(Translation::new(
            "item",
            "destination",
            LookupTable::from_pairs(vec![("ALCOHOL", "UCI")]),
        ))
        .with_translations(vec![Translation::new(
            "destination",
            "cost_center",
            LookupTable::from_pairs(vec![("PABELLON", "15220"), ("UCI", "166")]),
        )])
    }

    #[test]
    fn test_classification_asks_only_prefill_misses() {
        let mut workflow = create_classification(MemoryStore::new());
        let mut prompter = ScriptedPrompter::new(vec!["PABELLON", "UCI"]);

        let outcome = workflow.run(&create_supplies(), &mut prompter).unwrap();

        assert_eq!(outcome.prefill_misses, vec!["GASA", "JERINGA"]);
        assert_eq!(prompter.presented, vec!["GASA", "JERINGA"]);
        assert_eq!(outcome.records.records[3].attribute("cost_center").unwrap(), "15220");
        assert_eq!(outcome.records.records[1].attribute("cost_center").unwrap(), "166");
    }

    #[test]
    fn test_classification_aggregates_by_cost_center() {
        let mut workflow =
            create_classification(MemoryStore::new()).with_aggregation(vec!["cost_center".to_string()]);
        let mut prompter = ScriptedPrompter::new(vec!["PABELLON", "PABELLON"]);

        let outcome = workflow.run(&create_supplies(), &mut prompter).unwrap();

        let totals = &outcome.records;
        assert_eq!(totals.schema.entity_column, "cost_center");
        assert_eq!(totals.len(), 2);
        assert_eq!(totals.records[0].entity_id, "15220");
        assert_eq!(totals.records[0].amount("total").unwrap(), Decimal::from(15));
        assert_eq!(totals.records[1].entity_id, "166");
        assert_eq!(totals.records[1].amount("total").unwrap(), Decimal::from(5));

        println!("✅ {} cost centers", totals.len());
    }

    #[test]
    fn test_classification_resumes_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("supplies.checkpoint.csv");
        let ledger = dir.path().join("ledger.db");

        let first = {
            let store = FileStore::open(&checkpoint, &ledger, "supplies").unwrap();
            let mut workflow = create_classification(store);
            let mut prompter = ScriptedPrompter::new(vec!["PABELLON", "UCI"]);
            workflow.run(&create_supplies(), &mut prompter).unwrap().records
        };

        let store = FileStore::open(&checkpoint, &ledger, "supplies").unwrap();
        let mut workflow = create_classification(store);
        let mut prompter = ScriptedPrompter::new(Vec::<String>::new());
        let second = workflow.run(&create_supplies(), &mut prompter).unwrap();

        assert_eq!(prompter.asked, 0);
        assert!(second.summary.resumed);
        assert_eq!(second.records.fingerprint().unwrap(), first.fingerprint().unwrap());

        let outcome = workflow.reopen(&create_supplies().schema, "GASA").unwrap();
        assert_eq!(outcome.rows_cleared, 2);
        assert_eq!(outcome.previous_code.as_deref(), Some("PABELLON"));
    }
}
