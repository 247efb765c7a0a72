// 🧑‍⚖️ Enrichment Cache - ask the operator once per key, remember forever
//
// Flow per run:
//   checkpoint (if any) replaces the input → persisted answers fill what they can →
//   each remaining key is asked once → answer applied to every row sharing the key →
//   ledger row committed → checkpoint replaced atomically → next key.

pub mod detail;
pub mod prompt;
pub mod store;

pub use detail::{ColumnDetail, DetailSource, NoDetail};
pub use prompt::{ConsolePrompter, KeyContext, Prompter, ScriptedPrompter};
pub use store::{EnrichmentStore, FileStore, MemoryStore};

use crate::error::SchemaError;
use crate::record::{Record, RecordSet, Schema};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

// ============================================================================
// KEY EXTRACTION
// ============================================================================

/// Derives the natural key an operator answer is remembered under
pub trait KeyExtractor {
    fn key(&self, record: &Record) -> Result<String, SchemaError>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&Record) -> Result<String, SchemaError>,
{
    fn key(&self, record: &Record) -> Result<String, SchemaError> {
        self(record)
    }
}

/// Trimmed values of one or more columns, joined by a separator
#[derive(Debug, Clone)]
pub struct ColumnKey {
    pub columns: Vec<String>,
    pub separator: String,
}

impl ColumnKey {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ColumnKey {
            columns: columns.into_iter().map(Into::into).collect(),
            separator: " | ".to_string(),
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

impl KeyExtractor for ColumnKey {
    fn key(&self, record: &Record) -> Result<String, SchemaError> {
        let parts = self
            .columns
            .iter()
            .map(|column| {
                record
                    .field_text(column)
                    .map(|value| value.trim().to_string())
                    .ok_or_else(|| SchemaError::MissingAttribute {
                        entity_id: record.entity_id.clone(),
                        attribute: column.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join(&self.separator))
    }
}

// ============================================================================
// CODE VALIDATION
// ============================================================================

pub trait CodeValidator {
    fn accepts(&self, code: &str) -> bool;

    /// Shown to the operator when an answer is rejected
    fn describe(&self) -> String {
        "not an allowed code".to_string()
    }
}

/// A closed set of allowed codes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeSet {
    codes: BTreeSet<String>,
}

impl CodeSet {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CodeSet {
            codes: codes
                .into_iter()
                .map(|code| code.into().trim().to_string())
                .filter(|code| !code.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl CodeValidator for CodeSet {
    fn accepts(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    fn describe(&self) -> String {
        const SHOWN: usize = 12;
        let listed: Vec<&str> = self.codes.iter().take(SHOWN).map(String::as_str).collect();
        if self.codes.len() > SHOWN {
            format!("expected one of {} ... ({} codes)", listed.join(", "), self.codes.len())
        } else {
            format!("expected one of {}", listed.join(", "))
        }
    }
}

/// Trimmed answer line accepted by the validator, or the reason it is not.
/// Codes may contain inner spaces ("SECRE. FARMACIA"); the whole line is the code.
pub fn check_answer<V: CodeValidator + ?Sized>(validator: &V, answer: &str) -> Result<String, String> {
    let code = answer.trim();
    if code.is_empty() {
        return Err("empty answer".to_string());
    }
    if !validator.accepts(code) {
        return Err(validator.describe());
    }
    Ok(code.to_string())
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub keys_prompted: usize,
    pub rows_from_mapping: usize,
    pub rows_from_operator: usize,
    pub rejected_answers: usize,
    pub resumed: bool,
}

impl EnrichmentSummary {
    pub fn summary(&self) -> String {
        format!(
            "{} keys asked, {} rows from operator, {} rows from saved answers, {} answers rejected{}",
            self.keys_prompted,
            self.rows_from_operator,
            self.rows_from_mapping,
            self.rejected_answers,
            if self.resumed { " (resumed)" } else { "" }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReopenOutcome {
    pub rows_cleared: usize,
    pub previous_code: Option<String>,
}

// ============================================================================
// ENRICHMENT CACHE
// ============================================================================

pub struct EnrichmentCache<S> {
    store: S,
    target: String,
    context_columns: Vec<String>,
    detail: Box<dyn DetailSource>,
}

impl<S: EnrichmentStore> EnrichmentCache<S> {
    pub fn new(store: S, target: impl Into<String>) -> Self {
        EnrichmentCache {
            store,
            target: target.into(),
            context_columns: Vec::new(),
            detail: Box::new(NoDetail),
        }
    }

    /// Columns shown for each row of a key. Empty means entity id plus every attribute.
    pub fn with_context_columns(mut self, columns: Vec<String>) -> Self {
        self.context_columns = columns;
        self
    }

    pub fn with_detail(mut self, detail: Box<dyn DetailSource>) -> Self {
        self.detail = detail;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn checkpoint_schema(&self, schema: &Schema) -> Schema {
        let mut schema = schema.clone();
        schema.add_attribute(self.target.clone());
        schema
    }

    /// Fill every unset `target` attribute, asking the operator once per distinct key.
    pub fn enrich<K, V, P>(
        &mut self,
        records: &RecordSet,
        key: &K,
        validator: &V,
        prompter: &mut P,
    ) -> Result<(RecordSet, EnrichmentSummary)>
    where
        K: KeyExtractor + ?Sized,
        V: CodeValidator + ?Sized,
        P: Prompter + ?Sized,
    {
        let schema = self.checkpoint_schema(&records.schema);
        let mut summary = EnrichmentSummary::default();

        let mut working = match self.store.load_checkpoint(&schema)? {
            Some(checkpoint) => {
                summary.resumed = true;
                checkpoint
            }
            None => {
                let mut fresh = records.clone();
                fresh.schema = schema.clone();
                fresh
            }
        };
        for record in &mut working.records {
            if !record.attributes.contains_key(&self.target) {
                record.set_attribute(&self.target, "");
            }
        }

        // Natural key of every unresolved row
        let mapping = self.store.mapping()?;
        let mut pending: Vec<(usize, String)> = Vec::new();
        for (position, record) in working.records.iter_mut().enumerate() {
            if !record.is_unset(&self.target) {
                continue;
            }
            let natural_key = key.key(record)?;
            match mapping.get(&natural_key) {
                Some(code) => {
                    record.set_attribute(&self.target, code.clone());
                    summary.rows_from_mapping += 1;
                }
                None => pending.push((position, natural_key)),
            }
        }

        let mut seen = HashSet::new();
        let keys: Vec<String> = pending
            .iter()
            .filter(|(_, k)| seen.insert(k.clone()))
            .map(|(_, k)| k.clone())
            .collect();

        info!(
            target_attribute = %self.target,
            rows = working.len(),
            from_mapping = summary.rows_from_mapping,
            unresolved_keys = keys.len(),
            resumed = summary.resumed,
            "enrichment started"
        );

        for (index, natural_key) in keys.iter().enumerate() {
            let positions: Vec<usize> = pending
                .iter()
                .filter(|(_, k)| k == natural_key)
                .map(|(p, _)| *p)
                .collect();

            let context = self.key_context(&working, natural_key, &positions, index + 1, keys.len());
            prompter.present(&context)?;

            let code = loop {
                let answer = prompter.ask(&context)?;
                match check_answer(validator, &answer) {
                    Ok(code) => break code,
                    Err(reason) => {
                        summary.rejected_answers += 1;
                        debug!(key = %natural_key, answer = %answer.trim(), reason = %reason, "answer rejected");
                        prompter.reject(&answer, &reason)?;
                    }
                }
            };

            for &position in &positions {
                working.records[position].set_attribute(&self.target, code.clone());
            }
            summary.keys_prompted += 1;
            summary.rows_from_operator += positions.len();

            // Ledger first: a crash before the checkpoint lands is repaired from the mapping
            self.store.record_resolution(natural_key, &code)?;
            self.store.save_checkpoint(&working)?;

            info!(key = %natural_key, code = %code, rows = positions.len(), "key resolved");
        }

        if summary.keys_prompted == 0 && summary.rows_from_mapping > 0 {
            self.store.save_checkpoint(&working)?;
        }

        info!("{}", summary.summary());
        Ok((working, summary))
    }

    fn key_context(
        &self,
        working: &RecordSet,
        natural_key: &str,
        positions: &[usize],
        position: usize,
        total: usize,
    ) -> KeyContext {
        let rows: Vec<&Record> = positions.iter().map(|&p| &working.records[p]).collect();

        let columns: Vec<String> = if self.context_columns.is_empty() {
            std::iter::once(working.schema.entity_column.clone())
                .chain(
                    working
                        .schema
                        .attributes
                        .iter()
                        .filter(|a| **a != self.target)
                        .cloned(),
                )
                .collect()
        } else {
            self.context_columns.clone()
        };

        let rendered: Vec<Vec<(String, String)>> = rows
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|column| {
                        let value = if *column == working.schema.entity_column {
                            record.entity_id.clone()
                        } else {
                            record.field_text(column).unwrap_or_default()
                        };
                        (column.clone(), value)
                    })
                    .collect()
            })
            .collect();

        let detail = match self.detail.fetch(natural_key, &rows) {
            Ok(detail) => detail,
            Err(e) => {
                warn!(key = %natural_key, error = %e, "detail lookup failed");
                Some(format!("detail unavailable: {:#}", e))
            }
        };

        KeyContext {
            natural_key: natural_key.to_string(),
            position,
            total,
            target: self.target.clone(),
            rows: rendered,
            detail,
        }
    }

    /// Forget the answer for `natural_key` and clear it from the checkpoint, so the next
    /// run asks again.
    pub fn reopen<K>(&mut self, schema: &Schema, key: &K, natural_key: &str) -> Result<ReopenOutcome>
    where
        K: KeyExtractor + ?Sized,
    {
        let schema = self.checkpoint_schema(schema);
        let mut rows_cleared = 0;

        if let Some(mut checkpoint) = self.store.load_checkpoint(&schema)? {
            for record in &mut checkpoint.records {
                if key.key(record)? == natural_key && !record.is_unset(&self.target) {
                    record.set_attribute(&self.target, "");
                    rows_cleared += 1;
                }
            }
            if rows_cleared > 0 {
                self.store.save_checkpoint(&checkpoint)?;
            }
        }

        let previous_code = self.store.forget(natural_key)?;
        info!(
            key = %natural_key,
            rows_cleared,
            previous = previous_code.as_deref().unwrap_or("-"),
            "key reopened"
        );

        Ok(ReopenOutcome {
            rows_cleared,
            previous_code,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn create_test_record(id: &str, item: &str, code: &str) -> Record {
        Record::new(id).with_attribute("item", item).with_attribute("code", code)
    }

    fn create_test_set() -> RecordSet {
        let schema = Schema::new("ID").with_attribute("item").with_attribute("code");
        RecordSet::from_records(
            schema,
            vec![
                create_test_record("1", "GASA", ""),
                create_test_record("2", "ALCOHOL", "21"),
                create_test_record("3", "JERINGA", ""),
                create_test_record("4", "GASA", ""),
            ],
        )
    }

    fn codes() -> CodeSet {
        CodeSet::new(vec!["20", "21", "22"])
    }

    fn item_key() -> ColumnKey {
        ColumnKey::new(vec!["item"])
    }

    struct FailingDetail;

    impl DetailSource for FailingDetail {
        fn fetch(&self, _natural_key: &str, _rows: &[&Record]) -> Result<Option<String>> {
            Err(anyhow!("connection refused"))
        }
    }

    #[test]
    fn test_asks_once_per_distinct_key() {
        let mut cache = EnrichmentCache::new(MemoryStore::new(), "code");
        let mut prompter = ScriptedPrompter::new(vec!["20", "22"]);

        let (out, summary) = cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut prompter)
            .unwrap();

        assert_eq!(prompter.presented, vec!["GASA", "JERINGA"]);
        assert_eq!(summary.keys_prompted, 2);
        assert_eq!(summary.rows_from_operator, 3);
        assert!(out.records.iter().all(|r| !r.is_unset("code")));
        assert_eq!(out.records[0].attribute("code").unwrap(), "20");
        assert_eq!(out.records[1].attribute("code").unwrap(), "21");
        assert_eq!(out.records[3].attribute("code").unwrap(), "20");
        assert_eq!(cache.store().entries["JERINGA"], "22");
        assert_eq!(cache.store().saves, 2);

        println!("✅ {}", summary.summary());
    }

    #[test]
    fn test_invalid_answers_reprompt() {
        let mut cache = EnrichmentCache::new(MemoryStore::new(), "code");
        let mut prompter = ScriptedPrompter::new(vec!["", "2 0", "99", " 20 ", "22"]);

        let (out, summary) = cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut prompter)
            .unwrap();

        assert_eq!(summary.rejected_answers, 3);
        assert_eq!(prompter.asked, 5);
        assert_eq!(prompter.rejected, vec!["", "2 0", "99"]);
        assert_eq!(out.records[0].attribute("code").unwrap(), "20");
    }

    #[test]
    fn test_second_run_resumes_without_prompts() {
        let mut cache = EnrichmentCache::new(MemoryStore::new(), "code");
        let (first, _) = cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut ScriptedPrompter::new(vec!["20", "22"]))
            .unwrap();

        let mut prompter = ScriptedPrompter::new(Vec::<String>::new());
        let (second, summary) = cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut prompter)
            .unwrap();

        assert_eq!(prompter.asked, 0);
        assert!(summary.resumed);
        assert_eq!(second, first);
    }

    #[test]
    fn test_interrupted_run_resumes_remaining_keys() {
        let mut cache = EnrichmentCache::new(MemoryStore::new(), "code");
        let mut prompter = ScriptedPrompter::new(vec!["20"]);

        // Operator walks away after the first key
        assert!(cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut prompter)
            .is_err());

        let mut prompter = ScriptedPrompter::new(vec!["22"]);
        let (out, summary) = cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut prompter)
            .unwrap();

        assert_eq!(prompter.presented, vec!["JERINGA"]);
        assert_eq!(summary.keys_prompted, 1);
        assert_eq!(out.records[3].attribute("code").unwrap(), "20");
    }

    #[test]
    fn test_mapping_fills_rows_checkpoint_missed() {
        // Ledger committed, crash before the checkpoint was replaced
        let mut store = MemoryStore::new();
        store.checkpoint = Some(create_test_set());
        store.entries.insert("GASA".to_string(), "20".to_string());
        let mut cache = EnrichmentCache::new(store, "code");
        let mut prompter = ScriptedPrompter::new(vec!["22"]);

        let (out, summary) = cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut prompter)
            .unwrap();

        assert_eq!(summary.rows_from_mapping, 2);
        assert_eq!(prompter.presented, vec!["JERINGA"]);
        assert_eq!(out.records[0].attribute("code").unwrap(), "20");
    }

    #[test]
    fn test_detail_failure_is_shown_not_fatal() {
        let mut cache =
            EnrichmentCache::new(MemoryStore::new(), "code").with_detail(Box::new(FailingDetail));
        let set = create_test_set();

        let context = cache.key_context(&set, "GASA", &[0, 3], 1, 2);
        assert_eq!(
            context.detail.as_deref(),
            Some("detail unavailable: connection refused")
        );
        assert_eq!(context.rows[1][0], ("ID".to_string(), "4".to_string()));

        let result = cache.enrich(&set, &item_key(), &codes(), &mut ScriptedPrompter::new(vec!["20", "22"]));
        assert!(result.is_ok());
    }

    #[test]
    fn test_reopen_clears_rows_and_forgets_answer() {
        let mut cache = EnrichmentCache::new(MemoryStore::new(), "code");
        cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut ScriptedPrompter::new(vec!["20", "22"]))
            .unwrap();

        let outcome = cache
            .reopen(&create_test_set().schema, &item_key(), "GASA")
            .unwrap();
        assert_eq!(outcome.rows_cleared, 2);
        assert_eq!(outcome.previous_code, Some("20".to_string()));

        let mut prompter = ScriptedPrompter::new(vec!["21"]);
        let (out, _) = cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut prompter)
            .unwrap();
        assert_eq!(prompter.presented, vec!["GASA"]);
        assert_eq!(out.records[0].attribute("code").unwrap(), "21");
        assert_eq!(out.records[2].attribute("code").unwrap(), "22");
    }

    #[test]
    fn test_file_store_run_twice_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("supplies.checkpoint.csv");
        let ledger = dir.path().join("ledger.db");

        let first = {
            let store = FileStore::open(&checkpoint, &ledger, "supplies").unwrap();
            let mut cache = EnrichmentCache::new(store, "code");
            let (out, _) = cache
                .enrich(&create_test_set(), &item_key(), &codes(), &mut ScriptedPrompter::new(vec!["20", "22"]))
                .unwrap();
            out
        };

        let store = FileStore::open(&checkpoint, &ledger, "supplies").unwrap();
        let mut cache = EnrichmentCache::new(store, "code");
        let mut prompter = ScriptedPrompter::new(Vec::<String>::new());
        let (second, summary) = cache
            .enrich(&create_test_set(), &item_key(), &codes(), &mut prompter)
            .unwrap();

        assert_eq!(prompter.asked, 0);
        assert!(summary.resumed);
        assert_eq!(second.fingerprint().unwrap(), first.fingerprint().unwrap());
    }

    #[test]
    fn test_composite_key_and_closure_key() {
        let record = Record::new("1")
            .with_attribute("item", " GASA ")
            .with_attribute("unit", "UCI");

        let key = ColumnKey::new(vec!["item", "unit"]).with_separator("/");
        assert_eq!(key.key(&record).unwrap(), "GASA/UCI");
        assert!(ColumnKey::new(vec!["brand"]).key(&record).is_err());

        let closure = |r: &Record| -> Result<String, SchemaError> { Ok(r.entity_id.clone()) };
        assert_eq!(closure.key(&record).unwrap(), "1");
    }

    #[test]
    fn test_check_answer() {
        let codes = codes();

        assert_eq!(check_answer(&codes, " 21\n"), Ok("21".to_string()));
        assert_eq!(check_answer(&codes, "  "), Err("empty answer".to_string()));
        assert!(check_answer(&codes, "21 22").is_err());
        assert_eq!(check_answer(&codes, "23"), Err("expected one of 20, 21, 22".to_string()));
    }

    #[test]
    fn test_code_with_inner_spaces_is_accepted() {
        let destinations = CodeSet::new(vec!["SECRE. FARMACIA", "UCI"]);
        assert_eq!(
            check_answer(&destinations, "  SECRE. FARMACIA \n"),
            Ok("SECRE. FARMACIA".to_string())
        );
        assert!(check_answer(&destinations, "SECRE.  FARMACIA").is_err());

        let mut cache = EnrichmentCache::new(MemoryStore::new(), "code");
        let mut prompter = ScriptedPrompter::new(vec!["SECRE. FARMACIA", "UCI"]);

        let (out, summary) = cache
            .enrich(&create_test_set(), &item_key(), &destinations, &mut prompter)
            .unwrap();

        assert_eq!(summary.rejected_answers, 0);
        assert!(prompter.rejected.is_empty());
        assert_eq!(out.records[0].attribute("code").unwrap(), "SECRE. FARMACIA");
        assert_eq!(out.records[3].attribute("code").unwrap(), "SECRE. FARMACIA");
        assert_eq!(out.records[2].attribute("code").unwrap(), "UCI");

        println!("✅ {}", summary.summary());
    }
}
