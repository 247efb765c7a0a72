// 💾 Enrichment Store - where the checkpoint and the mapping live between runs

use crate::ledger::{Event, Ledger, ENTITY_CHECKPOINT};
use crate::record::{RecordSet, Schema};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const OPERATOR: &str = "operator";

/// Persistence seam of the enrichment cache.
///
/// Writes happen in this order per answered key: `record_resolution` then `save_checkpoint`.
/// A crash between the two leaves the answer in the mapping, and the next run fills it from there.
pub trait EnrichmentStore {
    /// The persisted record set, if a previous run left one
    fn load_checkpoint(&mut self, schema: &Schema) -> Result<Option<RecordSet>>;

    /// Replace the persisted record set atomically
    fn save_checkpoint(&mut self, records: &RecordSet) -> Result<()>;

    fn mapping(&self) -> Result<BTreeMap<String, String>>;

    fn record_resolution(&mut self, natural_key: &str, code: &str) -> Result<()>;

    /// Remove a key's answer, returning the code it had
    fn forget(&mut self, natural_key: &str) -> Result<Option<String>>;
}

impl<S: EnrichmentStore + ?Sized> EnrichmentStore for Box<S> {
    fn load_checkpoint(&mut self, schema: &Schema) -> Result<Option<RecordSet>> {
        (**self).load_checkpoint(schema)
    }

    fn save_checkpoint(&mut self, records: &RecordSet) -> Result<()> {
        (**self).save_checkpoint(records)
    }

    fn mapping(&self) -> Result<BTreeMap<String, String>> {
        (**self).mapping()
    }

    fn record_resolution(&mut self, natural_key: &str, code: &str) -> Result<()> {
        (**self).record_resolution(natural_key, code)
    }

    fn forget(&mut self, natural_key: &str) -> Result<Option<String>> {
        (**self).forget(natural_key)
    }
}

// ============================================================================
// FILE STORE (checkpoint CSV + SQLite ledger)
// ============================================================================

pub struct FileStore {
    checkpoint: PathBuf,
    ledger: Ledger,
    namespace: String,
}

impl FileStore {
    pub fn new(checkpoint: impl Into<PathBuf>, ledger: Ledger, namespace: impl Into<String>) -> Self {
        FileStore {
            checkpoint: checkpoint.into(),
            ledger,
            namespace: namespace.into(),
        }
    }

    /// Open (or create) the ledger at `ledger_path`
    pub fn open(checkpoint: &Path, ledger_path: &Path, namespace: &str) -> Result<Self> {
        let ledger = Ledger::open(ledger_path)?;
        Ok(FileStore::new(checkpoint, ledger, namespace))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}

impl EnrichmentStore for FileStore {
    fn load_checkpoint(&mut self, schema: &Schema) -> Result<Option<RecordSet>> {
        if !self.checkpoint.exists() {
            return Ok(None);
        }
        let records = RecordSet::read_csv(&self.checkpoint, schema)
            .with_context(|| format!("Failed to load checkpoint: {}", self.checkpoint.display()))?;
        info!(
            checkpoint = %self.checkpoint.display(),
            rows = records.len(),
            "resuming from checkpoint"
        );
        Ok(Some(records))
    }

    fn save_checkpoint(&mut self, records: &RecordSet) -> Result<()> {
        records.write_csv(&self.checkpoint)?;

        let event = Event::new(
            "checkpoint_written",
            ENTITY_CHECKPOINT,
            &self.namespace,
            serde_json::json!({
                "path": self.checkpoint.display().to_string(),
                "rows": records.len(),
                "fingerprint": records.fingerprint()?,
            }),
            OPERATOR,
        );
        self.ledger.record_event(&event)?;

        debug!(checkpoint = %self.checkpoint.display(), rows = records.len(), "checkpoint written");
        Ok(())
    }

    fn mapping(&self) -> Result<BTreeMap<String, String>> {
        self.ledger.mapping(&self.namespace)
    }

    fn record_resolution(&mut self, natural_key: &str, code: &str) -> Result<()> {
        let entry = self
            .ledger
            .upsert_mapping(&self.namespace, natural_key, code, OPERATOR)?;
        debug!(key = %natural_key, code = %code, revision = entry.revision, "mapping recorded");
        Ok(())
    }

    fn forget(&mut self, natural_key: &str) -> Result<Option<String>> {
        self.ledger
            .remove_mapping(&self.namespace, natural_key, OPERATOR)
    }
}

// ============================================================================
// MEMORY STORE (dry runs and tests)
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub checkpoint: Option<RecordSet>,
    pub entries: BTreeMap<String, String>,
    pub saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Start from answers already known elsewhere (e.g. a real ledger)
    pub fn seeded(entries: BTreeMap<String, String>) -> Self {
        MemoryStore {
            entries,
            ..MemoryStore::default()
        }
    }
}

impl EnrichmentStore for MemoryStore {
    fn load_checkpoint(&mut self, _schema: &Schema) -> Result<Option<RecordSet>> {
        Ok(self.checkpoint.clone())
    }

    fn save_checkpoint(&mut self, records: &RecordSet) -> Result<()> {
        self.checkpoint = Some(records.clone());
        self.saves += 1;
        Ok(())
    }

    fn mapping(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.entries.clone())
    }

    fn record_resolution(&mut self, natural_key: &str, code: &str) -> Result<()> {
        self.entries.insert(natural_key.to_string(), code.to_string());
        Ok(())
    }

    fn forget(&mut self, natural_key: &str) -> Result<Option<String>> {
        Ok(self.entries.remove(natural_key))
    }
}

// ============================================================================
// TESTS
// ============================================================================
