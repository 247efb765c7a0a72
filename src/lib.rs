// SIGCOM Reconciliation Engine - Core Library
// Exposes all modules for use in the CLI and tests

pub mod error;
pub mod record;
pub mod normalize;
pub mod loader;
pub mod resolver;      // Redundancy Resolver - one value per entity
pub mod aggregate;
pub mod conservation;  // Amount conservation check
pub mod translate;     // Static lookup tables
pub mod ledger;        // Persisted operator answers + audit trail
pub mod enrichment;    // Ask once, remember forever
pub mod config;
pub mod workflow;

// Re-export commonly used types
pub use error::{MappingError, SchemaError, TranslateError};
pub use record::{Record, RecordSet, Schema};
pub use normalize::normalize;
pub use loader::{load_source, schema_for};
pub use resolver::{
    AttributeGroup, AttributeRule, DuplicatedEntity, RedundancyResolver, ResolutionReport,
};
pub use aggregate::{aggregate, aggregate_by_attributes};
pub use conservation::{
    AmountDiscrepancy, ConservationCheck, ConservationReport, ConservationResult,
    DiscrepancyCategory,
};
pub use translate::{translate, translate_all, translate_partial, LookupTable, Translation};
pub use ledger::{Event, Ledger, MappingEntry};
pub use enrichment::{
    CodeSet, CodeValidator, ColumnDetail, ColumnKey, ConsolePrompter, DetailSource,
    EnrichmentCache, EnrichmentStore, EnrichmentSummary, FileStore, KeyContext, KeyExtractor,
    MemoryStore, NoDetail, Prompter, ReopenOutcome, ScriptedPrompter,
};
pub use config::{EnrichmentConfig, PayrollConfig, PipelineConfig, SourceConfig};
pub use workflow::{
    ClassificationOutcome, ClassificationWorkflow, PayrollOutcome, PayrollWorkflow, Population,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
