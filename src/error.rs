// ⚠️ Domain Errors - malformed input and lookup misses
// Infrastructure failures (files, SQLite, terminal) travel as anyhow::Error instead.

use thiserror::Error;

/// Malformed upstream data. Fatal to the pass that detected it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("record for entity '{entity_id}' is missing attribute '{attribute}'")]
    MissingAttribute { entity_id: String, attribute: String },

    #[error("record for entity '{entity_id}' is missing amount field '{field}'")]
    MissingAmount { entity_id: String, field: String },

    #[error("{source_name}: missing column '{column}'")]
    MissingColumn { source_name: String, column: String },

    #[error("{source_name}, line {line}: cannot parse amount '{value}' in column '{column}'")]
    InvalidAmount {
        source_name: String,
        line: u64,
        column: String,
        value: String,
    },

    #[error("cannot combine record sets with different attributes: {left:?} vs {right:?}")]
    IncompatibleSchemas { left: Vec<String>, right: Vec<String> },
}

/// A lookup table has no entry for a value. The whole translation call is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no mapping for {attribute} value '{value}'")]
pub struct MappingError {
    pub attribute: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

// ============================================================================
// TESTS
// ============================================================================
