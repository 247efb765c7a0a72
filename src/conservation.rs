// ⚖️ Conservation Check - resolution relabels, it never creates or loses money
//
// For every entity and every amount field:
//   sum(before) = sum(after)
//
// Run after the last aggregation; a violation means a pass dropped or duplicated rows.

use crate::error::SchemaError;
use crate::record::RecordSet;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// CONSERVATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConservationResult {
    /// Every entity total matches
    Conserved { entities: usize, fields: usize },

    /// At least one entity total moved
    Violated { discrepancies: Vec<AmountDiscrepancy> },
}

impl ConservationResult {
    pub fn is_conserved(&self) -> bool {
        matches!(self, ConservationResult::Conserved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountDiscrepancy {
    pub entity_id: String,
    pub field: String,
    pub before: Decimal,
    pub after: Decimal,
    pub category: DiscrepancyCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscrepancyCategory {
    /// Entity present on both sides with different totals
    AmountMismatch,
    /// Entity disappeared
    MissingEntity,
    /// Entity appeared from nowhere
    UnexpectedEntity,
}

// ============================================================================
// CONSERVATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConservationReport {
    pub result: ConservationResult,
    pub records_before: usize,
    pub records_after: usize,
    pub checked_at: DateTime<Utc>,
}

impl ConservationReport {
    pub fn is_conserved(&self) -> bool {
        self.result.is_conserved()
    }

    pub fn summary(&self) -> String {
        match &self.result {
            ConservationResult::Conserved { entities, fields } => format!(
                "Amounts conserved: {} entities x {} fields ({} rows -> {} rows)",
                entities, fields, self.records_before, self.records_after
            ),
            ConservationResult::Violated { discrepancies } => format!(
                "Amounts NOT conserved: {} discrepancies ({} rows -> {} rows)",
                discrepancies.len(),
                self.records_before,
                self.records_after
            ),
        }
    }
}

// ============================================================================
// CONSERVATION CHECK
// ============================================================================

pub struct ConservationCheck {
    pub amount_fields: Vec<String>,
}

impl ConservationCheck {
    pub fn new(amount_fields: Vec<String>) -> Self {
        ConservationCheck { amount_fields }
    }

    /// Check every amount field of `before`'s schema
    pub fn for_schema(records: &RecordSet) -> Self {
        ConservationCheck::new(records.schema.amounts.clone())
    }

    pub fn verify(
        &self,
        before: &RecordSet,
        after: &RecordSet,
    ) -> Result<ConservationReport, SchemaError> {
        let mut discrepancies = Vec::new();
        let mut entities = BTreeSet::new();

        for field in &self.amount_fields {
            let totals_before = before.totals_by_entity(field)?;
            let totals_after = after.totals_by_entity(field)?;

            for (entity_id, &amount_before) in &totals_before {
                entities.insert(entity_id.clone());
                match totals_after.get(entity_id) {
                    Some(&amount_after) if amount_after == amount_before => {}
                    Some(&amount_after) => discrepancies.push(AmountDiscrepancy {
                        entity_id: entity_id.clone(),
                        field: field.clone(),
                        before: amount_before,
                        after: amount_after,
                        category: DiscrepancyCategory::AmountMismatch,
                    }),
                    None => discrepancies.push(AmountDiscrepancy {
                        entity_id: entity_id.clone(),
                        field: field.clone(),
                        before: amount_before,
                        after: Decimal::ZERO,
                        category: DiscrepancyCategory::MissingEntity,
                    }),
                }
            }

            for (entity_id, &amount_after) in &totals_after {
                if !totals_before.contains_key(entity_id) {
                    discrepancies.push(AmountDiscrepancy {
                        entity_id: entity_id.clone(),
                        field: field.clone(),
                        before: Decimal::ZERO,
                        after: amount_after,
                        category: DiscrepancyCategory::UnexpectedEntity,
                    });
                }
            }
        }

        let result = if discrepancies.is_empty() {
            ConservationResult::Conserved {
                entities: entities.len(),
                fields: self.amount_fields.len(),
            }
        } else {
            ConservationResult::Violated { discrepancies }
        };

        Ok(ConservationReport {
            result,
            records_before: before.len(),
            records_after: after.len(),
            checked_at: Utc::now(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
