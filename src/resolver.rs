// 🔁 Redundancy Resolver - collapse conflicting attribute values per entity
// One pass per attribute: the value carrying the most amount wins, first-seen breaks ties,
// and an override value can replace the ranking for a whole attribute.

use crate::error::SchemaError;
use crate::record::RecordSet;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

// ============================================================================
// RESOLUTION RULE
// ============================================================================

/// One step of a resolution plan. Plans run in order; later passes see rewritten data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRule {
    pub attribute: String,

    /// Fixed canonical value for every duplicated entity (statutory contract beats fee-based)
    pub tie_break_override: Option<String>,
}

impl AttributeRule {
    /// Rule that keeps the highest-amount value
    pub fn ranked(attribute: impl Into<String>) -> Self {
        AttributeRule {
            attribute: attribute.into(),
            tie_break_override: None,
        }
    }

    pub fn with_override(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        AttributeRule {
            attribute: attribute.into(),
            tie_break_override: Some(value.into()),
        }
    }
}

// ============================================================================
// RESOLUTION REPORT
// ============================================================================

/// Summed ranking amount of one `(entity_id, value)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeGroup {
    pub entity_id: String,
    pub value: String,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicatedEntity {
    pub entity_id: String,

    /// Candidates, highest amount first
    pub candidates: Vec<AttributeGroup>,

    pub canonical: String,

    /// True when the override decided instead of the ranking
    pub overridden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub attribute: String,
    pub entities_seen: usize,
    pub duplicated: Vec<DuplicatedEntity>,
    pub records_rewritten: usize,
}

impl ResolutionReport {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} entities, {} duplicated, {} records rewritten",
            self.attribute,
            self.entities_seen,
            self.duplicated.len(),
            self.records_rewritten
        )
    }

    /// The CanonicalMapping this pass applied
    pub fn canonical_mapping(&self) -> HashMap<&str, &str> {
        self.duplicated
            .iter()
            .map(|d| (d.entity_id.as_str(), d.canonical.as_str()))
            .collect()
    }
}

// ============================================================================
// REDUNDANCY RESOLVER
// ============================================================================

pub struct RedundancyResolver {
    /// Amount field used to rank competing values
    pub rank_amount: String,
}

impl RedundancyResolver {
    pub fn new(rank_amount: impl Into<String>) -> Self {
        RedundancyResolver {
            rank_amount: rank_amount.into(),
        }
    }

    /// Resolve one attribute. Returns a new record set where every record of an entity
    /// carries the same value for `attribute`; amounts are never touched.
    pub fn resolve(
        &self,
        records: &RecordSet,
        attribute: &str,
        tie_break_override: Option<&str>,
    ) -> Result<(RecordSet, ResolutionReport), SchemaError> {
        let (groups, entities) = self.group(records, attribute)?;

        // Pick canonical values for duplicated entities
        let mut duplicated = Vec::new();
        for (entity_id, group_ids) in &entities {
            if group_ids.len() < 2 {
                continue;
            }

            let mut candidates: Vec<AttributeGroup> =
                group_ids.iter().map(|&i| groups[i].clone()).collect();
            // sort_by is stable: equal totals keep first-seen order
            candidates.sort_by(|a, b| b.total.cmp(&a.total));

            let (canonical, overridden) = match tie_break_override {
                Some(value) => (value.to_string(), true),
                None => (candidates[0].value.clone(), false),
            };

            debug!(
                attribute,
                entity = %entity_id,
                canonical = %canonical,
                candidates = candidates.len(),
                overridden,
                "collapsed duplicated values"
            );

            duplicated.push(DuplicatedEntity {
                entity_id: entity_id.clone(),
                candidates,
                canonical,
                overridden,
            });
        }

        // Rewrite every record of a mapped entity
        let mapping: HashMap<&str, &str> = duplicated
            .iter()
            .map(|d| (d.entity_id.as_str(), d.canonical.as_str()))
            .collect();

        let mut resolved = records.clone();
        let mut records_rewritten = 0;
        for record in &mut resolved.records {
            if let Some(canonical) = mapping.get(record.entity_id.as_str()) {
                if record.attribute(attribute)? != *canonical {
                    record.set_attribute(attribute, *canonical);
                    records_rewritten += 1;
                }
            }
        }

        let report = ResolutionReport {
            attribute: attribute.to_string(),
            entities_seen: entities.len(),
            duplicated,
            records_rewritten,
        };
        info!("resolved {}", report.summary());

        Ok((resolved, report))
    }

    /// Run a plan of passes in order
    pub fn resolve_all(
        &self,
        records: &RecordSet,
        rules: &[AttributeRule],
    ) -> Result<(RecordSet, Vec<ResolutionReport>), SchemaError> {
        let mut current = records.clone();
        let mut reports = Vec::with_capacity(rules.len());

        for rule in rules {
            let (next, report) =
                self.resolve(&current, &rule.attribute, rule.tie_break_override.as_deref())?;
            current = next;
            reports.push(report);
        }

        Ok((current, reports))
    }

    /// AttributeGroups in first-seen order, and each entity's group ids in first-seen order
    fn group(
        &self,
        records: &RecordSet,
        attribute: &str,
    ) -> Result<(Vec<AttributeGroup>, Vec<(String, Vec<usize>)>), SchemaError> {
        let mut groups: Vec<AttributeGroup> = Vec::new();
        let mut group_index: HashMap<(String, String), usize> = HashMap::new();
        let mut entities: Vec<(String, Vec<usize>)> = Vec::new();
        let mut entity_index: HashMap<String, usize> = HashMap::new();

        for record in &records.records {
            let value = record.attribute(attribute)?;
            let amount = record.amount(&self.rank_amount)?;
            let key = (record.entity_id.clone(), value.to_string());

            if let Some(&id) = group_index.get(&key) {
                groups[id].total += amount;
                continue;
            }

            let id = groups.len();
            groups.push(AttributeGroup {
                entity_id: record.entity_id.clone(),
                value: value.to_string(),
                total: amount,
            });
            group_index.insert(key, id);

            let slot = match entity_index.get(&record.entity_id) {
                Some(&slot) => slot,
                None => {
                    entities.push((record.entity_id.clone(), Vec::new()));
                    entity_index.insert(record.entity_id.clone(), entities.len() - 1);
                    entities.len() - 1
                }
            };
            entities[slot].1.push(id);
        }

        Ok((groups, entities))
    }
}

// ============================================================================
// TESTS
// ============================================================================
