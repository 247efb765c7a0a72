// 📒 Enrichment Ledger - operator answers that outlive the run
// SQLite: the current natural_key → code mapping per namespace, plus an append-only event trail.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const ENTITY_KEY: &str = "enrichment_key";
pub const ENTITY_CHECKPOINT: &str = "checkpoint";

/// One persisted answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub namespace: String,
    pub natural_key: String,
    pub code: String,
    /// 1 for the first answer, bumped every time the same key is answered again
    pub revision: i64,
    pub resolved_at: DateTime<Utc>,
}

/// Event for audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Event entity id for a natural key
pub fn key_entity_id(namespace: &str, natural_key: &str) -> String {
    format!("{}:{}", namespace, natural_key)
}

// ============================================================================
// LEDGER
// ============================================================================

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger: {}", path.display()))?;
        let ledger = Ledger { conn };
        ledger.setup()?;
        debug!(path = %path.display(), "opened ledger");
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory ledger")?;
        let ledger = Ledger { conn };
        ledger.setup()?;
        Ok(ledger)
    }

    fn setup(&self) -> Result<()> {
        // Enable WAL mode for crash recovery (in-memory databases answer "memory")
        self.conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

        // ==========================================================================
        // Mapping Table (one current answer per key)
        // ==========================================================================
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS enrichment_mapping (
                namespace TEXT NOT NULL,
                natural_key TEXT NOT NULL,
                code TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                resolved_at TEXT NOT NULL,
                PRIMARY KEY (namespace, natural_key)
            )",
            [],
        )?;

        // ==========================================================================
        // Events Table (audit trail)
        // ==========================================================================
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT UNIQUE NOT NULL,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                data TEXT NOT NULL,
                actor TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
            [],
        )?;

        Ok(())
    }

    /// Record an answer. Commits the mapping row and its event together.
    pub fn upsert_mapping(
        &mut self,
        namespace: &str,
        natural_key: &str,
        code: &str,
        actor: &str,
    ) -> Result<MappingEntry> {
        let now = Utc::now();
        let tx = self.conn.transaction()?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT code FROM enrichment_mapping WHERE namespace = ?1 AND natural_key = ?2",
                params![namespace, natural_key],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO enrichment_mapping (namespace, natural_key, code, revision, resolved_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(namespace, natural_key) DO UPDATE SET
                code = excluded.code,
                revision = enrichment_mapping.revision + 1,
                resolved_at = excluded.resolved_at",
            params![namespace, natural_key, code, now.to_rfc3339()],
        )?;

        let revision: i64 = tx.query_row(
            "SELECT revision FROM enrichment_mapping WHERE namespace = ?1 AND natural_key = ?2",
            params![namespace, natural_key],
            |row| row.get(0),
        )?;

        let event = Event::new(
            "mapping_resolved",
            ENTITY_KEY,
            &key_entity_id(namespace, natural_key),
            serde_json::json!({
                "code": code,
                "previous": previous,
                "revision": revision,
            }),
            actor,
        );
        insert_event(&tx, &event)?;

        tx.commit().context("Failed to commit mapping")?;

        Ok(MappingEntry {
            namespace: namespace.to_string(),
            natural_key: natural_key.to_string(),
            code: code.to_string(),
            revision,
            resolved_at: now,
        })
    }

    /// Current `natural_key → code` mapping of one namespace
    pub fn mapping(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .entries(namespace)?
            .into_iter()
            .map(|entry| (entry.natural_key, entry.code))
            .collect())
    }

    pub fn entries(&self, namespace: &str) -> Result<Vec<MappingEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT namespace, natural_key, code, revision, resolved_at
             FROM enrichment_mapping
             WHERE namespace = ?1
             ORDER BY natural_key",
        )?;

        let entries = stmt
            .query_map(params![namespace], |row| {
                let resolved_at: String = row.get(4)?;
                Ok(MappingEntry {
                    namespace: row.get(0)?,
                    natural_key: row.get(1)?,
                    code: row.get(2)?,
                    revision: row.get(3)?,
                    resolved_at: parse_timestamp(4, &resolved_at)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Drop a key's answer so the next run asks again. The old code stays in the events.
    pub fn remove_mapping(
        &mut self,
        namespace: &str,
        natural_key: &str,
        actor: &str,
    ) -> Result<Option<String>> {
        let tx = self.conn.transaction()?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT code FROM enrichment_mapping WHERE namespace = ?1 AND natural_key = ?2",
                params![namespace, natural_key],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(code) = &previous {
            tx.execute(
                "DELETE FROM enrichment_mapping WHERE namespace = ?1 AND natural_key = ?2",
                params![namespace, natural_key],
            )?;

            let event = Event::new(
                "mapping_reopened",
                ENTITY_KEY,
                &key_entity_id(namespace, natural_key),
                serde_json::json!({ "previous": code }),
                actor,
            );
            insert_event(&tx, &event)?;
        }

        tx.commit().context("Failed to commit reopen")?;
        Ok(previous)
    }

    pub fn record_event(&self, event: &Event) -> Result<()> {
        insert_event(&self.conn, event)
    }

    /// Events for one entity, newest first
    pub fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
             FROM events
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY timestamp DESC, id DESC",
        )?;

        let events = stmt
            .query_map(params![entity_type, entity_id], |row| {
                let timestamp: String = row.get(1)?;
                let data_json: String = row.get(5)?;

                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: parse_timestamp(1, &timestamp)?,
                    event_type: row.get(2)?,
                    entity_type: row.get(3)?,
                    entity_id: row.get(4)?,
                    data: serde_json::from_str(&data_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                    })?,
                    actor: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

/// Insert event into audit trail
fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

// ============================================================================
// TESTS
// ============================================================================
