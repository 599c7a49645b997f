//! Ontology Knowledge Base.
//!
//! Stores the Values and Beliefs that directives are derived from, each with a
//! dense embedding vector, and answers nearest-neighbour queries over both by
//! cosine similarity.
//!
//! # Storage layout
//!
//! | table              | purpose                                             |
//! |--------------------|-----------------------------------------------------|
//! | `ontology_values`  | one row per Value; embedding as little-endian BLOB  |
//! | `ontology_beliefs` | one row per Belief; `related_values` as JSON array  |
//! | `directive_refs`   | `(directive_id, entity_kind, entity_id)` retained   |
//! |                    | references that block deletion                      |
//!
//! Every call holds the connection lock for its whole duration, so readers
//! never observe a half-written record.
//!
//! # Example
//!
//! ```rust
//! use mothership_memory::ontology::{KnowledgeBase, NewBelief, NewValue};
//!
//! let kb = KnowledgeBase::open_in_memory().unwrap();
//! let fairness = kb.put_value(NewValue::new("Fairness", "Treat every user equally", vec![1.0, 0.0])).unwrap();
//! kb.put_belief(
//!     NewBelief::new("Clear Explanations", "Explain each step", vec![0.9, 0.1])
//!         .related_to(fairness.id),
//! )
//! .unwrap();
//!
//! let hits = kb.similarity_search(&[1.0, 0.0], 5).unwrap();
//! assert_eq!(hits[0].name(), "Fairness");
//! ```

use std::collections::BTreeSet;

use chrono::Utc;
use mothership_types::{
    Belief, BeliefId, ConstraintSet, DirectiveId, EntityKind, MothershipError, Value, ValueId,
};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::sql::{json_col, time_col, ts, uuid_col};
use crate::vector::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from knowledge base operations.
#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Embedding vectors must be non-empty")]
    DimensionMismatch,
    #[error("{kind} name already taken: {name}")]
    DuplicateName { kind: EntityKind, name: String },
    #[error("{kind} {id} references unknown value {missing}")]
    UnknownReference {
        kind: EntityKind,
        id: Uuid,
        missing: ValueId,
    },
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Uuid },
    #[error("{kind} {id} is still referenced by a dependent record")]
    ReferencedByDependent { kind: EntityKind, id: Uuid },
}

impl From<KnowledgeError> for MothershipError {
    fn from(err: KnowledgeError) -> Self {
        match err {
            KnowledgeError::DuplicateName { kind, name } => {
                MothershipError::DuplicateName { kind, name }
            }
            KnowledgeError::UnknownReference { kind, id, missing } => {
                MothershipError::UnknownReference { kind, id, missing }
            }
            KnowledgeError::NotFound { kind, id } => MothershipError::NotFound { kind, id },
            KnowledgeError::ReferencedByDependent { kind, id } => {
                MothershipError::ReferencedByDependent { kind, id }
            }
            KnowledgeError::DimensionMismatch => {
                MothershipError::Validation("embedding must be non-empty".to_string())
            }
            other => MothershipError::Storage(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write requests
// ─────────────────────────────────────────────────────────────────────────────

/// Input for [`KnowledgeBase::put_value`].
#[derive(Debug, Clone)]
pub struct NewValue {
    pub name: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub guidance: ConstraintSet,
}

impl NewValue {
    pub fn new(name: impl Into<String>, description: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            embedding,
            guidance: ConstraintSet::new(),
        }
    }

    pub fn with_guidance(mut self, guidance: ConstraintSet) -> Self {
        self.guidance = guidance;
        self
    }
}

/// Input for [`KnowledgeBase::put_belief`].
#[derive(Debug, Clone)]
pub struct NewBelief {
    pub name: String,
    pub description: String,
    pub embedding: Vec<f32>,
    pub related_values: BTreeSet<ValueId>,
    pub guidance: ConstraintSet,
}

impl NewBelief {
    pub fn new(name: impl Into<String>, description: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            embedding,
            related_values: BTreeSet::new(),
            guidance: ConstraintSet::new(),
        }
    }

    pub fn related_to(mut self, value_id: ValueId) -> Self {
        self.related_values.insert(value_id);
        self
    }

    pub fn with_guidance(mut self, guidance: ConstraintSet) -> Self {
        self.guidance = guidance;
        self
    }
}

/// Administrative edit of a Value. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ValueUpdate {
    pub description: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub guidance: Option<ConstraintSet>,
}

/// Administrative edit of a Belief. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct BeliefUpdate {
    pub description: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub related_values: Option<BTreeSet<ValueId>>,
    pub guidance: Option<ConstraintSet>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Query results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KnowledgeEntry {
    Value(Value),
    Belief(Belief),
}

/// One similarity-search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeMatch {
    pub entry: KnowledgeEntry,
    pub similarity: f32,
}

impl KnowledgeMatch {
    pub fn name(&self) -> &str {
        match &self.entry {
            KnowledgeEntry::Value(v) => &v.name,
            KnowledgeEntry::Belief(b) => &b.name,
        }
    }

    pub fn guidance(&self) -> &ConstraintSet {
        match &self.entry {
            KnowledgeEntry::Value(v) => &v.guidance,
            KnowledgeEntry::Belief(b) => &b.guidance,
        }
    }

    pub fn description(&self) -> &str {
        match &self.entry {
            KnowledgeEntry::Value(v) => &v.description,
            KnowledgeEntry::Belief(b) => &b.description,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OntologySummary {
    pub total_values: usize,
    pub total_beliefs: usize,
    pub ontology_size: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// KnowledgeBase
// ─────────────────────────────────────────────────────────────────────────────

const VALUE_COLUMNS: &str = "id, name, description, embedding, guidance, created_at, updated_at";
const BELIEF_COLUMNS: &str =
    "id, name, description, embedding, related_values, guidance, created_at, updated_at";

/// SQLite-backed store of Values and Beliefs.
pub struct KnowledgeBase {
    conn: Mutex<Connection>,
}

impl KnowledgeBase {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, KnowledgeError> {
        let conn = Connection::open(path)?;
        let kb = Self {
            conn: Mutex::new(conn),
        };
        kb.init_schema()?;
        Ok(kb)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, KnowledgeError> {
        let conn = Connection::open_in_memory()?;
        let kb = Self {
            conn: Mutex::new(conn),
        };
        kb.init_schema()?;
        Ok(kb)
    }

    fn init_schema(&self) -> Result<(), KnowledgeError> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS ontology_values (
                id          TEXT NOT NULL PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                embedding   BLOB NOT NULL,
                guidance    TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ontology_beliefs (
                id             TEXT NOT NULL PRIMARY KEY,
                name           TEXT NOT NULL UNIQUE,
                description    TEXT NOT NULL,
                embedding      BLOB NOT NULL,
                related_values TEXT NOT NULL,
                guidance       TEXT NOT NULL,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS directive_refs (
                directive_id TEXT NOT NULL,
                entity_kind  TEXT NOT NULL CHECK (entity_kind IN ('value', 'belief')),
                entity_id    TEXT NOT NULL,
                PRIMARY KEY (directive_id, entity_kind, entity_id)
            );
            CREATE INDEX IF NOT EXISTS directive_refs_entity
                ON directive_refs (entity_kind, entity_id);",
        )?;
        Ok(())
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    /// Store a new Value.
    ///
    /// Returns [`KnowledgeError::DuplicateName`] when the name is taken.
    pub fn put_value(&self, new: NewValue) -> Result<Value, KnowledgeError> {
        if new.embedding.is_empty() {
            return Err(KnowledgeError::DimensionMismatch);
        }
        let conn = self.conn.lock();
        if name_taken(&conn, "ontology_values", &new.name)? {
            return Err(KnowledgeError::DuplicateName {
                kind: EntityKind::Value,
                name: new.name,
            });
        }
        let now = Utc::now();
        let value = Value {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            embedding: new.embedding,
            guidance: new.guidance,
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO ontology_values
                 (id, name, description, embedding, guidance, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                value.id.to_string(),
                value.name,
                value.description,
                embedding_to_bytes(&value.embedding),
                serde_json::to_string(&value.guidance)?,
                ts(&value.created_at),
                ts(&value.updated_at),
            ],
        )?;
        info!(value_id = %value.id, name = %value.name, "value stored");
        Ok(value)
    }

    /// Store a new Belief.
    ///
    /// Every id in `related_values` must name an existing Value, otherwise
    /// [`KnowledgeError::UnknownReference`] is returned and nothing is written.
    pub fn put_belief(&self, new: NewBelief) -> Result<Belief, KnowledgeError> {
        if new.embedding.is_empty() {
            return Err(KnowledgeError::DimensionMismatch);
        }
        let conn = self.conn.lock();
        let id = Uuid::new_v4();
        if name_taken(&conn, "ontology_beliefs", &new.name)? {
            return Err(KnowledgeError::DuplicateName {
                kind: EntityKind::Belief,
                name: new.name,
            });
        }
        check_related_values(&conn, id, &new.related_values)?;

        let now = Utc::now();
        let belief = Belief {
            id,
            name: new.name,
            description: new.description,
            embedding: new.embedding,
            related_values: new.related_values,
            guidance: new.guidance,
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO ontology_beliefs
                 (id, name, description, embedding, related_values, guidance, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                belief.id.to_string(),
                belief.name,
                belief.description,
                embedding_to_bytes(&belief.embedding),
                serde_json::to_string(&belief.related_values)?,
                serde_json::to_string(&belief.guidance)?,
                ts(&belief.created_at),
                ts(&belief.updated_at),
            ],
        )?;
        info!(belief_id = %belief.id, name = %belief.name, "belief stored");
        Ok(belief)
    }

    /// Apply an administrative edit to a Value. Identity and name never change.
    pub fn update_value(&self, id: ValueId, update: ValueUpdate) -> Result<Value, KnowledgeError> {
        let conn = self.conn.lock();
        let mut value = fetch_value(&conn, id)?.ok_or(KnowledgeError::NotFound {
            kind: EntityKind::Value,
            id,
        })?;
        if let Some(description) = update.description {
            value.description = description;
        }
        if let Some(embedding) = update.embedding {
            if embedding.is_empty() {
                return Err(KnowledgeError::DimensionMismatch);
            }
            value.embedding = embedding;
        }
        if let Some(guidance) = update.guidance {
            value.guidance = guidance;
        }
        value.updated_at = Utc::now();
        conn.execute(
            "UPDATE ontology_values
             SET description = ?1, embedding = ?2, guidance = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                value.description,
                embedding_to_bytes(&value.embedding),
                serde_json::to_string(&value.guidance)?,
                ts(&value.updated_at),
                id.to_string(),
            ],
        )?;
        debug!(value_id = %id, "value updated");
        Ok(value)
    }

    /// Apply an administrative edit to a Belief. A replacement
    /// `related_values` set is validated like [`put_belief`](Self::put_belief).
    pub fn update_belief(
        &self,
        id: BeliefId,
        update: BeliefUpdate,
    ) -> Result<Belief, KnowledgeError> {
        let conn = self.conn.lock();
        let mut belief = fetch_belief(&conn, id)?.ok_or(KnowledgeError::NotFound {
            kind: EntityKind::Belief,
            id,
        })?;
        if let Some(related) = update.related_values {
            check_related_values(&conn, id, &related)?;
            belief.related_values = related;
        }
        if let Some(description) = update.description {
            belief.description = description;
        }
        if let Some(embedding) = update.embedding {
            if embedding.is_empty() {
                return Err(KnowledgeError::DimensionMismatch);
            }
            belief.embedding = embedding;
        }
        if let Some(guidance) = update.guidance {
            belief.guidance = guidance;
        }
        belief.updated_at = Utc::now();
        conn.execute(
            "UPDATE ontology_beliefs
             SET description = ?1, embedding = ?2, related_values = ?3, guidance = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                belief.description,
                embedding_to_bytes(&belief.embedding),
                serde_json::to_string(&belief.related_values)?,
                serde_json::to_string(&belief.guidance)?,
                ts(&belief.updated_at),
                id.to_string(),
            ],
        )?;
        debug!(belief_id = %id, "belief updated");
        Ok(belief)
    }

    /// Record that `directive_id` was derived from the given entries. Retained
    /// entries cannot be deleted.
    pub fn retain_for_directive(
        &self,
        directive_id: DirectiveId,
        values: &BTreeSet<ValueId>,
        beliefs: &BTreeSet<BeliefId>,
    ) -> Result<(), KnowledgeError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO directive_refs (directive_id, entity_kind, entity_id)
                 VALUES (?1, ?2, ?3)",
            )?;
            for id in values {
                stmt.execute(params![directive_id.to_string(), "value", id.to_string()])?;
            }
            for id in beliefs {
                stmt.execute(params![directive_id.to_string(), "belief", id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a Value that no Belief or retained Directive references.
    pub fn delete_value(&self, id: ValueId) -> Result<(), KnowledgeError> {
        let conn = self.conn.lock();
        if fetch_value(&conn, id)?.is_none() {
            return Err(KnowledgeError::NotFound {
                kind: EntityKind::Value,
                id,
            });
        }
        let referenced_by_belief = all_beliefs(&conn)?
            .iter()
            .any(|b| b.related_values.contains(&id));
        if referenced_by_belief || retained(&conn, "value", id)? {
            return Err(KnowledgeError::ReferencedByDependent {
                kind: EntityKind::Value,
                id,
            });
        }
        conn.execute(
            "DELETE FROM ontology_values WHERE id = ?1",
            params![id.to_string()],
        )?;
        info!(value_id = %id, "value deleted");
        Ok(())
    }

    /// Delete a Belief that no retained Directive references.
    pub fn delete_belief(&self, id: BeliefId) -> Result<(), KnowledgeError> {
        let conn = self.conn.lock();
        if fetch_belief(&conn, id)?.is_none() {
            return Err(KnowledgeError::NotFound {
                kind: EntityKind::Belief,
                id,
            });
        }
        if retained(&conn, "belief", id)? {
            return Err(KnowledgeError::ReferencedByDependent {
                kind: EntityKind::Belief,
                id,
            });
        }
        conn.execute(
            "DELETE FROM ontology_beliefs WHERE id = ?1",
            params![id.to_string()],
        )?;
        info!(belief_id = %id, "belief deleted");
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    pub fn get_value(&self, id: ValueId) -> Result<Value, KnowledgeError> {
        let conn = self.conn.lock();
        fetch_value(&conn, id)?.ok_or(KnowledgeError::NotFound {
            kind: EntityKind::Value,
            id,
        })
    }

    pub fn get_belief(&self, id: BeliefId) -> Result<Belief, KnowledgeError> {
        let conn = self.conn.lock();
        fetch_belief(&conn, id)?.ok_or(KnowledgeError::NotFound {
            kind: EntityKind::Belief,
            id,
        })
    }

    /// Look a Value up by its unique name.
    pub fn find_value(&self, name: &str) -> Result<Option<Value>, KnowledgeError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {VALUE_COLUMNS} FROM ontology_values WHERE name = ?1");
        Ok(conn.query_row(&sql, params![name], row_to_value).optional()?)
    }

    /// Values in creation order (oldest first).
    pub fn list_values(&self, limit: usize, offset: usize) -> Result<Vec<Value>, KnowledgeError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {VALUE_COLUMNS} FROM ontology_values
             ORDER BY created_at ASC, rowid ASC LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_value)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Beliefs in creation order (oldest first).
    pub fn list_beliefs(&self, limit: usize, offset: usize) -> Result<Vec<Belief>, KnowledgeError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {BELIEF_COLUMNS} FROM ontology_beliefs
             ORDER BY created_at ASC, rowid ASC LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_belief)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Return the `k` Values and Beliefs nearest to `query`, ranked by cosine
    /// similarity (highest first, ties broken by name).
    ///
    /// Entries whose embedding dimension differs from the query are skipped.
    pub fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<KnowledgeMatch>, KnowledgeError> {
        if query.is_empty() {
            return Err(KnowledgeError::DimensionMismatch);
        }
        let (values, beliefs) = {
            let conn = self.conn.lock();
            (all_values(&conn)?, all_beliefs(&conn)?)
        };

        let mut scored: Vec<KnowledgeMatch> = values
            .into_iter()
            .filter(|v| v.embedding.len() == query.len())
            .map(|v| KnowledgeMatch {
                similarity: cosine_similarity(&v.embedding, query),
                entry: KnowledgeEntry::Value(v),
            })
            .chain(
                beliefs
                    .into_iter()
                    .filter(|b| b.embedding.len() == query.len())
                    .map(|b| KnowledgeMatch {
                        similarity: cosine_similarity(&b.embedding, query),
                        entry: KnowledgeEntry::Belief(b),
                    }),
            )
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.name().cmp(b.name()))
        });
        scored.truncate(k);
        Ok(scored)
    }

    pub fn summary(&self) -> Result<OntologySummary, KnowledgeError> {
        let conn = self.conn.lock();
        let total_values: i64 =
            conn.query_row("SELECT COUNT(*) FROM ontology_values", [], |r| r.get(0))?;
        let total_beliefs: i64 =
            conn.query_row("SELECT COUNT(*) FROM ontology_beliefs", [], |r| r.get(0))?;
        Ok(OntologySummary {
            total_values: total_values as usize,
            total_beliefs: total_beliefs as usize,
            ontology_size: (total_values + total_beliefs) as usize,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

fn name_taken(conn: &Connection, table: &str, name: &str) -> Result<bool, KnowledgeError> {
    let sql = format!("SELECT 1 FROM {table} WHERE name = ?1");
    Ok(conn
        .query_row(&sql, params![name], |_| Ok(()))
        .optional()?
        .is_some())
}

fn check_related_values(
    conn: &Connection,
    belief_id: BeliefId,
    related: &BTreeSet<ValueId>,
) -> Result<(), KnowledgeError> {
    for value_id in related {
        if fetch_value(conn, *value_id)?.is_none() {
            return Err(KnowledgeError::UnknownReference {
                kind: EntityKind::Belief,
                id: belief_id,
                missing: *value_id,
            });
        }
    }
    Ok(())
}

fn retained(conn: &Connection, kind: &str, id: Uuid) -> Result<bool, KnowledgeError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM directive_refs WHERE entity_kind = ?1 AND entity_id = ?2 LIMIT 1",
            params![kind, id.to_string()],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn fetch_value(conn: &Connection, id: ValueId) -> Result<Option<Value>, KnowledgeError> {
    let sql = format!("SELECT {VALUE_COLUMNS} FROM ontology_values WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id.to_string()], row_to_value)
        .optional()?)
}

fn fetch_belief(conn: &Connection, id: BeliefId) -> Result<Option<Belief>, KnowledgeError> {
    let sql = format!("SELECT {BELIEF_COLUMNS} FROM ontology_beliefs WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id.to_string()], row_to_belief)
        .optional()?)
}

fn all_values(conn: &Connection) -> Result<Vec<Value>, KnowledgeError> {
    let sql = format!("SELECT {VALUE_COLUMNS} FROM ontology_values ORDER BY rowid ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_value)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn all_beliefs(conn: &Connection) -> Result<Vec<Belief>, KnowledgeError> {
    let sql = format!("SELECT {BELIEF_COLUMNS} FROM ontology_beliefs ORDER BY rowid ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_belief)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn row_to_value(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let blob: Vec<u8> = row.get(3)?;
    Ok(Value {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        embedding: bytes_to_embedding(&blob),
        guidance: json_col(row, 4)?,
        created_at: time_col(row, 5)?,
        updated_at: time_col(row, 6)?,
    })
}

fn row_to_belief(row: &rusqlite::Row<'_>) -> rusqlite::Result<Belief> {
    let blob: Vec<u8> = row.get(3)?;
    Ok(Belief {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        embedding: bytes_to_embedding(&blob),
        related_values: json_col(row, 4)?,
        guidance: json_col(row, 5)?,
        created_at: time_col(row, 6)?,
        updated_at: time_col(row, 7)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mothership_types::Constraint;

    fn kb() -> KnowledgeBase {
        KnowledgeBase::open_in_memory().unwrap()
    }

    fn value(kb: &KnowledgeBase, name: &str, embedding: Vec<f32>) -> Value {
        kb.put_value(NewValue::new(name, format!("{name} description"), embedding))
            .unwrap()
    }

    // ── Values ──────────────────────────────────────────────────────────────

    #[test]
    fn put_and_get_value() {
        let kb = kb();
        let guidance = ConstraintSet::new().with(
            "privacy",
            Constraint::ForbiddenTopic {
                keywords: vec!["password".to_string()],
            },
        );
        let v = kb
            .put_value(NewValue::new("Privacy", "Protect user data", vec![0.2, 0.8]).with_guidance(guidance.clone()))
            .unwrap();
        let back = kb.get_value(v.id).unwrap();
        assert_eq!(back.name, "Privacy");
        assert_eq!(back.embedding, vec![0.2, 0.8]);
        assert_eq!(back.guidance, guidance);
    }

    #[test]
    fn duplicate_value_name_is_rejected() {
        let kb = kb();
        value(&kb, "Fairness", vec![1.0]);
        let err = kb
            .put_value(NewValue::new("Fairness", "again", vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::DuplicateName { kind: EntityKind::Value, .. }));
        assert_eq!(kb.summary().unwrap().total_values, 1);
    }

    #[test]
    fn empty_embedding_is_rejected() {
        let kb = kb();
        let err = kb.put_value(NewValue::new("Empty", "none", vec![])).unwrap_err();
        assert!(matches!(err, KnowledgeError::DimensionMismatch));
    }

    #[test]
    fn get_unknown_value_is_not_found() {
        let err = kb().get_value(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, KnowledgeError::NotFound { .. }));
    }

    #[test]
    fn list_values_pages_in_creation_order() {
        let kb = kb();
        for name in ["a", "b", "c", "d"] {
            value(&kb, name, vec![1.0, 0.0]);
        }
        let page: Vec<String> = kb
            .list_values(2, 1)
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(page, vec!["b", "c"]);
    }

    // ── Beliefs ─────────────────────────────────────────────────────────────

    #[test]
    fn belief_with_existing_values_is_stored() {
        let kb = kb();
        let fairness = value(&kb, "Fairness", vec![1.0, 0.0]);
        let b = kb
            .put_belief(NewBelief::new("Clear Explanations", "Explain steps", vec![0.5, 0.5]).related_to(fairness.id))
            .unwrap();
        let back = kb.get_belief(b.id).unwrap();
        assert!(back.related_values.contains(&fairness.id));
    }

    #[test]
    fn belief_with_unknown_value_is_rejected_and_not_written() {
        let kb = kb();
        let fairness = value(&kb, "Fairness", vec![1.0, 0.0]);
        let ghost = Uuid::new_v4();
        let err = kb
            .put_belief(
                NewBelief::new("Orphan", "refers to nothing", vec![0.5, 0.5])
                    .related_to(fairness.id)
                    .related_to(ghost),
            )
            .unwrap_err();
        match err {
            KnowledgeError::UnknownReference { missing, .. } => assert_eq!(missing, ghost),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(kb.summary().unwrap().total_beliefs, 0);
    }

    #[test]
    fn update_belief_revalidates_related_values() {
        let kb = kb();
        let b = kb
            .put_belief(NewBelief::new("Standalone", "no values", vec![1.0]))
            .unwrap();
        let err = kb
            .update_belief(
                b.id,
                BeliefUpdate {
                    related_values: Some([Uuid::new_v4()].into_iter().collect()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::UnknownReference { .. }));
        assert!(kb.get_belief(b.id).unwrap().related_values.is_empty());
    }

    // ── Similarity search ───────────────────────────────────────────────────

    #[test]
    fn similarity_search_ranks_values_and_beliefs_together() {
        let kb = kb();
        let near = value(&kb, "Near", vec![1.0, 0.0, 0.0]);
        value(&kb, "Far", vec![0.0, 0.0, 1.0]);
        kb.put_belief(NewBelief::new("Middle", "", vec![1.0, 1.0, 0.0]).related_to(near.id))
            .unwrap();

        let hits = kb.similarity_search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].name(), "Near");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].name(), "Middle");
        assert!(matches!(hits[1].entry, KnowledgeEntry::Belief(_)));
    }

    #[test]
    fn similarity_ties_break_by_name() {
        let kb = kb();
        value(&kb, "zeta", vec![1.0, 0.0]);
        value(&kb, "alpha", vec![2.0, 0.0]);
        let hits = kb.similarity_search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(hits[0].name(), "alpha");
        assert_eq!(hits[1].name(), "zeta");
    }

    #[test]
    fn similarity_search_skips_mismatched_dimensions() {
        let kb = kb();
        value(&kb, "3d", vec![1.0, 0.0, 0.0]);
        assert!(kb.similarity_search(&[1.0, 0.0], 5).unwrap().is_empty());
        assert!(matches!(
            kb.similarity_search(&[], 5).unwrap_err(),
            KnowledgeError::DimensionMismatch
        ));
    }

    // ── Deletion guards ─────────────────────────────────────────────────────

    #[test]
    fn delete_value_blocked_by_belief() {
        let kb = kb();
        let v = value(&kb, "Fairness", vec![1.0]);
        kb.put_belief(NewBelief::new("B", "", vec![1.0]).related_to(v.id))
            .unwrap();
        let err = kb.delete_value(v.id).unwrap_err();
        assert!(matches!(err, KnowledgeError::ReferencedByDependent { .. }));
    }

    #[test]
    fn delete_value_blocked_by_retained_directive() {
        let kb = kb();
        let v = value(&kb, "Fairness", vec![1.0]);
        let directive = Uuid::new_v4();
        kb.retain_for_directive(directive, &[v.id].into_iter().collect(), &BTreeSet::new())
            .unwrap();
        let err = kb.delete_value(v.id).unwrap_err();
        assert!(matches!(err, KnowledgeError::ReferencedByDependent { .. }));
    }

    #[test]
    fn unreferenced_value_can_be_deleted() {
        let kb = kb();
        let v = value(&kb, "Loose", vec![1.0]);
        kb.delete_value(v.id).unwrap();
        assert!(matches!(
            kb.get_value(v.id).unwrap_err(),
            KnowledgeError::NotFound { .. }
        ));
    }

    #[test]
    fn description_edit_keeps_identity() {
        let kb = kb();
        let v = value(&kb, "Fairness", vec![1.0, 0.0]);
        let updated = kb
            .update_value(
                v.id,
                ValueUpdate {
                    description: Some("Equal treatment".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.id, v.id);
        assert_eq!(updated.name, "Fairness");
        assert_eq!(kb.get_value(v.id).unwrap().description, "Equal treatment");
        assert_eq!(kb.find_value("Fairness").unwrap().map(|v| v.id), Some(v.id));
    }

    #[test]
    fn summary_counts_both_kinds() {
        let kb = kb();
        let v = value(&kb, "A", vec![1.0]);
        kb.put_belief(NewBelief::new("B", "", vec![1.0]).related_to(v.id))
            .unwrap();
        let s = kb.summary().unwrap();
        assert_eq!(
            s,
            OntologySummary {
                total_values: 1,
                total_beliefs: 1,
                ontology_size: 2
            }
        );
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.sqlite3");
        let path = path.to_str().unwrap();
        let id = {
            let kb = KnowledgeBase::open(path).unwrap();
            value(&kb, "Persistent", vec![0.1, 0.2]).id
        };
        let kb = KnowledgeBase::open(path).unwrap();
        assert_eq!(kb.get_value(id).unwrap().embedding, vec![0.1, 0.2]);
    }

    #[test]
    fn knowledge_error_maps_to_global_error() {
        let err: MothershipError = KnowledgeError::DuplicateName {
            kind: EntityKind::Belief,
            name: "x".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "duplicate_name");
    }
}
