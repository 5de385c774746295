//! The store contract: one logical persistence API, two backends.
//!
//! `DataStore` is implemented by [`LocalStore`](local::LocalStore) (embedded
//! sled database, offline/demo mode) and [`RemoteStore`](remote::RemoteStore)
//! (hosted relational store behind a REST surface, production). Callers go
//! through the [`DataAccess`](crate::facade::DataAccess) facade, which picks
//! one adapter at startup and never swaps it mid-session.
//!
//! The write batch (`apply_batch`) is the transaction primitive. On the
//! local store it is fully atomic; on the remote store operations are issued
//! sequentially and a failure partway leaves earlier writes committed. That
//! asymmetry is accepted and surfaced through `StoreError::BatchFailed`.

pub mod changes;
pub mod local;
pub mod remote;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::schema::{EntityKind, Record};

pub use changes::{ChangeOp, TableChange, TableSubscription};
pub use local::LocalStore;
pub use remote::RemoteStore;

/// Equality filters for `list`, keyed by canonical field name.
pub type ListFilter = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{table} record is missing required field '{field}'")]
    MissingField { table: &'static str, field: String },

    #[error("constraint violation on {table}: {message}")]
    Constraint { table: &'static str, message: String },

    #[error("no {table} row with id '{id}'")]
    RowNotFound { table: &'static str, id: String },

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("row is not a JSON object")]
    NotAnObject,

    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("remote store rejected the request ({status}): {body}")]
    Remote { status: u16, body: String },

    #[error("unexpected remote response: {0}")]
    InvalidResponse(String),

    #[error("batch failed at operation {index}: {source}")]
    BatchFailed {
        index: usize,
        #[source]
        source: Box<StoreError>,
    },
}

/// Maximum length for error response bodies kept in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl StoreError {
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        // Back off to a char boundary; slicing mid-character panics.
        let mut cut = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!(
            "{}... (truncated, {} total bytes)",
            &body[..cut],
            body.len()
        )
    }

    /// Map a non-success HTTP status to the store error taxonomy.
    ///
    /// 409 is the remote store reporting a duplicate key or broken foreign
    /// key; everything else is a transport-level rejection.
    pub fn from_status(table: &'static str, status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            409 => StoreError::Constraint {
                table,
                message: truncated,
            },
            _ => StoreError::Remote {
                status: status.as_u16(),
                body: truncated,
            },
        }
    }
}

/// One write in a batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a new row; duplicate id is a constraint violation.
    Create { kind: EntityKind, row: Record },
    /// Insert, or merge into the existing row with the same id. A partial
    /// row is fine when the id already exists; a partial row for a new id
    /// fails the required-field check locally and the destination table's
    /// column constraints remotely.
    Upsert { kind: EntityKind, row: Record },
    /// Merge a partial record into an existing row.
    Update {
        kind: EntityKind,
        id: String,
        patch: Record,
    },
    /// Remove a row; missing id is a no-op.
    Delete { kind: EntityKind, id: String },
}

/// The shared persistence contract both adapters implement.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetch one row by id. A missing id is `Ok(None)`, not an error.
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Record>, StoreError>;

    /// Insert a new row, generating the id when absent.
    async fn create(&self, kind: EntityKind, row: Record) -> Result<Record, StoreError>;

    /// Merge `patch` into the existing row and return the merged row.
    async fn update(&self, kind: EntityKind, id: &str, patch: Record)
        -> Result<Record, StoreError>;

    /// Rows matching every equality filter; all rows when `filters` is empty.
    async fn list(&self, kind: EntityKind, filters: &ListFilter) -> Result<Vec<Record>, StoreError>;

    /// Remove a row. Deleting a missing id is a no-op.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError>;

    /// Run a batch of writes as one logical unit, returning the rows each
    /// write produced (deletes yield nothing). Atomic on the local store;
    /// best-effort sequential on the remote store.
    async fn apply_batch(&self, ops: Vec<WriteOp>) -> Result<Vec<Record>, StoreError>;

    /// Register a change listener for one logical table.
    fn subscribe(&self, table: &str) -> Result<TableSubscription, StoreError>;
}

// ===== Shared row helpers =====

/// Read the row's id, requiring it to be a non-empty string when present.
pub(crate) fn row_id(kind: EntityKind, row: &Record) -> Result<Option<String>, StoreError> {
    match row.get(kind.id_field()) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
        Some(_) => Err(StoreError::Constraint {
            table: kind.table(),
            message: format!("{} must be a non-empty string", kind.id_field()),
        }),
    }
}

/// Ensure the row carries an id, generating a v4 uuid when absent.
pub(crate) fn ensure_row_id(kind: EntityKind, row: &mut Record) -> Result<String, StoreError> {
    if let Some(id) = row_id(kind, row)? {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    row.insert(kind.id_field().to_string(), Value::String(id.clone()));
    Ok(id)
}

/// Reject rows missing a minimal identifying field.
pub(crate) fn require_fields(kind: EntityKind, row: &Record) -> Result<(), StoreError> {
    for field in kind.required_fields() {
        let blank = match row.get(*field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        if blank {
            return Err(StoreError::MissingField {
                table: kind.table(),
                field: (*field).to_string(),
            });
        }
    }
    Ok(())
}

/// Stamp creation timestamps adapter-side.
///
/// Tables without an `updated_at` column must not receive the field at all.
pub(crate) fn stamp_create(kind: EntityKind, row: &mut Record) {
    let now = Utc::now().to_rfc3339();
    row.entry("created_at".to_string())
        .or_insert_with(|| Value::String(now.clone()));
    if kind.has_updated_at() {
        row.insert("updated_at".to_string(), Value::String(now));
    }
}

/// Stamp the update timestamp where the table carries the column.
pub(crate) fn stamp_update(kind: EntityKind, row: &mut Record) {
    if kind.has_updated_at() {
        row.insert(
            "updated_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }
}

/// Merge a patch into an existing row. The primary key cannot be changed.
pub(crate) fn merge_patch(
    kind: EntityKind,
    existing: &Record,
    patch: &Record,
) -> Result<Record, StoreError> {
    if let Some(patched_id) = row_id(kind, patch)? {
        if let Some(current_id) = row_id(kind, existing)? {
            if patched_id != current_id {
                return Err(StoreError::Constraint {
                    table: kind.table(),
                    message: format!("{} cannot be changed by an update", kind.id_field()),
                });
            }
        }
    }
    let mut merged = existing.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    Ok(merged)
}

/// True when the row satisfies every equality filter.
pub(crate) fn matches_filters(row: &Record, filters: &ListFilter) -> bool {
    filters.iter().all(|(field, expected)| row.get(field) == Some(expected))
}
