//! Embedded store adapter for offline and demo operation.
//!
//! Rows live in a single sled tree keyed `<table>/<id>`, with secondary
//! index entries under `idx/<table>/<field>/<value>\0<id>` for the fields
//! each entity declares as indexed. Keeping everything in one tree lets a
//! write batch commit through one sled transaction, all-or-nothing.
//!
//! Change subscriptions ride sled's native watch mechanism: the first
//! subscriber for a table spawns a blocking task that forwards watch events
//! into the shared [`ChangeHub`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use tracing::{debug, warn};

use crate::schema::{EntityKind, Record};

use super::changes::{ChangeHub, ChangeOp, TableChange, TableSubscription};
use super::{
    ensure_row_id, matches_filters, merge_patch, require_fields, stamp_create, stamp_update,
    DataStore, ListFilter, StoreError, WriteOp,
};

/// Separator between an index value and the row id it points at.
/// NUL cannot appear in JSON string content, so prefixes stay unambiguous.
const INDEX_SEP: char = '\u{0}';

pub struct LocalStore {
    // Held so the database stays open for the lifetime of the store.
    _db: sled::Db,
    tree: sled::Tree,
    hub: Arc<ChangeHub>,
    watched: Mutex<HashSet<&'static str>>,
}

impl LocalStore {
    /// Open (or create) the embedded database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// An in-memory throwaway database, used by tests and demo mode.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree("records")?;
        Ok(Self {
            _db: db,
            tree,
            hub: Arc::new(ChangeHub::new()),
            watched: Mutex::new(HashSet::new()),
        })
    }

    fn row_key(kind: EntityKind, id: &str) -> Vec<u8> {
        format!("{}/{}", kind.table(), id).into_bytes()
    }

    fn table_prefix(kind: EntityKind) -> String {
        format!("{}/", kind.table())
    }

    /// Stable text form of a filterable value for index keys.
    fn index_repr(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn index_key(kind: EntityKind, field: &str, value: &Value, id: &str) -> Vec<u8> {
        format!(
            "idx/{}/{}/{}{}{}",
            kind.table(),
            field,
            Self::index_repr(value),
            INDEX_SEP,
            id
        )
        .into_bytes()
    }

    fn index_prefix(kind: EntityKind, field: &str, value: &Value) -> Vec<u8> {
        format!(
            "idx/{}/{}/{}{}",
            kind.table(),
            field,
            Self::index_repr(value),
            INDEX_SEP
        )
        .into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Record, StoreError> {
        let value: Value = serde_json::from_slice(bytes)?;
        match value {
            Value::Object(record) => Ok(record),
            _ => Err(StoreError::NotAnObject),
        }
    }

    /// Reconcile index entries for one row inside a transaction.
    fn sync_indexes(
        tx: &TransactionalTree,
        kind: EntityKind,
        id: &str,
        old: Option<&Record>,
        new: Option<&Record>,
    ) -> Result<(), sled::transaction::UnabortableTransactionError> {
        for field in kind.indexed_fields() {
            let old_value = old.and_then(|r| r.get(*field)).filter(|v| !v.is_null());
            let new_value = new.and_then(|r| r.get(*field)).filter(|v| !v.is_null());
            if old_value == new_value {
                continue;
            }
            if let Some(value) = old_value {
                tx.remove(Self::index_key(kind, field, value, id))?;
            }
            if let Some(value) = new_value {
                tx.insert(Self::index_key(kind, field, value, id), id.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Apply one write inside the transaction. The abort payload carries the
    /// op index so batch callers can report how far they got.
    fn apply_op(
        tx: &TransactionalTree,
        index: usize,
        op: &WriteOp,
    ) -> Result<Option<Record>, ConflictableTransactionError<(usize, StoreError)>> {
        let abort = |e: StoreError| ConflictableTransactionError::Abort((index, e));

        match op {
            WriteOp::Create { kind, row } => {
                let kind = *kind;
                let mut row = row.clone();
                let id = ensure_row_id(kind, &mut row).map_err(abort)?;
                require_fields(kind, &row).map_err(abort)?;
                stamp_create(kind, &mut row);
                let key = Self::row_key(kind, &id);
                if tx.get(&key)?.is_some() {
                    return Err(abort(StoreError::Constraint {
                        table: kind.table(),
                        message: format!("duplicate id '{}'", id),
                    }));
                }
                let bytes = serde_json::to_vec(&row).map_err(|e| abort(e.into()))?;
                tx.insert(key, bytes)?;
                Self::sync_indexes(tx, kind, &id, None, Some(&row))?;
                Ok(Some(row))
            }
            WriteOp::Upsert { kind, row } => {
                let kind = *kind;
                let mut row = row.clone();
                let id = ensure_row_id(kind, &mut row).map_err(abort)?;
                let key = Self::row_key(kind, &id);
                let (old, merged) = match tx.get(&key)? {
                    Some(bytes) => {
                        let existing = Self::decode(&bytes).map_err(abort)?;
                        let mut merged =
                            merge_patch(kind, &existing, &row).map_err(abort)?;
                        stamp_update(kind, &mut merged);
                        (Some(existing), merged)
                    }
                    None => {
                        stamp_create(kind, &mut row);
                        (None, row)
                    }
                };
                require_fields(kind, &merged).map_err(abort)?;
                let bytes = serde_json::to_vec(&merged).map_err(|e| abort(e.into()))?;
                tx.insert(key, bytes)?;
                Self::sync_indexes(tx, kind, &id, old.as_ref(), Some(&merged))?;
                Ok(Some(merged))
            }
            WriteOp::Update { kind, id, patch } => {
                let kind = *kind;
                let key = Self::row_key(kind, id);
                let existing = match tx.get(&key)? {
                    Some(bytes) => Self::decode(&bytes).map_err(abort)?,
                    None => {
                        return Err(abort(StoreError::RowNotFound {
                            table: kind.table(),
                            id: id.clone(),
                        }))
                    }
                };
                let mut merged = merge_patch(kind, &existing, patch).map_err(abort)?;
                stamp_update(kind, &mut merged);
                let bytes = serde_json::to_vec(&merged).map_err(|e| abort(e.into()))?;
                tx.insert(key, bytes)?;
                Self::sync_indexes(tx, kind, id, Some(&existing), Some(&merged))?;
                Ok(Some(merged))
            }
            WriteOp::Delete { kind, id } => {
                let kind = *kind;
                let key = Self::row_key(kind, id);
                match tx.get(&key)? {
                    Some(bytes) => {
                        let existing = Self::decode(&bytes).map_err(abort)?;
                        Self::sync_indexes(tx, kind, id, Some(&existing), None)?;
                        tx.remove(key)?;
                    }
                    None => {} // deleting a missing row is a no-op
                }
                Ok(None)
            }
        }
    }

    /// Run a batch through one sled transaction: every op commits or none do.
    fn run_batch(&self, ops: &[WriteOp]) -> Result<Vec<Option<Record>>, StoreError> {
        let result = self.tree.transaction(|tx| {
            let mut results = Vec::with_capacity(ops.len());
            for (index, op) in ops.iter().enumerate() {
                results.push(Self::apply_op(tx, index, op)?);
            }
            Ok(results)
        });
        match result {
            Ok(results) => Ok(results),
            Err(TransactionError::Abort((index, source))) => Err(StoreError::BatchFailed {
                index,
                source: Box::new(source),
            }),
            Err(TransactionError::Storage(e)) => Err(StoreError::Sled(e)),
        }
    }

    /// Single-op callers want the underlying error, not the batch wrapper.
    fn unwrap_single(err: StoreError) -> StoreError {
        match err {
            StoreError::BatchFailed { source, .. } => *source,
            other => other,
        }
    }

    async fn run_single(&self, op: WriteOp) -> Result<Option<Record>, StoreError> {
        let mut results = self
            .run_batch(std::slice::from_ref(&op))
            .map_err(Self::unwrap_single)?;
        self.tree.flush_async().await?;
        Ok(results.pop().flatten())
    }

    /// Spawn the watch-forwarding task for a table, once.
    fn ensure_watcher(&self, kind: EntityKind) {
        let mut watched = self.watched.lock().expect("watcher set lock poisoned");
        if !watched.insert(kind.table()) {
            return;
        }
        let prefix = Self::table_prefix(kind);
        let subscriber = self.tree.watch_prefix(prefix.as_bytes());
        let hub = Arc::clone(&self.hub);
        let table = kind.table();
        tokio::task::spawn_blocking(move || {
            for event in subscriber {
                let change = match event {
                    sled::Event::Insert { key, value } => {
                        let row = match Self::decode(&value) {
                            Ok(record) => Value::Object(record),
                            Err(e) => {
                                warn!(table, error = %e, "undecodable row in watch event");
                                continue;
                            }
                        };
                        TableChange {
                            table: table.to_string(),
                            op: ChangeOp::Upsert,
                            row_id: row_id_from_key(&key, &prefix),
                            row: Some(row),
                        }
                    }
                    sled::Event::Remove { key } => TableChange {
                        table: table.to_string(),
                        op: ChangeOp::Delete,
                        row_id: row_id_from_key(&key, &prefix),
                        row: None,
                    },
                };
                hub.publish(change);
            }
            debug!(table, "watch task finished");
        });
    }
}

fn row_id_from_key(key: &[u8], prefix: &str) -> String {
    let raw = key.strip_prefix(prefix.as_bytes()).unwrap_or(key);
    String::from_utf8_lossy(raw).into_owned()
}

#[async_trait]
impl DataStore for LocalStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Record>, StoreError> {
        match self.tree.get(Self::row_key(kind, id))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, kind: EntityKind, row: Record) -> Result<Record, StoreError> {
        let created = self.run_single(WriteOp::Create { kind, row }).await?;
        created.ok_or(StoreError::NotAnObject)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: Record,
    ) -> Result<Record, StoreError> {
        let updated = self
            .run_single(WriteOp::Update {
                kind,
                id: id.to_string(),
                patch,
            })
            .await?;
        updated.ok_or(StoreError::NotAnObject)
    }

    async fn list(&self, kind: EntityKind, filters: &ListFilter) -> Result<Vec<Record>, StoreError> {
        // Prefer an indexed prefix scan when any filter covers an indexed
        // field; the remaining filters apply to the fetched rows.
        let indexed = filters
            .iter()
            .find(|(field, _)| kind.indexed_fields().contains(&field.as_str()));

        let mut rows = Vec::new();
        if let Some((field, value)) = indexed {
            debug!(table = kind.table(), field = %field, "list via index scan");
            for entry in self.tree.scan_prefix(Self::index_prefix(kind, field, value)) {
                let (_, id_bytes) = entry?;
                let id = String::from_utf8_lossy(&id_bytes).into_owned();
                if let Some(row) = self.get(kind, &id).await? {
                    if matches_filters(&row, filters) {
                        rows.push(row);
                    }
                }
            }
        } else {
            debug!(table = kind.table(), "list via table scan");
            for entry in self.tree.scan_prefix(Self::table_prefix(kind).as_bytes()) {
                let (_, bytes) = entry?;
                let row = Self::decode(&bytes)?;
                if matches_filters(&row, filters) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        self.run_single(WriteOp::Delete {
            kind,
            id: id.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn apply_batch(&self, ops: Vec<WriteOp>) -> Result<Vec<Record>, StoreError> {
        let results = self.run_batch(&ops)?;
        self.tree.flush_async().await?;
        Ok(results.into_iter().flatten().collect())
    }

    fn subscribe(&self, table: &str) -> Result<TableSubscription, StoreError> {
        let kind = EntityKind::from_table(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        self.ensure_watcher(kind);
        Ok(self.hub.subscribe(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn record(value: Value) -> Record {
        value.as_object().expect("test fixture must be an object").clone()
    }

    fn store() -> LocalStore {
        LocalStore::temporary().expect("temporary store")
    }

    fn household() -> Record {
        record(json!({"household_id": "h1", "address_line1": "123 Main St"}))
    }

    #[tokio::test]
    async fn test_create_then_get_round_trip() {
        let store = store();
        let created = store.create(EntityKind::Household, household()).await.unwrap();
        assert!(created.contains_key("created_at"));
        assert!(created.contains_key("updated_at"));

        let fetched = store.get(EntityKind::Household, "h1").await.unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_get_missing_id_is_none() {
        let store = store();
        let fresh_id = Uuid::new_v4().to_string();
        assert!(store
            .get(EntityKind::Household, &fresh_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_create_generates_id_when_absent() {
        let store = store();
        let created = store
            .create(
                EntityKind::Household,
                record(json!({"address_line1": "9 Elm Ave"})),
            )
            .await
            .unwrap();
        let id = created.get("household_id").and_then(Value::as_str).unwrap();
        assert!(store.get(EntityKind::Household, id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_create_is_a_constraint_violation() {
        let store = store();
        store.create(EntityKind::Household, household()).await.unwrap();
        let err = store.create(EntityKind::Household, household()).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }));
    }

    #[tokio::test]
    async fn test_create_missing_required_field() {
        let store = store();
        let err = store
            .create(EntityKind::Household, record(json!({"city": "Macon"})))
            .await
            .unwrap_err();
        match err {
            StoreError::MissingField { field, .. } => assert_eq!(field, "address_line1"),
            other => panic!("expected MissingField, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_merges_partial_record() {
        let store = store();
        store.create(EntityKind::Household, household()).await.unwrap();
        let updated = store
            .update(
                EntityKind::Household,
                "h1",
                record(json!({"city": "Macon"})),
            )
            .await
            .unwrap();
        assert_eq!(updated.get("address_line1"), Some(&json!("123 Main St")));
        assert_eq!(updated.get("city"), Some(&json!("Macon")));

        let err = store
            .update(EntityKind::Household, "nope", record(json!({"city": "X"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store();
        store.create(EntityKind::Household, household()).await.unwrap();
        store.delete(EntityKind::Household, "h1").await.unwrap();
        assert!(store.get(EntityKind::Household, "h1").await.unwrap().is_none());
        // Second delete of the same id is a no-op, not an error.
        store.delete(EntityKind::Household, "h1").await.unwrap();
    }

    async fn seed_children(store: &LocalStore) {
        for (id, household_id) in [("c1", "h1"), ("c2", "h1"), ("c3", "h2")] {
            store
                .create(
                    EntityKind::Child,
                    record(json!({
                        "child_id": id,
                        "first_name": "Kid",
                        "last_name": id,
                        "household_id": household_id
                    })),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_list_uses_index_for_indexed_field() {
        let store = store();
        seed_children(&store).await;
        let mut filters = ListFilter::new();
        filters.insert("household_id".to_string(), json!("h1"));
        let rows = store.list(EntityKind::Child, &filters).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.get("household_id") == Some(&json!("h1"))));
    }

    #[tokio::test]
    async fn test_list_falls_back_to_scan_for_unindexed_field() {
        let store = store();
        seed_children(&store).await;
        let mut filters = ListFilter::new();
        filters.insert("last_name".to_string(), json!("c3"));
        let rows = store.list(EntityKind::Child, &filters).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("child_id"), Some(&json!("c3")));
    }

    #[tokio::test]
    async fn test_index_follows_updates_and_deletes() {
        let store = store();
        seed_children(&store).await;
        store
            .update(
                EntityKind::Child,
                "c3",
                record(json!({"household_id": "h1"})),
            )
            .await
            .unwrap();
        store.delete(EntityKind::Child, "c1").await.unwrap();

        let mut filters = ListFilter::new();
        filters.insert("household_id".to_string(), json!("h1"));
        let rows = store.list(EntityKind::Child, &filters).await.unwrap();
        let ids: Vec<_> = rows
            .iter()
            .map(|r| r.get("child_id").and_then(Value::as_str).unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["c2", "c3"]);

        filters.insert("household_id".to_string(), json!("h2"));
        assert!(store.list(EntityKind::Child, &filters).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let store = store();
        store.create(EntityKind::Household, household()).await.unwrap();

        // Second op fails (duplicate household), so the guardian from the
        // first op must not be visible afterwards.
        let err = store
            .apply_batch(vec![
                WriteOp::Create {
                    kind: EntityKind::Guardian,
                    row: record(json!({
                        "guardian_id": "g1",
                        "first_name": "Dana",
                        "last_name": "Whitfield",
                        "mobile_phone": "555-867-5309",
                        "household_id": "h1"
                    })),
                },
                WriteOp::Create {
                    kind: EntityKind::Household,
                    row: household(),
                },
            ])
            .await
            .unwrap_err();
        match err {
            StoreError::BatchFailed { index, source } => {
                assert_eq!(index, 1);
                assert!(matches!(*source, StoreError::Constraint { .. }));
            }
            other => panic!("expected BatchFailed, got {:?}", other),
        }
        assert!(store.get(EntityKind::Guardian, "g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_upsert_merges_into_existing() {
        let store = store();
        store.create(EntityKind::Household, household()).await.unwrap();
        let rows = store
            .apply_batch(vec![WriteOp::Upsert {
                kind: EntityKind::Household,
                row: record(json!({"household_id": "h1", "address_line1": "123 Main St", "city": "Macon"})),
            }])
            .await
            .unwrap();
        assert_eq!(rows[0].get("city"), Some(&json!("Macon")));
        let fetched = store.get(EntityKind::Household, "h1").await.unwrap().unwrap();
        assert_eq!(fetched.get("city"), Some(&json!("Macon")));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_changes() {
        let store = store();
        let mut sub = store.subscribe("households").unwrap();
        store.create(EntityKind::Household, household()).await.unwrap();
        let change = sub.next().await.expect("expected an upsert change");
        assert_eq!(change.op, ChangeOp::Upsert);
        assert_eq!(change.row_id, "h1");
        assert!(change.row.is_some());

        store.delete(EntityKind::Household, "h1").await.unwrap();
        let change = sub.next().await.expect("expected a delete change");
        assert_eq!(change.op, ChangeOp::Delete);
        assert_eq!(change.row_id, "h1");
    }

    #[tokio::test]
    async fn test_subscribe_unknown_table() {
        let store = store();
        assert!(matches!(
            store.subscribe("not_a_table"),
            Err(StoreError::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn test_timestamps_respect_capability_map() {
        let store = store();
        let row = store
            .create(
                EntityKind::Attendance,
                record(json!({"child_id": "c1", "event_id": "e1"})),
            )
            .await
            .unwrap();
        assert!(row.contains_key("created_at"));
        assert!(!row.contains_key("updated_at"));
    }
}
