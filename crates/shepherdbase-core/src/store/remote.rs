//! Remote store adapter for production operation.
//!
//! Every CRUD call is one round trip against the hosted store's REST
//! surface: `{base}/rest/v1/{table}` with `column=eq.value` filter
//! predicates, a service key sent as both `apikey` and bearer token, and
//! `Prefer: return=representation` so writes echo the stored row back.
//!
//! Timestamps are stamped adapter-side before transmission; tables without
//! an `updated_at` column never receive the field (see
//! [`EntityKind::has_updated_at`]). Write batches are issued sequentially
//! and are best-effort only: a failure partway leaves earlier operations
//! committed, surfaced as `StoreError::BatchFailed`. The adapter performs
//! no automatic retries; callers re-invoke on transient failure.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::{debug, warn};

use crate::schema::{EntityKind, Record};

use super::changes::{ChangeHub, TableChange, TableSubscription};
use super::{
    ensure_row_id, require_fields, stamp_create, stamp_update, DataStore, ListFilter, StoreError,
    WriteOp,
};

/// HTTP request timeout in seconds.
/// 30s allows for slow responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct RemoteStore {
    client: Client,
    base_url: String,
    service_key: String,
    hub: Arc<ChangeHub>,
    /// Tables with a running change-feed task. A table is removed again
    /// when its task exits, so a later subscribe can restart the feed.
    streaming: Arc<Mutex<HashSet<&'static str>>>,
}

impl RemoteStore {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            client,
            base_url,
            service_key: service_key.into(),
            hub: Arc::new(ChangeHub::new()),
            streaming: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn stream_url(&self, table: &str) -> String {
        format!("{}/realtime/v1/stream?table={}", self.base_url, table)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, StoreError> {
        let mut headers = header::HeaderMap::new();
        let key = header::HeaderValue::from_str(&self.service_key)
            .map_err(|_| StoreError::InvalidResponse("service key is not a valid header value".into()))?;
        headers.insert("apikey", key);
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", self.service_key))
                .map_err(|_| StoreError::InvalidResponse("service key is not a valid header value".into()))?,
        );
        Ok(headers)
    }

    /// Equality predicates in the remote store's `column=eq.value` form.
    fn filter_params(filters: &ListFilter) -> Vec<(String, String)> {
        filters
            .iter()
            .map(|(field, value)| {
                let repr = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (field.clone(), format!("eq.{}", repr))
            })
            .collect()
    }

    async fn check_response(
        table: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, StoreError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::from_status(table, status, &body))
        }
    }

    /// Parse the row array a write with `return=representation` echoes back.
    async fn read_rows(
        table: &'static str,
        response: reqwest::Response,
    ) -> Result<Vec<Record>, StoreError> {
        let rows: Vec<Value> = response.json().await?;
        rows.into_iter()
            .map(|row| match row {
                Value::Object(record) => Ok(record),
                _ => Err(StoreError::InvalidResponse(format!(
                    "{} row is not a JSON object",
                    table
                ))),
            })
            .collect()
    }

    async fn create_row(&self, kind: EntityKind, mut row: Record) -> Result<Record, StoreError> {
        ensure_row_id(kind, &mut row)?;
        require_fields(kind, &row)?;
        stamp_create(kind, &mut row);
        self.insert_row(kind, row, false).await
    }

    /// Partial rows are allowed here: on conflict the destination merges
    /// the payload into the existing row, and for a genuinely new row its
    /// column constraints reject missing required columns. `created_at` is
    /// never sent, so a merge cannot clobber the stored value; the column
    /// default fills it for new rows.
    async fn upsert_row(&self, kind: EntityKind, mut row: Record) -> Result<Record, StoreError> {
        ensure_row_id(kind, &mut row)?;
        row.remove("created_at");
        stamp_update(kind, &mut row);
        self.insert_row(kind, row, true).await
    }

    async fn insert_row(
        &self,
        kind: EntityKind,
        row: Record,
        upsert: bool,
    ) -> Result<Record, StoreError> {
        let url = self.rest_url(kind.table());
        debug!(table = kind.table(), upsert, "remote insert");
        let mut request = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(&vec![Value::Object(row)]);
        if upsert {
            request = request
                .query(&[("on_conflict", kind.id_field())])
                .header("Prefer", "resolution=merge-duplicates,return=representation");
        } else {
            request = request.header("Prefer", "return=representation");
        }
        let response = request.send().await?;
        let response = Self::check_response(kind.table(), response).await?;
        let mut rows = Self::read_rows(kind.table(), response).await?;
        rows.pop().ok_or_else(|| {
            StoreError::InvalidResponse(format!("{} write returned no representation", kind.table()))
        })
    }

    async fn update_row(
        &self,
        kind: EntityKind,
        id: &str,
        mut patch: Record,
    ) -> Result<Record, StoreError> {
        stamp_update(kind, &mut patch);
        let url = self.rest_url(kind.table());
        debug!(table = kind.table(), id, "remote update");
        let response = self
            .client
            .patch(&url)
            .headers(self.auth_headers()?)
            .query(&[(kind.id_field(), &format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(&Value::Object(patch))
            .send()
            .await?;
        let response = Self::check_response(kind.table(), response).await?;
        let mut rows = Self::read_rows(kind.table(), response).await?;
        rows.pop().ok_or_else(|| StoreError::RowNotFound {
            table: kind.table(),
            id: id.to_string(),
        })
    }

    async fn delete_row(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let url = self.rest_url(kind.table());
        debug!(table = kind.table(), id, "remote delete");
        let response = self
            .client
            .delete(&url)
            .headers(self.auth_headers()?)
            .query(&[(kind.id_field(), &format!("eq.{}", id))])
            .send()
            .await?;
        // A delete matching zero rows still succeeds: missing id is a no-op.
        Self::check_response(kind.table(), response).await?;
        Ok(())
    }

    /// Start the change-feed task for a table, once. The feed is a
    /// newline-delimited JSON stream of [`TableChange`]s keyed by table.
    /// When the task exits (rejection, disconnect, end of stream) the table
    /// is released so the next subscribe re-establishes the feed.
    fn ensure_stream(&self, kind: EntityKind) {
        let table = kind.table();
        if !self
            .streaming
            .lock()
            .expect("stream set lock poisoned")
            .insert(table)
        {
            return;
        }
        let headers = match self.auth_headers() {
            Ok(headers) => headers,
            Err(e) => {
                warn!(table, error = %e, "cannot start change feed");
                self.streaming
                    .lock()
                    .expect("stream set lock poisoned")
                    .remove(table);
                return;
            }
        };
        let url = self.stream_url(table);
        let client = self.client.clone();
        let hub = Arc::clone(&self.hub);
        let streaming = Arc::clone(&self.streaming);
        tokio::spawn(async move {
            run_change_feed(client, url, headers, table, &hub).await;
            streaming
                .lock()
                .expect("stream set lock poisoned")
                .remove(table);
        });
    }
}

async fn run_change_feed(
    client: Client,
    url: String,
    headers: header::HeaderMap,
    table: &'static str,
    hub: &ChangeHub,
) {
    let response = match client.get(&url).headers(headers).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(table, status = %response.status(), "change feed rejected");
            return;
        }
        Err(e) => {
            warn!(table, error = %e, "change feed connection failed");
            return;
        }
    };
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(table, error = %e, "change feed interrupted");
                return;
            }
        };
        buffer.extend_from_slice(&chunk);
        for change in drain_feed_lines(&mut buffer, table) {
            hub.publish(change);
        }
    }
    debug!(table, "change feed ended");
}

/// Drain every complete newline-terminated line from `buffer`, keeping the
/// changes addressed to `table`. A trailing partial line stays buffered.
fn drain_feed_lines(buffer: &mut Vec<u8>, table: &str) -> Vec<TableChange> {
    let mut changes = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<TableChange>(line) {
            Ok(change) if change.table == table => changes.push(change),
            Ok(change) => {
                debug!(table, other = %change.table, "ignoring change for other table");
            }
            Err(e) => warn!(table, error = %e, "undecodable change feed line"),
        }
    }
    changes
}

#[async_trait]
impl DataStore for RemoteStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Record>, StoreError> {
        let url = self.rest_url(kind.table());
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .query(&[
                (kind.id_field(), format!("eq.{}", id)),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let response = Self::check_response(kind.table(), response).await?;
        let mut rows = Self::read_rows(kind.table(), response).await?;
        Ok(rows.pop())
    }

    async fn create(&self, kind: EntityKind, row: Record) -> Result<Record, StoreError> {
        self.create_row(kind, row).await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: Record,
    ) -> Result<Record, StoreError> {
        self.update_row(kind, id, patch).await
    }

    async fn list(&self, kind: EntityKind, filters: &ListFilter) -> Result<Vec<Record>, StoreError> {
        let url = self.rest_url(kind.table());
        debug!(table = kind.table(), filters = filters.len(), "remote list");
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .query(&Self::filter_params(filters))
            .send()
            .await?;
        let response = Self::check_response(kind.table(), response).await?;
        Self::read_rows(kind.table(), response).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        self.delete_row(kind, id).await
    }

    /// Sequential, best-effort: operations already committed remotely are
    /// not rolled back when a later one fails.
    async fn apply_batch(&self, ops: Vec<WriteOp>) -> Result<Vec<Record>, StoreError> {
        let mut results = Vec::with_capacity(ops.len());
        for (index, op) in ops.into_iter().enumerate() {
            let outcome = match op {
                WriteOp::Create { kind, row } => self.create_row(kind, row).await.map(Some),
                WriteOp::Upsert { kind, row } => self.upsert_row(kind, row).await.map(Some),
                WriteOp::Update { kind, id, patch } => {
                    self.update_row(kind, &id, patch).await.map(Some)
                }
                WriteOp::Delete { kind, id } => self.delete_row(kind, &id).await.map(|_| None),
            };
            match outcome {
                Ok(Some(row)) => results.push(row),
                Ok(None) => {}
                Err(source) => {
                    warn!(index, committed = index, "remote batch failed partway");
                    return Err(StoreError::BatchFailed {
                        index,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(results)
    }

    fn subscribe(&self, table: &str) -> Result<TableSubscription, StoreError> {
        let kind = EntityKind::from_table(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        self.ensure_stream(kind);
        Ok(self.hub.subscribe(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Record;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    fn record(value: Value) -> Record {
        value.as_object().expect("test fixture must be an object").clone()
    }

    /// True once `data` holds the full request (headers plus declared body).
    fn request_complete(data: &[u8]) -> bool {
        let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&data[..pos]);
        let body_len = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        data.len() >= pos + 4 + body_len
    }

    /// Serve one canned response on an ephemeral port; the captured request
    /// text comes back through the returned receiver.
    async fn serve_once(status_line: &str, body: &str) -> (String, oneshot::Receiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
                if request_complete(&data) {
                    break;
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&data).into_owned());
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        (format!("http://{}", addr), rx)
    }

    #[tokio::test]
    async fn test_get_missing_row_is_none() {
        let (url, _request) = serve_once("200 OK", "[]").await;
        let store = RemoteStore::new(url, "key").unwrap();
        let row = store.get(EntityKind::Household, "h1").await.unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn test_create_returns_the_stored_representation() {
        let (url, request) = serve_once(
            "201 Created",
            r#"[{"household_id":"h1","address_line1":"123 Main St"}]"#,
        )
        .await;
        let store = RemoteStore::new(url, "sk-123").unwrap();
        let created = store
            .create(
                EntityKind::Household,
                record(json!({"household_id": "h1", "address_line1": "123 Main St"})),
            )
            .await
            .unwrap();
        assert_eq!(created.get("address_line1"), Some(&json!("123 Main St")));

        let request = request.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("post /rest/v1/households"));
        assert!(request.contains("prefer: return=representation"));
        assert!(request.contains("authorization: bearer sk-123"));
    }

    #[tokio::test]
    async fn test_conflict_response_maps_to_constraint() {
        let (url, _request) = serve_once(
            "409 Conflict",
            r#"{"message":"duplicate key value violates unique constraint"}"#,
        )
        .await;
        let store = RemoteStore::new(url, "key").unwrap();
        let err = store
            .create(
                EntityKind::Household,
                record(json!({"household_id": "h1", "address_line1": "123 Main St"})),
            )
            .await
            .unwrap_err();
        match err {
            StoreError::Constraint { table, message } => {
                assert_eq!(table, "households");
                assert!(message.contains("duplicate key"));
            }
            other => panic!("expected Constraint, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_of_missing_row_is_row_not_found() {
        // PostgREST answers a zero-match PATCH with an empty representation.
        let (url, _request) = serve_once("200 OK", "[]").await;
        let store = RemoteStore::new(url, "key").unwrap();
        let err = store
            .update(EntityKind::Household, "nope", record(json!({"city": "Macon"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound { .. }));
    }

    #[tokio::test]
    async fn test_upsert_payload_merges_without_clobbering_created_at() {
        let (url, request) = serve_once("200 OK", r#"[{"household_id":"h1","city":"Macon"}]"#).await;
        let store = RemoteStore::new(url, "key").unwrap();
        // Partial row: no address_line1, plus a stale created_at.
        let rows = store
            .apply_batch(vec![WriteOp::Upsert {
                kind: EntityKind::Household,
                row: record(json!({
                    "household_id": "h1",
                    "city": "Macon",
                    "created_at": "2020-01-01T00:00:00Z"
                })),
            }])
            .await
            .unwrap();
        assert_eq!(rows[0].get("city"), Some(&json!("Macon")));

        let request = request.await.unwrap();
        assert!(request.contains("on_conflict=household_id"));
        assert!(request
            .to_ascii_lowercase()
            .contains("resolution=merge-duplicates"));
        assert!(!request.contains("created_at"));
        assert!(request.contains("updated_at"));
    }

    #[tokio::test]
    async fn test_failed_change_feed_releases_the_table() {
        // Nothing listens on this port, so the feed task fails fast.
        let store = RemoteStore::new("http://127.0.0.1:9", "key").unwrap();
        let _sub = store.subscribe("households").unwrap();
        for _ in 0..100 {
            if store
                .streaming
                .lock()
                .unwrap()
                .is_empty()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(store.streaming.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drain_feed_lines_scopes_and_buffers() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(
            br#"{"table":"households","op":"upsert","row_id":"h1","row":{"household_id":"h1"}}"#,
        );
        buffer.push(b'\n');
        buffer.extend_from_slice(br#"{"table":"children","op":"delete","row_id":"c1"}"#);
        buffer.push(b'\n');
        buffer.extend_from_slice(b"not json at all\n");
        buffer.extend_from_slice(br#"{"table":"households""#); // incomplete line

        let changes = drain_feed_lines(&mut buffer, "households");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].row_id, "h1");
        assert_eq!(changes[0].op, crate::store::ChangeOp::Upsert);
        // The partial trailing line waits for its newline.
        assert_eq!(buffer, br#"{"table":"households""#.to_vec());
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let store = RemoteStore::new("https://db.example.org/", "key").unwrap();
        assert_eq!(
            store.rest_url("households"),
            "https://db.example.org/rest/v1/households"
        );
        assert_eq!(
            store.stream_url("children"),
            "https://db.example.org/realtime/v1/stream?table=children"
        );
    }

    #[test]
    fn test_filter_params_generate_eq_predicates() {
        let mut filters = ListFilter::new();
        filters.insert("household_id".to_string(), json!("h1"));
        filters.insert("is_active".to_string(), json!(true));
        let params = RemoteStore::filter_params(&filters);
        assert!(params.contains(&("household_id".to_string(), "eq.h1".to_string())));
        assert!(params.contains(&("is_active".to_string(), "eq.true".to_string())));
    }

    #[test]
    fn test_auth_headers_carry_key_twice() {
        let store = RemoteStore::new("https://db.example.org", "sk-123").unwrap();
        let headers = store.auth_headers().unwrap();
        assert_eq!(headers.get("apikey").unwrap(), "sk-123");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-123");
    }
}
