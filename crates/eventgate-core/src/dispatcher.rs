//! Ingestion dispatcher.
//!
//! Owns the map from fully-qualified relation name to live
//! [`EventHandler`] and keeps it in lockstep with the catalog via the
//! watcher's observer callbacks. Ingest calls resolve the handler under a
//! read lock; watcher callbacks install and tear down handlers under the
//! write lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::catalog::{filter_columns, Column, Relation};
use crate::connection::Connection;
use crate::error::{IngestError, IngestResult};
use crate::metrics::IngestMetrics;
use crate::operator::{BulkInsertOperator, DEFAULT_BUF_SIZE};
use crate::parser::RowParser;
use crate::watcher::RelationObserver;

/// Per-relation composition of a JSON parser and a bulk-insert operator.
pub struct EventHandler {
    parser: RowParser,
    operator: BulkInsertOperator,
}

impl EventHandler {
    /// Builds the parser and spawns the operator for one relation.
    ///
    /// `columns` must already be filtered and non-empty.
    #[must_use]
    pub fn new(
        table: String,
        columns: &[Column],
        conn: Arc<dyn Connection>,
        buf_size: usize,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            parser: RowParser::new(columns),
            operator: BulkInsertOperator::spawn(table, columns, conn, buf_size, metrics),
        }
    }

    /// Parses a newline-delimited payload and submits the rows, blocking
    /// until the operator acknowledges them.
    ///
    /// Any parse error fails the whole request before anything is
    /// submitted. An all-blank payload acknowledges immediately.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Parse`] or the operator's
    /// [`IngestError::Insert`].
    pub async fn ingest(&self, payload: &[u8]) -> IngestResult<()> {
        let rows = self.parser.parse_lines(payload)?;
        if rows.is_empty() {
            return Ok(());
        }
        self.operator.insert(rows).await?;
        Ok(())
    }

    /// Shuts down the underlying operator.
    pub async fn close(&self) {
        self.operator.close().await;
    }
}

/// Routes ingest requests to per-relation handlers.
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Arc<EventHandler>>>,
    conn: Arc<dyn Connection>,
    buf_size: usize,
    metrics: Arc<IngestMetrics>,
}

impl EventDispatcher {
    /// Creates a dispatcher with the default operator buffer size.
    #[must_use]
    pub fn new(conn: Arc<dyn Connection>, metrics: Arc<IngestMetrics>) -> Self {
        Self::with_buf_size(conn, metrics, DEFAULT_BUF_SIZE)
    }

    /// Creates a dispatcher with an explicit operator buffer size.
    #[must_use]
    pub fn with_buf_size(
        conn: Arc<dyn Connection>,
        metrics: Arc<IngestMetrics>,
        buf_size: usize,
    ) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            conn,
            buf_size,
            metrics,
        }
    }

    /// Routes one request's payload to the handler for `name`.
    ///
    /// A bare name canonicalises to `"public.<name>"`.
    ///
    /// # Errors
    ///
    /// [`IngestError::UnknownRelation`] when no handler is live for the
    /// name, otherwise whatever the handler returns.
    pub async fn ingest_event(&self, name: &str, payload: &[u8]) -> IngestResult<()> {
        let key = canonical_key(name);
        let handler = self
            .handlers
            .read()
            .get(&key)
            .cloned()
            .ok_or(IngestError::UnknownRelation(key))?;
        handler.ingest(payload).await
    }

    /// Number of live handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// The shared ingest metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Closes and removes every handler; used on process shutdown.
    pub async fn shutdown(&self) {
        let handlers: Vec<Arc<EventHandler>> =
            self.handlers.write().drain().map(|(_, h)| h).collect();
        for handler in handlers {
            handler.close().await;
        }
    }
}

fn canonical_key(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("public.{name}")
    }
}

#[async_trait]
impl RelationObserver for EventDispatcher {
    /// Installs a fresh handler for a new or changed relation. The swap
    /// is atomic under the write lock, so no ingest can observe a stale
    /// handler; the replaced handler is closed afterwards and its queued
    /// submissions drain against the old columns.
    async fn on_update(&self, relation: Relation) -> Result<(), IngestError> {
        let key = relation.key();
        let columns = filter_columns(&relation.columns);
        if columns.is_empty() {
            warn!(relation = %key, "no insertable columns after filtering");
            let stale = self.handlers.write().remove(&key);
            if let Some(stale) = stale {
                stale.close().await;
            }
            return Ok(());
        }

        info!(relation = %key, columns = columns.len(), "installing event handler");
        let handler = Arc::new(EventHandler::new(
            key.clone(),
            &columns,
            Arc::clone(&self.conn),
            self.buf_size,
            Arc::clone(&self.metrics),
        ));
        let previous = self.handlers.write().insert(key, handler);
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(())
    }

    async fn on_delete(&self, key: &str) -> Result<(), IngestError> {
        let removed = self.handlers.write().remove(key);
        if let Some(handler) = removed {
            info!(relation = %key, "removing event handler");
            handler.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::stub::RecordingConnection;
    use crate::row::Datum;

    fn relation(name: &str, definition: &str, columns: Vec<Column>) -> Relation {
        Relation {
            id: 1,
            schema: "public".into(),
            name: name.into(),
            relation_type: "table".into(),
            definition: definition.into(),
            columns,
        }
    }

    fn dispatcher(conn: &Arc<RecordingConnection>) -> EventDispatcher {
        EventDispatcher::with_buf_size(
            Arc::clone(conn) as Arc<dyn Connection>,
            Arc::new(IngestMetrics::new()),
            16,
        )
    }

    #[tokio::test]
    async fn unknown_relation_is_rejected() {
        let conn = Arc::new(RecordingConnection::new());
        let d = dispatcher(&conn);
        let err = d.ingest_event("nope", b"{}").await.unwrap_err();
        assert!(matches!(err, IngestError::UnknownRelation(ref k) if k == "public.nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn bare_names_canonicalise_to_public() {
        let conn = Arc::new(RecordingConnection::new());
        let d = dispatcher(&conn);
        d.on_update(relation(
            "t",
            "v1",
            vec![Column::new("a", "integer")],
        ))
        .await
        .unwrap();

        d.ingest_event("t", b"{\"a\": 1}").await.unwrap();
        d.ingest_event("public.t", b"{\"a\": 2}").await.unwrap();
        assert_eq!(conn.calls().len(), 2);
        d.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn parse_errors_fail_before_submission() {
        let conn = Arc::new(RecordingConnection::new());
        let d = dispatcher(&conn);
        d.on_update(relation("t", "v1", vec![Column::new("a", "integer")]))
            .await
            .unwrap();

        let err = d.ingest_event("t", b"{oops}").await.unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
        assert!(conn.calls().is_empty());
        d.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_columns_are_excluded_everywhere() {
        let conn = Arc::new(RecordingConnection::new());
        let d = dispatcher(&conn);
        d.on_update(relation(
            "t",
            "v1",
            vec![
                Column::new("_row_id", "serial"),
                Column::new("a", "integer"),
                Column::new("_rw_timestamp", "timestamptz"),
            ],
        ))
        .await
        .unwrap();

        d.ingest_event("t", b"{\"a\": 1, \"_row_id\": 9}")
            .await
            .unwrap();

        let calls = conn.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].0,
            "INSERT INTO public.t (a) VALUES ($1); FLUSH;"
        );
        assert_eq!(calls[0].1, vec![Datum::Int8(1)]);
        d.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn schema_change_swaps_in_a_wider_handler() {
        let conn = Arc::new(RecordingConnection::new());
        let d = dispatcher(&conn);
        d.on_update(relation("t", "v1", vec![Column::new("a", "integer")]))
            .await
            .unwrap();
        d.ingest_event("t", b"{\"a\": 1}").await.unwrap();

        d.on_update(relation(
            "t",
            "v2",
            vec![
                Column::new("a", "integer"),
                Column::new("b", "character varying"),
            ],
        ))
        .await
        .unwrap();
        d.ingest_event("t", b"{\"a\": 2, \"b\": \"x\"}").await.unwrap();

        let calls = conn.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].0,
            "INSERT INTO public.t (a, b) VALUES ($1, $2); FLUSH;"
        );
        assert_eq!(
            calls[1].1,
            vec![Datum::Int8(2), Datum::Text("x".into())]
        );
        d.shutdown().await;
    }

    #[tokio::test]
    async fn delete_removes_the_handler() {
        let conn = Arc::new(RecordingConnection::new());
        let d = dispatcher(&conn);
        d.on_update(relation("t", "v1", vec![Column::new("a", "integer")]))
            .await
            .unwrap();
        assert_eq!(d.handler_count(), 1);

        d.on_delete("public.t").await.unwrap();
        assert_eq!(d.handler_count(), 0);
        assert!(matches!(
            d.ingest_event("t", b"{\"a\": 1}").await.unwrap_err(),
            IngestError::UnknownRelation(_)
        ));
    }

    #[tokio::test]
    async fn fully_filtered_relation_gets_no_handler() {
        let conn = Arc::new(RecordingConnection::new());
        let d = dispatcher(&conn);
        d.on_update(relation(
            "t",
            "v1",
            vec![Column::new("_row_id", "serial")],
        ))
        .await
        .unwrap();
        assert_eq!(d.handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_payload_acks_without_submission() {
        let conn = Arc::new(RecordingConnection::new());
        let d = dispatcher(&conn);
        d.on_update(relation("t", "v1", vec![Column::new("a", "integer")]))
            .await
            .unwrap();

        d.ingest_event("t", b"\n\n  \n").await.unwrap();
        assert!(conn.calls().is_empty());
        d.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_every_handler() {
        let conn = Arc::new(RecordingConnection::new());
        let d = dispatcher(&conn);
        for name in ["t", "u"] {
            d.on_update(relation(name, "v1", vec![Column::new("a", "integer")]))
                .await
                .unwrap();
        }
        d.shutdown().await;
        assert_eq!(d.handler_count(), 0);
        assert!(matches!(
            d.ingest_event("t", b"{\"a\": 1}").await.unwrap_err(),
            IngestError::UnknownRelation(_)
        ));
    }
}
