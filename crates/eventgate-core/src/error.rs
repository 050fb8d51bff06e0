//! Error types for the ingestion engine.
//!
//! One enum per domain: [`ParseError`] for the JSON row parser,
//! [`ConnectionError`] for the database facade, [`InsertError`] for the
//! bulk-insert operator, [`CatalogError`] for catalog polling, and
//! [`IngestError`] as the dispatcher-level union returned to callers.

use std::time::Duration;

use thiserror::Error;

/// Result alias for the ingest path.
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors from decoding a JSON event line into a positional row.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The line is not a valid JSON object.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// An array-valued field has no column type to decode against.
    #[error("no type information for array field '{0}'")]
    MissingType(String),

    /// The column's array element type is not in the supported set.
    #[error("unsupported array element type '{0}'")]
    UnsupportedType(String),

    /// A bytea array element was not valid base64.
    #[error("invalid base64 in bytea element: {0}")]
    Bytea(#[from] base64::DecodeError),
}

/// Errors from executing a statement over the shared pool.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Could not acquire a pooled connection.
    #[error("failed to acquire a pooled connection: {0}")]
    Pool(String),

    /// The database rejected the statement.
    #[error("statement execution failed: {0}")]
    Exec(String),

    /// The statement did not complete within the execution timeout.
    #[error("statement execution timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by [`BulkInsertOperator::insert`](crate::operator::BulkInsertOperator::insert).
///
/// Cloneable so one flush result can fan out to every submission in the
/// batch.
#[derive(Debug, Clone, Error)]
pub enum InsertError {
    /// The operator has shut down; nothing was written.
    #[error("bulk insert operator is closed")]
    Closed,

    /// The inbox is full; the caller should retry with backoff.
    #[error("insert backpressure: inbox is full")]
    Backpressure,

    /// A single submission would exceed the driver's parameter budget.
    #[error("submission of {rows} rows exceeds the {max_rows}-row limit")]
    TooLarge {
        /// Rows in the rejected submission.
        rows: usize,
        /// Largest submission the operator accepts for its column count.
        max_rows: usize,
    },

    /// The batched INSERT failed; every submission in the batch gets this.
    #[error(transparent)]
    Flush(#[from] ConnectionError),
}

/// Errors from querying the system catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Could not acquire a pooled connection.
    #[error("failed to acquire a pooled connection: {0}")]
    Pool(String),

    /// A catalog query failed.
    #[error("catalog query failed: {0}")]
    Query(#[from] tokio_postgres::Error),
}

/// Dispatcher-level errors returned to ingestion callers.
#[derive(Debug, Error)]
pub enum IngestError {
    /// No live handler for the addressed relation.
    #[error("no relation named '{0}'")]
    UnknownRelation(String),

    /// The payload failed to parse; nothing was submitted.
    #[error("failed to parse event payload: {0}")]
    Parse(#[from] ParseError),

    /// The operator rejected or failed the submission.
    #[error("failed to insert event rows: {0}")]
    Insert(#[from] InsertError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_error_display() {
        assert_eq!(
            InsertError::Closed.to_string(),
            "bulk insert operator is closed"
        );
        assert_eq!(
            InsertError::Backpressure.to_string(),
            "insert backpressure: inbox is full"
        );
    }

    #[test]
    fn too_large_names_both_sizes() {
        let err = InsertError::TooLarge {
            rows: 13108,
            max_rows: 13107,
        };
        let msg = err.to_string();
        assert!(msg.contains("13108"));
        assert!(msg.contains("13107"));
    }

    #[test]
    fn flush_error_is_transparent() {
        let err = InsertError::Flush(ConnectionError::Exec("boom".into()));
        assert_eq!(err.to_string(), "statement execution failed: boom");
    }

    #[test]
    fn ingest_error_wraps_parse() {
        let parse = ParseError::MissingType("xs".into());
        let err = IngestError::from(parse);
        assert!(err.to_string().contains("xs"));
    }
}
