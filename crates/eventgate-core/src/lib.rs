//! # Eventgate Core
//!
//! The ingestion engine behind the eventgate HTTP front-end: a relation
//! watcher that mirrors the database catalog, a schema-driven JSON row
//! parser, and per-relation bulk-insert operators that coalesce many
//! concurrent submissions into large multi-row INSERT statements.
//!
//! The HTTP surface, configuration, and process lifecycle live in the
//! `eventgate-server` crate; this crate only talks to the database.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod catalog;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod operator;
pub mod parser;
pub mod query;
pub mod row;
pub mod statement;
pub mod watcher;

pub use catalog::{filter_columns, CatalogSource, Column, PgCatalog, Relation};
pub use connection::{Connection, PgPool};
pub use dispatcher::{EventDispatcher, EventHandler};
pub use error::{CatalogError, ConnectionError, IngestError, InsertError, ParseError};
pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use operator::BulkInsertOperator;
pub use parser::RowParser;
pub use row::{Datum, Row};
pub use watcher::{RelationObserver, RelationWatcher};
