//! Catalog model and the system-catalog client.
//!
//! The database exposes its schema through `rw_relations`, `rw_schemas`,
//! and `rw_columns`. [`PgCatalog`] issues two read-only queries against
//! them and combines the results into a keyed snapshot of [`Relation`]s.
//! The [`CatalogSource`] seam lets the watcher run against a stub in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::CatalogError;

/// One column of a relation, as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Database type name, e.g. `"integer"`, `"character varying"`,
    /// `"integer[]"`, `"struct<a integer>"`.
    pub data_type: String,
    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,
    /// Whether the catalog marks the column as hidden.
    pub is_hidden: bool,
}

impl Column {
    /// Convenience constructor with both flags unset.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_primary_key: false,
            is_hidden: false,
        }
    }
}

/// A table-typed relation with its ordered columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Catalog identifier.
    pub id: i32,
    /// Schema the relation belongs to.
    pub schema: String,
    /// Relation name.
    pub name: String,
    /// Relation type; always `"table"` for watched relations.
    pub relation_type: String,
    /// Textual CREATE statement; the watcher's change-detection fingerprint.
    pub definition: String,
    /// Columns in catalog result order (ordinal positions).
    pub columns: Vec<Column>,
}

impl Relation {
    /// The canonical `"<schema>.<name>"` key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Drops columns the ingest path must never bind: `_row_id` and anything
/// prefixed `_rw`. The returned order is the catalog order, which fixes
/// the INSERT column list, the placeholder positions, and the parser index.
#[must_use]
pub fn filter_columns(columns: &[Column]) -> Vec<Column> {
    columns
        .iter()
        .filter(|c| c.name != "_row_id" && !c.name.starts_with("_rw"))
        .cloned()
        .collect()
}

/// Read access to the database's relation catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetches every table-typed relation with its columns, keyed by
    /// `"<schema>.<name>"`.
    async fn snapshot(&self) -> Result<BTreeMap<String, Relation>, CatalogError>;
}

const RELATIONS_SQL: &str = "\
SELECT
    rw_relations.id,
    rw_schemas.name AS schema,
    rw_relations.name,
    rw_relations.relation_type,
    rw_relations.definition
FROM rw_relations
JOIN rw_schemas ON rw_schemas.id = rw_relations.schema_id
WHERE relation_type = 'table'";

const COLUMNS_SQL: &str = "\
SELECT
    rw_relations.id            AS relation_id,
    rw_schemas.name            AS schema,
    rw_relations.name          AS relation_name,
    rw_relations.relation_type AS relation_type,
    rw_columns.name            AS column_name,
    rw_columns.data_type       AS column_type,
    rw_columns.is_primary_key  AS is_primary_key,
    rw_columns.is_hidden       AS is_hidden
FROM rw_columns
JOIN rw_relations ON rw_relations.id = rw_columns.relation_id
JOIN rw_schemas   ON rw_schemas.id = rw_relations.schema_id
WHERE rw_relations.relation_type = 'table'";

/// Catalog client backed by the shared connection pool.
pub struct PgCatalog {
    pool: deadpool_postgres::Pool,
}

impl PgCatalog {
    /// Creates a catalog client over an existing pool.
    #[must_use]
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogSource for PgCatalog {
    async fn snapshot(&self) -> Result<BTreeMap<String, Relation>, CatalogError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| CatalogError::Pool(e.to_string()))?;

        let mut relations = BTreeMap::new();
        for row in client.query(RELATIONS_SQL, &[]).await? {
            let relation = Relation {
                id: row.try_get(0)?,
                schema: row.try_get(1)?,
                name: row.try_get(2)?,
                relation_type: row.try_get(3)?,
                definition: row.try_get(4)?,
                columns: Vec::new(),
            };
            relations.insert(relation.key(), relation);
        }

        for row in client.query(COLUMNS_SQL, &[]).await? {
            let schema: String = row.try_get(1)?;
            let name: String = row.try_get(2)?;
            let key = format!("{schema}.{name}");
            if let Some(relation) = relations.get_mut(&key) {
                relation.columns.push(Column {
                    name: row.try_get(4)?,
                    data_type: row.try_get(5)?,
                    is_primary_key: row.try_get(6)?,
                    is_hidden: row.try_get(7)?,
                });
            }
        }

        Ok(relations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_key_is_schema_qualified() {
        let relation = Relation {
            id: 7,
            schema: "public".into(),
            name: "events".into(),
            relation_type: "table".into(),
            definition: "CREATE TABLE events (a INT)".into(),
            columns: vec![],
        };
        assert_eq!(relation.key(), "public.events");
    }

    #[test]
    fn filter_drops_row_id_and_rw_prefixed() {
        let columns = vec![
            Column::new("_row_id", "serial"),
            Column::new("a", "integer"),
            Column::new("_rw_timestamp", "timestamptz"),
            Column::new("b", "character varying"),
            Column::new("_rwkeep", "integer"),
        ];
        let filtered = filter_columns(&columns);
        let names: Vec<&str> = filtered.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn filter_preserves_order() {
        let columns = vec![
            Column::new("z", "integer"),
            Column::new("a", "integer"),
            Column::new("m", "integer"),
        ];
        let filtered = filter_columns(&columns);
        let names: Vec<&str> = filtered.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn filter_keeps_everything_else() {
        let columns = vec![Column::new("row_id", "integer"), Column::new("rw", "text")];
        assert_eq!(filter_columns(&columns).len(), 2);
    }
}
