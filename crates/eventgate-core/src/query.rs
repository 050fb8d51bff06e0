//! Ad-hoc statement execution for the SQL endpoint.
//!
//! Runs one caller-supplied statement over the shared pool and converts
//! the result rows to JSON, resolving column type names from a fixed OID
//! table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_postgres::Row as PgRow;

use crate::error::CatalogError;

/// One output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryColumn {
    /// Column name.
    pub name: String,
    /// Resolved type name, or `"unknown_OID(<n>)"`.
    pub data_type: String,
}

/// Result of [`run_query`].
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    /// Number of rows returned.
    pub row_count: u64,
    /// Output columns in result order.
    pub columns: Vec<QueryColumn>,
    /// Rows as column-name → JSON value maps.
    pub rows: Vec<serde_json::Map<String, Value>>,
}

/// Executes `sql` and converts the result set to JSON.
///
/// # Errors
///
/// Returns [`CatalogError`] when no connection can be acquired or the
/// database rejects the statement.
pub async fn run_query(
    pool: &deadpool_postgres::Pool,
    sql: &str,
) -> Result<QueryOutput, CatalogError> {
    let client = pool
        .get()
        .await
        .map_err(|e| CatalogError::Pool(e.to_string()))?;

    let statement = client.prepare(sql).await?;
    let rows = client.query(&statement, &[]).await?;

    let columns: Vec<QueryColumn> = statement
        .columns()
        .iter()
        .map(|c| QueryColumn {
            name: c.name().to_string(),
            data_type: type_name(c.type_().oid()),
        })
        .collect();

    let mut out_rows = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut object = serde_json::Map::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            object.insert(column.name.clone(), cell_to_json(row, i));
        }
        out_rows.push(object);
    }

    Ok(QueryOutput {
        row_count: rows.len() as u64,
        columns,
        rows: out_rows,
    })
}

/// Maps the OIDs the target engine reports to their type names.
fn type_name(oid: u32) -> String {
    match oid {
        16 => "boolean".into(),
        20 => "bigint".into(),
        21 => "smallint".into(),
        23 => "integer".into(),
        25 => "text".into(),
        700 => "real".into(),
        701 => "double precision".into(),
        1043 => "varchar".into(),
        1114 => "timestamp".into(),
        1184 => "timestamptz".into(),
        2950 => "uuid".into(),
        other => format!("unknown_OID({other})"),
    }
}

/// Extracts one cell as JSON; values that fail typed extraction become
/// null rather than failing the whole response.
fn cell_to_json(row: &PgRow, i: usize) -> Value {
    match row.columns()[i].type_().oid() {
        16 => row.try_get::<_, Option<bool>>(i).ok().flatten().map_or(Value::Null, Value::Bool),
        20 => opt_value(row.try_get::<_, Option<i64>>(i)),
        21 => opt_value(row.try_get::<_, Option<i16>>(i)),
        23 => opt_value(row.try_get::<_, Option<i32>>(i)),
        700 => opt_value(row.try_get::<_, Option<f32>>(i)),
        701 => opt_value(row.try_get::<_, Option<f64>>(i)),
        1114 | 1184 => row
            .try_get::<_, Option<DateTime<Utc>>>(i)
            .ok()
            .flatten()
            .map_or(Value::Null, |ts| Value::String(ts.to_rfc3339())),
        2950 => row
            .try_get::<_, Option<uuid::Uuid>>(i)
            .ok()
            .flatten()
            .map_or(Value::Null, |u| Value::String(u.to_string())),
        _ => row
            .try_get::<_, Option<String>>(i)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::String),
    }
}

fn opt_value<T: Into<Value>>(cell: Result<Option<T>, tokio_postgres::Error>) -> Value {
    cell.ok().flatten().map_or(Value::Null, Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_oids_resolve() {
        assert_eq!(type_name(16), "boolean");
        assert_eq!(type_name(23), "integer");
        assert_eq!(type_name(701), "double precision");
        assert_eq!(type_name(1184), "timestamptz");
    }

    #[test]
    fn unknown_oids_are_labelled() {
        assert_eq!(type_name(9999), "unknown_OID(9999)");
    }

    #[test]
    fn output_serializes_to_json() {
        let output = QueryOutput {
            row_count: 1,
            columns: vec![QueryColumn {
                name: "a".into(),
                data_type: "integer".into(),
            }],
            rows: vec![serde_json::Map::from_iter([(
                "a".to_string(),
                Value::from(1),
            )])],
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["row_count"], 1);
        assert_eq!(json["columns"][0]["data_type"], "integer");
        assert_eq!(json["rows"][0]["a"], 1);
    }
}
