//! Multi-row INSERT statement builder.
//!
//! Deterministic and testable in isolation: given the cached prefix and a
//! snapshot of buffered submissions, produces one SQL string with 1-based
//! row-major placeholders and the flat argument vector that binds them.

use std::fmt::Write as _;

use crate::catalog::Column;
use crate::row::{Datum, Row};

/// Builds the cached `"INSERT INTO <table> (c1, …, cn) VALUES "` prefix.
#[must_use]
pub fn insert_prefix(table: &str, columns: &[Column]) -> String {
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    format!("INSERT INTO {table} ({}) VALUES ", names.join(", "))
}

/// Builds the flush statement for an ordered snapshot of submissions.
///
/// Placeholders are contiguous and row-major (`row 0 col 0` → `$1`), rows
/// render as `($i, …, $j)` joined by `", "`, and a single `"; FLUSH;"` is
/// appended so the write becomes visible in the same execution. The rows
/// are moved into the returned argument vector, whose length is
/// `nrows · ncols`.
#[must_use]
pub fn build_insert_statement(
    prefix: &str,
    batches: Vec<Vec<Row>>,
    ncols: usize,
) -> (String, Vec<Datum>) {
    let nrows: usize = batches.iter().map(Vec::len).sum();

    let mut sql = String::with_capacity(prefix.len() + nrows * ncols * 6 + 16);
    sql.push_str(prefix);
    let mut args = Vec::with_capacity(nrows * ncols);

    let mut pos = 0usize;
    let mut first = true;
    for batch in batches {
        for row in batch {
            if first {
                first = false;
            } else {
                sql.push_str(", ");
            }
            sql.push('(');
            for k in 0..ncols {
                pos += 1;
                let _ = write!(sql, "${pos}");
                if k + 1 < ncols {
                    sql.push_str(", ");
                }
            }
            sql.push(')');
            args.extend(row);
        }
    }
    sql.push_str("; FLUSH;");

    (sql, args)
}
