//! Schema-driven JSON row parser.
//!
//! Projects newline-delimited JSON objects into positional [`Row`]s typed
//! by the destination table's filtered columns. Scalar fields decode
//! generically; array fields consult the column type so the database
//! binding keeps its element type (an `integer[]` must not arrive as a
//! generic or string array), and nested objects pass through verbatim as
//! `jsonb`.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::value::RawValue;
use serde_json::Value;

use crate::catalog::Column;
use crate::error::ParseError;
use crate::row::{Datum, Row};

/// Parses JSON event lines against one relation's filtered column schema.
pub struct RowParser {
    /// Column name → positional index.
    index: HashMap<String, usize>,
    /// Column name → database type name.
    types: HashMap<String, String>,
    /// Number of columns (row width).
    width: usize,
}

impl RowParser {
    /// Builds a parser over the filtered, ordered column set.
    #[must_use]
    pub fn new(columns: &[Column]) -> Self {
        let mut index = HashMap::with_capacity(columns.len());
        let mut types = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            index.insert(column.name.clone(), i);
            types.insert(column.name.clone(), column.data_type.clone());
        }
        Self {
            index,
            types,
            width: columns.len(),
        }
    }

    /// Splits a payload on ASCII newline and parses every non-blank line.
    ///
    /// Newline is a record separator only; whitespace-only segments
    /// (including one produced by a trailing newline) are skipped. Any
    /// bad line fails the whole batch.
    ///
    /// # Errors
    ///
    /// Returns the first [`ParseError`] encountered.
    pub fn parse_lines(&self, payload: &[u8]) -> Result<Vec<Row>, ParseError> {
        let mut rows = Vec::new();
        for line in payload.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            rows.push(self.parse_line(line)?);
        }
        Ok(rows)
    }

    /// Parses one JSON object into a positional row.
    ///
    /// Fields absent from the schema are ignored; schema columns absent
    /// from the object are left NULL.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] for malformed JSON, an array field without
    /// type information, or an unsupported array element type.
    pub fn parse_line(&self, line: &[u8]) -> Result<Row, ParseError> {
        let fields: HashMap<String, Box<RawValue>> = serde_json::from_slice(line)?;
        let mut row = vec![Datum::Null; self.width];
        for (key, raw) in &fields {
            let datum = self.decode_field(key, raw)?;
            if let Some(&i) = self.index.get(key) {
                row[i] = datum;
            }
        }
        Ok(row)
    }

    /// Decodes one field. Every field is decoded (an untyped array is an
    /// error even when the field is not in the schema); only schema
    /// fields end up in the row.
    fn decode_field(&self, key: &str, raw: &RawValue) -> Result<Datum, ParseError> {
        let text = raw.get();
        match text.trim_start().as_bytes().first() {
            None => Ok(Datum::Null),
            Some(b'{') => Ok(Datum::Jsonb(text.to_string())),
            Some(b'[') => {
                let data_type = self
                    .types
                    .get(key)
                    .ok_or_else(|| ParseError::MissingType(key.to_string()))?;
                parse_array(text, data_type)
            }
            Some(_) => {
                let value: Value = serde_json::from_str(text)?;
                Ok(scalar_datum(&value))
            }
        }
    }
}

// ── Field decoding helpers ─────────────────────────────────────────

fn scalar_datum(value: &Value) -> Datum {
    match value {
        Value::Null => Datum::Null,
        Value::Bool(b) => Datum::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Datum::Int8(i)
            } else {
                Datum::Float8(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Datum::Text(s.clone()),
        // Arrays and objects are dispatched before generic decoding.
        Value::Array(_) | Value::Object(_) => Datum::Jsonb(value.to_string()),
    }
}

/// Decodes a JSON array against the column type `data_type`.
///
/// The element type is `data_type` with one trailing `"[]"` stripped:
/// a further `"[]"` suffix recurses, a `struct` prefix keeps elements as
/// their source text, and everything else goes through a fixed scalar
/// table.
fn parse_array(raw: &str, data_type: &str) -> Result<Datum, ParseError> {
    let elem = data_type.strip_suffix("[]").unwrap_or(data_type);

    if elem.ends_with("[]") {
        let items: Vec<Box<RawValue>> = serde_json::from_str(raw)?;
        let mut out = Vec::with_capacity(items.len());
        for item in &items {
            out.push(parse_array(item.get(), elem)?);
        }
        return Ok(Datum::Array(out));
    }

    if elem.starts_with("struct") {
        let items: Vec<String> = serde_json::from_str(raw)?;
        return Ok(Datum::Array(items.into_iter().map(Datum::Text).collect()));
    }

    match elem {
        "integer" => {
            let items: Vec<i32> = serde_json::from_str(raw)?;
            Ok(Datum::Array(items.into_iter().map(Datum::Int4).collect()))
        }
        "smallint" => {
            let items: Vec<i16> = serde_json::from_str(raw)?;
            Ok(Datum::Array(items.into_iter().map(Datum::Int2).collect()))
        }
        "bigint" => {
            let items: Vec<i64> = serde_json::from_str(raw)?;
            Ok(Datum::Array(items.into_iter().map(Datum::Int8).collect()))
        }
        "real" => {
            let items: Vec<f32> = serde_json::from_str(raw)?;
            Ok(Datum::Array(items.into_iter().map(Datum::Float4).collect()))
        }
        "double precision" => {
            let items: Vec<f64> = serde_json::from_str(raw)?;
            Ok(Datum::Array(items.into_iter().map(Datum::Float8).collect()))
        }
        "boolean" => {
            let items: Vec<bool> = serde_json::from_str(raw)?;
            Ok(Datum::Array(items.into_iter().map(Datum::Bool).collect()))
        }
        "numeric" | "character varying" | "interval" | "date" | "time" | "timestamp"
        | "timestamptz" | "time with time zone" | "time without time zone" | "rw_int256" => {
            let items: Vec<String> = serde_json::from_str(raw)?;
            Ok(Datum::Array(items.into_iter().map(Datum::Text).collect()))
        }
        "bytea" => {
            let items: Vec<String> = serde_json::from_str(raw)?;
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(Datum::Bytea(BASE64.decode(item)?));
            }
            Ok(Datum::Array(out))
        }
        "jsonb" => {
            let items: Vec<Box<RawValue>> = serde_json::from_str(raw)?;
            Ok(Datum::Array(
                items
                    .into_iter()
                    .map(|item| Datum::Jsonb(item.get().to_string()))
                    .collect(),
            ))
        }
        other => Err(ParseError::UnsupportedType(other.to_string())),
    }
}
