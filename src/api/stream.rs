use bytes::Bytes;
use mysql_async::Row;
use serde_json::Value;

use crate::services::compiler::CompiledQuery;

/// Streaming encoder for the query response document:
///
/// ```text
/// {"version": "...", "header": [...], "rows": [[...], ...], "info": [...], "warn": [...]}
/// ```
///
/// The preamble goes out before the first database row arrives, rows are
/// appended one by one, and the trailer closes the document with the
/// accumulated notes.
pub struct ResultFrame {
    version: String,
    header: Vec<String>,
    key_len: usize,
    suppress_null_rows: bool,
    info: Vec<String>,
    warn: Vec<String>,
    rows_emitted: usize,
}

impl ResultFrame {
    pub fn new(version: &str, compiled: &CompiledQuery) -> Self {
        Self {
            version: version.to_string(),
            header: compiled.header.clone(),
            key_len: compiled.key_len,
            suppress_null_rows: compiled.suppress_null_rows,
            info: Vec::new(),
            warn: compiled.warnings.clone(),
            rows_emitted: 0,
        }
    }

    pub fn preamble(&self) -> Bytes {
        let mut out = String::from("{\"version\":");
        out.push_str(&Value::String(self.version.clone()).to_string());
        out.push_str(",\"header\":");
        out.push_str(&serde_json::to_string(&self.header).unwrap_or_else(|_| "[]".into()));
        out.push_str(",\"rows\":[");
        Bytes::from(out)
    }

    /// Encode one row, or `None` when the row is suppressed. Datapoint rows
    /// whose value columns are all null carry no information.
    pub fn row(&mut self, values: &[Value]) -> Option<Bytes> {
        if self.suppress_null_rows
            && values.len() > self.key_len
            && values[self.key_len..].iter().all(Value::is_null)
        {
            return None;
        }
        let encoded = serde_json::to_string(values).unwrap_or_else(|_| "[]".into());
        let chunk = if self.rows_emitted == 0 {
            encoded
        } else {
            format!(",{encoded}")
        };
        self.rows_emitted += 1;
        Some(Bytes::from(chunk))
    }

    pub fn push_info(&mut self, note: impl Into<String>) {
        self.info.push(note.into());
    }

    /// Close the rows array and the document. A result without any rows
    /// gets an `info` note so that clients can tell "empty" from "broken".
    pub fn trailer(mut self) -> Bytes {
        if self.rows_emitted == 0 {
            self.info.push("query returned zero rows".to_string());
        }
        let mut out = String::from("]");
        if !self.info.is_empty() {
            out.push_str(",\"info\":");
            out.push_str(&serde_json::to_string(&self.info).unwrap_or_else(|_| "[]".into()));
        }
        if !self.warn.is_empty() {
            out.push_str(",\"warn\":");
            out.push_str(&serde_json::to_string(&self.warn).unwrap_or_else(|_| "[]".into()));
        }
        out.push('}');
        Bytes::from(out)
    }
}

/// Convert one database row into JSON values, in projection order.
pub fn row_to_json(row: Row) -> Vec<Value> {
    use mysql_async::consts::ColumnType;
    use mysql_async::Value as Sql;

    let columns = row.columns();
    let values = row.unwrap();
    values
        .into_iter()
        .zip(columns.iter())
        .map(|(value, column)| match value {
            Sql::NULL => Value::Null,
            Sql::Int(i) => match column.column_type() {
                ColumnType::MYSQL_TYPE_TINY => Value::Bool(i != 0),
                _ => Value::from(i),
            },
            Sql::UInt(u) => match column.column_type() {
                ColumnType::MYSQL_TYPE_TINY => Value::Bool(u != 0),
                _ => Value::from(u),
            },
            Sql::Float(f) => Value::from(f),
            Sql::Double(d) => Value::from(d),
            Sql::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Value::String(text),
                Err(_) => Value::Null,
            },
            Sql::Date(y, m, d, h, min, s, _) => Value::String(format!(
                "{y:04}-{m:02}-{d:02} {h:02}:{min:02}:{s:02}"
            )),
            Sql::Time(neg, d, h, m, s, _) => {
                let sign = if neg { "-" } else { "" };
                let hours = u32::from(h) + d * 24;
                Value::String(format!("{sign}{hours}:{m:02}:{s:02}"))
            }
        })
        .collect()
}
