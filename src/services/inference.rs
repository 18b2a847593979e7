use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::api::middleware::AppError;
use crate::models::schema::{ColumnDef, SqlType};

/// Strings at or past this width are stored as `TEXT`.
pub const TEXT_THRESHOLD: usize = 2000;
/// Distinct values are tracked up to this cap for index planning.
pub const CARDINALITY_CAP: usize = 200;
/// JSON-looking values wider than this become `JSON` instead of `VARCHAR`.
const JSON_WIDTH: usize = 120;

/// Accumulated observations for one CSV column.
#[derive(Debug)]
pub struct ColumnStats {
    max_len: usize,
    seen: usize,
    all_numeric: bool,
    has_fraction: bool,
    has_big_int: bool,
    all_bool: bool,
    json_like: bool,
    distinct: HashSet<String>,
    saturated: bool,
}

impl Default for ColumnStats {
    fn default() -> Self {
        Self {
            max_len: 0,
            seen: 0,
            all_numeric: true,
            has_fraction: false,
            has_big_int: false,
            all_bool: true,
            json_like: false,
            distinct: HashSet::new(),
            saturated: false,
        }
    }
}

impl ColumnStats {
    fn observe(&mut self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        self.seen += 1;
        self.max_len = self.max_len.max(raw.chars().count());

        match raw.parse::<i64>() {
            Ok(v) => {
                if v.unsigned_abs() > i32::MAX as u64 {
                    self.has_big_int = true;
                }
            }
            Err(_) => {
                if raw.parse::<f64>().is_ok() {
                    self.has_fraction = true;
                } else {
                    self.all_numeric = false;
                }
            }
        }

        if !raw.eq_ignore_ascii_case("true") && !raw.eq_ignore_ascii_case("false") {
            self.all_bool = false;
        }

        if raw.starts_with('{') || raw.starts_with('[') {
            self.json_like = true;
        }

        if !self.saturated {
            self.distinct.insert(raw.to_string());
            if self.distinct.len() >= CARDINALITY_CAP {
                self.saturated = true;
            }
        }
    }

    pub fn cardinality(&self) -> usize {
        self.distinct.len()
    }

    fn sql_type(&self, name: &str) -> SqlType {
        if self.seen == 0 {
            return SqlType::Varchar(1);
        }
        if self.all_bool || name.starts_with("is--") {
            return SqlType::Boolean;
        }
        if self.all_numeric {
            if self.has_fraction {
                return SqlType::Double;
            }
            return if self.has_big_int {
                SqlType::BigInt
            } else {
                SqlType::Integer
            };
        }
        if self.json_like && self.max_len > JSON_WIDTH {
            return SqlType::Json;
        }
        if self.max_len >= TEXT_THRESHOLD {
            return SqlType::Text;
        }
        SqlType::Varchar(self.max_len.max(1))
    }

    fn column_def(&self, name: &str) -> ColumnDef {
        ColumnDef {
            sql_type: self.sql_type(name),
            cardinality: self.cardinality(),
        }
    }
}

/// One inference pass over the CSV files contributing to a logical table.
#[derive(Debug, Default)]
pub struct SchemaScan {
    columns: BTreeMap<String, ColumnStats>,
}

impl SchemaScan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream one CSV file, folding every cell into the column stats.
    pub fn scan_file(&mut self, path: &Path) -> Result<(), AppError> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| {
            AppError::SchemaValidation(format!("cannot read {}: {e}", path.display()))
        })?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| AppError::SchemaValidation(format!("bad header in {}: {e}", path.display())))?
            .iter()
            .map(str::to_string)
            .collect();

        for record in reader.records() {
            let record = record.map_err(|e| {
                AppError::SchemaValidation(format!("bad row in {}: {e}", path.display()))
            })?;
            for (column, cell) in headers.iter().zip(record.iter()) {
                self.columns.entry(column.clone()).or_default().observe(cell);
            }
        }
        // Columns that never saw a row still need a definition
        for column in headers {
            self.columns.entry(column).or_default();
        }
        Ok(())
    }

    pub fn column_defs(&self) -> BTreeMap<String, ColumnDef> {
        self.columns
            .iter()
            .map(|(name, stats)| (name.clone(), stats.column_def(name)))
            .collect()
    }

    pub fn cardinality(&self, column: &str) -> usize {
        self.columns.get(column).map_or(0, ColumnStats::cardinality)
    }
}

/// The wider of two inferred types, for folding observations of the same
/// logical column arriving under different CSV headers.
pub fn widen(a: &SqlType, b: &SqlType) -> SqlType {
    use SqlType::*;
    match (a, b) {
        (Text, _) | (_, Text) => Text,
        (Json, _) | (_, Json) => Json,
        (Varchar(x), Varchar(y)) => Varchar(*x.max(y)),
        (Varchar(x), _) | (_, Varchar(x)) => Varchar(*x),
        (Double, _) | (_, Double) => Double,
        (BigInt, _) | (_, BigInt) => BigInt,
        (Integer, _) | (_, Integer) => Integer,
        (Boolean, Boolean) => Boolean,
    }
}

/// Read just the header row of a CSV file.
pub fn read_headers(path: &Path) -> Result<Vec<String>, AppError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| AppError::SchemaValidation(format!("cannot read {}: {e}", path.display())))?;
    Ok(reader
        .headers()
        .map_err(|e| AppError::SchemaValidation(format!("bad header in {}: {e}", path.display())))?
        .iter()
        .map(str::to_string)
        .collect())
}
