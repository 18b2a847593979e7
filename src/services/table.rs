use mysql_async::prelude::*;
use mysql_async::{Conn, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

use crate::api::middleware::AppError;
use crate::models::schema::{Shard, SqlType, TableDef};

/// Physical identifier cap of the database engine.
const MAX_TABLE_NAME: usize = 64;
/// Estimated row size cap before a logical table is split.
pub const ROW_SIZE_LIMIT: usize = 8000;
/// Key components at or above this cardinality get a secondary index.
pub const INDEX_CARDINALITY: usize = 150;
/// MySQL server error code for a detected deadlock.
const ER_LOCK_DEADLOCK: u16 = 1213;
/// Retry delay after a deadlocked upsert batch.
const DEADLOCK_BACKOFF: Duration = Duration::from_millis(500);
/// "Too many columns" / "row size too large" server errors that trigger a
/// reactive split when the preemptive estimate was off.
const ER_TOO_MANY_FIELDS: u16 = 1117;
const ER_TOO_BIG_ROWSIZE: u16 = 1118;

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn quote_str(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl SqlType {
    pub fn ddl(&self) -> String {
        match self {
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Double => "DOUBLE".to_string(),
            SqlType::Varchar(width) => format!("VARCHAR({width})"),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Json => "JSON".to_string(),
        }
    }

    /// Estimated stored width in bytes, for split planning.
    pub fn estimated_width(&self) -> usize {
        match self {
            SqlType::Boolean => 1,
            SqlType::Integer => 4,
            SqlType::BigInt | SqlType::Double => 8,
            SqlType::Varchar(width) => width + 2,
            // Stored out of row; only the pointer counts
            SqlType::Text | SqlType::Json => 20,
        }
    }
}

/// Derive a DB-safe physical name. Names that would exceed the engine's
/// identifier cap are replaced by a hashed form keeping a readable prefix.
pub fn physical_table_name(dataset: &str, version: &str, suffix: &str) -> String {
    let logical = format!("{dataset}__{version}__{suffix}");
    if logical.len() <= MAX_TABLE_NAME {
        return logical;
    }
    let digest = Sha256::digest(logical.as_bytes());
    let hash = format!("{digest:x}");
    let prefix: String = logical.chars().take(MAX_TABLE_NAME - 17).collect();
    format!("{prefix}_{}", &hash[..16])
}

fn column_type<'a>(def: &'a TableDef, column: &str) -> &'a SqlType {
    def.columns
        .get(column)
        .map_or(&SqlType::Varchar(255), |c| &c.sql_type)
}

/// Split a logical table into shards respecting both the column cap and the
/// estimated row size limit. Key columns are carried by every shard; value
/// columns are distributed in declaration order.
pub fn plan_shards(def: &mut TableDef, base_name: &str, max_columns: usize) {
    // Key and `is--<set>` columns are carried by every shard
    let fixed_width: usize = def
        .key
        .iter()
        .map(|c| column_type(def, c).estimated_width())
        .sum::<usize>()
        + def.sets.len();
    let fixed_count = def.key.len() + def.sets.len();

    let mut groups: Vec<Vec<String>> = vec![Vec::new()];
    let mut width = fixed_width;
    let mut count = fixed_count;
    for value in &def.values {
        let value_width = column_type(def, value).estimated_width();
        let overflow = count + 1 > max_columns || width + value_width > ROW_SIZE_LIMIT;
        if overflow && !groups.last().unwrap().is_empty() {
            groups.push(Vec::new());
            width = fixed_width;
            count = fixed_count;
        }
        groups.last_mut().unwrap().push(value.clone());
        width += value_width;
        count += 1;
    }

    def.shards = groups
        .into_iter()
        .enumerate()
        .map(|(i, values)| Shard {
            table: if i == 0 {
                base_name.to_string()
            } else {
                format!("{base_name}__{i}")
            },
            values,
        })
        .collect();
}

fn set_column(set: &str) -> String {
    format!("is--{set}")
}

/// The `CREATE OR REPLACE TABLE` statement for one shard, including stored
/// and virtual translation columns for the shard's values.
pub fn create_table_sql(def: &TableDef, shard: &Shard) -> String {
    let mut columns = Vec::new();
    for key in &def.key {
        columns.push(format!(
            "{} {} NOT NULL",
            quote_ident(key),
            column_type(def, key).ddl()
        ));
    }
    for set in &def.sets {
        columns.push(format!("{} BOOLEAN", quote_ident(&set_column(set))));
    }
    for value in &shard.values {
        let sql_type = column_type(def, value).ddl();
        columns.push(format!("{} {}", quote_ident(value), sql_type));
        for (lang, translated) in &def.translations {
            if translated.iter().any(|c| c == value) {
                let stored = format!("_{value}--{lang}");
                let virtual_col = format!("{value}--{lang}");
                columns.push(format!("{} {}", quote_ident(&stored), sql_type));
                columns.push(format!(
                    "{} {} AS (COALESCE({}, {})) VIRTUAL",
                    quote_ident(&virtual_col),
                    sql_type,
                    quote_ident(&stored),
                    quote_ident(value)
                ));
            }
        }
    }
    let key_list = def
        .key
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE OR REPLACE TABLE {} ({}, PRIMARY KEY ({}))",
        quote_ident(&shard.table),
        columns.join(", "),
        key_list
    )
}

/// Create every shard of a logical table. A "too many columns" or "row too
/// big" rejection of the estimate-based plan halves the column cap and
/// replans before retrying.
pub async fn create_table(
    conn: &mut Conn,
    def: &mut TableDef,
    max_columns: usize,
) -> Result<(), AppError> {
    let base_name = def.primary_table().to_string();
    let mut cap = max_columns;
    loop {
        let mut failed = None;
        for shard in &def.shards {
            let sql = create_table_sql(def, shard);
            tracing::debug!("ddl: {}", sql);
            if let Err(e) = conn.query_drop(&sql).await {
                failed = Some(e);
                break;
            }
        }
        match failed {
            None => return Ok(()),
            Some(mysql_async::Error::Server(server))
                if matches!(server.code, ER_TOO_MANY_FIELDS | ER_TOO_BIG_ROWSIZE) && cap > 2 =>
            {
                cap /= 2;
                tracing::warn!(
                    "table {} rejected ({}), replanning with {} columns per shard",
                    base_name,
                    server,
                    cap
                );
                plan_shards(def, &base_name, cap);
            }
            Some(e) => {
                return Err(AppError::Internal(format!(
                    "creating {base_name} failed: {e}"
                )))
            }
        }
    }
}

/// Maps CSV headers onto table columns; `flags` are `is--<set>` columns set
/// TRUE for every row of this file.
#[derive(Debug, Clone, Default)]
pub struct LoadMapping {
    pub columns: Vec<(String, String)>,
    pub flags: Vec<String>,
    /// Target a stored translation column set instead of the base columns:
    /// value columns are remapped to `_<col>--<lang>`.
    pub language: Option<String>,
}

impl LoadMapping {
    /// A translation load targets the stored `_<col>--<lang>` columns.
    fn target_column(&self, def: &TableDef, table_column: &str) -> String {
        match &self.language {
            Some(lang) if def.values.iter().any(|v| v == table_column) => {
                format!("_{table_column}--{lang}")
            }
            _ => table_column.to_string(),
        }
    }

    /// The (csv, table) pairs relevant to one shard: all mapped key columns
    /// plus the shard's mapped values.
    fn shard_columns(&self, def: &TableDef, shard: &Shard) -> Vec<(String, String)> {
        self.columns
            .iter()
            .filter(|(_, table_col)| {
                def.key.iter().any(|k| k == table_col)
                    || shard.values.iter().any(|v| v == table_col)
            })
            .map(|(csv_col, table_col)| (csv_col.clone(), self.target_column(def, table_col)))
            .collect()
    }
}

/// Bulk load through a CSV-backed external table. Preferred when the file
/// carries no translations: one `INSERT .. SELECT` per shard.
pub async fn bulk_load_external(
    conn: &mut Conn,
    def: &TableDef,
    mapping: &LoadMapping,
    path: &Path,
) -> Result<(), AppError> {
    let headers = crate::services::inference::read_headers(path)?;
    let ext_name = format!("{}__ext", def.primary_table());

    let ext_columns = headers
        .iter()
        .map(|h| format!("{} VARCHAR(4000)", quote_ident(h)))
        .collect::<Vec<_>>()
        .join(", ");
    let create_ext = format!(
        "CREATE OR REPLACE TABLE {} ({}) ENGINE=CONNECT TABLE_TYPE=CSV FILE_NAME={} HEADER=1 SEP_CHAR=','",
        quote_ident(&ext_name),
        ext_columns,
        quote_str(&path.display().to_string())
    );
    tracing::debug!("ddl: {}", create_ext);
    conn.query_drop(&create_ext)
        .await
        .map_err(|e| AppError::Internal(format!("external table failed: {e}")))?;

    // Every shard receives the keys of every row so that shard joins stay
    // complete; shards without mapped values get a no-op duplicate update.
    for shard in &def.shards {
        let pairs = mapping.shard_columns(def, shard);
        let mut insert_cols: Vec<String> = pairs.iter().map(|(_, t)| quote_ident(t)).collect();
        let mut select_exprs: Vec<String> = pairs
            .iter()
            .map(|(csv_col, table_col)| select_expr(def, csv_col, table_col))
            .collect();
        for flag in &mapping.flags {
            insert_cols.push(quote_ident(flag));
            select_exprs.push("TRUE".to_string());
        }
        let sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} ON DUPLICATE KEY UPDATE {}",
            quote_ident(&shard.table),
            insert_cols.join(", "),
            select_exprs.join(", "),
            quote_ident(&ext_name),
            upsert_updates(def, &pairs, &mapping.flags)
        );
        tracing::debug!("bulk copy: {}", sql);
        exec_with_deadlock_retry(conn, &sql, Vec::new()).await?;
    }

    conn.query_drop(format!("DROP TABLE {}", quote_ident(&ext_name)))
        .await
        .map_err(|e| AppError::Internal(format!("dropping external table failed: {e}")))?;
    Ok(())
}

/// The SELECT expression converting an external VARCHAR cell into the
/// target column type.
fn select_expr(def: &TableDef, csv_col: &str, table_col: &str) -> String {
    let base = table_col.strip_prefix('_').map_or(table_col, |rest| {
        rest.split("--").next().unwrap_or(table_col)
    });
    let quoted = quote_ident(csv_col);
    match column_type(def, base) {
        SqlType::Boolean => format!(
            "CASE UPPER({quoted}) WHEN 'TRUE' THEN TRUE WHEN 'FALSE' THEN FALSE ELSE NULL END"
        ),
        _ => format!("NULLIF({quoted}, '')"),
    }
}

/// Row-by-row upsert through the CSV parser. Slower but required for files
/// carrying translations and tolerant of oversized cells.
pub async fn load_rows(
    conn: &mut Conn,
    def: &TableDef,
    mapping: &LoadMapping,
    path: &Path,
) -> Result<usize, AppError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| AppError::SchemaValidation(format!("cannot read {}: {e}", path.display())))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| AppError::SchemaValidation(format!("bad header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    // Per shard: (insert sql, csv column indexes, target base types)
    let mut plans = Vec::new();
    for shard in &def.shards {
        let pairs = mapping.shard_columns(def, shard);
        let mut insert_cols: Vec<String> = pairs.iter().map(|(_, t)| quote_ident(t)).collect();
        let mut placeholders: Vec<&str> = pairs.iter().map(|_| "?").collect();
        for flag in &mapping.flags {
            insert_cols.push(quote_ident(flag));
            placeholders.push("TRUE");
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            quote_ident(&shard.table),
            insert_cols.join(", "),
            placeholders.join(", "),
            upsert_updates(def, &pairs, &mapping.flags)
        );
        let indexes: Vec<(usize, SqlType)> = pairs
            .iter()
            .map(|(csv_col, table_col)| {
                let index = headers.iter().position(|h| h == csv_col).unwrap_or(0);
                let base = table_col
                    .strip_prefix('_')
                    .and_then(|rest| rest.split("--").next())
                    .unwrap_or(table_col);
                (index, column_type(def, base).clone())
            })
            .collect();
        plans.push((sql, indexes));
    }

    let mut loaded = 0usize;
    for record in reader.records() {
        let record = record
            .map_err(|e| AppError::SchemaValidation(format!("bad row in {}: {e}", path.display())))?;
        for (sql, indexes) in &plans {
            let params: Vec<Value> = indexes
                .iter()
                .map(|(index, sql_type)| cell_value(record.get(*index).unwrap_or(""), sql_type))
                .collect();
            exec_with_deadlock_retry(conn, sql, params).await?;
        }
        loaded += 1;
    }
    Ok(loaded)
}

fn cell_value(raw: &str, sql_type: &SqlType) -> Value {
    if raw.is_empty() {
        return Value::NULL;
    }
    match sql_type {
        SqlType::Boolean => Value::from(raw.eq_ignore_ascii_case("true")),
        SqlType::Integer | SqlType::BigInt => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::NULL),
        SqlType::Double => raw.parse::<f64>().map(Value::from).unwrap_or(Value::NULL),
        _ => Value::from(raw),
    }
}

/// The `ON DUPLICATE KEY UPDATE` list for one shard: overwrite mapped
/// non-key columns and flag columns. A shard receiving only keys gets a
/// no-op assignment so the upsert stays valid.
fn upsert_updates(def: &TableDef, pairs: &[(String, String)], flags: &[String]) -> String {
    let mut updates: Vec<String> = pairs
        .iter()
        .filter(|(_, t)| !def.key.iter().any(|k| k == t))
        .map(|(_, t)| format!("{0} = VALUES({0})", quote_ident(t)))
        .chain(flags.iter().map(|f| format!("{} = TRUE", quote_ident(f))))
        .collect();
    if updates.is_empty() {
        let first = quote_ident(&def.key[0]);
        updates.push(format!("{first} = {first}"));
    }
    updates.join(", ")
}

/// Execute a statement, retrying exactly once after a deadlock.
async fn exec_with_deadlock_retry(
    conn: &mut Conn,
    sql: &str,
    params: Vec<Value>,
) -> Result<(), AppError> {
    let first = if params.is_empty() {
        conn.query_drop(sql).await
    } else {
        conn.exec_drop(sql, params.clone()).await
    };
    match first {
        Ok(()) => Ok(()),
        Err(mysql_async::Error::Server(server)) if server.code == ER_LOCK_DEADLOCK => {
            tracing::warn!("deadlock, retrying once: {}", sql);
            tokio::time::sleep(DEADLOCK_BACKOFF).await;
            let second = if params.is_empty() {
                conn.query_drop(sql).await
            } else {
                conn.exec_drop(sql, params).await
            };
            second.map_err(|e| AppError::Internal(format!("{e}; sql: {sql}")))
        }
        Err(e) => Err(AppError::Internal(format!("{e}; sql: {sql}"))),
    }
}

pub async fn drop_primary_index(conn: &mut Conn, def: &TableDef) -> Result<(), AppError> {
    for shard in &def.shards {
        let sql = format!("ALTER TABLE {} DROP PRIMARY KEY", quote_ident(&shard.table));
        tracing::debug!("ddl: {}", sql);
        conn.query_drop(&sql)
            .await
            .map_err(|e| AppError::Internal(format!("{e}; sql: {sql}")))?;
    }
    Ok(())
}

pub async fn create_primary_index(conn: &mut Conn, def: &TableDef) -> Result<(), AppError> {
    let keys = def
        .key
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");
    for shard in &def.shards {
        let sql = format!(
            "ALTER TABLE {} ADD PRIMARY KEY ({})",
            quote_ident(&shard.table),
            keys
        );
        tracing::debug!("ddl: {}", sql);
        conn.query_drop(&sql)
            .await
            .map_err(|e| AppError::Internal(format!("{e}; sql: {sql}")))?;
    }
    Ok(())
}

/// Secondary indexes on key components whose observed cardinality warrants
/// them.
pub async fn create_secondary_indexes(conn: &mut Conn, def: &TableDef) -> Result<(), AppError> {
    for key in &def.key {
        let cardinality = def.columns.get(key).map_or(0, |c| c.cardinality);
        if cardinality < INDEX_CARDINALITY {
            continue;
        }
        for shard in &def.shards {
            let sql = format!(
                "CREATE INDEX {} ON {} ({})",
                quote_ident(&format!("idx__{key}")),
                quote_ident(&shard.table),
                quote_ident(key)
            );
            tracing::debug!("ddl: {}", sql);
            conn.query_drop(&sql)
                .await
                .map_err(|e| AppError::Internal(format!("{e}; sql: {sql}")))?;
        }
    }
    Ok(())
}

pub async fn drop_tables(conn: &mut Conn, tables: &[String]) -> Result<(), AppError> {
    for table in tables {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
        tracing::debug!("ddl: {}", sql);
        conn.query_drop(&sql)
            .await
            .map_err(|e| AppError::Internal(format!("{e}; sql: {sql}")))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Query emission

/// The shard subset and aliasing scheme for one SELECT over a (possibly
/// wide) logical table.
pub struct TablePlan<'a> {
    def: &'a TableDef,
    /// Indices into `def.shards`, aliased `t0`, `t1`, ... in order.
    selected: Vec<usize>,
}

impl<'a> TablePlan<'a> {
    /// Select the shards needed to answer for the touched columns. Key
    /// columns are served by whichever shard comes first.
    pub fn new(def: &'a TableDef, touched: &[String]) -> Self {
        let mut selected: Vec<usize> = Vec::new();
        for column in touched {
            if def.key.iter().any(|k| k == column) || def.sets.iter().any(|s| set_column(s) == *column) {
                continue;
            }
            let base = column.split("--").next().unwrap_or(column);
            if let Some(index) = def
                .shards
                .iter()
                .position(|shard| shard.values.iter().any(|v| v == base))
            {
                if !selected.contains(&index) {
                    selected.push(index);
                }
            }
        }
        if selected.is_empty() {
            selected.push(0);
        }
        selected.sort_unstable();
        Self { def, selected }
    }

    fn alias_of(&self, shard_index: usize) -> String {
        let position = self
            .selected
            .iter()
            .position(|&i| i == shard_index)
            .unwrap_or(0);
        format!("t{position}")
    }

    /// Qualify a base-table column with its shard alias. Translation
    /// columns live in the shard of their base column.
    pub fn qualify(&self, column: &str) -> String {
        let base = column.split("--").next().unwrap_or(column);
        let base = base.strip_prefix('_').unwrap_or(base);
        let shard_index = self
            .def
            .shards
            .iter()
            .position(|shard| shard.values.iter().any(|v| v == base))
            .filter(|index| self.selected.contains(index))
            .unwrap_or(self.selected[0]);
        format!("{}.{}", quote_ident(&self.alias_of(shard_index)), quote_ident(column))
    }

    /// `FROM`/shard-join clause: shards joined with equality on the full key.
    pub fn from_clause(&self) -> String {
        let first = self.selected[0];
        let mut sql = format!(
            "{} AS {}",
            quote_ident(&self.def.shards[first].table),
            quote_ident(&self.alias_of(first))
        );
        for &index in &self.selected[1..] {
            let alias = self.alias_of(index);
            let on = self
                .def
                .key
                .iter()
                .map(|k| {
                    format!(
                        "{}.{} = {}.{}",
                        quote_ident(&self.alias_of(first)),
                        quote_ident(k),
                        quote_ident(&alias),
                        quote_ident(k)
                    )
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            sql.push_str(&format!(
                " INNER JOIN {} AS {} ON {}",
                quote_ident(&self.def.shards[index].table),
                quote_ident(&alias),
                on
            ));
        }
        sql
    }
}

#[derive(Debug, Clone)]
pub struct JoinClause {
    pub table: String,
    pub alias: String,
    /// `(base column, joined column)` equality pairs.
    pub on: Vec<(String, String)>,
}

/// Build the final SELECT. Inner joins always precede the WHERE clause.
pub fn select_sql(
    plan: &TablePlan<'_>,
    projection: &[(String, String)],
    joins: &[JoinClause],
    filters: &[String],
    sort: &[(String, bool)],
) -> String {
    let select_list = projection
        .iter()
        .map(|(column, alias)| format!("{} AS {}", plan.qualify(column), quote_ident(alias)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("SELECT {} FROM {}", select_list, plan.from_clause());

    for join in joins {
        let on = join
            .on
            .iter()
            .map(|(base, foreign)| {
                format!(
                    "{} = {}.{}",
                    plan.qualify(base),
                    quote_ident(&join.alias),
                    quote_ident(foreign)
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        sql.push_str(&format!(
            " INNER JOIN {} AS {} ON {}",
            quote_ident(&join.table),
            quote_ident(&join.alias),
            on
        ));
    }

    if !filters.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&filters.join(" AND "));
    }

    if !sort.is_empty() {
        let order = sort
            .iter()
            .map(|(alias, descending)| {
                if *descending {
                    format!("{} DESC", quote_ident(alias))
                } else {
                    quote_ident(alias)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" ORDER BY {order}"));
    }

    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema::ColumnDef;
    use std::collections::BTreeMap;

    fn def_with_values(n: usize) -> TableDef {
        let values: Vec<String> = (0..n).map(|i| format!("indicator_{i:02}")).collect();
        let mut columns = BTreeMap::new();
        columns.insert(
            "geo".to_string(),
            ColumnDef {
                sql_type: SqlType::Varchar(10),
                cardinality: 200,
            },
        );
        columns.insert(
            "time".to_string(),
            ColumnDef {
                sql_type: SqlType::Integer,
                cardinality: 60,
            },
        );
        for value in &values {
            columns.insert(
                value.clone(),
                ColumnDef {
                    sql_type: SqlType::Double,
                    cardinality: 200,
                },
            );
        }
        TableDef {
            key: vec!["geo".into(), "time".into()],
            values,
            columns,
            ..Default::default()
        }
    }

    #[test]
    fn test_physical_table_name_short() {
        assert_eq!(
            physical_table_name("test", "v1", "concepts"),
            "test__v1__concepts"
        );
    }

    #[test]
    fn test_physical_table_name_hashed() {
        let suffix = "datapoints__".to_string() + &"verylongkeycomponent_".repeat(5);
        let name = physical_table_name("test", "v1", &suffix);
        assert!(name.len() <= 64, "{} is too long", name);
        // Deterministic
        assert_eq!(name, physical_table_name("test", "v1", &suffix));
    }

    #[test]
    fn test_plan_shards_single() {
        let mut def = def_with_values(5);
        plan_shards(&mut def, "test__v1__dp", 1000);
        assert_eq!(def.shards.len(), 1);
        assert_eq!(def.shards[0].table, "test__v1__dp");
        assert_eq!(def.shards[0].values.len(), 5);
    }

    #[test]
    fn test_plan_shards_by_column_cap() {
        let mut def = def_with_values(20);
        plan_shards(&mut def, "test__v1__dp", 10);
        // 2 key columns + 8 values per shard
        assert!(def.shards.len() >= 3, "got {} shards", def.shards.len());
        for shard in &def.shards {
            assert!(shard.values.len() + def.key.len() <= 10);
        }
        let total: usize = def.shards.iter().map(|s| s.values.len()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn test_plan_shards_by_row_size() {
        let mut def = def_with_values(0);
        def.values = (0..5).map(|i| format!("blob_{i}")).collect();
        for value in &def.values {
            def.columns.insert(
                value.clone(),
                ColumnDef {
                    sql_type: SqlType::Varchar(3000),
                    cardinality: 0,
                },
            );
        }
        plan_shards(&mut def, "t", 1000);
        assert!(def.shards.len() > 1);
        for shard in &def.shards {
            let width: usize = shard
                .values
                .iter()
                .map(|v| def.columns[v].sql_type.estimated_width())
                .sum::<usize>()
                + 12 + 4; // keys
            assert!(width <= ROW_SIZE_LIMIT);
        }
    }

    #[test]
    fn test_create_table_sql() {
        let mut def = def_with_values(1);
        def.sets = vec!["country".into()];
        plan_shards(&mut def, "test__v1__dp_geo_time", 1000);
        let sql = create_table_sql(&def, &def.shards[0]);
        assert!(sql.starts_with("CREATE OR REPLACE TABLE `test__v1__dp_geo_time`"));
        assert!(sql.contains("`geo` VARCHAR(10) NOT NULL"));
        assert!(sql.contains("`is--country` BOOLEAN"));
        assert!(sql.contains("PRIMARY KEY (`geo`, `time`)"));
    }

    #[test]
    fn test_create_table_sql_translations() {
        let mut def = TableDef {
            key: vec!["concept".into()],
            values: vec!["description".into()],
            ..Default::default()
        };
        def.columns.insert(
            "concept".into(),
            ColumnDef {
                sql_type: SqlType::Varchar(32),
                cardinality: 10,
            },
        );
        def.columns.insert(
            "description".into(),
            ColumnDef {
                sql_type: SqlType::Varchar(200),
                cardinality: 10,
            },
        );
        def.translations
            .insert("fi-FI".into(), vec!["description".into()]);
        plan_shards(&mut def, "test__v1__concepts", 1000);
        let sql = create_table_sql(&def, &def.shards[0]);
        assert!(sql.contains("`_description--fi-FI` VARCHAR(200)"));
        assert!(sql.contains(
            "`description--fi-FI` VARCHAR(200) AS (COALESCE(`_description--fi-FI`, `description`)) VIRTUAL"
        ));
    }

    #[test]
    fn test_select_sql_single_shard() {
        let mut def = def_with_values(2);
        plan_shards(&mut def, "dp", 1000);
        let plan = TablePlan::new(&def, &["indicator_00".into()]);
        let sql = select_sql(
            &plan,
            &[
                ("geo".into(), "geo".into()),
                ("indicator_00".into(), "indicator_00".into()),
            ],
            &[],
            &["`t0`.`time` <=> 2000".into()],
            &[("geo".into(), false)],
        );
        assert_eq!(
            sql,
            "SELECT `t0`.`geo` AS `geo`, `t0`.`indicator_00` AS `indicator_00` \
             FROM `dp` AS `t0` WHERE `t0`.`time` <=> 2000 ORDER BY `geo`"
        );
    }

    #[test]
    fn test_select_sql_wide_joins_shards_on_key() {
        let mut def = def_with_values(20);
        plan_shards(&mut def, "dp", 10);
        let touched = vec!["indicator_00".to_string(), "indicator_19".to_string()];
        let plan = TablePlan::new(&def, &touched);
        let sql = select_sql(
            &plan,
            &[
                ("geo".into(), "geo".into()),
                ("indicator_00".into(), "indicator_00".into()),
                ("indicator_19".into(), "indicator_19".into()),
            ],
            &[],
            &[],
            &[],
        );
        assert!(sql.contains("INNER JOIN"));
        assert!(sql.contains("`t0`.`geo` = `t1`.`geo`"));
        assert!(sql.contains("`t0`.`time` = `t1`.`time`"));
    }

    #[test]
    fn test_select_sql_single_shard_when_projection_fits() {
        let mut def = def_with_values(20);
        plan_shards(&mut def, "dp", 10);
        let plan = TablePlan::new(&def, &["indicator_00".into(), "indicator_01".into()]);
        let sql = select_sql(
            &plan,
            &[("indicator_00".into(), "indicator_00".into())],
            &[],
            &[],
            &[],
        );
        assert!(!sql.contains("INNER JOIN"), "unexpected shard join: {sql}");
    }

    #[test]
    fn test_select_sql_user_join_precedes_where() {
        let mut def = def_with_values(1);
        plan_shards(&mut def, "dp", 1000);
        let plan = TablePlan::new(&def, &[]);
        let sql = select_sql(
            &plan,
            &[("geo".into(), "geo".into())],
            &[JoinClause {
                table: "test__v1__geo".into(),
                alias: "j_geo".into(),
                on: vec![("geo".into(), "geo".into())],
            }],
            &["`j_geo`.`is--country` IS TRUE".into()],
            &[],
        );
        let join_at = sql.find("INNER JOIN").unwrap();
        let where_at = sql.find("WHERE").unwrap();
        assert!(join_at < where_at);
        assert!(sql.contains("`t0`.`geo` = `j_geo`.`geo`"));
    }

    #[test]
    fn test_quote_helpers() {
        assert_eq!(quote_ident("is--country"), "`is--country`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
        assert_eq!(quote_str("O'Brien"), "'O\\'Brien'");
        assert_eq!(quote_str("back\\slash"), "'back\\\\slash'");
    }

    #[test]
    fn test_cell_value_conversions() {
        assert_eq!(cell_value("", &SqlType::Integer), Value::NULL);
        assert_eq!(cell_value("42", &SqlType::Integer), Value::from(42i64));
        assert_eq!(cell_value("TRUE", &SqlType::Boolean), Value::from(true));
        assert_eq!(cell_value("0.5", &SqlType::Double), Value::from(0.5f64));
        assert_eq!(
            cell_value("sweden", &SqlType::Varchar(10)),
            Value::from("sweden")
        );
    }
}
