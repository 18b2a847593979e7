use serde_json::Value;
use std::collections::BTreeMap;

use crate::api::middleware::AppError;
use crate::models::query::{
    CmpOp, DdfQuery, FromClause, JoinSpec, Predicate, SortKey, ValueOperand,
};
use crate::models::schema::{SchemaModel, TableDef};
use crate::services::table::{quote_ident, quote_str, select_sql, JoinClause, TablePlan};

/// The compiled form of a query: either one SQL statement or, for schema
/// queries, a synthetic row stream.
#[derive(Debug)]
pub struct CompiledQuery {
    pub sql: Option<String>,
    pub header: Vec<String>,
    /// Leading columns of the header that form the key.
    pub key_len: usize,
    /// Rows produced without the database, for `<kind>.schema` queries.
    pub synthetic_rows: Option<Vec<Vec<Value>>>,
    /// Suppress rows whose value columns are all null (datapoints only).
    pub suppress_null_rows: bool,
    pub warnings: Vec<String>,
}

/// Compile a validated query against a dataset's schema model.
pub fn compile(query: &DdfQuery, schema: &SchemaModel) -> Result<CompiledQuery, AppError> {
    // Equivalent queries must produce identical SQL, so the projection is
    // sorted before anything else looks at it.
    let mut key: Vec<String> = query.select.key.clone();
    key.sort_unstable();
    let mut values: Vec<String> = query.select.value.clone();
    values.sort_unstable();

    if let FromClause::Schema(kind) = query.from {
        let header = key.clone();
        let rows = schema
            .schema_rows(kind)
            .into_iter()
            .map(|pair| project_schema_row(&header, &pair))
            .collect();
        return Ok(CompiledQuery {
            sql: None,
            key_len: header.len(),
            header,
            synthetic_rows: Some(rows),
            suppress_null_rows: false,
            warnings: Vec::new(),
        });
    }

    let compiler = Compiler::resolve(query, schema, key, values)?;
    compiler.emit(query)
}

/// Map a synthetic `[keyTuple, value]` pair onto the requested columns.
fn project_schema_row(header: &[String], pair: &[Value]) -> Vec<Value> {
    header
        .iter()
        .map(|column| match column.as_str() {
            "key" => pair[0].clone(),
            "value" => pair[1].clone(),
            _ => Value::Null,
        })
        .collect()
}

/// One key column of the projection: the name the client asked for and the
/// physical column after entity-set normalisation.
struct KeyBinding {
    requested: String,
    physical: String,
    /// Set restriction to honour, if the requested column was an entity set.
    set: Option<String>,
}

struct Compiler<'a> {
    schema: &'a SchemaModel,
    def: &'a TableDef,
    from: FromClause,
    keys: Vec<KeyBinding>,
    values: Vec<String>,
}

impl<'a> Compiler<'a> {
    fn resolve(
        query: &DdfQuery,
        schema: &'a SchemaModel,
        key: Vec<String>,
        values: Vec<String>,
    ) -> Result<Self, AppError> {
        let def = match query.from {
            FromClause::Concepts => schema
                .concepts_table()
                .ok_or_else(|| AppError::QuerySemantic("dataset has no concepts".into()))?,
            FromClause::Entities => {
                if key.len() != 1 {
                    return Err(AppError::QuerySemantic(
                        "entity queries take exactly one key column".into(),
                    ));
                }
                schema.entity_table(&key[0]).ok_or_else(|| {
                    AppError::QuerySemantic(format!("no entity domain serves {:?}", key[0]))
                })?
            }
            FromClause::Datapoints => schema.datapoint_table(&key).ok_or_else(|| {
                AppError::QuerySemantic(format!("no datapoints keyed by {}", key.join(", ")))
            })?,
            FromClause::Schema(_) => unreachable!("schema queries are synthesised"),
        };

        let keys = key
            .iter()
            .map(|requested| {
                let physical = schema.resolve_domain(requested).to_string();
                if !def.key.iter().any(|k| k == &physical) {
                    return Err(AppError::QuerySemantic(format!(
                        "key column {requested:?} is not part of the table key"
                    )));
                }
                let set = (physical != *requested).then(|| requested.clone());
                Ok(KeyBinding {
                    requested: requested.clone(),
                    physical,
                    set,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for value in &values {
            let known = def.has_column(value)
                || def.sets.iter().any(|s| format!("is--{s}") == *value);
            if !known {
                return Err(AppError::QuerySemantic(format!(
                    "unknown value column {value:?}"
                )));
            }
        }

        Ok(Self {
            schema,
            def,
            from: query.from,
            keys,
            values,
        })
    }

    fn emit(&self, query: &DdfQuery) -> Result<CompiledQuery, AppError> {
        let language = query.language.as_deref();
        let mut warnings = Vec::new();

        // Projection: requested key names first, then value columns, with
        // translated values routed through the coalescing virtual column.
        let mut projection: Vec<(String, String)> = Vec::new();
        for binding in &self.keys {
            projection.push((binding.physical.clone(), binding.requested.clone()));
        }
        for value in &self.values {
            projection.push((self.def.projected_column(value, language), value.clone()));
        }

        // Join bindings. Time-domain keys join the base table against
        // itself, so they add no clause; entity keys join the domain table.
        let mut joins: Vec<JoinClause> = Vec::new();
        let mut join_aliases: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut join_filters: Vec<(String, Predicate)> = Vec::new();
        let mut joined_on: BTreeMap<String, String> = BTreeMap::new();
        for (var, spec) in &query.join {
            self.resolve_join(
                var,
                spec,
                &mut joins,
                &mut join_aliases,
                &mut join_filters,
                &mut joined_on,
            )?;
        }

        // Columns the plan must be able to serve decide the shard subset.
        // Filter columns reaching the base table through a time-domain
        // binding (dotted or in the binding's own where) count too.
        let mut touched: Vec<String> = projection.iter().map(|(c, _)| c.clone()).collect();
        if let Some(where_clause) = &query.where_clause {
            self.collect_base_columns(where_clause, &join_aliases, true, &mut touched);
        }
        for (var, predicate) in &join_filters {
            let base_scope = matches!(join_aliases.get(var), Some(None));
            self.collect_base_columns(predicate, &join_aliases, base_scope, &mut touched);
        }
        let plan = TablePlan::new(self.def, &touched);

        // Implicit entity-set restrictions from the projection key: on the
        // base table for entity queries, through a joined entity table
        // otherwise
        let mut filters: Vec<String> = Vec::new();
        let mut set_joins: Vec<JoinClause> = Vec::new();
        for binding in &self.keys {
            let Some(set) = &binding.set else { continue };
            if self.from == FromClause::Entities {
                filters.push(format!("{} IS TRUE", plan.qualify(&format!("is--{set}"))));
            } else {
                let entity = self.schema.entity_table(set).ok_or_else(|| {
                    AppError::QuerySemantic(format!("no entity domain serves {set:?}"))
                })?;
                let alias = format!("e_{set}");
                set_joins.push(JoinClause {
                    table: entity.primary_table().to_string(),
                    alias: alias.clone(),
                    on: vec![(binding.physical.clone(), binding.physical.clone())],
                });
                filters.push(format!(
                    "{}.{} IS TRUE",
                    quote_ident(&alias),
                    quote_ident(&format!("is--{set}"))
                ));
            }
        }

        // Base where clause
        if let Some(where_clause) = &query.where_clause {
            let rendered = self.render(where_clause, &plan, &join_aliases, None)?;
            if rendered != "TRUE" {
                filters.push(rendered);
            }
        }

        // Join where clauses, qualified against the join's alias (or the
        // base table for time-domain joins)
        for (var, predicate) in &join_filters {
            let scope = join_aliases.get(var).cloned().flatten();
            let rendered = self.render(predicate, &plan, &join_aliases, scope.as_deref())?;
            if rendered != "TRUE" {
                filters.push(rendered);
            }
        }

        // Ordering on columns outside the projection is dropped with a
        // warning rather than failing the query
        let header: Vec<String> = projection.iter().map(|(_, alias)| alias.clone()).collect();
        let mut sort: Vec<(String, bool)> = Vec::new();
        for SortKey { column, descending } in &query.order_by {
            if header.iter().any(|h| h == column) {
                sort.push((column.clone(), *descending));
            } else {
                warnings.push(format!(
                    "order_by column {column:?} is not part of the projection and was ignored"
                ));
            }
        }

        let mut all_joins = set_joins;
        all_joins.extend(joins);
        let sql = select_sql(&plan, &projection, &all_joins, &filters, &sort);
        tracing::debug!("compiled query: {}", sql);

        Ok(CompiledQuery {
            sql: Some(sql),
            key_len: self.keys.len(),
            header,
            synthetic_rows: None,
            suppress_null_rows: self.from == FromClause::Datapoints,
            warnings,
        })
    }

    fn resolve_join(
        &self,
        var: &str,
        spec: &JoinSpec,
        joins: &mut Vec<JoinClause>,
        join_aliases: &mut BTreeMap<String, Option<String>>,
        join_filters: &mut Vec<(String, Predicate)>,
        joined_on: &mut BTreeMap<String, String>,
    ) -> Result<(), AppError> {
        let on_column = &spec.on[0];
        let domain = self.schema.resolve_domain(on_column);

        if spec.on.len() == 1 && SchemaModel::is_time_domain(domain) {
            // In-domain join: conditions apply to the base table directly
            join_aliases.insert(var.to_string(), None);
            if let Some(where_clause) = &spec.where_clause {
                join_filters.push((var.to_string(), where_clause.clone()));
            }
            return Ok(());
        }

        let entity = self.schema.entity_table(on_column).ok_or_else(|| {
            AppError::QuerySemantic(format!("join {var:?} references unknown table for {on_column:?}"))
        })?;
        let table = entity.primary_table().to_string();
        if let Some(existing) = joined_on.get(&table) {
            if existing != domain {
                return Err(AppError::QuerySemantic(format!(
                    "table {table:?} joined twice with conflicting columns"
                )));
            }
        }
        joined_on.insert(table.clone(), domain.to_string());

        let alias = format!("j_{var}");
        let mut on = vec![(domain.to_string(), domain.to_string())];
        for extra in &spec.on[1..] {
            let extra = self.schema.resolve_domain(extra).to_string();
            on.push((extra.clone(), extra));
        }
        joins.push(JoinClause {
            table,
            alias: alias.clone(),
            on,
        });

        // A set-valued join key restricts the joined entities to the set
        if domain != on_column {
            join_filters.push((
                var.to_string(),
                Predicate::Cmp {
                    column: format!("is--{on_column}"),
                    op: CmpOp::Eq,
                    rhs: ValueOperand::Bool(true),
                },
            ));
        }

        join_aliases.insert(var.to_string(), Some(alias));
        if let Some(where_clause) = &spec.where_clause {
            join_filters.push((var.to_string(), where_clause.clone()));
        }
        Ok(())
    }

    /// Render a predicate to SQL. `scope` qualifies bare columns against a
    /// join alias; `None` means the base table.
    fn render(
        &self,
        predicate: &Predicate,
        plan: &TablePlan<'_>,
        join_aliases: &BTreeMap<String, Option<String>>,
        scope: Option<&str>,
    ) -> Result<String, AppError> {
        match predicate {
            Predicate::And(terms) => {
                let rendered = terms
                    .iter()
                    .map(|t| self.render(t, plan, join_aliases, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                let useful: Vec<String> =
                    rendered.into_iter().filter(|r| r != "TRUE").collect();
                if useful.is_empty() {
                    Ok("TRUE".to_string())
                } else {
                    Ok(format!("({})", useful.join(" AND ")))
                }
            }
            Predicate::Or(terms) => {
                let rendered = terms
                    .iter()
                    .map(|t| self.render(t, plan, join_aliases, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", rendered.join(" OR ")))
            }
            Predicate::JoinRef { var, .. } => {
                if !join_aliases.contains_key(var) {
                    return Err(AppError::QuerySemantic(format!(
                        "predicate references unknown join ${var}"
                    )));
                }
                // The INNER JOIN itself enforces the binding
                Ok("TRUE".to_string())
            }
            Predicate::Cmp { column, op, rhs } => {
                let reference = self.render_column(column, plan, join_aliases, scope)?;
                render_comparison(&reference, *op, rhs)
            }
        }
    }

    /// Columns a predicate reads from the base table, for shard planning.
    /// Dotted references follow their binding: entity joins read the
    /// foreign table (ignored here), time-domain joins read the base
    /// table. `base_scope` says whether bare columns address the base
    /// table in this predicate's context.
    fn collect_base_columns(
        &self,
        predicate: &Predicate,
        join_aliases: &BTreeMap<String, Option<String>>,
        base_scope: bool,
        out: &mut Vec<String>,
    ) {
        match predicate {
            Predicate::And(terms) | Predicate::Or(terms) => {
                for term in terms {
                    self.collect_base_columns(term, join_aliases, base_scope, out);
                }
            }
            Predicate::Cmp { column, .. } => {
                if let Some((var, rest)) = column.split_once('.') {
                    let var = var.trim_start_matches('$');
                    if matches!(join_aliases.get(var), Some(None)) {
                        out.push(self.schema.resolve_domain(rest).to_string());
                    }
                } else if base_scope {
                    out.push(self.schema.resolve_domain(column).to_string());
                }
            }
            Predicate::JoinRef { .. } => {}
        }
    }

    fn render_column(
        &self,
        column: &str,
        plan: &TablePlan<'_>,
        join_aliases: &BTreeMap<String, Option<String>>,
        scope: Option<&str>,
    ) -> Result<String, AppError> {
        // A dotted reference qualifies against the named join
        if let Some((var, rest)) = column.split_once('.') {
            let var = var.trim_start_matches('$');
            return match join_aliases.get(var) {
                Some(Some(alias)) => Ok(format!("{}.{}", quote_ident(alias), quote_ident(rest))),
                Some(None) => Ok(plan.qualify(&self.schema.resolve_domain(rest).to_string())),
                None => Err(AppError::QuerySemantic(format!(
                    "column {column:?} references unknown join ${var}"
                ))),
            };
        }
        if let Some(alias) = scope {
            // Entity-set names inside a join's predicate address the
            // joined table's domain column
            let resolved = self.schema.resolve_domain(column);
            return Ok(format!("{}.{}", quote_ident(alias), quote_ident(resolved)));
        }
        // Entity-set names in base predicates resolve to the domain column
        Ok(plan.qualify(self.schema.resolve_domain(column)))
    }
}

fn render_comparison(reference: &str, op: CmpOp, rhs: &ValueOperand) -> Result<String, AppError> {
    // Boolean equality reads better (and indexes better) as IS [NOT] TRUE
    if let ValueOperand::Bool(flag) = rhs {
        match op {
            CmpOp::Eq => {
                return Ok(format!(
                    "{reference} IS {}",
                    if *flag { "TRUE" } else { "FALSE" }
                ))
            }
            CmpOp::Ne => {
                return Ok(format!(
                    "{reference} IS NOT {}",
                    if *flag { "TRUE" } else { "FALSE" }
                ))
            }
            _ => {}
        }
    }

    let sql = match op {
        CmpOp::Eq => format!("{reference} <=> {}", render_operand(rhs)?),
        CmpOp::Ne => format!("NOT ({reference} <=> {})", render_operand(rhs)?),
        CmpOp::Gt => format!("{reference} > {}", render_operand(rhs)?),
        CmpOp::Gte => format!("{reference} >= {}", render_operand(rhs)?),
        CmpOp::Lt => format!("{reference} < {}", render_operand(rhs)?),
        CmpOp::Lte => format!("{reference} <= {}", render_operand(rhs)?),
        CmpOp::In | CmpOp::Nin => {
            let ValueOperand::List(items) = rhs else {
                return Err(AppError::QuerySyntax("$in/$nin expects an array".into()));
            };
            if items.is_empty() {
                // IN () is not valid SQL
                return Ok(match op {
                    CmpOp::In => "FALSE".to_string(),
                    _ => "TRUE".to_string(),
                });
            }
            let list = items
                .iter()
                .map(render_operand)
                .collect::<Result<Vec<_>, _>>()?
                .join(", ");
            match op {
                CmpOp::In => format!("{reference} IN ({list})"),
                _ => format!("{reference} NOT IN ({list})"),
            }
        }
    };
    Ok(sql)
}

fn render_operand(operand: &ValueOperand) -> Result<String, AppError> {
    match operand {
        ValueOperand::Num(n) => Ok(n.to_string()),
        ValueOperand::Str(s) => Ok(quote_str(s)),
        ValueOperand::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        ValueOperand::Null => Ok("NULL".to_string()),
        ValueOperand::List(_) => Err(AppError::QuerySyntax(
            "nested arrays are not valid operands".into(),
        )),
    }
}
