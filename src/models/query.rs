use serde_json::{Number, Value};
use std::collections::BTreeMap;

use crate::api::middleware::AppError;
use crate::models::urlon;

/// A structured dataset query, decoded and validated but not yet compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct DdfQuery {
    pub select: Select,
    pub from: FromClause,
    pub where_clause: Option<Predicate>,
    /// Join bindings keyed by variable name, without the `$` prefix.
    pub join: BTreeMap<String, JoinSpec>,
    pub order_by: Vec<SortKey>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub key: Vec<String>,
    pub value: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FromClause {
    Concepts,
    Entities,
    Datapoints,
    Schema(SchemaKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Concepts,
    Entities,
    Datapoints,
    All,
}

impl FromClause {
    fn parse(text: &str) -> Result<Self, AppError> {
        match text {
            "concepts" => Ok(FromClause::Concepts),
            "entities" => Ok(FromClause::Entities),
            "datapoints" => Ok(FromClause::Datapoints),
            "concepts.schema" => Ok(FromClause::Schema(SchemaKind::Concepts)),
            "entities.schema" => Ok(FromClause::Schema(SchemaKind::Entities)),
            "datapoints.schema" => Ok(FromClause::Schema(SchemaKind::Datapoints)),
            "*.schema" => Ok(FromClause::Schema(SchemaKind::All)),
            other => Err(AppError::QuerySemantic(format!(
                "from {other:?} is not supported"
            ))),
        }
    }
}

/// A predicate tree in normalized form: scalars are rewritten to `$eq` and
/// multi-operator comparison objects to an explicit `$and` during parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Cmp {
        column: String,
        op: CmpOp,
        rhs: ValueOperand,
    },
    /// A `column: "$var"` reference binding the column to a join.
    JoinRef { column: String, var: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
}

impl CmpOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "$eq" => Some(CmpOp::Eq),
            "$ne" => Some(CmpOp::Ne),
            "$gt" => Some(CmpOp::Gt),
            "$gte" => Some(CmpOp::Gte),
            "$lt" => Some(CmpOp::Lt),
            "$lte" => Some(CmpOp::Lte),
            "$in" => Some(CmpOp::In),
            "$nin" => Some(CmpOp::Nin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueOperand {
    Num(Number),
    Str(String),
    Bool(bool),
    Null,
    List(Vec<ValueOperand>),
}

impl ValueOperand {
    fn parse(value: &Value) -> Result<Self, AppError> {
        match value {
            Value::Number(n) => Ok(ValueOperand::Num(n.clone())),
            Value::String(s) => Ok(ValueOperand::Str(s.clone())),
            Value::Bool(b) => Ok(ValueOperand::Bool(*b)),
            Value::Null => Ok(ValueOperand::Null),
            Value::Array(items) => Ok(ValueOperand::List(
                items
                    .iter()
                    .map(ValueOperand::parse)
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(_) => Err(AppError::QuerySyntax(
                "comparison operand cannot be an object".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    /// The column(s) the binding joins on.
    pub on: Vec<String>,
    pub where_clause: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

impl DdfQuery {
    /// Decode a query from a raw URL query string: URL object notation is
    /// tried first, percent-encoded JSON second.
    pub fn from_query_string(raw: &str) -> Result<Self, AppError> {
        let decoded = percent_decode(raw);
        let value = match urlon::parse(&decoded) {
            Ok(value) => value,
            Err(_) => serde_json::from_str(&decoded).map_err(|_| {
                AppError::QuerySyntax(
                    "query string is neither URL object notation nor JSON".to_string(),
                )
            })?,
        };
        Self::from_value(&value)
    }

    /// Validate and convert a decoded JSON document into a query.
    pub fn from_value(value: &Value) -> Result<Self, AppError> {
        let object = value
            .as_object()
            .ok_or_else(|| AppError::QuerySyntax("query must be an object".to_string()))?;

        let select = object
            .get("select")
            .ok_or_else(|| AppError::QuerySyntax("missing select".to_string()))?;
        let select = Select {
            key: string_array(select.get("key"), "select.key")?,
            value: string_array(select.get("value"), "select.value")?,
        };
        if select.key.is_empty() {
            return Err(AppError::QuerySyntax("select.key must not be empty".to_string()));
        }

        let from = match object.get("from") {
            Some(Value::String(text)) => FromClause::parse(text)?,
            Some(_) => return Err(AppError::QuerySyntax("from must be a string".to_string())),
            None => return Err(AppError::QuerySyntax("missing from".to_string())),
        };

        let where_clause = match object.get("where") {
            Some(value) => Some(parse_predicate(value)?),
            None => None,
        };

        let mut join = BTreeMap::new();
        if let Some(bindings) = object.get("join") {
            let bindings = bindings
                .as_object()
                .ok_or_else(|| AppError::QuerySyntax("join must be an object".to_string()))?;
            for (var, spec) in bindings {
                let name = var.strip_prefix('$').ok_or_else(|| {
                    AppError::QuerySyntax(format!(
                        "join variable {var:?} must start with '$'"
                    ))
                })?;
                if name.is_empty() {
                    return Err(AppError::QuerySyntax(
                        "join variable must not be empty".to_string(),
                    ));
                }
                join.insert(name.to_string(), parse_join_spec(spec)?);
            }
        }

        let order_by = match object.get("order_by") {
            Some(value) => parse_order_by(value)?,
            None => Vec::new(),
        };

        let language = match object.get("language") {
            Some(Value::String(tag)) => {
                if !valid_language_tag(tag) {
                    return Err(AppError::QuerySyntax(format!(
                        "malformed language tag {tag:?}"
                    )));
                }
                Some(tag.clone())
            }
            Some(_) => {
                return Err(AppError::QuerySyntax("language must be a string".to_string()))
            }
            None => None,
        };

        Ok(DdfQuery {
            select,
            from,
            where_clause,
            join,
            order_by,
            language,
        })
    }
}

fn string_array(value: Option<&Value>, field: &str) -> Result<Vec<String>, AppError> {
    let items = value
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::QuerySyntax(format!("{field} must be an array")))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| AppError::QuerySyntax(format!("{field} must contain strings")))
        })
        .collect()
}

fn parse_predicate(value: &Value) -> Result<Predicate, AppError> {
    let object = value
        .as_object()
        .ok_or_else(|| AppError::QuerySyntax("where must be an object".to_string()))?;

    let mut terms = Vec::new();
    for (key, item) in object {
        match key.as_str() {
            "$and" => terms.push(parse_branch(item, Predicate::And)?),
            "$or" => terms.push(parse_branch(item, Predicate::Or)?),
            // A dotted `$var.column` key is a join-qualified column
            // reference, not an operator
            key if key.starts_with('$') && !key.contains('.') => {
                return Err(AppError::QuerySyntax(format!(
                    "unknown logical operator {key:?}"
                )))
            }
            column => terms.push(parse_condition(column, item)?),
        }
    }
    match terms.len() {
        0 => Err(AppError::QuerySyntax("where must not be empty".to_string())),
        1 => Ok(terms.into_iter().next().unwrap()),
        _ => Ok(Predicate::And(terms)),
    }
}

fn parse_branch(
    value: &Value,
    combine: fn(Vec<Predicate>) -> Predicate,
) -> Result<Predicate, AppError> {
    let items = value
        .as_array()
        .ok_or_else(|| AppError::QuerySyntax("$and/$or expects an array".to_string()))?;
    let terms = items
        .iter()
        .map(parse_predicate)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(combine(terms))
}

/// Parse a `column: <condition>` entry. Scalars become an implicit `$eq`,
/// `$`-prefixed strings become join references and operator objects with
/// more than one operator become an explicit `$and`.
fn parse_condition(column: &str, value: &Value) -> Result<Predicate, AppError> {
    match value {
        Value::String(s) if s.starts_with('$') => Ok(Predicate::JoinRef {
            column: column.to_string(),
            var: s[1..].to_string(),
        }),
        Value::Object(ops) => {
            let mut cmps = Vec::new();
            for (op, operand) in ops {
                let op = CmpOp::parse(op).ok_or_else(|| {
                    AppError::QuerySyntax(format!("unknown comparison operator {op:?}"))
                })?;
                cmps.push(Predicate::Cmp {
                    column: column.to_string(),
                    op,
                    rhs: ValueOperand::parse(operand)?,
                });
            }
            match cmps.len() {
                0 => Err(AppError::QuerySyntax(format!(
                    "empty comparison for column {column:?}"
                ))),
                1 => Ok(cmps.into_iter().next().unwrap()),
                _ => Ok(Predicate::And(cmps)),
            }
        }
        scalar => Ok(Predicate::Cmp {
            column: column.to_string(),
            op: CmpOp::Eq,
            rhs: ValueOperand::parse(scalar)?,
        }),
    }
}

fn parse_join_spec(value: &Value) -> Result<JoinSpec, AppError> {
    let object = value
        .as_object()
        .ok_or_else(|| AppError::QuerySyntax("join binding must be an object".to_string()))?;
    let on = match object.get("key") {
        Some(Value::String(column)) => vec![column.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    AppError::QuerySyntax("join key must contain strings".to_string())
                })
            })
            .collect::<Result<_, _>>()?,
        _ => {
            return Err(AppError::QuerySyntax(
                "join binding requires a key".to_string(),
            ))
        }
    };
    if on.is_empty() {
        return Err(AppError::QuerySyntax("join key must not be empty".to_string()));
    }
    let where_clause = match object.get("where") {
        Some(value) => Some(parse_predicate(value)?),
        None => None,
    };
    Ok(JoinSpec { on, where_clause })
}

fn parse_order_by(value: &Value) -> Result<Vec<SortKey>, AppError> {
    let items = value
        .as_array()
        .ok_or_else(|| AppError::QuerySyntax("order_by must be an array".to_string()))?;
    let mut keys = Vec::new();
    for item in items {
        match item {
            Value::String(column) => keys.push(SortKey {
                column: column.clone(),
                descending: false,
            }),
            Value::Object(map) if map.len() == 1 => {
                let (column, direction) = map.iter().next().unwrap();
                let descending = match direction.as_str() {
                    Some("asc") => false,
                    Some("desc") => true,
                    _ => {
                        return Err(AppError::QuerySyntax(
                            "order_by direction must be \"asc\" or \"desc\"".to_string(),
                        ))
                    }
                };
                keys.push(SortKey {
                    column: column.clone(),
                    descending,
                });
            }
            _ => {
                return Err(AppError::QuerySyntax(
                    "order_by entries must be strings or single-key objects".to_string(),
                ))
            }
        }
    }
    Ok(keys)
}

/// BCP-47-like tag: 2-3 letters, optionally a `-` or `_` and 2-15 more
/// characters from the tag alphabet.
fn valid_language_tag(tag: &str) -> bool {
    let mut parts = tag.splitn(2, ['-', '_']);
    let primary = parts.next().unwrap_or("");
    if !(2..=3).contains(&primary.len()) || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    match parts.next() {
        None => true,
        Some(rest) => {
            (2..=15).contains(&rest.len())
                && rest
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(value: Value) -> Result<DdfQuery, AppError> {
        DdfQuery::from_value(&value)
    }

    #[test]
    fn test_minimal_query() {
        let q = query(json!({
            "select": {"key": ["concept"], "value": []},
            "from": "concepts"
        }))
        .unwrap();
        assert_eq!(q.from, FromClause::Concepts);
        assert_eq!(q.select.key, vec!["concept"]);
        assert!(q.select.value.is_empty());
    }

    #[test]
    fn test_missing_select() {
        let err = query(json!({"from": "concepts"})).unwrap_err();
        assert!(matches!(err, AppError::QuerySyntax(_)));
    }

    #[test]
    fn test_select_key_must_be_array() {
        let err = query(json!({
            "select": {"key": "concept", "value": []},
            "from": "concepts"
        }))
        .unwrap_err();
        assert!(matches!(err, AppError::QuerySyntax(_)));
    }

    #[test]
    fn test_unsupported_from() {
        let err = query(json!({
            "select": {"key": ["concept"], "value": []},
            "from": "indicators"
        }))
        .unwrap_err();
        assert!(matches!(err, AppError::QuerySemantic(_)));
    }

    #[test]
    fn test_schema_from_kinds() {
        for (text, kind) in [
            ("concepts.schema", SchemaKind::Concepts),
            ("entities.schema", SchemaKind::Entities),
            ("datapoints.schema", SchemaKind::Datapoints),
            ("*.schema", SchemaKind::All),
        ] {
            let q = query(json!({
                "select": {"key": ["key", "value"], "value": []},
                "from": text
            }))
            .unwrap();
            assert_eq!(q.from, FromClause::Schema(kind));
        }
    }

    #[test]
    fn test_scalar_becomes_eq() {
        let q = query(json!({
            "select": {"key": ["geo"], "value": []},
            "from": "entities",
            "where": {"world_4region": "africa"}
        }))
        .unwrap();
        assert_eq!(
            q.where_clause.unwrap(),
            Predicate::Cmp {
                column: "world_4region".into(),
                op: CmpOp::Eq,
                rhs: ValueOperand::Str("africa".into()),
            }
        );
    }

    #[test]
    fn test_multi_operator_becomes_and() {
        let q = query(json!({
            "select": {"key": ["geo", "time"], "value": ["population"]},
            "from": "datapoints",
            "where": {"time": {"$gte": 1990, "$lt": 2000}}
        }))
        .unwrap();
        match q.where_clause.unwrap() {
            Predicate::And(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_join_reference_and_binding() {
        let q = query(json!({
            "select": {"key": ["city", "time"], "value": ["population"]},
            "from": "datapoints",
            "where": {"$and": [{"geo": "$geo"}]},
            "join": {"$geo": {"key": "geo", "where": {"latitude": {"$lt": 25}}}}
        }))
        .unwrap();
        assert_eq!(
            q.where_clause.unwrap(),
            Predicate::JoinRef {
                column: "geo".into(),
                var: "geo".into()
            }
        );
        let binding = q.join.get("geo").unwrap();
        assert_eq!(binding.on, vec!["geo"]);
        assert!(binding.where_clause.is_some());
    }

    #[test]
    fn test_dotted_join_reference_column() {
        let q = query(json!({
            "select": {"key": ["geo", "time"], "value": ["population"]},
            "from": "datapoints",
            "join": {"$time": {"key": "time"}},
            "where": {"$time.population": {"$gt": 0}}
        }))
        .unwrap();
        assert_eq!(
            q.where_clause.unwrap(),
            Predicate::Cmp {
                column: "$time.population".into(),
                op: CmpOp::Gt,
                rhs: ValueOperand::Num(0.into()),
            }
        );

        // A bare `$`-prefixed key without a dot is still rejected
        let err = query(json!({
            "select": {"key": ["geo"], "value": []},
            "from": "entities",
            "where": {"$not": [{"geo": "swe"}]}
        }))
        .unwrap_err();
        assert!(matches!(err, AppError::QuerySyntax(_)));
    }

    #[test]
    fn test_malformed_join_variable() {
        let err = query(json!({
            "select": {"key": ["geo"], "value": []},
            "from": "entities",
            "join": {"geo": {"key": "geo"}}
        }))
        .unwrap_err();
        assert!(matches!(err, AppError::QuerySyntax(_)));
    }

    #[test]
    fn test_order_by_forms() {
        let q = query(json!({
            "select": {"key": ["geo", "time"], "value": ["population"]},
            "from": "datapoints",
            "order_by": ["time", {"population": "desc"}]
        }))
        .unwrap();
        assert_eq!(q.order_by.len(), 2);
        assert!(!q.order_by[0].descending);
        assert!(q.order_by[1].descending);

        let err = query(json!({
            "select": {"key": ["geo"], "value": []},
            "from": "entities",
            "order_by": [{"geo": "descending"}]
        }))
        .unwrap_err();
        assert!(matches!(err, AppError::QuerySyntax(_)));
    }

    #[test]
    fn test_language_validation() {
        for tag in ["fi", "fi-FI", "en_US", "zh-Hans", "pt-BR"] {
            assert!(valid_language_tag(tag), "{tag} should be valid");
        }
        for tag in ["f", "finnish-language-tag-overflowing", "12-FI", "fi-"] {
            assert!(!valid_language_tag(tag), "{tag} should be invalid");
        }
    }

    #[test]
    fn test_decode_urlon_then_json_fallback() {
        let urlon = "$select$key@=concept;&value@;;&from=concepts";
        let q = DdfQuery::from_query_string(urlon).unwrap();
        assert_eq!(q.from, FromClause::Concepts);

        let json = "%7B%22select%22%3A%7B%22key%22%3A%5B%22concept%22%5D%2C%22value%22%3A%5B%5D%7D%2C%22from%22%3A%22concepts%22%7D";
        let q = DdfQuery::from_query_string(json).unwrap();
        assert_eq!(q.from, FromClause::Concepts);

        assert!(DdfQuery::from_query_string("definitely not a query").is_err());
    }
}
