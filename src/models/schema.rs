use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::models::query::SchemaKind;

/// Single-component keys in this set join the base table against itself
/// instead of an entity table.
pub const TIME_DOMAINS: &[&str] = &["time", "year", "quarter", "month", "week", "day"];

/// The in-memory representation of a dataset's schema, persisted as the
/// `definition` JSON document in the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaModel {
    /// Concept tables keyed by the `$`-joined sorted key tuple.
    pub concepts: BTreeMap<String, TableDef>,
    /// Entity domain tables, one per domain, keyed like `concepts`.
    pub entities: BTreeMap<String, TableDef>,
    /// Datapoint tables keyed by the domain-normalised key tuple.
    pub datapoints: BTreeMap<String, TableDef>,
    /// Entity set to entity domain resolution.
    pub domains: BTreeMap<String, String>,
    /// Languages contributed by the package's translation files.
    #[serde(default)]
    pub languages: Vec<String>,
}

/// One logical table and its physical backing. A wide logical table is
/// backed by several shards sharing the key columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableDef {
    /// Key columns, sorted.
    pub key: Vec<String>,
    /// Declared value columns in declaration order.
    pub values: Vec<String>,
    /// Inferred column definitions (key and value columns alike).
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnDef>,
    /// Physical shards; exactly one unless the table was split.
    pub shards: Vec<Shard>,
    /// Contributing package resources.
    #[serde(default)]
    pub resources: Vec<String>,
    /// For entity tables: the domain concept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Entity sets folded into this domain table.
    #[serde(default)]
    pub sets: Vec<String>,
    /// Language -> value columns that carry a stored translation column.
    #[serde(default)]
    pub translations: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub table: String,
    /// Value columns carried by this shard.
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub sql_type: SqlType,
    /// Distinct values observed, saturating at the tracking cap.
    pub cardinality: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Varchar(usize),
    Text,
    Json,
}

impl TableDef {
    /// The physical table of the only shard; wide tables answer per-column
    /// via [`TableDef::shard_for`].
    pub fn primary_table(&self) -> &str {
        &self.shards[0].table
    }

    pub fn is_wide(&self) -> bool {
        self.shards.len() > 1
    }

    /// The shard carrying a value column. Key columns live in every shard.
    pub fn shard_for(&self, column: &str) -> Option<&Shard> {
        if self.key.iter().any(|k| k == column) {
            return self.shards.first();
        }
        self.shards
            .iter()
            .find(|shard| shard.values.iter().any(|v| v == column))
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.key.iter().any(|k| k == column) || self.values.iter().any(|v| v == column)
    }

    /// The column to project for a value under an optional language: the
    /// coalescing virtual column when a stored translation exists.
    pub fn projected_column(&self, column: &str, language: Option<&str>) -> String {
        if let Some(lang) = language {
            if let Some(translated) = self.translations.get(lang) {
                if translated.iter().any(|c| c == column) {
                    return format!("{column}--{lang}");
                }
            }
        }
        column.to_string()
    }
}

impl SchemaModel {
    /// The canonical map key for a tuple of key columns.
    pub fn key_of(columns: &[String]) -> String {
        let mut sorted: Vec<&str> = columns.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.join("$")
    }

    pub fn is_time_domain(column: &str) -> bool {
        TIME_DOMAINS.contains(&column)
    }

    /// Resolve an entity set to its domain; other concepts map to themselves.
    pub fn resolve_domain<'a>(&'a self, concept: &'a str) -> &'a str {
        self.domains.get(concept).map_or(concept, String::as_str)
    }

    /// Domain-normalise a datapoint key: entity sets become their domains,
    /// and the result is sorted.
    pub fn normalize_key(&self, key: &[String]) -> Vec<String> {
        let mut normalized: Vec<String> = key
            .iter()
            .map(|column| self.resolve_domain(column).to_string())
            .collect();
        normalized.sort_unstable();
        normalized
    }

    pub fn concepts_table(&self) -> Option<&TableDef> {
        self.concepts.values().next()
    }

    /// The domain table serving an entity concept (set or domain).
    pub fn entity_table(&self, concept: &str) -> Option<&TableDef> {
        let domain = self.resolve_domain(concept);
        self.entities.get(&SchemaModel::key_of(&[domain.to_string()]))
    }

    /// The datapoint table for a (possibly set-keyed) key tuple.
    pub fn datapoint_table(&self, key: &[String]) -> Option<&TableDef> {
        let normalized = self.normalize_key(key);
        self.datapoints.get(&SchemaModel::key_of(&normalized))
    }

    /// Every physical table backing this schema, for transactional removal.
    pub fn physical_tables(&self) -> Vec<String> {
        self.concepts
            .values()
            .chain(self.entities.values())
            .chain(self.datapoints.values())
            .flat_map(|def| def.shards.iter().map(|shard| shard.table.clone()))
            .collect()
    }

    /// Synthesise `[keyTuple, value]` rows for a `<kind>.schema` query
    /// without touching the database.
    pub fn schema_rows(&self, kind: SchemaKind) -> Vec<Vec<Value>> {
        let sections: Vec<&BTreeMap<String, TableDef>> = match kind {
            SchemaKind::Concepts => vec![&self.concepts],
            SchemaKind::Entities => vec![&self.entities],
            SchemaKind::Datapoints => vec![&self.datapoints],
            SchemaKind::All => vec![&self.concepts, &self.entities, &self.datapoints],
        };
        let mut rows = Vec::new();
        for section in sections {
            for def in section.values() {
                for value in &def.values {
                    rows.push(vec![json!(def.key), json!(value)]);
                }
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SchemaModel {
        let mut model = SchemaModel::default();
        model.domains.insert("country".into(), "geo".into());
        model.domains.insert("city".into(), "geo".into());
        model.entities.insert(
            "geo".into(),
            TableDef {
                key: vec!["geo".into()],
                values: vec!["name".into(), "latitude".into()],
                shards: vec![Shard {
                    table: "test_v1_geo".into(),
                    values: vec!["name".into(), "latitude".into()],
                }],
                domain: Some("geo".into()),
                sets: vec!["country".into(), "city".into()],
                ..Default::default()
            },
        );
        model.datapoints.insert(
            "geo$time".into(),
            TableDef {
                key: vec!["geo".into(), "time".into()],
                values: vec!["population".into()],
                shards: vec![Shard {
                    table: "test_v1_dp_geo_time".into(),
                    values: vec!["population".into()],
                }],
                ..Default::default()
            },
        );
        model
    }

    #[test]
    fn test_key_of_sorts() {
        assert_eq!(
            SchemaModel::key_of(&["time".into(), "geo".into()]),
            "geo$time"
        );
    }

    #[test]
    fn test_normalize_key_remaps_sets() {
        let model = sample();
        assert_eq!(
            model.normalize_key(&["country".into(), "time".into()]),
            vec!["geo", "time"]
        );
    }

    #[test]
    fn test_datapoint_lookup_through_set() {
        let model = sample();
        let def = model
            .datapoint_table(&["city".into(), "time".into()])
            .unwrap();
        assert_eq!(def.primary_table(), "test_v1_dp_geo_time");
    }

    #[test]
    fn test_entity_lookup_through_set() {
        let model = sample();
        assert_eq!(
            model.entity_table("country").unwrap().primary_table(),
            "test_v1_geo"
        );
    }

    #[test]
    fn test_time_domains() {
        assert!(SchemaModel::is_time_domain("time"));
        assert!(SchemaModel::is_time_domain("quarter"));
        assert!(!SchemaModel::is_time_domain("geo"));
    }

    #[test]
    fn test_schema_rows() {
        let model = sample();
        let rows = model.schema_rows(SchemaKind::Datapoints);
        assert_eq!(rows, vec![vec![json!(["geo", "time"]), json!("population")]]);

        let all = model.schema_rows(SchemaKind::All);
        assert_eq!(all.len(), 3); // name, latitude, population
    }

    #[test]
    fn test_projected_column_uses_translation() {
        let mut def = TableDef {
            key: vec!["concept".into()],
            values: vec!["description".into()],
            ..Default::default()
        };
        def.translations
            .insert("fi-FI".into(), vec!["description".into()]);

        assert_eq!(
            def.projected_column("description", Some("fi-FI")),
            "description--fi-FI"
        );
        assert_eq!(def.projected_column("description", Some("sv-SE")), "description");
        assert_eq!(def.projected_column("description", None), "description");
    }

    #[test]
    fn test_physical_tables() {
        let model = sample();
        let mut tables = model.physical_tables();
        tables.sort();
        assert_eq!(tables, vec!["test_v1_dp_geo_time", "test_v1_geo"]);
    }

    #[test]
    fn test_roundtrip_serde() {
        let model = sample();
        let raw = serde_json::to_string(&model).unwrap();
        let back: SchemaModel = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.datapoints.len(), 1);
        assert_eq!(back.domains.get("country").unwrap(), "geo");
    }
}
