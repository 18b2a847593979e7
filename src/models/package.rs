use serde::{Deserialize, Serialize};

use crate::api::middleware::AppError;

/// The `datapackage.json` manifest at the root of a DDF package directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataPackage {
    pub name: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub translations: Vec<Translation>,
    #[serde(rename = "ddfSchema")]
    pub ddf_schema: Option<DdfSchema>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Resource {
    pub name: String,
    pub path: String,
    pub schema: ResourceSchema,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceSchema {
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(rename = "primaryKey", default)]
    pub primary_key: PrimaryKey,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Field {
    pub name: String,
}

/// `primaryKey` appears both as a single string and as an array.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(untagged)]
pub enum PrimaryKey {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl PrimaryKey {
    pub fn columns(&self) -> Vec<String> {
        match self {
            PrimaryKey::None => Vec::new(),
            PrimaryKey::Single(column) => vec![column.clone()],
            PrimaryKey::Multiple(columns) => columns.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Translation {
    pub id: String,
}

/// The `ddfSchema` section: one entry per `(key, value)` pair per kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DdfSchema {
    #[serde(default)]
    pub concepts: Vec<SchemaEntry>,
    #[serde(default)]
    pub entities: Vec<SchemaEntry>,
    #[serde(default)]
    pub datapoints: Vec<SchemaEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaEntry {
    #[serde(rename = "primaryKey")]
    pub primary_key: Vec<String>,
    pub value: Option<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl DataPackage {
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::SchemaValidation(format!("invalid datapackage.json: {e}")))
    }

    /// The manifest is unusable without a `ddfSchema` section.
    pub fn ddf_schema(&self) -> Result<&DdfSchema, AppError> {
        self.ddf_schema
            .as_ref()
            .ok_or_else(|| AppError::SchemaValidation("datapackage.json has no ddfSchema".into()))
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "name": "test",
        "resources": [
            {
                "name": "concepts",
                "path": "ddf--concepts.csv",
                "schema": {"fields": [{"name": "concept"}, {"name": "concept_type"}], "primaryKey": "concept"}
            },
            {
                "name": "datapoints--population",
                "path": "ddf--datapoints--population--by--geo--time.csv",
                "schema": {"fields": [{"name": "geo"}, {"name": "time"}, {"name": "population"}], "primaryKey": ["geo", "time"]}
            }
        ],
        "translations": [{"id": "fi-FI"}],
        "ddfSchema": {
            "concepts": [{"primaryKey": ["concept"], "value": "concept_type", "resources": ["concepts"]}],
            "entities": [],
            "datapoints": [{"primaryKey": ["geo", "time"], "value": "population", "resources": ["datapoints--population"]}]
        }
    }"#;

    #[test]
    fn test_parse_manifest() {
        let package = DataPackage::from_json(MANIFEST).unwrap();
        assert_eq!(package.name.as_deref(), Some("test"));
        assert_eq!(package.resources.len(), 2);
        assert_eq!(package.translations[0].id, "fi-FI");

        let schema = package.ddf_schema().unwrap();
        assert_eq!(schema.datapoints[0].primary_key, vec!["geo", "time"]);
        assert_eq!(schema.datapoints[0].value.as_deref(), Some("population"));
    }

    #[test]
    fn test_primary_key_forms() {
        let package = DataPackage::from_json(MANIFEST).unwrap();
        assert_eq!(package.resources[0].schema.primary_key.columns(), vec!["concept"]);
        assert_eq!(
            package.resources[1].schema.primary_key.columns(),
            vec!["geo", "time"]
        );
    }

    #[test]
    fn test_missing_ddf_schema() {
        let package = DataPackage::from_json(r#"{"resources": []}"#).unwrap();
        assert!(package.ddf_schema().is_err());
    }
}
