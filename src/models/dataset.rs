use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::middleware::AppError;
use crate::models::schema::SchemaModel;

/// Reserved token resolving to the most recently imported version.
pub const LATEST: &str = "latest";
/// Reserved token selecting every version of a dataset in admin commands.
pub const ALL_VERSIONS: &str = "_ALL_";

pub const MAX_VERSION_LEN: usize = 40;

/// A single `(name, version)` catalog entry without its schema document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub name: String,
    pub version: String,
    #[serde(rename = "default", skip_serializing_if = "is_false")]
    pub is_default: bool,
    #[serde(skip_serializing)]
    pub imported: DateTime<Utc>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A fully loaded catalog record, including the persisted schema model.
#[derive(Debug, Clone)]
pub struct DatasetRecord {
    pub name: String,
    pub version: String,
    pub is_default: bool,
    pub imported: DateTime<Utc>,
    pub password_hash: Option<String>,
    pub schema: SchemaModel,
}

impl DatasetRecord {
    pub fn is_protected(&self) -> bool {
        self.password_hash.is_some()
    }
}

/// Check a dataset name against the allowed alphabet.
pub fn validate_name(name: &str) -> Result<(), AppError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AppError::SchemaValidation(format!(
            "dataset name {name:?} must match [-a-z_0-9]+"
        )))
    }
}

/// Check a version string supplied by a caller. Reserved tokens are never
/// accepted as stored versions.
pub fn validate_version(version: &str) -> Result<(), AppError> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(AppError::SchemaValidation(format!(
            "version must be 1 to {MAX_VERSION_LEN} characters"
        )));
    }
    if version == LATEST || version == ALL_VERSIONS {
        return Err(AppError::SchemaValidation(format!(
            "{version:?} is a reserved token and cannot be used as a version"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("systema_globalis").is_ok());
        assert!(validate_name("sg-2024").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Uppercase").is_err());
        assert!(validate_name("with space").is_err());
        assert!(validate_name("dot.name").is_err());
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version("v1").is_ok());
        assert!(validate_version("2024073001").is_ok());
        assert!(validate_version("").is_err());
        assert!(validate_version(&"x".repeat(41)).is_err());
        assert!(validate_version("latest").is_err());
        assert!(validate_version("_ALL_").is_err());
    }

    #[test]
    fn test_version_entry_serializes_default_flag_only_when_set() {
        let entry = VersionEntry {
            name: "test".into(),
            version: "v1".into(),
            is_default: false,
            imported: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("default").is_none());

        let entry = VersionEntry {
            is_default: true,
            ..entry
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["default"], serde_json::json!(true));
    }
}
