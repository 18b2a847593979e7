use chrono::{DateTime, TimeZone, Utc};
use mysql_async::prelude::*;
use mysql_async::TxOpts;
use sha2::{Digest, Sha256};

use crate::api::middleware::AppError;
use crate::models::dataset::{self, DatasetRecord, VersionEntry, ALL_VERSIONS, LATEST};
use crate::models::schema::SchemaModel;
use crate::storage::MySqlStorage;

/// MySQL duplicate-key error code.
const ER_DUP_ENTRY: u16 = 1062;

/// Which versions an admin `delete` targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveSelector {
    All,
    Latest,
    Versions(Vec<String>),
}

impl RemoveSelector {
    /// Parse the admin-surface token: `_ALL_`, `latest`, or a
    /// comma-separated list of literal versions.
    pub fn parse(token: &str) -> Self {
        match token {
            ALL_VERSIONS => RemoveSelector::All,
            LATEST => RemoveSelector::Latest,
            list => RemoveSelector::Versions(
                list.split(',').map(|v| v.trim().to_string()).collect(),
            ),
        }
    }
}

/// SHA-256 hex digest used for version password protection.
pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// The dataset/version catalog persisted in the `datasets` table.
#[derive(Clone)]
pub struct Catalog {
    storage: MySqlStorage,
}

impl Catalog {
    pub fn new(storage: MySqlStorage) -> Self {
        Self { storage }
    }

    /// All `(name, version)` entries, most recently imported first per name.
    pub async fn list(&self, name: Option<&str>) -> Result<Vec<VersionEntry>, AppError> {
        let mut conn = self.storage.conn().await?;
        let sql = match name {
            Some(_) => {
                "SELECT `name`, `version`, `is__default`, UNIX_TIMESTAMP(`imported`) \
                 FROM `datasets` WHERE `name` = ? ORDER BY `name`, `imported` DESC"
            }
            None => {
                "SELECT `name`, `version`, `is__default`, UNIX_TIMESTAMP(`imported`) \
                 FROM `datasets` ORDER BY `name`, `imported` DESC"
            }
        };
        let rows: Vec<(String, String, bool, i64)> = match name {
            Some(name) => conn.exec(sql, (name,)).await?,
            None => conn.query(sql).await?,
        };
        Ok(rows
            .into_iter()
            .map(|(name, version, is_default, imported)| VersionEntry {
                name,
                version,
                is_default,
                imported: timestamp(imported),
            })
            .collect())
    }

    /// Resolve a version reference: absent means the default (or, without
    /// one, the most recently imported), `latest` always the most recent,
    /// anything else an exact match.
    pub async fn lookup(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<DatasetRecord>, AppError> {
        let mut conn = self.storage.conn().await?;
        let rows: Vec<(String, bool, i64, Option<String>, String)> = conn
            .exec(
                "SELECT `version`, `is__default`, UNIX_TIMESTAMP(`imported`), `password`, `definition` \
                 FROM `datasets` WHERE `name` = ? ORDER BY `imported` DESC",
                (name,),
            )
            .await?;
        drop(conn);

        let selected = match version {
            Some(LATEST) => rows.first(),
            None => rows.iter().find(|row| row.1).or_else(|| rows.first()),
            Some(literal) => rows.iter().find(|row| row.0 == literal),
        };

        let Some((version, is_default, imported, password, definition)) = selected else {
            return Ok(None);
        };
        let schema: SchemaModel = serde_json::from_str(definition).map_err(|e| {
            AppError::Internal(format!("corrupt schema for {name}/{version}: {e}"))
        })?;
        Ok(Some(DatasetRecord {
            name: name.to_string(),
            version: version.clone(),
            is_default: *is_default,
            imported: timestamp(*imported),
            password_hash: password.clone(),
            schema,
        }))
    }

    /// The most recently imported version string, if any.
    pub async fn latest_version(&self, name: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.storage.conn().await?;
        let version: Option<String> = conn
            .exec_first(
                "SELECT `version` FROM `datasets` WHERE `name` = ? ORDER BY `imported` DESC LIMIT 1",
                (name,),
            )
            .await?;
        Ok(version)
    }

    /// Register a freshly loaded version. The tuple must not exist yet.
    pub async fn insert_new(
        &self,
        name: &str,
        version: &str,
        schema: &SchemaModel,
        password: Option<&str>,
    ) -> Result<(), AppError> {
        dataset::validate_name(name)?;
        dataset::validate_version(version)?;
        let definition = serde_json::to_string(schema)
            .map_err(|e| AppError::Internal(format!("cannot serialize schema: {e}")))?;
        let mut conn = self.storage.conn().await?;
        let result = conn
            .exec_drop(
                "INSERT INTO `datasets` (`name`, `version`, `definition`, `password`) \
                 VALUES (?, ?, ?, ?)",
                (name, version, definition, password.map(hash_password)),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(mysql_async::Error::Server(server)) if server.code == ER_DUP_ENTRY => Err(
                AppError::Conflict(format!("{name}/{version} already exists")),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Flip the default flag. `latest` clears any explicit default so that
    /// lookups fall back to the most recently imported version. Both steps
    /// run in one transaction so readers never see two defaults.
    pub async fn mark_default(&self, name: &str, version: &str) -> Result<(), AppError> {
        let mut conn = self.storage.conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        tx.exec_drop(
            "UPDATE `datasets` SET `is__default` = FALSE WHERE `name` = ?",
            (name,),
        )
        .await?;
        if version != LATEST {
            tx.exec_drop(
                "UPDATE `datasets` SET `is__default` = TRUE WHERE `name` = ? AND `version` = ?",
                (name, version),
            )
            .await?;
            let affected: Option<i64> = tx.query_first("SELECT ROW_COUNT()").await?;
            if affected.unwrap_or(0) == 0 {
                tx.rollback().await?;
                return Err(AppError::NotFound(format!("{name}/{version} does not exist")));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// If the dataset has versions but no default, promote the most
    /// recently imported one.
    pub async fn ensure_default(&self, name: &str) -> Result<(), AppError> {
        let entries = self.list(Some(name)).await?;
        if entries.is_empty() || entries.iter().any(|e| e.is_default) {
            return Ok(());
        }
        self.mark_default(name, &entries[0].version.clone()).await
    }

    /// Remove catalog rows and drop their backing tables. Returns the
    /// dropped table names.
    pub async fn remove(
        &self,
        name: &str,
        selector: &RemoveSelector,
    ) -> Result<Vec<String>, AppError> {
        let entries = self.list(Some(name)).await?;
        if entries.is_empty() {
            return Err(AppError::NotFound(format!("dataset {name} does not exist")));
        }
        let targets = removal_targets(&entries, selector)?;
        if *selector != RemoveSelector::All && rejects_default_removal(&entries, &targets) {
            return Err(AppError::Conflict(format!(
                "refusing to remove the default version of {name}; use {ALL_VERSIONS}"
            )));
        }

        let removed_default = entries
            .iter()
            .any(|e| e.is_default && targets.iter().any(|t| t == &e.version));

        let mut dropped = Vec::new();
        let mut conn = self.storage.conn().await?;
        for version in &targets {
            let definition: Option<String> = conn
                .exec_first(
                    "SELECT `definition` FROM `datasets` WHERE `name` = ? AND `version` = ?",
                    (name, version),
                )
                .await?;
            let Some(definition) = definition else {
                return Err(AppError::NotFound(format!("{name}/{version} does not exist")));
            };
            let schema: SchemaModel = serde_json::from_str(&definition)
                .map_err(|e| AppError::Internal(format!("corrupt schema: {e}")))?;
            let tables = schema.physical_tables();
            conn.exec_drop(
                "DELETE FROM `datasets` WHERE `name` = ? AND `version` = ?",
                (name, version),
            )
            .await?;
            super::table::drop_tables(&mut conn, &tables).await?;
            tracing::info!("removed {}/{} ({} tables)", name, version, tables.len());
            dropped.extend(tables);
        }
        drop(conn);

        // Losing the default falls back to the most recent survivor
        if removed_default {
            self.ensure_default(name).await?;
        }
        Ok(dropped)
    }

    /// Drop every version not worth keeping: the default (or, without one,
    /// the two most recent) and the version preceding the default survive.
    pub async fn purge(&self, name: &str) -> Result<Vec<String>, AppError> {
        let entries = self.list(Some(name)).await?;
        let victims = purge_victims(&entries);
        if victims.is_empty() {
            return Ok(Vec::new());
        }
        self.remove(name, &RemoveSelector::Versions(victims)).await
    }
}

fn timestamp(epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch, 0).single().unwrap_or_default()
}

/// Resolve a selector to literal versions against the current entries
/// (newest first).
fn removal_targets(
    entries: &[VersionEntry],
    selector: &RemoveSelector,
) -> Result<Vec<String>, AppError> {
    match selector {
        RemoveSelector::All => Ok(entries.iter().map(|e| e.version.clone()).collect()),
        RemoveSelector::Latest => Ok(vec![entries[0].version.clone()]),
        RemoveSelector::Versions(versions) => {
            for version in versions {
                if !entries.iter().any(|e| &e.version == version) {
                    return Err(AppError::NotFound(format!(
                        "version {version} does not exist"
                    )));
                }
            }
            Ok(versions.clone())
        }
    }
}

/// The most recent version, when it is also the default, may only go via
/// the explicit remove-everything token.
fn rejects_default_removal(entries: &[VersionEntry], targets: &[String]) -> bool {
    let most_recent = &entries[0];
    most_recent.is_default && targets.iter().any(|t| t == &most_recent.version)
}

/// Versions a purge deletes, given entries sorted newest first.
fn purge_victims(entries: &[VersionEntry]) -> Vec<String> {
    let keep_until = match entries.iter().position(|e| e.is_default) {
        // The default, anything newer, and the predecessor survive
        Some(default_at) => default_at + 1,
        // No default: the two most recent survive
        None => 1,
    };
    entries
        .iter()
        .skip(keep_until + 1)
        .map(|e| e.version.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: &str, is_default: bool, age: i64) -> VersionEntry {
        VersionEntry {
            name: "test".into(),
            version: version.into(),
            is_default,
            imported: timestamp(1_700_000_000 - age),
        }
    }

    #[test]
    fn test_hash_password_is_sha256_hex() {
        let hash = hash_password("secret");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn test_remove_selector_parse() {
        assert_eq!(RemoveSelector::parse("_ALL_"), RemoveSelector::All);
        assert_eq!(RemoveSelector::parse("latest"), RemoveSelector::Latest);
        assert_eq!(
            RemoveSelector::parse("v1,v2"),
            RemoveSelector::Versions(vec!["v1".into(), "v2".into()])
        );
    }

    #[test]
    fn test_removal_targets_unknown_version() {
        let entries = vec![entry("v2", false, 0), entry("v1", false, 10)];
        let err = removal_targets(&entries, &RemoveSelector::Versions(vec!["v9".into()]));
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_removing_recent_default() {
        let entries = vec![entry("v2", true, 0), entry("v1", false, 10)];
        assert!(rejects_default_removal(&entries, &["v2".to_string()]));
        assert!(!rejects_default_removal(&entries, &["v1".to_string()]));

        // Default that is not the most recent is removable
        let entries = vec![entry("v3", false, 0), entry("v2", true, 10)];
        assert!(!rejects_default_removal(&entries, &["v2".to_string()]));
    }

    #[test]
    fn test_purge_keeps_default_and_predecessor() {
        let entries = vec![
            entry("v5", false, 0),
            entry("v4", true, 10),
            entry("v3", false, 20),
            entry("v2", false, 30),
            entry("v1", false, 40),
        ];
        assert_eq!(purge_victims(&entries), vec!["v2", "v1"]);
    }

    #[test]
    fn test_purge_without_default_keeps_two_most_recent() {
        let entries = vec![
            entry("v4", false, 0),
            entry("v3", false, 10),
            entry("v2", false, 20),
            entry("v1", false, 30),
        ];
        assert_eq!(purge_victims(&entries), vec!["v2", "v1"]);
    }

    #[test]
    fn test_purge_nothing_to_do() {
        let entries = vec![entry("v2", true, 0), entry("v1", false, 10)];
        assert!(purge_victims(&entries).is_empty());
    }
}
