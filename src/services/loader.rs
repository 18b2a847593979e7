use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::models::dataset;
use crate::models::package::{DataPackage, SchemaEntry};
use crate::models::schema::{SchemaModel, TableDef};
use crate::services::assets::AssetStore;
use crate::services::catalog::Catalog;
use crate::services::inference::{self, SchemaScan};
use crate::services::notifier::Notifier;
use crate::services::table::{self, LoadMapping};
use crate::services::version;
use crate::storage::MySqlStorage;

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub publish: bool,
    pub only_parse: bool,
    pub assets_only: bool,
    pub password: Option<String>,
}

/// One CSV file feeding one logical table.
#[derive(Debug, Clone)]
struct FileLoad {
    path: PathBuf,
    mapping: LoadMapping,
}

/// Orchestrates ingestion of a DDF package directory.
pub struct Loader {
    storage: MySqlStorage,
    catalog: Catalog,
    assets: Arc<dyn AssetStore>,
    notifier: Notifier,
    max_columns: usize,
}

impl Loader {
    pub fn new(
        storage: MySqlStorage,
        catalog: Catalog,
        assets: Arc<dyn AssetStore>,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            catalog,
            assets,
            notifier: Notifier::new(config.slack_channel_url.clone()),
            max_columns: config.database.max_columns,
        }
    }

    /// Load a package directory as `(name, version)` and return the version
    /// actually used.
    pub async fn load(
        &self,
        dir: &Path,
        name: &str,
        version: Option<&str>,
        options: &LoadOptions,
    ) -> Result<String, AppError> {
        dataset::validate_name(name)?;

        // Re-uploading assets targets an existing version
        if options.assets_only {
            let record = self.catalog.lookup(name, version).await?.ok_or_else(|| {
                AppError::NotFound(format!("dataset {name} does not exist"))
            })?;
            self.upload_assets(dir, name, &record.version).await?;
            return Ok(record.version);
        }

        let version = match version {
            Some(version) => {
                dataset::validate_version(version)?;
                version.to_string()
            }
            None => version::next_version(self.catalog.latest_version(name).await?.as_deref()),
        };

        // Fail fast on an existing tuple instead of at the final insert
        if !options.only_parse && self.catalog.lookup(name, Some(&version)).await?.is_some() {
            return Err(AppError::Conflict(format!("{name}/{version} already exists")));
        }

        if !options.only_parse {
            self.notifier.load_started(name, &version).await;
        }
        let result = self.run_load(dir, name, &version, options).await;
        if !options.only_parse {
            match &result {
                Ok(()) => self.notifier.load_finished(name, &version).await,
                Err(e) => {
                    self.notifier
                        .load_failed(name, &version, &e.to_string())
                        .await
                }
            }
        }
        result.map(|()| version)
    }

    async fn run_load(
        &self,
        dir: &Path,
        name: &str,
        version: &str,
        options: &LoadOptions,
    ) -> Result<(), AppError> {
        let raw = std::fs::read_to_string(dir.join("datapackage.json"))
            .map_err(|e| AppError::SchemaValidation(format!("cannot read datapackage.json: {e}")))?;
        let package = DataPackage::from_json(&raw)?;
        package.ddf_schema()?;
        let languages = discover_translations(dir, &package);

        let mut schema = SchemaModel {
            languages: languages.clone(),
            ..Default::default()
        };

        // Concepts first: the domain map is read back out of them
        let (mut concepts_def, concept_files) =
            build_concepts(&package, dir, &languages, name, version)?;

        if options.only_parse {
            // Derive the full plan without touching the database
            let domains = domain_map_from_csv(&package, dir)?;
            let entities = build_entities(&package, dir, &domains, &languages, name, version)?;
            let datapoints =
                build_datapoints(&package, dir, &domains, &languages, name, version, self.max_columns)?;
            tracing::info!(
                "parsed {}: {} concept values, {} entity domains, {} datapoint tables",
                name,
                concepts_def.values.len(),
                entities.len(),
                datapoints.len()
            );
            for (def, _) in &datapoints {
                tracing::info!(
                    "  table {} ({} shards, {} values)",
                    def.primary_table(),
                    def.shards.len(),
                    def.values.len()
                );
            }
            return Ok(());
        }

        let mut conn = self.storage.conn().await?;

        table::create_table(&mut conn, &mut concepts_def, self.max_columns).await?;
        for file in &concept_files {
            table::load_rows(&mut conn, &concepts_def, &file.mapping, &file.path).await?;
        }

        // Entity sets resolve to their domains through the concepts table
        let domains = domain_map_from_db(&mut conn, &concepts_def).await?;
        schema.domains = domains.clone();
        schema
            .concepts
            .insert(SchemaModel::key_of(&concepts_def.key), concepts_def);

        for (domain, mut def, files) in
            build_entities(&package, dir, &domains, &languages, name, version)?
        {
            table::create_table(&mut conn, &mut def, self.max_columns).await?;
            for file in &files {
                table::load_rows(&mut conn, &def, &file.mapping, &file.path).await?;
            }
            table::create_secondary_indexes(&mut conn, &def).await?;
            schema.entities.insert(domain, def);
        }

        for (mut def, files) in build_datapoints(
            &package,
            dir,
            &domains,
            &languages,
            name,
            version,
            self.max_columns,
        )? {
            table::create_table(&mut conn, &mut def, self.max_columns).await?;
            // A lone contributing file cannot produce key collisions, so
            // the primary index can sit out the bulk copy
            let solo = files.len() == 1 && files[0].mapping.language.is_none();
            if solo {
                table::drop_primary_index(&mut conn, &def).await?;
            }
            for file in &files {
                if file.mapping.language.is_some() {
                    // Translations update stored columns row by row
                    table::load_rows(&mut conn, &def, &file.mapping, &file.path).await?;
                } else {
                    table::bulk_load_external(&mut conn, &def, &file.mapping, &file.path).await?;
                }
            }
            if solo {
                table::create_primary_index(&mut conn, &def).await?;
            }
            table::create_secondary_indexes(&mut conn, &def).await?;
            schema
                .datapoints
                .insert(SchemaModel::key_of(&def.key), def);
        }
        drop(conn);

        self.upload_assets(dir, name, version).await?;

        self.catalog
            .insert_new(name, version, &schema, options.password.as_deref())
            .await?;
        if options.publish {
            self.catalog.mark_default(name, version).await?;
        }
        Ok(())
    }

    async fn upload_assets(&self, dir: &Path, name: &str, version: &str) -> Result<(), AppError> {
        let assets_dir = dir.join("assets");
        if !assets_dir.is_dir() {
            return Ok(());
        }
        let entries = std::fs::read_dir(&assets_dir)
            .map_err(|e| AppError::Internal(format!("cannot read assets dir: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| AppError::Internal(e.to_string()))?;
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            self.assets
                .upload(name, version, &entry.path(), &file_name)
                .await?;
        }
        Ok(())
    }
}

/// Languages present both in the manifest and as `lang/<id>/` directories.
fn discover_translations(dir: &Path, package: &DataPackage) -> Vec<String> {
    package
        .translations
        .iter()
        .map(|t| t.id.clone())
        .filter(|id| dir.join("lang").join(id).is_dir())
        .collect()
}

/// Group `ddfSchema` entries by their sorted, optionally domain-normalised
/// key tuple, accumulating values and resources.
fn group_entries(
    entries: &[SchemaEntry],
    domains: Option<&BTreeMap<String, String>>,
) -> BTreeMap<Vec<String>, (Vec<String>, Vec<String>, Vec<String>)> {
    let mut groups: BTreeMap<Vec<String>, (Vec<String>, Vec<String>, Vec<String>)> =
        BTreeMap::new();
    for entry in entries {
        let mut key: Vec<String> = entry
            .primary_key
            .iter()
            .map(|column| match domains {
                Some(map) => map.get(column).cloned().unwrap_or_else(|| column.clone()),
                None => column.clone(),
            })
            .collect();
        key.sort_unstable();
        let (_, values, resources) = groups
            .entry(key.clone())
            .or_insert_with(|| (key, Vec::new(), Vec::new()));
        if let Some(value) = &entry.value {
            if !values.contains(value) {
                values.push(value.clone());
            }
        }
        for resource in &entry.resources {
            if !resources.contains(resource) {
                resources.push(resource.clone());
            }
        }
    }
    groups
}

/// The translation file shadowing a resource, if the language ships one.
fn translation_file(dir: &Path, lang: &str, resource_path: &str) -> Option<PathBuf> {
    let file_name = Path::new(resource_path).file_name()?;
    let candidate = dir.join("lang").join(lang).join(file_name);
    candidate.is_file().then_some(candidate)
}

/// Fold translated columns into the table definition and produce the
/// translation file loads.
fn attach_translations(
    def: &mut TableDef,
    files: &mut Vec<FileLoad>,
    dir: &Path,
    languages: &[String],
    resource_paths: &[String],
) -> Result<(), AppError> {
    for lang in languages {
        for resource_path in resource_paths {
            let Some(path) = translation_file(dir, lang, resource_path) else {
                continue;
            };
            let headers = inference::read_headers(&path)?;
            let translated: Vec<String> = headers
                .iter()
                .filter(|h| def.values.contains(h))
                .cloned()
                .collect();
            if translated.is_empty() {
                continue;
            }
            let entry = def.translations.entry(lang.clone()).or_default();
            for column in &translated {
                if !entry.contains(column) {
                    entry.push(column.clone());
                }
            }
            let mapping = LoadMapping {
                columns: headers
                    .iter()
                    .filter(|h| def.key.contains(h) || translated.contains(h))
                    .map(|h| (h.clone(), h.clone()))
                    .collect(),
                flags: Vec::new(),
                language: Some(lang.clone()),
            };
            files.push(FileLoad { path, mapping });
        }
    }
    Ok(())
}

fn build_concepts(
    package: &DataPackage,
    dir: &Path,
    languages: &[String],
    name: &str,
    version: &str,
) -> Result<(TableDef, Vec<FileLoad>), AppError> {
    let ddf = package.ddf_schema()?;
    let groups = group_entries(&ddf.concepts, None);
    let Some((key, (_, values, resources))) = groups.into_iter().next() else {
        return Err(AppError::SchemaValidation(
            "package declares no concepts".into(),
        ));
    };

    let mut scan = SchemaScan::new();
    let mut paths = Vec::new();
    for resource in &resources {
        let path = resource_path(package, dir, resource)?;
        scan.scan_file(&path)?;
        paths.push(path);
    }

    let mut def = TableDef {
        key,
        values,
        columns: scan.column_defs(),
        resources: resources.clone(),
        ..Default::default()
    };
    let table_name = table::physical_table_name(name, version, "concepts");
    table::plan_shards(&mut def, &table_name, usize::MAX);

    let mut files: Vec<FileLoad> = paths
        .into_iter()
        .map(|path| {
            let headers = inference::read_headers(&path)?;
            Ok(FileLoad {
                mapping: LoadMapping {
                    columns: headers.iter().map(|h| (h.clone(), h.clone())).collect(),
                    flags: Vec::new(),
                    language: None,
                },
                path,
            })
        })
        .collect::<Result<_, AppError>>()?;

    let resource_paths: Vec<String> = resources
        .iter()
        .filter_map(|r| package.resource(r).map(|r| r.path.clone()))
        .collect();
    attach_translations(&mut def, &mut files, dir, languages, &resource_paths)?;

    Ok((def, files))
}

/// Entity set to domain resolution straight from the concepts CSV, for the
/// parse-only path.
fn domain_map_from_csv(
    package: &DataPackage,
    dir: &Path,
) -> Result<BTreeMap<String, String>, AppError> {
    let ddf = package.ddf_schema()?;
    let groups = group_entries(&ddf.concepts, None);
    let mut domains = BTreeMap::new();
    for (_, (_, _, resources)) in groups {
        for resource in resources {
            let path = resource_path(package, dir, &resource)?;
            let mut reader = csv::Reader::from_path(&path)
                .map_err(|e| AppError::SchemaValidation(format!("cannot read concepts: {e}")))?;
            let headers: Vec<String> = reader
                .headers()
                .map_err(|e| AppError::SchemaValidation(e.to_string()))?
                .iter()
                .map(str::to_string)
                .collect();
            let concept_at = headers.iter().position(|h| h == "concept");
            let type_at = headers.iter().position(|h| h == "concept_type");
            let domain_at = headers.iter().position(|h| h == "domain");
            let (Some(concept_at), Some(type_at), Some(domain_at)) =
                (concept_at, type_at, domain_at)
            else {
                continue;
            };
            for record in reader.records() {
                let record = record.map_err(|e| AppError::SchemaValidation(e.to_string()))?;
                if record.get(type_at) == Some("entity_set") {
                    if let (Some(concept), Some(domain)) =
                        (record.get(concept_at), record.get(domain_at))
                    {
                        if !domain.is_empty() {
                            domains.insert(concept.to_string(), domain.to_string());
                        }
                    }
                }
            }
        }
    }
    Ok(domains)
}

/// Entity set to domain resolution out of the loaded concepts table.
async fn domain_map_from_db(
    conn: &mut mysql_async::Conn,
    concepts: &TableDef,
) -> Result<BTreeMap<String, String>, AppError> {
    use mysql_async::prelude::*;

    if !concepts.values.iter().any(|v| v == "domain") {
        return Ok(BTreeMap::new());
    }
    let sql = format!(
        "SELECT `concept`, `domain` FROM {} WHERE `concept_type` = 'entity_set' AND `domain` IS NOT NULL",
        table::quote_ident(concepts.primary_table())
    );
    let rows: Vec<(String, String)> = conn.query(&sql).await?;
    let mut domains = BTreeMap::new();
    for (concept, domain) in rows {
        if let Some(previous) = domains.insert(concept.clone(), domain.clone()) {
            if previous != domain {
                return Err(AppError::SchemaValidation(format!(
                    "entity set {concept} declares two domains ({previous}, {domain})"
                )));
            }
        }
    }
    Ok(domains)
}

fn build_entities(
    package: &DataPackage,
    dir: &Path,
    domains: &BTreeMap<String, String>,
    languages: &[String],
    name: &str,
    version: &str,
) -> Result<Vec<(String, TableDef, Vec<FileLoad>)>, AppError> {
    let ddf = package.ddf_schema()?;
    let groups = group_entries(&ddf.entities, Some(domains));
    let mut out = Vec::new();

    for (key, (_, values, resources)) in groups {
        if key.len() != 1 {
            return Err(AppError::SchemaValidation(format!(
                "entity keys must be single concepts, got {key:?}"
            )));
        }
        let domain = key[0].clone();
        let sets: Vec<String> = domains
            .iter()
            .filter(|(_, d)| **d == domain)
            .map(|(s, _)| s.clone())
            .collect();

        // Properties arrive as values; set memberships ride as flags
        let values: Vec<String> = values
            .into_iter()
            .filter(|v| !v.starts_with("is--"))
            .collect();

        let mut scan = SchemaScan::new();
        let mut files = Vec::new();
        let mut resource_paths = Vec::new();
        for resource_name in &resources {
            let resource = package.resource(resource_name).ok_or_else(|| {
                AppError::SchemaValidation(format!("unknown resource {resource_name:?}"))
            })?;
            let path = dir.join(&resource.path);
            scan.scan_file(&path)?;
            resource_paths.push(resource.path.clone());

            // The file's key column may be an entity set of this domain
            let file_key = resource.schema.primary_key.columns();
            let set_key = file_key.first().filter(|k| **k != domain).cloned();
            let headers = inference::read_headers(&path)?;
            let mapping = LoadMapping {
                columns: headers
                    .iter()
                    .map(|h| {
                        if Some(h) == set_key.as_ref() {
                            (h.clone(), domain.clone())
                        } else {
                            (h.clone(), h.clone())
                        }
                    })
                    .collect(),
                flags: set_key.iter().map(|s| format!("is--{s}")).collect(),
                language: None,
            };
            files.push(FileLoad { path, mapping });
        }

        // Rename set key columns to the domain in the inferred defs
        let mut columns = scan.column_defs();
        for set in &sets {
            if let Some(stats) = columns.remove(set) {
                let widened = columns
                    .get(&domain)
                    .map(|existing| inference::widen(&existing.sql_type, &stats.sql_type));
                let mut stats = stats;
                if let Some(sql_type) = widened {
                    stats.sql_type = sql_type;
                }
                columns.insert(domain.clone(), stats);
            }
        }

        let mut def = TableDef {
            key: vec![domain.clone()],
            values,
            columns,
            resources: resources.clone(),
            domain: Some(domain.clone()),
            sets,
            ..Default::default()
        };
        let table_name =
            table::physical_table_name(name, version, &format!("entities__{domain}"));
        table::plan_shards(&mut def, &table_name, usize::MAX);
        attach_translations(&mut def, &mut files, dir, languages, &resource_paths)?;

        out.push((SchemaModel::key_of(&def.key), def, files));
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn build_datapoints(
    package: &DataPackage,
    dir: &Path,
    domains: &BTreeMap<String, String>,
    languages: &[String],
    name: &str,
    version: &str,
    max_columns: usize,
) -> Result<Vec<(TableDef, Vec<FileLoad>)>, AppError> {
    let ddf = package.ddf_schema()?;
    let groups = group_entries(&ddf.datapoints, Some(domains));
    let mut out = Vec::new();

    for (key, (_, values, resources)) in groups {
        let mut scan = SchemaScan::new();
        let mut files = Vec::new();
        let mut resource_paths = Vec::new();
        let mut sets: Vec<String> = Vec::new();

        for resource_name in &resources {
            let resource = package.resource(resource_name).ok_or_else(|| {
                AppError::SchemaValidation(format!("unknown resource {resource_name:?}"))
            })?;
            let path = dir.join(&resource.path);
            scan.scan_file(&path)?;
            resource_paths.push(resource.path.clone());

            let file_key = resource.schema.primary_key.columns();
            let file_sets: Vec<String> = file_key
                .iter()
                .filter(|column| domains.contains_key(*column))
                .cloned()
                .collect();
            for set in &file_sets {
                if !sets.contains(set) {
                    sets.push(set.clone());
                }
            }

            let headers = inference::read_headers(&path)?;
            let mapping = LoadMapping {
                columns: headers
                    .iter()
                    .map(|h| {
                        let target = domains.get(h).cloned().unwrap_or_else(|| h.clone());
                        (h.clone(), target)
                    })
                    .collect(),
                flags: file_sets.iter().map(|s| format!("is--{s}")).collect(),
                language: None,
            };
            files.push(FileLoad { path, mapping });
        }

        // Set-keyed columns fold into the domain column in the inferred defs
        let mut columns = scan.column_defs();
        for (set, domain) in domains {
            if let Some(stats) = columns.remove(set) {
                let widened = columns
                    .get(domain)
                    .map(|existing| inference::widen(&existing.sql_type, &stats.sql_type));
                let mut stats = stats;
                if let Some(sql_type) = widened {
                    stats.sql_type = sql_type;
                }
                columns.insert(domain.clone(), stats);
            }
        }

        let mut def = TableDef {
            key: key.clone(),
            values,
            columns,
            resources: resources.clone(),
            sets,
            ..Default::default()
        };
        let table_name = table::physical_table_name(
            name,
            version,
            &format!("datapoints__{}", key.join("_")),
        );
        table::plan_shards(&mut def, &table_name, max_columns);
        attach_translations(&mut def, &mut files, dir, languages, &resource_paths)?;

        out.push((def, files));
    }
    Ok(out)
}

fn resource_path(package: &DataPackage, dir: &Path, name: &str) -> Result<PathBuf, AppError> {
    package
        .resource(name)
        .map(|r| dir.join(&r.path))
        .ok_or_else(|| AppError::SchemaValidation(format!("unknown resource {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_package(dir: &Path) {
        fs::write(
            dir.join("datapackage.json"),
            r#"{
                "name": "test",
                "resources": [
                    {"name": "concepts", "path": "ddf--concepts.csv",
                     "schema": {"fields": [{"name": "concept"}, {"name": "concept_type"}, {"name": "domain"}, {"name": "description"}], "primaryKey": "concept"}},
                    {"name": "geo", "path": "ddf--entities--geo.csv",
                     "schema": {"fields": [{"name": "geo"}, {"name": "name"}, {"name": "latitude"}], "primaryKey": "geo"}},
                    {"name": "country", "path": "ddf--entities--geo--country.csv",
                     "schema": {"fields": [{"name": "country"}, {"name": "name"}], "primaryKey": "country"}},
                    {"name": "pop", "path": "ddf--datapoints--population--by--country--time.csv",
                     "schema": {"fields": [{"name": "country"}, {"name": "time"}, {"name": "population"}], "primaryKey": ["country", "time"]}}
                ],
                "translations": [{"id": "fi-FI"}],
                "ddfSchema": {
                    "concepts": [
                        {"primaryKey": ["concept"], "value": "concept_type", "resources": ["concepts"]},
                        {"primaryKey": ["concept"], "value": "domain", "resources": ["concepts"]},
                        {"primaryKey": ["concept"], "value": "description", "resources": ["concepts"]}
                    ],
                    "entities": [
                        {"primaryKey": ["geo"], "value": "name", "resources": ["geo"]},
                        {"primaryKey": ["geo"], "value": "latitude", "resources": ["geo"]},
                        {"primaryKey": ["country"], "value": "name", "resources": ["country"]}
                    ],
                    "datapoints": [
                        {"primaryKey": ["country", "time"], "value": "population", "resources": ["pop"]}
                    ]
                }
            }"#,
        )
        .unwrap();
        fs::write(
            dir.join("ddf--concepts.csv"),
            "concept,concept_type,domain,description\n\
             geo,entity_domain,,Location\n\
             country,entity_set,geo,Country\n\
             time,time,,Time\n\
             population,measure,,Population\n",
        )
        .unwrap();
        fs::write(
            dir.join("ddf--entities--geo.csv"),
            "geo,name,latitude\nswe,Sweden,62.0\nsgp,Singapore,1.3\n",
        )
        .unwrap();
        fs::write(
            dir.join("ddf--entities--geo--country.csv"),
            "country,name\nswe,Sweden\nsgp,Singapore\n",
        )
        .unwrap();
        fs::write(
            dir.join("ddf--datapoints--population--by--country--time.csv"),
            "country,time,population\nswe,1991,8617000\nsgp,1991,3135000\n",
        )
        .unwrap();
        fs::create_dir_all(dir.join("lang").join("fi-FI")).unwrap();
        fs::write(
            dir.join("lang").join("fi-FI").join("ddf--concepts.csv"),
            "concept,description\ngeo,Sijainti\n",
        )
        .unwrap();
    }

    fn load_package(dir: &Path) -> DataPackage {
        DataPackage::from_json(&fs::read_to_string(dir.join("datapackage.json")).unwrap()).unwrap()
    }

    #[test]
    fn test_discover_translations() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path());
        let package = load_package(dir.path());
        assert_eq!(discover_translations(dir.path(), &package), vec!["fi-FI"]);
    }

    #[test]
    fn test_domain_map_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path());
        let package = load_package(dir.path());
        let domains = domain_map_from_csv(&package, dir.path()).unwrap();
        assert_eq!(domains.get("country").map(String::as_str), Some("geo"));
        assert_eq!(domains.len(), 1);
    }

    #[test]
    fn test_build_concepts_with_translation() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path());
        let package = load_package(dir.path());
        let (def, files) =
            build_concepts(&package, dir.path(), &["fi-FI".to_string()], "test", "v1").unwrap();
        assert_eq!(def.key, vec!["concept"]);
        assert!(def.values.contains(&"description".to_string()));
        assert_eq!(def.translations["fi-FI"], vec!["description"]);
        assert_eq!(def.primary_table(), "test__v1__concepts");
        // Base file plus the Finnish translation file
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].mapping.language.as_deref(), Some("fi-FI"));
    }

    #[test]
    fn test_build_entities_merges_set_into_domain() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path());
        let package = load_package(dir.path());
        let domains = domain_map_from_csv(&package, dir.path()).unwrap();
        let entities = build_entities(
            &package,
            dir.path(),
            &domains,
            &[],
            "test",
            "v1",
        )
        .unwrap();
        assert_eq!(entities.len(), 1);
        let (key, def, files) = &entities[0];
        assert_eq!(key, "geo");
        assert_eq!(def.sets, vec!["country"]);
        assert_eq!(files.len(), 2);
        // The set-keyed file maps its key column onto the domain and flags
        // membership
        let country_file = files
            .iter()
            .find(|f| f.path.to_string_lossy().contains("country"))
            .unwrap();
        assert!(country_file
            .mapping
            .columns
            .contains(&("country".to_string(), "geo".to_string())));
        assert_eq!(country_file.mapping.flags, vec!["is--country"]);
    }

    #[test]
    fn test_build_datapoints_normalises_key() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path());
        let package = load_package(dir.path());
        let domains = domain_map_from_csv(&package, dir.path()).unwrap();
        let datapoints = build_datapoints(
            &package,
            dir.path(),
            &domains,
            &[],
            "test",
            "v1",
            1000,
        )
        .unwrap();
        assert_eq!(datapoints.len(), 1);
        let (def, files) = &datapoints[0];
        assert_eq!(def.key, vec!["geo", "time"]);
        assert_eq!(def.values, vec!["population"]);
        assert_eq!(def.sets, vec!["country"]);
        assert_eq!(files[0].mapping.flags, vec!["is--country"]);
        assert!(files[0]
            .mapping
            .columns
            .contains(&("country".to_string(), "geo".to_string())));
    }

    #[test]
    fn test_group_entries_accumulates_values() {
        let entries = vec![
            SchemaEntry {
                primary_key: vec!["geo".into(), "time".into()],
                value: Some("population".into()),
                resources: vec!["a".into()],
            },
            SchemaEntry {
                primary_key: vec!["time".into(), "geo".into()],
                value: Some("gdp".into()),
                resources: vec!["b".into()],
            },
        ];
        let groups = group_entries(&entries, None);
        assert_eq!(groups.len(), 1);
        let (_, values, resources) = groups.values().next().unwrap();
        assert_eq!(values, &vec!["population", "gdp"]);
        assert_eq!(resources, &vec!["a", "b"]);
    }
}
