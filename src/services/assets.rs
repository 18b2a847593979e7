use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::{ObjectStore, PutPayload};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::AssetConfig;

/// Upload-and-issue-URL interface over the binary asset backend.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store a file under `<dataset>/<version>/<name>`.
    async fn upload(
        &self,
        dataset: &str,
        version: &str,
        file: &Path,
        name: &str,
    ) -> Result<(), AppError>;

    /// The URL the assets endpoint redirects to.
    fn url_for(&self, dataset: &str, version: &str, asset: &str) -> String;
}

/// Factory resolving the configured adapter name.
pub fn create_store(config: &AssetConfig) -> Result<Arc<dyn AssetStore>, AppError> {
    match config.store.as_str() {
        "local" => Ok(Arc::new(LocalAssetStore::new(PathBuf::from(
            "./asset-store",
        )))),
        "s3" => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                AppError::Internal("ASSET_STORE_BUCKET is required for the s3 store".into())
            })?;
            Ok(Arc::new(BucketAssetStore::new(bucket)?))
        }
        other => Err(AppError::Internal(format!(
            "unknown asset store adapter {other:?}"
        ))),
    }
}

/// Directory-backed store for development and tests.
pub struct LocalAssetStore {
    base_dir: PathBuf,
}

impl LocalAssetStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }
}

#[async_trait]
impl AssetStore for LocalAssetStore {
    async fn upload(
        &self,
        dataset: &str,
        version: &str,
        file: &Path,
        name: &str,
    ) -> Result<(), AppError> {
        let target_dir = self.base_dir.join(dataset).join(version);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| AppError::Internal(format!("cannot create asset dir: {e}")))?;
        tokio::fs::copy(file, target_dir.join(name))
            .await
            .map_err(|e| AppError::Internal(format!("cannot copy asset {name}: {e}")))?;
        Ok(())
    }

    fn url_for(&self, dataset: &str, version: &str, asset: &str) -> String {
        format!(
            "file://{}/{dataset}/{version}/{asset}",
            self.base_dir.display()
        )
    }
}

/// Blob-store adapter over an S3-compatible bucket.
pub struct BucketAssetStore {
    bucket: String,
    store: Box<dyn ObjectStore>,
}

impl BucketAssetStore {
    pub fn new(bucket: &str) -> Result<Self, AppError> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| AppError::Internal(format!("cannot open bucket {bucket}: {e}")))?;
        Ok(Self {
            bucket: bucket.to_string(),
            store: Box::new(store),
        })
    }
}

#[async_trait]
impl AssetStore for BucketAssetStore {
    async fn upload(
        &self,
        dataset: &str,
        version: &str,
        file: &Path,
        name: &str,
    ) -> Result<(), AppError> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| AppError::Internal(format!("cannot read asset {name}: {e}")))?;
        let location = object_store::path::Path::from(format!("{dataset}/{version}/{name}"));
        self.store
            .put(&location, PutPayload::from(bytes))
            .await
            .map_err(|e| AppError::Internal(format!("asset upload failed for {name}: {e}")))?;
        tracing::info!("uploaded asset {}/{}/{}", dataset, version, name);
        Ok(())
    }

    fn url_for(&self, dataset: &str, version: &str, asset: &str) -> String {
        format!(
            "https://{}.s3.amazonaws.com/{dataset}/{version}/{asset}",
            self.bucket
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_upload_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalAssetStore::new(dir.path().to_path_buf());

        let source = dir.path().join("logo.png");
        tokio::fs::write(&source, b"image-bytes").await.unwrap();
        store
            .upload("test", "v1", &source, "logo.png")
            .await
            .unwrap();

        let stored = dir.path().join("test").join("v1").join("logo.png");
        assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"image-bytes");

        let url = store.url_for("test", "v1", "logo.png");
        assert!(url.ends_with("/test/v1/logo.png"));
    }

    #[test]
    fn test_factory_rejects_unknown_adapter() {
        let config = AssetConfig {
            store: "carrier-pigeon".into(),
            bucket: None,
        };
        assert!(create_store(&config).is_err());
    }

    #[test]
    fn test_bucket_url_shape() {
        let config = AssetConfig {
            store: "s3".into(),
            bucket: None,
        };
        // Missing bucket is an error, not a panic
        assert!(create_store(&config).is_err());
    }
}
