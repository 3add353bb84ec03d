// service/storage_service.rs
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{config::Config, models::chatmodel::Attachment, service::error::ServiceError};

/// Where chat attachments live. The returned attachment carries a public URL.
#[async_trait]
pub trait FileStorage: Send + Sync + std::fmt::Debug {
    async fn store(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<Attachment, ServiceError>;

    fn max_bytes(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
    base_url: String,
    max_bytes: usize,
}

impl LocalFileStorage {
    pub fn new(config: &Config) -> Self {
        Self {
            root: PathBuf::from(&config.upload_dir),
            base_url: config.storage_base_url.trim_end_matches('/').to_string(),
            max_bytes: config.max_upload_mb * 1024 * 1024,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Keeps the extension and drops anything that could escape the upload dir.
fn storage_key(file_name: &str) -> String {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ext.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(10)
                .collect::<String>()
        })
        .filter(|ext| !ext.is_empty());

    match extension {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext.to_lowercase()),
        None => Uuid::new_v4().to_string(),
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn store(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<Attachment, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::Validation("Uploaded file is empty".to_string()));
        }
        if bytes.len() > self.max_bytes {
            return Err(ServiceError::Validation(format!(
                "File exceeds the {} byte limit",
                self.max_bytes
            )));
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ServiceError::Storage(format!("failed to create upload dir: {}", e)))?;

        let key = storage_key(file_name);
        let dest = self.root.join(&key);
        if let Err(e) = tokio::fs::write(&dest, bytes).await {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(ServiceError::Storage(format!(
                "failed to write {}: {}",
                dest.display(),
                e
            )));
        }
        tracing::info!("stored upload {} ({} bytes) as {}", file_name, bytes.len(), key);

        Ok(Attachment {
            file_name: file_name.to_string(),
            file_url: format!("{}/{}", self.base_url, key),
            file_size: bytes.len() as i64,
            mime_type: mime_type.to_string(),
        })
    }

    fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}
