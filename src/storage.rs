//! Where finished artifacts go

use crate::utils::sanitize_filename;
use crate::CaptureError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores `bytes` and returns the URL it can be fetched from.
    async fn upload(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: &str,
    ) -> Result<String, CaptureError>;
}

/// Writes artifacts under `<root>/screenshots/`.
pub struct LocalStorage {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.map(|base| base.trim_end_matches('/').to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_key(filename: &str) -> String {
        format!(
            "{}-{}",
            chrono::Utc::now().timestamp_millis(),
            sanitize_filename(filename)
        )
    }

    fn public_url(&self, key: &str, path: &Path) -> Result<String, CaptureError> {
        if let Some(base) = &self.public_base_url {
            return Ok(format!("{base}/screenshots/{key}"));
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        Url::from_file_path(&absolute)
            .map(String::from)
            .map_err(|_| CaptureError::Storage(format!("no file URL for {}", absolute.display())))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: &str,
    ) -> Result<String, CaptureError> {
        let dir = self.root.join("screenshots");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CaptureError::Storage(format!("create {}: {e}", dir.display())))?;

        let key = Self::object_key(filename);
        let path = dir.join(&key);
        let size = bytes.len();
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CaptureError::Storage(format!("write {}: {e}", path.display())))?;

        debug!("Stored {} ({}, {} bytes)", key, content_type, size);
        self.public_url(&key, &path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_writes_file_with_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path(), Some("https://cdn.example.com/".to_string()));

        let url = storage
            .upload(vec![1, 2, 3], "job 1/shot.png", "image/png")
            .await
            .unwrap();

        assert!(url.starts_with("https://cdn.example.com/screenshots/"));
        assert!(url.ends_with("-job 1_shot.png"));

        let mut entries = std::fs::read_dir(dir.path().join("screenshots")).unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(std::fs::read(entry.path()).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_upload_without_base_url_returns_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path(), None);

        let url = storage.upload(vec![0], "a.pdf", "application/pdf").await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("-a.pdf"));
    }
}
