use std::path::{Component, Path, PathBuf};

use storagecrypt_core::transfer::partial_path;
use thiserror::Error;

const BLOBS_DIR: &str = "blobs";
const STAGING_DIR: &str = "staging";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("blob name is empty")]
    Empty,
    #[error("blob name contains unsupported component")]
    UnsupportedComponent,
}

/// Local layout of plaintext replicas and transfer scratch files.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.to_path_buf(),
        }
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.root.join(BLOBS_DIR)).await?;
        tokio::fs::create_dir_all(self.root.join(STAGING_DIR)).await
    }

    pub fn blob_name_for(document_id: i64) -> String {
        format!("doc-{document_id}")
    }

    pub fn blob_path(&self, local_file_name: &str) -> Result<PathBuf, PathError> {
        if local_file_name.is_empty() {
            return Err(PathError::Empty);
        }
        // Blob names are single, plain path segments.
        let mut components = Path::new(local_file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(PathError::UnsupportedComponent),
        }
        Ok(self.root.join(BLOBS_DIR).join(local_file_name))
    }

    pub fn partial_blob_path(&self, local_file_name: &str) -> Result<PathBuf, PathError> {
        Ok(partial_path(&self.blob_path(local_file_name)?))
    }

    /// Scratch file for ciphertext of one document in one direction.
    pub fn staging_path(&self, document_id: i64, suffix: &str) -> PathBuf {
        self.root
            .join(STAGING_DIR)
            .join(format!("doc-{document_id}.{suffix}"))
    }
}

pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
