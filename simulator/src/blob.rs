use std::{
    io::{Error, ErrorKind},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tracing::info;

use crate::{collaborators::BlobUploader, error::TransportError};

/// Blob container backed by a local directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, TransportError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            let message = format!("invalid blob name '{name}'");
            return Err(Error::new(ErrorKind::InvalidInput, message).into());
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BlobUploader for FsBlobStore {
    async fn upload(&self, name: &str, local_path: &Path) -> Result<(), TransportError> {
        let target = self.blob_path(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let bytes = tokio::fs::copy(local_path, &target).await?;
        info!("uploaded {name} ({bytes} bytes)");
        Ok(())
    }
}
