//! Staging of uploaded images for the engine thread.

use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// An uploaded image written to the staging directory. The file is removed
/// when the guard is dropped, whichever way the request ends.
pub struct StagedUpload {
    file: NamedTempFile,
}

impl StagedUpload {
    pub async fn write(dir: &Path, bytes: Vec<u8>) -> std::io::Result<Self> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            let file = tempfile::Builder::new()
                .prefix("upload-")
                .tempfile_in(&dir)?;
            std::fs::write(file.path(), &bytes)?;
            tracing::debug!(path = %file.path().display(), bytes = bytes.len(), "upload staged");
            Ok(Self { file })
        })
        .await
        .map_err(std::io::Error::other)?
    }

    pub fn path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_staged_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let upload = StagedUpload::write(dir.path(), b"jpeg bytes".to_vec()).await.unwrap();
        let path = upload.path();
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg bytes");
        assert!(path.starts_with(dir.path()));

        drop(upload);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("uploads/today");
        let upload = StagedUpload::write(&nested, vec![1, 2, 3]).await.unwrap();
        assert!(upload.path().starts_with(&nested));
    }
}
