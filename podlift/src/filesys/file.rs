//! Local files: the configuration, `.env` and saved image archives

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::errors::PodliftError;
use crate::utils::hex;

/// A path on the machine running podlift
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: PathBuf,
}

impl File {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Length in bytes
    pub async fn size(&self) -> Result<u64, PodliftError> {
        Ok(fs::metadata(&self.path).await?.len())
    }

    pub async fn read_string(&self) -> Result<String, PodliftError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Hex-encoded SHA-256 of the file contents, read in chunks
    pub async fn sha256(&self) -> Result<String, PodliftError> {
        let mut file = fs::File::open(&self.path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Remove the file; a missing file is not an error
    pub async fn delete(&self) -> Result<(), PodliftError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }

    /// Walk up from `start` looking for a file called `name`
    pub fn find_upward(start: &Path, name: &str) -> Option<File> {
        let mut dir = Some(start);
        while let Some(current) = dir {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Some(File::new(candidate));
            }
            dir = current.parent();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sha256_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.tar");
        std::fs::write(&path, b"hello world").unwrap();

        let file = File::new(&path);
        assert_eq!(file.size().await.unwrap(), 11);
        assert_eq!(
            file.sha256().await.unwrap(),
            crate::utils::sha256_hash(b"hello world")
        );
    }

    #[test]
    fn test_find_upward() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("podlift.json"), "{}").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = File::find_upward(&nested, "podlift.json").unwrap();
        assert_eq!(found.path(), dir.path().join("podlift.json"));
        assert!(File::find_upward(&nested, "missing.json").is_none());
    }
}
