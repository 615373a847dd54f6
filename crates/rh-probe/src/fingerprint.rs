//! Change-detection helpers: filesystem stat and SHA-256 content hashing.

use chrono::{DateTime, Utc};
use rh_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Size and modification time of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Stat `path`. Returns `None` if the file does not exist (or is not a
/// regular file).
pub fn stat(path: &Path) -> Result<Option<Fingerprint>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(Fingerprint {
            size: meta.len(),
            modified_at: DateTime::<Utc>::from(meta.modified()?),
        })),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Hex SHA-256 of the content of `path`. Blocking.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`hash_file`] on the blocking pool.
pub async fn hash_file_async(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| Error::Internal(format!("hash task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn stat_missing_is_none() {
        assert!(stat(Path::new("/nonexistent/file.mp3")).unwrap().is_none());
    }

    #[test]
    fn stat_directory_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(stat(dir.path()).unwrap().is_none());
    }

    #[test]
    fn stat_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![0u8; 1234]).unwrap();
        assert_eq!(stat(&path).unwrap().unwrap().size, 1234);
    }

    #[tokio::test]
    async fn async_hash_matches_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![7u8; HASH_BUF_SIZE * 3 + 17]).unwrap();
        assert_eq!(
            hash_file_async(path.clone()).await.unwrap(),
            hash_file(&path).unwrap()
        );
    }
}
