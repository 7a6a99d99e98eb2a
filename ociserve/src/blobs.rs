//! Content-addressed blob storage.
//!
//! Blobs are keyed by digest alone; the repository is carried through the
//! interface for authorization-shaped callers but does not partition the
//! store. Two backends: a map under a mutex, and a directory of
//! `<algo>/<hex>` files written tmp-then-rename.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::Digest;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait BlobHandler: Send + Sync {
    async fn stat(&self, repo: &str, digest: &Digest) -> Result<u64, BlobError>;
    async fn get(&self, repo: &str, digest: &Digest) -> Result<BlobReader, BlobError>;
    async fn put(&self, repo: &str, digest: &Digest, data: Bytes) -> Result<(), BlobError>;
    async fn delete(&self, repo: &str, digest: &Digest) -> Result<(), BlobError>;
}

#[derive(Default)]
pub struct MemBlobHandler {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemBlobHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobHandler for MemBlobHandler {
    async fn stat(&self, _repo: &str, digest: &Digest) -> Result<u64, BlobError> {
        self.blobs
            .lock()
            .unwrap()
            .get(&digest.to_string())
            .map(|b| b.len() as u64)
            .ok_or(BlobError::NotFound)
    }

    async fn get(&self, _repo: &str, digest: &Digest) -> Result<BlobReader, BlobError> {
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(&digest.to_string())
            .cloned()
            .ok_or(BlobError::NotFound)?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn put(&self, _repo: &str, digest: &Digest, data: Bytes) -> Result<(), BlobError> {
        // second writer of the same digest wins nothing, loses nothing
        self.blobs.lock().unwrap().insert(digest.to_string(), data);
        Ok(())
    }

    async fn delete(&self, _repo: &str, digest: &Digest) -> Result<(), BlobError> {
        self.blobs
            .lock()
            .unwrap()
            .remove(&digest.to_string())
            .map(|_| ())
            .ok_or(BlobError::NotFound)
    }
}

/// Filesystem backend storing each blob at `<root>/<algo>/<hex>` (or
/// `<root>/<algo>:<hex>` flat when configured). The filename is the whole
/// identity; there is no companion metadata.
pub struct FsBlobHandler {
    root: PathBuf,
    flat: bool,
    // held across rename/remove only, the tmp write runs concurrently
    commit_lock: tokio::sync::Mutex<()>,
}

impl FsBlobHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsBlobHandler {
            root: root.into(),
            flat: false,
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Store `<algo>:<hex>` files directly under the root.
    pub fn flat(root: impl Into<PathBuf>) -> Self {
        FsBlobHandler {
            root: root.into(),
            flat: true,
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        if self.flat {
            self.root.join(digest.to_string())
        } else {
            self.root
                .join(digest.algorithm().as_ref())
                .join(digest.digest())
        }
    }

    fn tmp_path(&self, digest: &Digest) -> PathBuf {
        let mut path = self.blob_path(digest);
        path.set_file_name(format!(
            "{}_tmp{:016x}",
            digest.digest(),
            rand::random::<u64>()
        ));
        path
    }
}

fn not_found(e: std::io::Error) -> BlobError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BlobError::NotFound
    } else {
        BlobError::Io(e)
    }
}

#[async_trait]
impl BlobHandler for FsBlobHandler {
    async fn stat(&self, _repo: &str, digest: &Digest) -> Result<u64, BlobError> {
        let meta = tokio::fs::metadata(self.blob_path(digest))
            .await
            .map_err(not_found)?;
        Ok(meta.len())
    }

    async fn get(&self, _repo: &str, digest: &Digest) -> Result<BlobReader, BlobError> {
        let file = tokio::fs::File::open(self.blob_path(digest))
            .await
            .map_err(not_found)?;
        Ok(Box::new(file))
    }

    async fn put(&self, _repo: &str, digest: &Digest, data: Bytes) -> Result<(), BlobError> {
        let path = self.blob_path(digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.tmp_path(digest);
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        let _guard = self.commit_lock.lock().await;
        match tokio::fs::rename(&tmp, &path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }

    async fn delete(&self, _repo: &str, digest: &Digest) -> Result<(), BlobError> {
        let _guard = self.commit_lock.lock().await;
        tokio::fs::remove_file(self.blob_path(digest))
            .await
            .map_err(not_found)
    }
}

/// Drain a handler reader fully. Mostly for tests and small blobs; the
/// router streams instead.
pub async fn read_all(mut reader: BlobReader) -> Result<Vec<u8>, BlobError> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocicore::digest::sha256_digest;

    async fn roundtrip(handler: &dyn BlobHandler) {
        let data = Bytes::from_static(b"some layer bytes");
        let digest = sha256_digest(&data);

        assert!(matches!(
            handler.stat("foo", &digest).await,
            Err(BlobError::NotFound)
        ));

        handler.put("foo", &digest, data.clone()).await.unwrap();
        assert_eq!(handler.stat("foo", &digest).await.unwrap(), data.len() as u64);

        // content addressing is global, any repo sees it
        assert_eq!(handler.stat("bar", &digest).await.unwrap(), data.len() as u64);

        let got = read_all(handler.get("foo", &digest).await.unwrap())
            .await
            .unwrap();
        assert_eq!(got, data);

        handler.delete("foo", &digest).await.unwrap();
        assert!(matches!(
            handler.delete("foo", &digest).await,
            Err(BlobError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_mem_roundtrip() {
        roundtrip(&MemBlobHandler::new()).await;
    }

    #[tokio::test]
    async fn test_fs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        roundtrip(&FsBlobHandler::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_fs_layout() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FsBlobHandler::new(dir.path());
        let data = Bytes::from_static(b"abc");
        let digest = sha256_digest(&data);
        handler.put("foo", &digest, data).await.unwrap();
        let expect = dir.path().join("sha256").join(digest.digest());
        assert!(expect.exists());
        // no tmp leftovers
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("sha256"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_fs_flat_layout() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FsBlobHandler::flat(dir.path());
        let data = Bytes::from_static(b"abc");
        let digest = sha256_digest(&data);
        handler.put("foo", &digest, data).await.unwrap();
        assert!(dir.path().join(digest.to_string()).exists());
    }

    #[tokio::test]
    async fn test_put_same_digest_twice() {
        let handler = MemBlobHandler::new();
        let data = Bytes::from_static(b"abc");
        let digest = sha256_digest(&data);
        handler.put("a", &digest, data.clone()).await.unwrap();
        handler.put("b", &digest, data.clone()).await.unwrap();
        assert_eq!(handler.stat("c", &digest).await.unwrap(), 3);
    }
}
