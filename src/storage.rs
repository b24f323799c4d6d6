//! Object store adapter.
//!
//! Raw upload bytes live behind this narrow interface so the catalog only
//! ever sees an opaque storage reference. The bundled implementation is a
//! content-addressed directory on the local filesystem; tests use
//! [`MemoryStore`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Persists the bytes and returns a retrievable reference.
    async fn put(&self, content_hash: &str, bytes: &[u8]) -> Result<String>;

    /// Fetches the bytes for a previously returned reference.
    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>>;
}

/// Content-addressed filesystem store: one file per distinct hash, sharded
/// by the first two hex characters to keep directories small.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, content_hash: &str) -> PathBuf {
        let shard = &content_hash[..2.min(content_hash.len())];
        self.root.join(shard).join(content_hash)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn put(&self, content_hash: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(content_hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create storage dir: {}", parent.display()))?;
        }
        // Same hash means same bytes; an existing file needs no rewrite.
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path.display().to_string());
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write object: {}", path.display()))?;
        Ok(path.display().to_string())
    }

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>> {
        tokio::fs::read(storage_ref)
            .await
            .with_context(|| format!("Failed to read object: {}", storage_ref))
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, content_hash: &str, bytes: &[u8]) -> Result<String> {
        let key = format!("mem://{}", content_hash);
        self.objects
            .lock()
            .expect("store mutex poisoned")
            .insert(key.clone(), bytes.to_vec());
        Ok(key)
    }

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .expect("store mutex poisoned")
            .get(storage_ref)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("object not found: {}", storage_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path().to_path_buf());

        let r = store.put("abcd1234", b"hello").await.unwrap();
        assert_eq!(store.get(&r).await.unwrap(), b"hello");

        // Re-put with the same hash is a no-op returning the same ref
        let r2 = store.put("abcd1234", b"hello").await.unwrap();
        assert_eq!(r, r2);
    }

    #[tokio::test]
    async fn test_memory_store_missing_ref() {
        let store = MemoryStore::default();
        assert!(store.get("mem://nope").await.is_err());
    }
}
