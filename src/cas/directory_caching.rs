//! Decoded-Directory caching
//!
//! Directory messages are fetched over and over while input trees are
//! walked. Entries are immutable under their digest, so a bounded LRU of
//! already-decoded messages never needs invalidation.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;
use tonic::async_trait;

use crate::build::bazel::remote::execution::v2::{Digest, Directory};
use crate::digest::{digest_key, DigestKeyFormat};

use super::{ContentAddressableStorage, ContentAddressableStorageInstance, Result};

pub struct DirectoryCachingContentAddressableStorage {
    backend: ContentAddressableStorageInstance,
    key_format: DigestKeyFormat,
    directories: Mutex<LruCache<String, Arc<Directory>>>,
}

impl DirectoryCachingContentAddressableStorage {
    pub fn instantiate(
        backend: ContentAddressableStorageInstance,
        key_format: DigestKeyFormat,
        max_directories: usize,
    ) -> ContentAddressableStorageInstance {
        Arc::new(Self {
            backend,
            key_format,
            directories: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_directories).expect("directory cache needs a capacity"),
            )),
        })
    }
}

#[async_trait]
impl ContentAddressableStorage for DirectoryCachingContentAddressableStorage {
    async fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Arc<Directory>> {
        let key = digest_key(instance, digest, self.key_format);
        if let Some(directory) = self.directories.lock().await.get(&key) {
            return Ok(Arc::clone(directory));
        }
        let directory = self.backend.get_directory(instance, digest).await?;
        self.directories
            .lock()
            .await
            .put(key, Arc::clone(&directory));
        Ok(directory)
    }

    async fn get_file(
        &self,
        instance: &str,
        digest: &Digest,
        target: &Path,
        is_executable: bool,
    ) -> Result<()> {
        self.backend
            .get_file(instance, digest, target, is_executable)
            .await
    }

    async fn put_file(&self, instance: &str, path: &Path) -> Result<Digest> {
        self.backend.put_file(instance, path).await
    }

    async fn put_blob(&self, instance: &str, data: Vec<u8>) -> Result<Digest> {
        self.backend.put_blob(instance, data).await
    }
}
