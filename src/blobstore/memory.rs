//! In-memory LRU blob store

use std::{cmp::min, sync::Arc};

use lru::LruCache;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{async_trait, Status};
use tracing::info;

use crate::build::bazel::remote::execution::v2::Digest;
use crate::digest::{digest_key, empty_digest, DigestKeyFormat};

use super::{read_all, BlobAccess, BlobAccessInstance, BlobStream, Result};

struct MemoryBlobAccessInner {
    memory_used: usize,
    memory_limit: usize,
    data: LruCache<String, Arc<[u8]>>,
}

/// Bounded in-memory store. Evicts least-recently-used blobs once the
/// byte budget is exceeded, except for the empty blob which is pinned.
pub struct MemoryBlobAccess {
    content: Arc<Mutex<MemoryBlobAccessInner>>,
}

const KEY_OVERHEAD: usize = 80;

const BLOCK_SIZE: usize = 512 * 1024;

impl MemoryBlobAccess {
    pub fn instantiate(memory_limit: usize) -> BlobAccessInstance {
        let mut data = LruCache::unbounded();
        // Bazel assumes the CAS always holds the empty blob.
        data.put(Self::key("", &empty_digest()), Vec::new().into());
        Arc::new(Self {
            content: Arc::new(Mutex::new(MemoryBlobAccessInner {
                memory_used: KEY_OVERHEAD,
                memory_limit,
                data,
            })),
        })
    }

    fn key(instance: &str, digest: &Digest) -> String {
        digest_key(instance, digest, DigestKeyFormat::WithInstance)
    }
}

#[async_trait]
impl BlobAccess for MemoryBlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        let key = Self::key(instance, digest);
        let data = match self.content.lock().await.data.get(&key).map(Arc::clone) {
            Some(data) => data,
            None => {
                return super::error_stream(Status::not_found(format!(
                    "Blob {}/{} not found",
                    digest.hash, digest.size_bytes
                )))
            }
        };

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let mut sent = 0;
            while sent < data.len() {
                let chunk = min(BLOCK_SIZE, data.len() - sent);
                if (tx.send(Ok(data[sent..sent + chunk].to_vec())).await).is_err() {
                    // The consumer went away; nothing left to signal.
                    break;
                }
                sent += chunk;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        size_bytes: i64,
        data: BlobStream,
    ) -> Result<()> {
        {
            let mut lock = self.content.lock().await;
            while lock.memory_limit < lock.memory_used + size_bytes as usize {
                if lock.data.len() <= 1 {
                    return Err(Status::resource_exhausted("Blob too large for this store"));
                }
                if let Some((key, body)) = lock.data.pop_lru() {
                    if body.is_empty() {
                        // The pinned empty blob; put it back.
                        lock.data.put(key, body);
                    } else {
                        info!("Evicting {} to make room", key);
                        lock.memory_used -= KEY_OVERHEAD + body.len();
                    }
                }
            }
        }

        let body = read_all(data).await?;
        let mut lock = self.content.lock().await;
        lock.memory_used += KEY_OVERHEAD + body.len();
        lock.data.put(Self::key(instance, digest), body.into());
        Ok(())
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        let lock = self.content.lock().await;
        Ok(digests
            .into_iter()
            .filter(|digest| !lock.data.contains(&Self::key(instance, digest)))
            .collect())
    }

    async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        let mut lock = self.content.lock().await;
        if let Some(body) = lock.data.pop(&Self::key(instance, digest)) {
            lock.memory_used -= KEY_OVERHEAD + body.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::{blob_stream, read_all};
    use super::*;

    const MEGABYTE: usize = 1024 * 1024;

    fn hello_digest() -> Digest {
        Digest {
            hash: sha256::digest(&b"hello"[..]),
            size_bytes: 5,
        }
    }

    #[tokio::test]
    async fn new_store_has_empty_blob() -> Result<()> {
        let storage = MemoryBlobAccess::instantiate(MEGABYTE);
        let missing = storage.find_missing("", vec![empty_digest()]).await?;
        assert!(missing.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn insert_and_retrieve() -> Result<()> {
        let storage = MemoryBlobAccess::instantiate(MEGABYTE);
        let digest = hello_digest();
        storage
            .put("", &digest, 5, blob_stream(b"hello".to_vec()))
            .await?;
        let data = read_all(storage.get("", &digest).await).await?;
        assert_eq!(&data, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn instances_are_disjoint() -> Result<()> {
        let storage = MemoryBlobAccess::instantiate(MEGABYTE);
        let digest = hello_digest();
        storage
            .put("left", &digest, 5, blob_stream(b"hello".to_vec()))
            .await?;
        let missing = storage.find_missing("right", vec![digest]).await?;
        assert_eq!(missing.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn eviction_frees_room_for_new_blobs() -> Result<()> {
        // Room for the pinned empty blob plus one 16-byte blob, not two.
        let storage = MemoryBlobAccess::instantiate(KEY_OVERHEAD + KEY_OVERHEAD + 16 + 4);
        let first = Digest {
            hash: sha256::digest(&b"aaaaaaaaaaaaaaaa"[..]),
            size_bytes: 16,
        };
        storage
            .put("", &first, 16, blob_stream(b"aaaaaaaaaaaaaaaa".to_vec()))
            .await?;
        let second = Digest {
            hash: sha256::digest(&b"bbbbbbbbbbbbbbbb"[..]),
            size_bytes: 16,
        };
        storage
            .put("", &second, 16, blob_stream(b"bbbbbbbbbbbbbbbb".to_vec()))
            .await?;
        let missing = storage
            .find_missing("", vec![first.clone(), second.clone()])
            .await?;
        assert_eq!(missing, vec![first]);
        Ok(())
    }

    #[tokio::test]
    async fn delete_makes_blob_missing() -> Result<()> {
        let storage = MemoryBlobAccess::instantiate(MEGABYTE);
        let digest = hello_digest();
        storage
            .put("", &digest, 5, blob_stream(b"hello".to_vec()))
            .await?;
        storage.delete("", &digest).await?;
        let missing = storage.find_missing("", vec![digest]).await?;
        assert_eq!(missing.len(), 1);
        Ok(())
    }
}
