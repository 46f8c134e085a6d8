//! Per-worker batched writes
//!
//! Absorbs the many small `put`s produced by a completed action and
//! publishes them at an explicit flush point. The bounded pending set
//! provides back-pressure: once it is full, further `put`s wait until a
//! flush starts draining. Duplicate digest keys are written once.
//!
//! Callers must flush before publishing an action result, otherwise
//! uploads may still be sitting in the queue.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tonic::{async_trait, Status};

use crate::build::bazel::remote::execution::v2::Digest;
use crate::digest::{digest_key, DigestKeyFormat};

use super::{BlobAccess, BlobAccessInstance, BlobStream, Result};

struct PendingPut {
    instance: String,
    digest: Digest,
    size_bytes: i64,
    data: BlobStream,
    permit: OwnedSemaphorePermit,
}

pub struct BatchedStoreBlobAccess {
    backend: BlobAccessInstance,
    key_format: DigestKeyFormat,
    capacity: usize,
    slots: Arc<Semaphore>,
    pending: Mutex<HashMap<String, PendingPut>>,
}

impl BatchedStoreBlobAccess {
    pub fn instantiate(
        backend: BlobAccessInstance,
        key_format: DigestKeyFormat,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            key_format,
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Drains the pending set, writing every enqueued blob to the backend.
    /// Returns after each of them has either succeeded or failed; the
    /// first failure is reported, the rest are still attempted.
    pub async fn flush(&self) -> Result<()> {
        let mut first_error = None;
        loop {
            let batch: Vec<PendingPut> = {
                let mut pending = self.pending.lock().await;
                pending.drain().map(|(_, put)| put).collect()
            };
            if batch.is_empty() {
                // A put that acquired a slot may not have registered its
                // blob yet; wait for those before declaring the queue dry.
                if self.slots.available_permits() == self.capacity {
                    break;
                }
                tokio::task::yield_now().await;
                continue;
            }
            for put in batch {
                let result = self
                    .backend
                    .put(&put.instance, &put.digest, put.size_bytes, put.data)
                    .await;
                if let Err(status) = result {
                    first_error.get_or_insert(status);
                }
                drop(put.permit);
            }
        }
        match first_error {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlobAccess for BatchedStoreBlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        self.backend.get(instance, digest).await
    }

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        size_bytes: i64,
        data: BlobStream,
    ) -> Result<()> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| Status::cancelled("Store is shutting down"))?;
        let key = digest_key(instance, digest, self.key_format);
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&key) {
            // Already enqueued under this key; the duplicate is dropped.
            return Ok(());
        }
        pending.insert(
            key,
            PendingPut {
                instance: instance.to_string(),
                digest: digest.clone(),
                size_bytes,
                data,
                permit,
            },
        );
        Ok(())
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        self.backend.find_missing(instance, digests).await
    }

    async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        self.backend.delete(instance, digest).await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::super::{blob_stream, memory::MemoryBlobAccess, read_all};
    use super::*;

    fn numbered_blob(i: usize) -> (Digest, Vec<u8>) {
        let body = format!("blob-{}", i).into_bytes();
        (
            Digest {
                hash: sha256::digest(&body[..]),
                size_bytes: body.len() as i64,
            },
            body,
        )
    }

    #[tokio::test]
    async fn blobs_reach_backend_only_after_flush() -> Result<()> {
        let backend = MemoryBlobAccess::instantiate(1024 * 1024);
        let batched =
            BatchedStoreBlobAccess::instantiate(Arc::clone(&backend), DigestKeyFormat::WithoutInstance, 10);
        let (digest, body) = numbered_blob(0);
        batched
            .put("", &digest, digest.size_bytes, blob_stream(body.clone()))
            .await?;

        let missing = backend.find_missing("", vec![digest.clone()]).await?;
        assert_eq!(missing.len(), 1);

        batched.flush().await?;
        let data = read_all(backend.get("", &digest).await).await?;
        assert_eq!(data, body);
        Ok(())
    }

    #[tokio::test]
    async fn put_blocks_once_capacity_is_reached() -> Result<()> {
        let backend = MemoryBlobAccess::instantiate(1024 * 1024);
        let batched =
            BatchedStoreBlobAccess::instantiate(Arc::clone(&backend), DigestKeyFormat::WithoutInstance, 4);

        let producer = {
            let batched = Arc::clone(&batched);
            tokio::spawn(async move {
                for i in 0..10 {
                    let (digest, body) = numbered_blob(i);
                    batched
                        .put("", &digest, digest.size_bytes, blob_stream(body))
                        .await?;
                }
                Ok::<(), Status>(())
            })
        };

        // With capacity 4 the fifth put cannot complete before a drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        batched.flush().await?;
        timeout(Duration::from_secs(5), producer)
            .await
            .unwrap()
            .unwrap()?;
        batched.flush().await?;

        let digests: Vec<Digest> = (0..10).map(|i| numbered_blob(i).0).collect();
        assert!(backend.find_missing("", digests).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_digests_are_written_once() -> Result<()> {
        let backend = Arc::new(CountingBackend {
            inner: MemoryBlobAccess::instantiate(1024 * 1024),
            writes: Mutex::new(Vec::new()),
        });
        let batched = BatchedStoreBlobAccess::instantiate(
            Arc::clone(&backend) as BlobAccessInstance,
            DigestKeyFormat::WithoutInstance,
            10,
        );
        let (digest, body) = numbered_blob(0);
        batched
            .put("", &digest, digest.size_bytes, blob_stream(body.clone()))
            .await?;
        batched
            .put("", &digest, digest.size_bytes, blob_stream(body))
            .await?;
        batched.flush().await?;

        let writes = backend.writes.lock().await;
        assert_eq!(writes.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn flush_attempts_all_writes_and_reports_first_error() -> Result<()> {
        let backend = Arc::new(CountingBackend {
            inner: MemoryBlobAccess::instantiate(16),
            writes: Mutex::new(Vec::new()),
        });
        let batched = BatchedStoreBlobAccess::instantiate(
            Arc::clone(&backend) as BlobAccessInstance,
            DigestKeyFormat::WithoutInstance,
            10,
        );
        // The tiny backend rejects these blobs, but both writes must still
        // have been attempted.
        for i in 0..2 {
            let (digest, body) = numbered_blob(i);
            batched
                .put("", &digest, digest.size_bytes, blob_stream(body))
                .await?;
        }
        let err = batched.flush().await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
        assert_eq!(backend.writes.lock().await.len(), 2);
        Ok(())
    }

    struct CountingBackend {
        inner: BlobAccessInstance,
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BlobAccess for CountingBackend {
        async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
            self.inner.get(instance, digest).await
        }

        async fn put(
            &self,
            instance: &str,
            digest: &Digest,
            size_bytes: i64,
            data: BlobStream,
        ) -> Result<()> {
            self.writes
                .lock()
                .await
                .push(digest_key(instance, digest, DigestKeyFormat::WithoutInstance));
            self.inner.put(instance, digest, size_bytes, data).await
        }

        async fn find_missing(
            &self,
            instance: &str,
            digests: Vec<Digest>,
        ) -> Result<Vec<Digest>> {
            self.inner.find_missing(instance, digests).await
        }
    }
}
