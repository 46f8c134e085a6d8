//! Digest validation and streaming content verification
//!
//! Wraps any [`BlobAccess`] so that every blob read or written is checked
//! against its digest: the byte count must match `size_bytes` exactly and
//! the running hash must equal `hash` at EOF. Corruption detected on the
//! read side invalidates the underlying blob, so later `find_missing`
//! calls report it absent and clients re-upload.

use std::sync::Arc;

use async_stream::stream;
use sha2::Digest as _;
use tokio_stream::StreamExt;
use tonic::{async_trait, Code, Status};
use tracing::{info, warn};

use crate::build::bazel::remote::execution::v2::Digest;
use crate::digest::validate_digest;

use super::{BlobAccess, BlobAccessInstance, BlobStream, Result};

pub struct IntegrityValidatingBlobAccess {
    backend: BlobAccessInstance,
}

impl IntegrityValidatingBlobAccess {
    pub fn instantiate(backend: BlobAccessInstance) -> BlobAccessInstance {
        Arc::new(Self { backend })
    }
}

async fn invalidate(backend: &BlobAccessInstance, instance: &str, digest: &Digest) {
    // Deleting the corrupted blob makes future find_missing calls report
    // it absent, causing clients to re-upload it or retry the action.
    match backend.delete(instance, digest).await {
        Ok(()) => info!(
            "Deleted corrupted blob {}/{}",
            digest.hash, digest.size_bytes
        ),
        Err(err) => warn!(
            "Failed to delete corrupted blob {}/{}: {}",
            digest.hash, digest.size_bytes, err
        ),
    }
}

/// Passes chunks through while hashing them and counting down the
/// expected size. The terminal item carries any mismatch; `invalidator`
/// names the store holding the corrupt copy, if any.
fn verifying_stream(
    mut inner: BlobStream,
    digest: Digest,
    error_code: Code,
    invalidator: Option<(BlobAccessInstance, String)>,
) -> BlobStream {
    let family = match validate_digest(&digest) {
        Ok(family) => family,
        Err(status) => return super::error_stream(status),
    };
    Box::pin(stream! {
        let mut hasher = family.hasher();
        let mut size_left = digest.size_bytes;
        while let Some(chunk) = inner.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(status) => {
                    yield Err(status);
                    return;
                }
            };
            if chunk.len() as i64 > size_left {
                if let Some((backend, instance)) = &invalidator {
                    invalidate(backend, instance, &digest).await;
                }
                yield Err(Status::new(error_code, "Blob is longer than expected"));
                return;
            }
            size_left -= chunk.len() as i64;
            hasher.update(&chunk);
            yield Ok(chunk);
        }
        if size_left != 0 {
            if let Some((backend, instance)) = &invalidator {
                invalidate(backend, instance, &digest).await;
            }
            yield Err(Status::new(
                error_code,
                format!("Blob is {} bytes shorter than expected", size_left),
            ));
            return;
        }
        let actual = format!("{:x}", hasher.finalize());
        if actual != digest.hash {
            if let Some((backend, instance)) = &invalidator {
                invalidate(backend, instance, &digest).await;
            }
            yield Err(Status::new(
                error_code,
                format!(
                    "Checksum of blob is {}, while {} was expected",
                    actual, digest.hash
                ),
            ));
        }
    })
}

#[async_trait]
impl BlobAccess for IntegrityValidatingBlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        if let Err(status) = validate_digest(digest) {
            return super::error_stream(status);
        }
        // A mismatch on the read side means the store is at fault.
        verifying_stream(
            self.backend.get(instance, digest).await,
            digest.clone(),
            Code::Internal,
            Some((Arc::clone(&self.backend), instance.to_string())),
        )
    }

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        size_bytes: i64,
        data: BlobStream,
    ) -> Result<()> {
        validate_digest(digest)?;
        assert_eq!(
            digest.size_bytes, size_bytes,
            "put() called with a size that contradicts the digest"
        );
        // A mismatch on the write side means the client is at fault; the
        // put is refused and nothing needs invalidating.
        self.backend
            .put(
                instance,
                digest,
                size_bytes,
                verifying_stream(data, digest.clone(), Code::InvalidArgument, None),
            )
            .await
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        for digest in &digests {
            validate_digest(digest)?;
        }
        self.backend.find_missing(instance, digests).await
    }

    async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        validate_digest(digest)?;
        self.backend.delete(instance, digest).await
    }
}

#[cfg(test)]
mod test {
    use super::super::{blob_stream, memory::MemoryBlobAccess, read_all};
    use super::*;

    fn hello_digest() -> Digest {
        Digest {
            hash: sha256::digest(&b"hello"[..]),
            size_bytes: 5,
        }
    }

    #[tokio::test]
    async fn valid_blob_round_trips() -> Result<()> {
        let storage =
            IntegrityValidatingBlobAccess::instantiate(MemoryBlobAccess::instantiate(1024 * 1024));
        let digest = hello_digest();
        storage
            .put("", &digest, 5, blob_stream(b"hello".to_vec()))
            .await?;
        let data = read_all(storage.get("", &digest).await).await?;
        assert_eq!(&data, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_write_is_refused() {
        let leaf = MemoryBlobAccess::instantiate(1024 * 1024);
        let storage = IntegrityValidatingBlobAccess::instantiate(Arc::clone(&leaf));
        let digest = hello_digest();
        let err = storage
            .put("", &digest, 5, blob_stream(b"hello77".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        let missing = leaf.find_missing("", vec![digest]).await.unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn wrong_content_write_is_refused() {
        let storage =
            IntegrityValidatingBlobAccess::instantiate(MemoryBlobAccess::instantiate(1024 * 1024));
        let err = storage
            .put("", &hello_digest(), 5, blob_stream(b"jello".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn corrupted_read_invalidates_blob() {
        let leaf = MemoryBlobAccess::instantiate(1024 * 1024);
        let digest = hello_digest();
        // Sneak a wrong-content blob past verification.
        leaf.put("", &digest, 5, blob_stream(b"jello".to_vec()))
            .await
            .unwrap();

        let storage = IntegrityValidatingBlobAccess::instantiate(Arc::clone(&leaf));
        let err = read_all(storage.get("", &digest).await).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);

        // The corrupt copy was deleted, so the digest now reads as missing.
        let missing = storage.find_missing("", vec![digest]).await.unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn truncated_read_invalidates_blob() {
        let leaf = MemoryBlobAccess::instantiate(1024 * 1024);
        let digest = hello_digest();
        leaf.put("", &digest, 5, blob_stream(b"hel".to_vec()))
            .await
            .unwrap();

        let storage = IntegrityValidatingBlobAccess::instantiate(Arc::clone(&leaf));
        let err = read_all(storage.get("", &digest).await).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        let missing = storage.find_missing("", vec![digest]).await.unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn oversized_read_invalidates_blob() {
        let leaf = MemoryBlobAccess::instantiate(1024 * 1024);
        let digest = hello_digest();
        leaf.put("", &digest, 5, blob_stream(b"hello world".to_vec()))
            .await
            .unwrap();

        let storage = IntegrityValidatingBlobAccess::instantiate(Arc::clone(&leaf));
        let err = read_all(storage.get("", &digest).await).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        let missing = storage.find_missing("", vec![digest]).await.unwrap();
        assert_eq!(missing.len(), 1);
    }

    #[tokio::test]
    async fn malformed_digest_is_invalid_argument() {
        let storage =
            IntegrityValidatingBlobAccess::instantiate(MemoryBlobAccess::instantiate(1024 * 1024));
        let digest = Digest {
            hash: "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855".into(),
            size_bytes: 0,
        };
        let err = read_all(storage.get("", &digest).await).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
