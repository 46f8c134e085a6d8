//! Blob storage for CAS and AC
//!
//! Everything in the cache funnels through the [`BlobAccess`] contract:
//! leaf stores hold bytes, adapters decorate other [`BlobAccess`] values
//! with integrity checking, sharding, batching and metrics.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt};
use tonic::{async_trait, Status};

use crate::build::bazel::remote::execution::v2::Digest;

type Result<T, E = Status> = std::result::Result<T, E>;

/// A single-pass stream of blob content. The stream yields chunks until
/// EOF or a terminal error; dropping it releases whatever resources the
/// producer holds.
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// A stream that fails with `status` on first read. Backends use this to
/// report errors lazily, so that `get` itself never fails.
pub fn error_stream(status: Status) -> BlobStream {
    Box::pin(tokio_stream::once(Err(status)))
}

/// A stream yielding `data` as a single chunk.
pub fn blob_stream(data: Vec<u8>) -> BlobStream {
    if data.is_empty() {
        Box::pin(tokio_stream::empty())
    } else {
        Box::pin(tokio_stream::once(Ok(data)))
    }
}

/// Drains a stream into memory. Only suitable for blobs known to be small,
/// such as Directory messages and action results.
pub async fn read_all(mut stream: BlobStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?[..]);
    }
    Ok(data)
}

/// Uniform access to content-addressed blobs, keyed by instance name and
/// digest. Implemented both by terminal stores and by decorators.
#[async_trait]
pub trait BlobAccess: Send + Sync {
    /// Returns a stream yielding exactly `digest.size_bytes` bytes.
    /// Failures, including absence, surface as the stream's first item.
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream;

    /// Consumes `data` in full and stores it under `digest`. The blob is
    /// visible to `get` and `find_missing` once this returns.
    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        size_bytes: i64,
        data: BlobStream,
    ) -> Result<()>;

    /// Returns the subset of `digests` this store does not hold. Order and
    /// duplication of the result are unspecified.
    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>>;

    /// Removes a blob. Only the integrity adapter calls this, to invalidate
    /// corrupted content.
    async fn delete(&self, _instance: &str, _digest: &Digest) -> Result<()> {
        Err(Status::unimplemented(
            "This storage backend does not support object deletion",
        ))
    }
}

pub type BlobAccessInstance = Arc<dyn BlobAccess>;

pub mod batched;
pub mod configuration;
pub mod disk;
pub mod existence;
pub mod grpc;
pub mod http;
pub mod integrity;
pub mod memory;
pub mod metrics;
pub mod redis;
pub mod s3;
pub mod sharding;

#[cfg(test)]
mod test {
    use super::*;
    use crate::digest::empty_digest;

    #[tokio::test]
    async fn empty_blob_round_trip() -> Result<()> {
        let storage = memory::MemoryBlobAccess::instantiate(1024 * 1024);
        storage
            .put("", &empty_digest(), 0, blob_stream(Vec::new()))
            .await?;
        let data = read_all(storage.get("", &empty_digest()).await).await?;
        assert!(data.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn find_missing_returns_subset() -> Result<()> {
        let storage = memory::MemoryBlobAccess::instantiate(1024 * 1024);
        let hello = Digest {
            hash: sha256::digest(&b"hello"[..]),
            size_bytes: 5,
        };
        storage
            .put("", &hello, 5, blob_stream(b"hello".to_vec()))
            .await?;
        let absent = Digest {
            hash: sha256::digest(&b"absent"[..]),
            size_bytes: 6,
        };
        let missing = storage
            .find_missing("", vec![hello.clone(), absent.clone()])
            .await?;
        assert_eq!(missing, vec![absent]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_digest_fails_on_first_read() {
        let storage = memory::MemoryBlobAccess::instantiate(1024 * 1024);
        let absent = Digest {
            hash: sha256::digest(&b"absent"[..]),
            size_bytes: 6,
        };
        let err = read_all(storage.get("", &absent).await).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}
