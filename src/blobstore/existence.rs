//! Absence remapping for streaming consumers
//!
//! A client driving a recursive directory walk needs to tell "this input
//! was never uploaded" apart from an actual storage failure. This adapter
//! turns `NotFound` on streaming reads into `FailedPrecondition` so the
//! walk can stop cleanly.

use std::sync::Arc;

use tokio_stream::StreamExt;
use tonic::{async_trait, Code, Status};

use crate::build::bazel::remote::execution::v2::Digest;

use super::{BlobAccess, BlobAccessInstance, BlobStream, Result};

pub struct ExistencePreconditionBlobAccess {
    backend: BlobAccessInstance,
}

impl ExistencePreconditionBlobAccess {
    pub fn instantiate(backend: BlobAccessInstance) -> BlobAccessInstance {
        Arc::new(Self { backend })
    }
}

#[async_trait]
impl BlobAccess for ExistencePreconditionBlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        let inner = self.backend.get(instance, digest).await;
        Box::pin(inner.map(|item| {
            item.map_err(|status| match status.code() {
                Code::NotFound => Status::failed_precondition(status.message().to_string()),
                _ => status,
            })
        }))
    }

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        size_bytes: i64,
        data: BlobStream,
    ) -> Result<()> {
        self.backend.put(instance, digest, size_bytes, data).await
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        self.backend.find_missing(instance, digests).await
    }

    async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        self.backend.delete(instance, digest).await
    }
}
