//! Separate read and write paths
//!
//! Workers share one process-wide reader (hardlink pool + directory cache)
//! to maximize hit rates, while each keeps its own batched writer. This
//! adapter binds one of each behind the single CAS interface.

use std::path::Path;
use std::sync::Arc;

use tonic::async_trait;

use crate::build::bazel::remote::execution::v2::{Digest, Directory};

use super::{ContentAddressableStorage, ContentAddressableStorageInstance, Result};

pub struct ReadWriteDecouplingContentAddressableStorage {
    reader: ContentAddressableStorageInstance,
    writer: ContentAddressableStorageInstance,
}

impl ReadWriteDecouplingContentAddressableStorage {
    pub fn instantiate(
        reader: ContentAddressableStorageInstance,
        writer: ContentAddressableStorageInstance,
    ) -> ContentAddressableStorageInstance {
        Arc::new(Self { reader, writer })
    }
}

#[async_trait]
impl ContentAddressableStorage for ReadWriteDecouplingContentAddressableStorage {
    async fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Arc<Directory>> {
        self.reader.get_directory(instance, digest).await
    }

    async fn get_file(
        &self,
        instance: &str,
        digest: &Digest,
        target: &Path,
        is_executable: bool,
    ) -> Result<()> {
        self.reader
            .get_file(instance, digest, target, is_executable)
            .await
    }

    async fn put_file(&self, instance: &str, path: &Path) -> Result<Digest> {
        self.writer.put_file(instance, path).await
    }

    async fn put_blob(&self, instance: &str, data: Vec<u8>) -> Result<Digest> {
        self.writer.put_blob(instance, data).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blobstore::{memory::MemoryBlobAccess, BlobAccess};
    use crate::cas::blob_access::BlobAccessContentAddressableStorage;

    #[tokio::test]
    async fn reads_and_writes_use_their_own_backends() -> Result<()> {
        let read_blobs = MemoryBlobAccess::instantiate(1024 * 1024);
        let write_blobs = MemoryBlobAccess::instantiate(1024 * 1024);
        let storage = ReadWriteDecouplingContentAddressableStorage::instantiate(
            BlobAccessContentAddressableStorage::instantiate(Arc::clone(&read_blobs)),
            BlobAccessContentAddressableStorage::instantiate(Arc::clone(&write_blobs)),
        );

        let digest = storage.put_blob("", b"hello".to_vec()).await?;

        // The write went to the writer's store only.
        assert!(write_blobs
            .find_missing("", vec![digest.clone()])
            .await?
            .is_empty());
        assert_eq!(read_blobs.find_missing("", vec![digest]).await?.len(), 1);
        Ok(())
    }
}
