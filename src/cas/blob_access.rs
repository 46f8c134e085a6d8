//! CAS operations over a blob store

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use prost::Message;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::{async_trait, Status};

use crate::blobstore::{blob_stream, read_all, BlobAccess, BlobAccessInstance, BlobStream};
use crate::build::bazel::remote::execution::v2::{Digest, Directory};

use super::{ContentAddressableStorage, ContentAddressableStorageInstance, Result};

const BLOCK_SIZE: usize = 1024 * 1024;

fn map_io_error(err: std::io::Error) -> Status {
    match err.kind() {
        std::io::ErrorKind::NotFound => Status::not_found("File not found"),
        _ => Status::unknown(format!("I/O error: {:?}", err)),
    }
}

fn file_stream(mut file: fs::File) -> BlobStream {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            let mut buffer = vec![0; BLOCK_SIZE];
            match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    buffer.truncate(n);
                    if tx.send(Ok(buffer)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(map_io_error(err))).await;
                    break;
                }
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

/// Implements the worker-side CAS operations directly on top of a
/// [`crate::blobstore::BlobAccess`].
pub struct BlobAccessContentAddressableStorage {
    blob_access: BlobAccessInstance,
}

impl BlobAccessContentAddressableStorage {
    pub fn instantiate(blob_access: BlobAccessInstance) -> ContentAddressableStorageInstance {
        Arc::new(Self { blob_access })
    }
}

#[async_trait]
impl ContentAddressableStorage for BlobAccessContentAddressableStorage {
    async fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Arc<Directory>> {
        let data = read_all(self.blob_access.get(instance, digest).await).await?;
        let directory = Directory::decode(&data[..]).map_err(|err| {
            Status::invalid_argument(format!(
                "Unable to decode directory {}/{}: {:?}",
                digest.hash, digest.size_bytes, err
            ))
        })?;
        Ok(Arc::new(directory))
    }

    async fn get_file(
        &self,
        instance: &str,
        digest: &Digest,
        target: &Path,
        is_executable: bool,
    ) -> Result<()> {
        let mut stream = self.blob_access.get(instance, digest).await;
        let result = async {
            let mut file = fs::File::create(target).await.map_err(map_io_error)?;
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await.map_err(map_io_error)?;
            }
            file.flush().await.map_err(map_io_error)?;
            let mode = if is_executable { 0o555 } else { 0o444 };
            file.set_permissions(std::fs::Permissions::from_mode(mode))
                .await
                .map_err(map_io_error)
        }
        .await;

        // A half-written file must not survive a failed materialization.
        if result.is_err() {
            let _ = fs::remove_file(target).await;
        }
        result
    }

    async fn put_file(&self, instance: &str, path: &Path) -> Result<Digest> {
        let metadata = fs::metadata(path).await.map_err(map_io_error)?;
        let file_path = path.to_owned();
        let hash = tokio::task::spawn_blocking(move || sha256::try_digest(file_path))
            .await
            .map_err(|_| Status::unknown("Failed to join file hashing task"))?
            .map_err(map_io_error)?;
        let digest = Digest {
            hash,
            size_bytes: metadata.len() as i64,
        };
        let file = fs::File::open(path).await.map_err(map_io_error)?;
        self.blob_access
            .put(instance, &digest, digest.size_bytes, file_stream(file))
            .await?;
        Ok(digest)
    }

    async fn put_blob(&self, instance: &str, data: Vec<u8>) -> Result<Digest> {
        let digest = Digest {
            hash: sha256::digest(&data[..]),
            size_bytes: data.len() as i64,
        };
        self.blob_access
            .put(instance, &digest, digest.size_bytes, blob_stream(data))
            .await?;
        Ok(digest)
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::blobstore::memory::MemoryBlobAccess;
    use crate::build::bazel::remote::execution::v2::FileNode;

    fn storage() -> (BlobAccessInstance, ContentAddressableStorageInstance) {
        let blobs = MemoryBlobAccess::instantiate(1024 * 1024);
        let cas = BlobAccessContentAddressableStorage::instantiate(Arc::clone(&blobs));
        (blobs, cas)
    }

    #[tokio::test]
    async fn blob_and_file_round_trip() -> Result<()> {
        let (_, cas) = storage();
        let digest = cas.put_blob("", b"hello".to_vec()).await?;
        assert_eq!(digest.hash, sha256::digest(&b"hello"[..]));
        assert_eq!(digest.size_bytes, 5);

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("hello.txt");
        cas.get_file("", &digest, &target, false).await?;
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");

        let uploaded = cas.put_file("", &target).await?;
        assert_eq!(uploaded, digest);
        Ok(())
    }

    #[tokio::test]
    async fn executable_bit_is_applied() -> Result<()> {
        let (_, cas) = storage();
        let digest = cas.put_blob("", b"#!/bin/sh\n".to_vec()).await?;
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("run.sh");
        cas.get_file("", &digest, &target, true).await?;
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
        Ok(())
    }

    #[tokio::test]
    async fn directory_round_trip() -> Result<()> {
        let (_, cas) = storage();
        let file_digest = cas.put_blob("", b"hello".to_vec()).await?;
        let directory = Directory {
            files: vec![FileNode {
                name: "hello.txt".into(),
                digest: Some(file_digest),
                is_executable: false,
            }],
            directories: vec![],
            symlinks: vec![],
        };
        let dir_digest = cas.put_blob("", directory.encode_to_vec()).await?;

        let decoded = cas.get_directory("", &dir_digest).await?;
        assert_eq!(*decoded, directory);
        Ok(())
    }

    #[tokio::test]
    async fn failed_materialization_removes_partial_file() {
        let (_, cas) = storage();
        let absent = Digest {
            hash: sha256::digest(&b"absent"[..]),
            size_bytes: 6,
        };
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("absent");
        let err = cas.get_file("", &absent, &target, false).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
        assert!(!target.exists());
    }
}
