//! On-disk blob store

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::{async_trait, Status};

use crate::build::bazel::remote::execution::v2::Digest;
use crate::digest::{digest_key, empty_digest, DigestKeyFormat};

use super::{BlobAccess, BlobAccessInstance, BlobStream, Result};

pub(crate) fn map_io_error(err: std::io::Error) -> Status {
    match err.kind() {
        ErrorKind::NotFound => Status::not_found("Blob not found"),
        _ => Status::unknown(format!("I/O error: {:?}", err)),
    }
}

const BLOCK_SIZE: usize = 1024 * 1024;

/// Stores each blob as one file named after its digest key. Writes land in
/// a uniquely named temporary file first and are renamed into place, so a
/// blob is either fully present or absent.
pub struct DiskBlobAccess {
    base: PathBuf,
    key_format: DigestKeyFormat,
}

impl DiskBlobAccess {
    pub fn instantiate(
        base: &Path,
        key_format: DigestKeyFormat,
    ) -> std::io::Result<BlobAccessInstance> {
        let base = base.to_path_buf();
        std::fs::create_dir_all(&base)?;
        let this = Self { base, key_format };
        // Bazel assumes the CAS always holds the empty blob.
        drop(std::fs::File::create(this.path_for("", &empty_digest()))?);
        Ok(Arc::new(this))
    }

    fn path_for(&self, instance: &str, digest: &Digest) -> PathBuf {
        self.base.join(digest_key(instance, digest, self.key_format))
    }

    fn temp_path_for(&self, instance: &str, digest: &Digest) -> PathBuf {
        self.base.join(format!(
            "{}.{}.tmp",
            digest_key(instance, digest, self.key_format),
            uuid::Uuid::new_v4()
        ))
    }
}

#[async_trait]
impl BlobAccess for DiskBlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        let mut file = match fs::File::open(self.path_for(instance, digest)).await {
            Ok(file) => file,
            Err(err) => return super::error_stream(map_io_error(err)),
        };

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

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        _size_bytes: i64,
        mut data: BlobStream,
    ) -> Result<()> {
        let writing = self.temp_path_for(instance, digest);
        let target = self.path_for(instance, digest);

        let result = async {
            let mut file = File::create(&writing).await.map_err(map_io_error)?;
            while let Some(chunk) = data.next().await {
                file.write_all(&chunk?).await.map_err(map_io_error)?;
            }
            file.flush().await.map_err(map_io_error)?;
            drop(file);
            fs::rename(&writing, &target).await.map_err(map_io_error)
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&writing).await;
        }
        result
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        let mut missing = Vec::new();
        for digest in digests {
            match fs::metadata(self.path_for(instance, &digest)).await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => missing.push(digest),
                Err(err) => return Err(map_io_error(err)),
            }
        }
        Ok(missing)
    }

    async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        match fs::remove_file(self.path_for(instance, digest)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io_error(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{blob_stream, read_all};
    use super::*;

    fn hello_digest() -> Digest {
        Digest {
            hash: sha256::digest(&b"hello"[..]),
            size_bytes: 5,
        }
    }

    #[tokio::test]
    async fn new_store_has_empty_blob() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            DiskBlobAccess::instantiate(dir.path(), DigestKeyFormat::WithoutInstance).unwrap();
        let missing = storage.find_missing("", vec![empty_digest()]).await?;
        assert!(missing.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn write_then_read() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            DiskBlobAccess::instantiate(dir.path(), DigestKeyFormat::WithoutInstance).unwrap();
        let digest = hello_digest();
        storage
            .put("", &digest, 5, blob_stream(b"hello".to_vec()))
            .await?;
        let data = read_all(storage.get("", &digest).await).await?;
        assert_eq!(&data, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn failed_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            DiskBlobAccess::instantiate(dir.path(), DigestKeyFormat::WithoutInstance).unwrap();
        let digest = hello_digest();
        let result = storage
            .put(
                "",
                &digest,
                5,
                super::super::error_stream(Status::internal("source failed")),
            )
            .await;
        assert!(result.is_err());
        let missing = storage.find_missing("", vec![digest]).await.unwrap();
        assert_eq!(missing.len(), 1);
        // No stray temporary files either.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            DiskBlobAccess::instantiate(dir.path(), DigestKeyFormat::WithoutInstance).unwrap();
        let digest = hello_digest();
        storage
            .put("", &digest, 5, blob_stream(b"hello".to_vec()))
            .await?;
        storage.delete("", &digest).await?;
        storage.delete("", &digest).await?;
        let missing = storage.find_missing("", vec![digest]).await?;
        assert_eq!(missing.len(), 1);
        Ok(())
    }
}
