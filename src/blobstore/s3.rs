//! S3-style blob store built on `object_store`

use std::sync::Arc;

use object_store::{aws::AmazonS3Builder, path::Path as ObjectPath, ObjectStore, WriteMultipart};
use tokio_stream::StreamExt;
use tonic::{async_trait, Status};

use crate::build::bazel::remote::execution::v2::Digest;
use crate::digest::{digest_key, DigestKeyFormat};

use super::{BlobAccess, BlobAccessInstance, BlobStream, Result};

fn map_object_store_error(err: object_store::Error) -> Status {
    match err {
        object_store::Error::NotFound { .. } => Status::not_found("Blob not found"),
        err => Status::unknown(format!("Object store error: {}", err)),
    }
}

pub struct S3BlobAccess {
    store: Arc<dyn ObjectStore>,
    key_format: DigestKeyFormat,
}

impl S3BlobAccess {
    pub fn instantiate(
        bucket: &str,
        region: Option<&str>,
        endpoint: Option<&str>,
        key_format: DigestKeyFormat,
    ) -> anyhow::Result<BlobAccessInstance> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        // Plain-HTTP endpoints are how localstack/minio test setups work.
        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(endpoint);
            if endpoint.starts_with("http://") {
                builder = builder.with_allow_http(true);
            }
        }
        Ok(Arc::new(Self {
            store: Arc::new(builder.build()?),
            key_format,
        }))
    }

    fn path_for(&self, instance: &str, digest: &Digest) -> ObjectPath {
        ObjectPath::from(digest_key(instance, digest, self.key_format))
    }
}

#[async_trait]
impl BlobAccess for S3BlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        let result = match self.store.get(&self.path_for(instance, digest)).await {
            Ok(result) => result,
            Err(err) => return super::error_stream(map_object_store_error(err)),
        };
        Box::pin(result.into_stream().map(|chunk| match chunk {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(err) => Err(map_object_store_error(err)),
        }))
    }

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        _size_bytes: i64,
        mut data: BlobStream,
    ) -> Result<()> {
        let upload = self
            .store
            .put_multipart(&self.path_for(instance, digest))
            .await
            .map_err(map_object_store_error)?;
        let mut writer = WriteMultipart::new(upload);
        while let Some(chunk) = data.next().await {
            match chunk {
                Ok(chunk) => writer.write(&chunk),
                Err(err) => {
                    writer.abort().await.map_err(map_object_store_error)?;
                    return Err(err);
                }
            }
        }
        writer
            .finish()
            .await
            .map(|_| ())
            .map_err(map_object_store_error)
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        let mut missing = Vec::new();
        for digest in digests {
            match self.store.head(&self.path_for(instance, &digest)).await {
                Ok(_) => {}
                Err(object_store::Error::NotFound { .. }) => missing.push(digest),
                Err(err) => return Err(map_object_store_error(err)),
            }
        }
        Ok(missing)
    }

    async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        match self.store.delete(&self.path_for(instance, digest)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(map_object_store_error(err)),
        }
    }
}
