//! Redis-backed blob store
//!
//! Keys are digest keys, values are raw blob bytes. Existence probes are
//! pipelined so one round trip covers a whole `find_missing` batch.

use std::sync::Arc;

use tonic::{async_trait, Status};

use crate::build::bazel::remote::execution::v2::Digest;
use crate::digest::{digest_key, DigestKeyFormat};

use super::{read_all, BlobAccess, BlobAccessInstance, BlobStream, Result};

fn map_redis_error(err: redis::RedisError) -> Status {
    Status::unknown(format!("Redis error: {}", err))
}

pub struct RedisBlobAccess {
    client: redis::Client,
    key_format: DigestKeyFormat,
}

impl RedisBlobAccess {
    pub fn instantiate(client: redis::Client, key_format: DigestKeyFormat) -> BlobAccessInstance {
        Arc::new(Self { client, key_format })
    }

    fn key(&self, instance: &str, digest: &Digest) -> String {
        digest_key(instance, digest, self.key_format)
    }
}

#[async_trait]
impl BlobAccess for RedisBlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        let key = self.key(instance, digest);
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => return super::error_stream(map_redis_error(err)),
        };
        let value: Option<Vec<u8>> = match redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
        {
            Ok(value) => value,
            Err(err) => return super::error_stream(map_redis_error(err)),
        };
        match value {
            Some(value) => super::blob_stream(value),
            None => super::error_stream(Status::not_found(format!("Blob {} not found", key))),
        }
    }

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        _size_bytes: i64,
        data: BlobStream,
    ) -> Result<()> {
        let value = read_all(data).await?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        redis::cmd("SET")
            .arg(self.key(instance, digest))
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        let mut pipe = redis::pipe();
        for digest in &digests {
            pipe.cmd("EXISTS").arg(self.key(instance, digest));
        }
        let found: Vec<i64> = pipe.query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(digests
            .into_iter()
            .zip(found)
            .filter(|(_, count)| *count == 0)
            .map(|(digest, _)| digest)
            .collect())
    }

    async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        redis::cmd("DEL")
            .arg(self.key(instance, digest))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }
}
