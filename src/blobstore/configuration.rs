//! Blob store assembly from a configuration record

use std::path::{Path, PathBuf};

use async_recursion::async_recursion;
use serde::Deserialize;

use crate::digest::DigestKeyFormat;

use super::{
    disk::DiskBlobAccess, grpc::GrpcCasBlobAccess, http::HttpBlobAccess,
    integrity::IntegrityValidatingBlobAccess, memory::MemoryBlobAccess,
    metrics::MetricsBlobAccess, redis::RedisBlobAccess, s3::S3BlobAccess,
    sharding::{ShardingBlobAccess, WeightedShardSelector},
    BlobAccessInstance,
};

#[derive(Debug, Deserialize)]
pub struct BlobstoreConfiguration {
    pub content_addressable_storage: StorageConfiguration,
    pub action_cache: StorageConfiguration,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfiguration {
    #[serde(default)]
    pub verify_integrity: bool,
    pub backend: BackendConfiguration,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfiguration {
    Memory {
        max_bytes: usize,
    },
    Disk {
        directory: PathBuf,
    },
    Redis {
        url: String,
    },
    Http {
        address: String,
        prefix: String,
    },
    GrpcCas {
        address: String,
    },
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
    Sharding {
        #[serde(default)]
        seed: u64,
        shards: Vec<ShardConfiguration>,
    },
}

#[derive(Debug, Deserialize)]
pub struct ShardConfiguration {
    #[serde(default = "default_shard_weight")]
    pub weight: u32,
    /// `null` marks a drained slot; its traffic falls through to the
    /// remaining shards.
    pub backend: Option<BackendConfiguration>,
}

fn default_shard_weight() -> u32 {
    1
}

pub fn read_configuration(path: &Path) -> anyhow::Result<BlobstoreConfiguration> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

#[async_recursion]
async fn create_backend(
    config: &BackendConfiguration,
    key_format: DigestKeyFormat,
) -> anyhow::Result<BlobAccessInstance> {
    Ok(match config {
        BackendConfiguration::Memory { max_bytes } => MemoryBlobAccess::instantiate(*max_bytes),
        BackendConfiguration::Disk { directory } => {
            DiskBlobAccess::instantiate(directory, key_format)?
        }
        BackendConfiguration::Redis { url } => {
            RedisBlobAccess::instantiate(redis::Client::open(url.as_str())?, key_format)
        }
        BackendConfiguration::Http { address, prefix } => {
            HttpBlobAccess::instantiate(address, prefix)
        }
        BackendConfiguration::GrpcCas { address } => GrpcCasBlobAccess::instantiate(address).await?,
        BackendConfiguration::S3 {
            bucket,
            region,
            endpoint,
        } => S3BlobAccess::instantiate(bucket, region.as_deref(), endpoint.as_deref(), key_format)?,
        BackendConfiguration::Sharding { seed, shards } => {
            let mut backends = Vec::with_capacity(shards.len());
            let mut weights = Vec::with_capacity(shards.len());
            for shard in shards {
                weights.push(shard.weight);
                backends.push(match &shard.backend {
                    Some(backend) => Some(create_backend(backend, key_format).await?),
                    None => None,
                });
            }
            ShardingBlobAccess::instantiate(
                backends,
                Box::new(WeightedShardSelector::new(&weights)),
                key_format,
                *seed,
            )
        }
    })
}

/// Assembles one storage stack: the configured backend tree, optionally
/// wrapped in integrity validation, always wrapped in metrics.
pub async fn create_blob_access(
    config: &StorageConfiguration,
    store_name: &str,
    key_format: DigestKeyFormat,
) -> anyhow::Result<BlobAccessInstance> {
    let mut backend = create_backend(&config.backend, key_format).await?;
    if config.verify_integrity {
        backend = IntegrityValidatingBlobAccess::instantiate(backend);
    }
    Ok(MetricsBlobAccess::instantiate(backend, store_name))
}

#[cfg(test)]
mod test {
    use super::super::{blob_stream, read_all, BlobAccess};
    use super::*;
    use crate::build::bazel::remote::execution::v2::Digest;

    #[tokio::test]
    async fn sharded_memory_configuration_round_trips() -> anyhow::Result<()> {
        let config: BlobstoreConfiguration = serde_json::from_str(
            r#"{
                "content_addressable_storage": {
                    "verify_integrity": true,
                    "backend": {
                        "kind": "sharding",
                        "seed": 7,
                        "shards": [
                            { "weight": 1, "backend": { "kind": "memory", "max_bytes": 1048576 } },
                            { "weight": 1, "backend": null }
                        ]
                    }
                },
                "action_cache": {
                    "backend": { "kind": "memory", "max_bytes": 1048576 }
                }
            }"#,
        )?;
        let storage = create_blob_access(
            &config.content_addressable_storage,
            "cas",
            DigestKeyFormat::WithoutInstance,
        )
        .await?;

        let digest = Digest {
            hash: sha256::digest(&b"hello"[..]),
            size_bytes: 5,
        };
        storage
            .put("", &digest, 5, blob_stream(b"hello".to_vec()))
            .await
            .unwrap();
        let data = read_all(storage.get("", &digest).await).await.unwrap();
        assert_eq!(&data, b"hello");
        Ok(())
    }

    #[test]
    fn disk_configuration_parses() {
        let config: BackendConfiguration =
            serde_json::from_str(r#"{ "kind": "disk", "directory": "/var/cache/casdepot" }"#)
                .unwrap();
        match config {
            BackendConfiguration::Disk { directory } => {
                assert_eq!(directory, PathBuf::from("/var/cache/casdepot"));
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }
}
