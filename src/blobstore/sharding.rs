//! Digest-keyed sharding across multiple backends
//!
//! Each digest is hashed with FNV-1a and mapped to a shard by a
//! [`ShardSelector`]. Drained shards (slots without a backend) are skipped
//! deterministically, so removing a shard from rotation only moves its own
//! fraction of the keyspace.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{async_trait, Status};
use tracing::warn;

use crate::build::bazel::remote::execution::v2::Digest;
use crate::digest::{digest_key, fnv1a, DigestKeyFormat};

use super::{BlobAccess, BlobAccessInstance, BlobStream, Result};

/// Maps a digest hash to a shard slot. The selector keeps proposing
/// candidate slots until `is_drained` accepts one, and must propose the
/// same sequence for the same hash every time.
pub trait ShardSelector: Send + Sync {
    fn get_shard(&self, hash: u64, is_drained: &dyn Fn(usize) -> bool) -> usize;
}

/// Weighted selection over a slot table. Each slot appears in the table
/// as many times as its weight; a mismatch re-derives the probe position
/// from the hash so the walk stays deterministic.
pub struct WeightedShardSelector {
    slots: Vec<usize>,
}

impl WeightedShardSelector {
    pub fn new(weights: &[u32]) -> Self {
        let mut slots = Vec::new();
        for (index, weight) in weights.iter().enumerate() {
            slots.extend(std::iter::repeat(index).take(*weight as usize));
        }
        assert!(!slots.is_empty(), "shard selector needs a non-zero weight");
        Self { slots }
    }
}

impl ShardSelector for WeightedShardSelector {
    fn get_shard(&self, hash: u64, is_drained: &dyn Fn(usize) -> bool) -> usize {
        let mut h = hash;
        loop {
            let slot = self.slots[(h % self.slots.len() as u64) as usize];
            if !is_drained(slot) {
                return slot;
            }
            h = h
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
        }
    }
}

pub struct ShardingBlobAccess {
    backends: Vec<Option<BlobAccessInstance>>,
    shard_selector: Box<dyn ShardSelector>,
    key_format: DigestKeyFormat,
    hash_initialization: u64,
}

impl ShardingBlobAccess {
    pub fn instantiate(
        backends: Vec<Option<BlobAccessInstance>>,
        shard_selector: Box<dyn ShardSelector>,
        key_format: DigestKeyFormat,
        hash_initialization: u64,
    ) -> BlobAccessInstance {
        assert!(
            backends.iter().any(Option::is_some),
            "sharding needs at least one undrained backend"
        );
        Arc::new(Self {
            backends,
            shard_selector,
            key_format,
            hash_initialization,
        })
    }

    fn backend_index(&self, instance: &str, digest: &Digest) -> usize {
        let key = digest_key(instance, digest, self.key_format);
        let hash = fnv1a(&key, self.hash_initialization);
        self.shard_selector
            .get_shard(hash, &|index| self.backends[index].is_none())
    }

    fn backend(&self, instance: &str, digest: &Digest) -> &BlobAccessInstance {
        self.backends[self.backend_index(instance, digest)]
            .as_ref()
            .unwrap()
    }
}

#[async_trait]
impl BlobAccess for ShardingBlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        self.backend(instance, digest).get(instance, digest).await
    }

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        size_bytes: i64,
        data: BlobStream,
    ) -> Result<()> {
        self.backend(instance, digest)
            .put(instance, digest, size_bytes, data)
            .await
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        // Group the batch per backend, then query the backends concurrently.
        let mut per_backend: HashMap<usize, Vec<Digest>> = HashMap::new();
        for digest in digests {
            per_backend
                .entry(self.backend_index(instance, &digest))
                .or_default()
                .push(digest);
        }

        let mut calls = Vec::new();
        for (index, digests) in per_backend {
            let backend = Arc::clone(self.backends[index].as_ref().unwrap());
            let instance = instance.to_string();
            calls.push(tokio::spawn(async move {
                backend.find_missing(&instance, digests).await
            }));
        }

        // One failing shard does not abort the others; the union of the
        // successful responses is still useful to the caller.
        let shard_count = calls.len();
        let mut missing = Vec::new();
        let mut last_error = None;
        let mut failures = 0;
        for call in calls {
            match call.await {
                Ok(Ok(found_missing)) => missing.extend(found_missing),
                Ok(Err(status)) => {
                    failures += 1;
                    last_error = Some(status);
                }
                Err(err) => {
                    failures += 1;
                    last_error = Some(Status::internal(format!("Shard query panicked: {}", err)));
                }
            }
        }
        match last_error {
            Some(status) if failures == shard_count => Err(status),
            Some(status) => {
                warn!(
                    "{} of {} shards failed during find_missing, returning partial result: {}",
                    failures, shard_count, status
                );
                Ok(missing)
            }
            None => Ok(missing),
        }
    }

    async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        self.backend(instance, digest)
            .delete(instance, digest)
            .await
    }
}
