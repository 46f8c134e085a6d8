//! Action cache stored in a blob store
//!
//! The action digest is used as the storage key directly, so the blob's
//! content does not hash to its key. The backing store for an action cache
//! therefore must not sit behind the integrity adapter.

use std::sync::Arc;

use prost::Message;
use tonic::{async_trait, Status};

use crate::blobstore::{blob_stream, read_all, BlobAccess, BlobAccessInstance};
use crate::build::bazel::remote::execution::v2::{ActionResult, Digest};
use crate::proto::FailedAction;

use super::{ActionCache, ActionCacheInstance, Result};

pub struct BlobAccessActionCache {
    blob_access: BlobAccessInstance,
}

impl BlobAccessActionCache {
    pub fn instantiate(blob_access: BlobAccessInstance) -> ActionCacheInstance {
        Arc::new(Self { blob_access })
    }
}

#[async_trait]
impl ActionCache for BlobAccessActionCache {
    async fn get_action_result(&self, instance: &str, digest: &Digest) -> Result<ActionResult> {
        let data = read_all(self.blob_access.get(instance, digest).await).await?;
        ActionResult::decode(&data[..]).map_err(|err| {
            Status::internal(format!(
                "Action result {}/{} does not decode: {:?}",
                digest.hash, digest.size_bytes, err
            ))
        })
    }

    async fn put_action_result(
        &self,
        instance: &str,
        digest: &Digest,
        action_result: &ActionResult,
    ) -> Result<()> {
        let data = action_result.encode_to_vec();
        let size_bytes = data.len() as i64;
        self.blob_access
            .put(instance, digest, size_bytes, blob_stream(data))
            .await
    }
}

/// Frames a failed action together with its result and stores the record
/// in the CAS under its own digest. Returns the URL under which the record
/// can be inspected.
pub async fn put_failed_action(
    content_addressable_storage: &BlobAccessInstance,
    browser_url: &str,
    instance: &str,
    action_digest: &Digest,
    action_result: &ActionResult,
) -> Result<String> {
    let record = FailedAction {
        action_digest: Some(action_digest.clone()),
        action_result: Some(action_result.clone()),
    };
    let data = record.encode_to_vec();
    let digest = Digest {
        hash: sha256::digest(&data[..]),
        size_bytes: data.len() as i64,
    };
    content_addressable_storage
        .put(instance, &digest, digest.size_bytes, blob_stream(data))
        .await?;
    Ok(format!(
        "{}/failed_action/{}/{}/{}/",
        browser_url, instance, digest.hash, digest.size_bytes
    ))
}
