//! Action cache abstraction
//!
//! Maps an action's digest to its serialized ActionResult. Only successful
//! results belong here; failures are framed into the CAS for inspection
//! instead (see [`blob_access::put_failed_action`]).

use std::sync::Arc;

use tonic::{async_trait, Status};

use crate::build::bazel::remote::execution::v2::{ActionResult, Digest};

type Result<T, E = Status> = std::result::Result<T, E>;

#[async_trait]
pub trait ActionCache: Send + Sync {
    async fn get_action_result(&self, instance: &str, digest: &Digest) -> Result<ActionResult>;

    async fn put_action_result(
        &self,
        instance: &str,
        digest: &Digest,
        action_result: &ActionResult,
    ) -> Result<()>;
}

pub type ActionCacheInstance = Arc<dyn ActionCache>;

pub mod blob_access;
