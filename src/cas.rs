//! Worker-side views of the Content Addressable Storage
//!
//! Build actions need decoded Directory trees and input files on the local
//! filesystem, not byte streams. The adapters here layer decoded-Directory
//! caching and hardlink-pool materialization over a plain blob store, and
//! split reads from writes so workers can share a reader while each keeps
//! its own batched writer.

use std::path::Path;
use std::sync::Arc;

use tonic::{async_trait, Status};

use crate::build::bazel::remote::execution::v2::{Digest, Directory};

type Result<T, E = Status> = std::result::Result<T, E>;

#[async_trait]
pub trait ContentAddressableStorage: Send + Sync {
    /// Fetches and decodes the Directory message stored under `digest`.
    async fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Arc<Directory>>;

    /// Materializes the blob stored under `digest` as a file at `target`.
    async fn get_file(
        &self,
        instance: &str,
        digest: &Digest,
        target: &Path,
        is_executable: bool,
    ) -> Result<()>;

    /// Uploads the file at `path` and returns its digest.
    async fn put_file(&self, instance: &str, path: &Path) -> Result<Digest>;

    /// Uploads an in-memory blob and returns its digest.
    async fn put_blob(&self, instance: &str, data: Vec<u8>) -> Result<Digest>;
}

pub type ContentAddressableStorageInstance = Arc<dyn ContentAddressableStorage>;

pub mod blob_access;
pub mod directory_caching;
pub mod hardlinking;
pub mod read_write_decoupling;
