//! Hardlink-pool materialization
//!
//! Input files are fetched once into a flat pool directory and hardlinked
//! into every build directory that needs them. The pool is bounded both by
//! file count and by total bytes; eviction unlinks the pool entry only, so
//! build directories holding live links keep their inodes. The pool is
//! emptied on startup because nothing in it is valid across restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use tokio::fs;
use tokio::sync::Mutex;
use tonic::async_trait;
use tracing::trace;

use crate::build::bazel::remote::execution::v2::{Digest, Directory};
use crate::digest::{digest_key, DigestKeyFormat};

use super::{ContentAddressableStorage, ContentAddressableStorageInstance, Result};

struct PoolState {
    // LRU by last link time; values are file sizes.
    files: LruCache<String, u64>,
    total_size_bytes: u64,
    // Per-key single-flight: the fetcher holds the lock until the pool
    // file is in place, waiters queue on it.
    in_progress: HashMap<String, Arc<Mutex<()>>>,
}

pub struct HardlinkingContentAddressableStorage {
    backend: ContentAddressableStorageInstance,
    key_format: DigestKeyFormat,
    cache_directory: PathBuf,
    max_files: usize,
    max_size_bytes: u64,
    state: Mutex<PoolState>,
}

impl HardlinkingContentAddressableStorage {
    pub fn instantiate(
        backend: ContentAddressableStorageInstance,
        key_format: DigestKeyFormat,
        cache_directory: &Path,
        max_files: usize,
        max_size_bytes: u64,
    ) -> std::io::Result<ContentAddressableStorageInstance> {
        std::fs::create_dir_all(cache_directory)?;
        // Stale pool contents from a previous run are never reused.
        for entry in std::fs::read_dir(cache_directory)? {
            std::fs::remove_file(entry?.path())?;
        }
        Ok(Arc::new(Self {
            backend,
            key_format,
            cache_directory: cache_directory.to_path_buf(),
            max_files,
            max_size_bytes,
            state: Mutex::new(PoolState {
                files: LruCache::unbounded(),
                total_size_bytes: 0,
                in_progress: HashMap::new(),
            }),
        }))
    }

    fn pool_path(&self, key: &str) -> PathBuf {
        self.cache_directory.join(key)
    }

    fn pool_key(&self, instance: &str, digest: &Digest, is_executable: bool) -> String {
        // The executable bit travels with the inode, so the two variants
        // need separate pool entries.
        format!(
            "{}{}",
            digest_key(instance, digest, self.key_format),
            if is_executable { "+x" } else { "+f" }
        )
    }

    async fn link_from_pool(&self, key: &str, target: &Path) -> std::io::Result<()> {
        fs::hard_link(self.pool_path(key), target).await
    }
}

#[async_trait]
impl ContentAddressableStorage for HardlinkingContentAddressableStorage {
    async fn get_directory(&self, instance: &str, digest: &Digest) -> Result<Arc<Directory>> {
        self.backend.get_directory(instance, digest).await
    }

    async fn get_file(
        &self,
        instance: &str,
        digest: &Digest,
        target: &Path,
        is_executable: bool,
    ) -> Result<()> {
        let key = self.pool_key(instance, digest, is_executable);
        loop {
            enum Action {
                Link,
                Wait(Arc<Mutex<()>>),
                Fetch(tokio::sync::OwnedMutexGuard<()>),
            }

            let action = {
                let mut state = self.state.lock().await;
                if state.files.get(&key).is_some() {
                    Action::Link
                } else if let Some(flight) = state.in_progress.get(&key) {
                    Action::Wait(Arc::clone(flight))
                } else {
                    let flight = Arc::new(Mutex::new(()));
                    let guard = Arc::clone(&flight).try_lock_owned().unwrap();
                    state.in_progress.insert(key.clone(), flight);
                    Action::Fetch(guard)
                }
            };

            match action {
                Action::Link => {
                    match self.link_from_pool(&key, target).await {
                        Ok(()) => return Ok(()),
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                            // Evicted between index lookup and link; the
                            // next pass fetches it again.
                            let mut state = self.state.lock().await;
                            state.files.pop(&key);
                            continue;
                        }
                        Err(err) => {
                            return Err(tonic::Status::unknown(format!(
                                "Failed to link cached file: {:?}",
                                err
                            )))
                        }
                    }
                }
                Action::Wait(flight) => {
                    // The fetcher releases this once the pool file exists.
                    let _ = flight.lock().await;
                    continue;
                }
                Action::Fetch(guard) => {
                    let pool_path = self.pool_path(&key);
                    let fetched = self
                        .backend
                        .get_file(instance, digest, &pool_path, is_executable)
                        .await;

                    let evicted = {
                        let mut state = self.state.lock().await;
                        state.in_progress.remove(&key);
                        match &fetched {
                            Ok(()) => {
                                let size = digest.size_bytes as u64;
                                state.files.put(key.clone(), size);
                                state.total_size_bytes += size;

                                // Plan evictions under the lock, unlink
                                // outside of it.
                                let mut evicted = Vec::new();
                                while (state.files.len() > self.max_files
                                    || state.total_size_bytes > self.max_size_bytes)
                                    // Never evict the entry that is about
                                    // to be linked.
                                    && state.files.len() > 1
                                {
                                    match state.files.pop_lru() {
                                        Some((victim, size)) => {
                                            state.total_size_bytes -= size;
                                            evicted.push(victim);
                                        }
                                        None => break,
                                    }
                                }
                                evicted
                            }
                            Err(_) => Vec::new(),
                        }
                    };
                    drop(guard);
                    fetched?;

                    for victim in evicted {
                        trace!("Evicting {} from the hardlink pool", victim);
                        let _ = fs::remove_file(self.pool_path(&victim)).await;
                    }
                    continue;
                }
            }
        }
    }

    async fn put_file(&self, instance: &str, path: &Path) -> Result<Digest> {
        self.backend.put_file(instance, path).await
    }

    async fn put_blob(&self, instance: &str, data: Vec<u8>) -> Result<Digest> {
        self.backend.put_blob(instance, data).await
    }
}
