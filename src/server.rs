//! gRPC frontend
//!
//! Exposes the composed blob store and action cache through the services
//! Bazel speaks: ByteStream for blob transfer, ContentAddressableStorage
//! for existence checks and small batches, ActionCache for results, and
//! Capabilities so clients can discover what this cache supports.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tonic::{async_trait, transport::Server, Request, Response, Status, Streaming};
use tracing::{info, info_span};

use async_stream::stream;

use crate::{
    actioncache::{ActionCache as _, ActionCacheInstance},
    blobstore::{blob_stream, BlobAccess, BlobAccessInstance, BlobStream},
    build::bazel::{
        remote::execution::v2::{
            action_cache_server::{ActionCache, ActionCacheServer},
            batch_update_blobs_response,
            capabilities_server::{Capabilities, CapabilitiesServer},
            content_addressable_storage_server::{
                ContentAddressableStorage, ContentAddressableStorageServer,
            },
            digest_function, symlink_absolute_path_strategy, ActionCacheUpdateCapabilities,
            ActionResult, BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
            BatchUpdateBlobsResponse, CacheCapabilities, Digest, FindMissingBlobsRequest,
            FindMissingBlobsResponse, GetActionResultRequest, GetCapabilitiesRequest,
            GetTreeRequest, GetTreeResponse, ServerCapabilities, UpdateActionResultRequest,
        },
        semver::SemVer,
    },
    google::{
        bytestream::{
            byte_stream_server::{ByteStream, ByteStreamServer},
            QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse,
            WriteRequest, WriteResponse,
        },
        rpc,
    },
};

pub async fn serve(
    dst: SocketAddr,
    instance_name: &str,
    content_addressable_storage: BlobAccessInstance,
    action_cache: ActionCacheInstance,
    read_chunk_size: usize,
) -> anyhow::Result<()> {
    Server::builder()
        .trace_fn(|request| info_span!("request", uri = %request.uri()))
        .add_service(CapabilitiesServer::new(DepotCapabilities {
            instance_name: instance_name.to_string(),
        }))
        .add_service(ByteStreamServer::new(DepotByteStream {
            blob_access: content_addressable_storage.clone(),
            read_chunk_size,
        }))
        .add_service(ContentAddressableStorageServer::new(
            DepotContentAddressableStorage {
                blob_access: content_addressable_storage.clone(),
            },
        ))
        .add_service(ActionCacheServer::new(DepotActionCache {
            action_cache,
            blob_access: content_addressable_storage,
        }))
        .serve(dst)
        .await?;

    Ok(())
}

fn is_lowercase_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

fn parse_size(field: &str) -> Option<i64> {
    field.parse().ok().filter(|size| *size >= 0)
}

/// Parses `[{instance}/]blobs/{hash}/{size}` resource names.
fn parse_resource_name_read(resource_name: &str) -> Result<(String, Digest), Status> {
    let invalid = || Status::invalid_argument("Invalid resource naming scheme");
    let fields: Vec<&str> = resource_name.split('/').filter(|f| !f.is_empty()).collect();
    let l = fields.len();
    if (l != 3 && l != 4) || fields[l - 3] != "blobs" || !is_lowercase_hex(fields[l - 2]) {
        return Err(invalid());
    }
    let size_bytes = parse_size(fields[l - 1]).ok_or_else(invalid)?;
    let instance = if l == 4 { fields[0] } else { "" };
    Ok((
        instance.to_string(),
        Digest {
            hash: fields[l - 2].to_string(),
            size_bytes,
        },
    ))
}

/// Parses `[{instance}/]uploads/{uuid}/blobs/{hash}/{size}` resource names.
fn parse_resource_name_write(resource_name: &str) -> Result<(String, Digest), Status> {
    let invalid = || Status::invalid_argument("Invalid resource naming scheme");
    let fields: Vec<&str> = resource_name.split('/').filter(|f| !f.is_empty()).collect();
    let l = fields.len();
    if (l != 5 && l != 6)
        || fields[l - 5] != "uploads"
        || fields[l - 3] != "blobs"
        || !is_lowercase_hex(fields[l - 2])
    {
        return Err(invalid());
    }
    let size_bytes = parse_size(fields[l - 1]).ok_or_else(invalid)?;
    let instance = if l == 6 { fields[0] } else { "" };
    Ok((
        instance.to_string(),
        Digest {
            hash: fields[l - 2].to_string(),
            size_bytes,
        },
    ))
}

/// Turns an incoming write stream into a blob stream, enforcing that
/// every follow-up request leaves the resource name empty and carries a
/// write offset equal to the bytes delivered so far.
fn write_request_stream<S>(first_data: Vec<u8>, mut rest: S) -> BlobStream
where
    S: Stream<Item = Result<WriteRequest, Status>> + Send + Unpin + 'static,
{
    Box::pin(stream! {
        let mut write_offset = first_data.len() as i64;
        if !first_data.is_empty() {
            yield Ok(first_data);
        }
        while let Some(message) = rest.next().await {
            let message = match message {
                Ok(message) => message,
                Err(status) => {
                    yield Err(status);
                    return;
                }
            };
            if !message.resource_name.is_empty() {
                yield Err(Status::invalid_argument(
                    "Resource name may only be provided in the first write request",
                ));
                return;
            }
            if message.write_offset != write_offset {
                yield Err(Status::invalid_argument(format!(
                    "Attempted to write at offset {}, while {} was expected",
                    message.write_offset, write_offset
                )));
                return;
            }
            write_offset += message.data.len() as i64;
            if !message.data.is_empty() {
                yield Ok(message.data);
            }
        }
    })
}

struct DepotByteStream {
    blob_access: BlobAccessInstance,
    read_chunk_size: usize,
}

#[async_trait]
impl ByteStream for DepotByteStream {
    type ReadStream = ReceiverStream<Result<ReadResponse, Status>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        let request = request.into_inner();
        if request.read_offset != 0 || request.read_limit != 0 {
            return Err(Status::unimplemented(
                "This service does not support downloading partial files",
            ));
        }
        let (instance, digest) = parse_resource_name_read(&request.resource_name)?;
        info!("Handling read of {}/{}", digest.hash, digest.size_bytes);

        let mut blob = self.blob_access.get(&instance, &digest).await;
        let chunk_size = self.read_chunk_size;
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = blob.next().await {
                match chunk {
                    Ok(data) => {
                        buffer.extend_from_slice(&data);
                        while buffer.len() >= chunk_size {
                            let rest = buffer.split_off(chunk_size);
                            let data = std::mem::replace(&mut buffer, rest);
                            if tx.send(Ok(ReadResponse { data })).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
            }
            if !buffer.is_empty() {
                let _ = tx.send(Ok(ReadResponse { data: buffer })).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("Write stream contained no messages"))?;
        let (instance, digest) = parse_resource_name_write(&first.resource_name)?;
        info!("Handling write of {}/{}", digest.hash, digest.size_bytes);

        self.blob_access
            .put(
                &instance,
                &digest,
                digest.size_bytes,
                write_request_stream(first.data, stream),
            )
            .await?;

        Ok(Response::new(WriteResponse {
            committed_size: digest.size_bytes,
        }))
    }

    async fn query_write_status(
        &self,
        _request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        Err(Status::unimplemented(
            "This service does not support querying write status",
        ))
    }
}

struct DepotContentAddressableStorage {
    blob_access: BlobAccessInstance,
}

#[async_trait]
impl ContentAddressableStorage for DepotContentAddressableStorage {
    type GetTreeStream = ReceiverStream<Result<GetTreeResponse, Status>>;

    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        let request = request.into_inner();
        let missing = self
            .blob_access
            .find_missing(&request.instance_name, request.blob_digests)
            .await?;
        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests: missing,
        }))
    }

    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        let request = request.into_inner();
        info!(
            "Handling batch update of {} blobs",
            request.requests.len()
        );

        let mut responses = Vec::with_capacity(request.requests.len());
        for update in request.requests {
            let digest = update
                .digest
                .ok_or_else(|| Status::invalid_argument("Update request lacks a digest"))?;
            let size_bytes = update.data.len() as i64;
            let result = self
                .blob_access
                .put(
                    &request.instance_name,
                    &digest,
                    size_bytes,
                    blob_stream(update.data),
                )
                .await;
            let status = match result {
                Ok(()) => rpc::Status {
                    code: rpc::Code::Ok as i32,
                    message: String::new(),
                    details: vec![],
                },
                Err(status) => rpc::Status {
                    code: status.code() as i32,
                    message: status.message().to_string(),
                    details: vec![],
                },
            };
            responses.push(batch_update_blobs_response::Response {
                digest: Some(digest),
                status: Some(status),
            });
        }

        Ok(Response::new(BatchUpdateBlobsResponse { responses }))
    }

    async fn batch_read_blobs(
        &self,
        _request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        Err(Status::unimplemented("Batch reads are not supported"))
    }

    async fn get_tree(
        &self,
        _request: Request<GetTreeRequest>,
    ) -> Result<Response<Self::GetTreeStream>, Status> {
        Err(Status::unimplemented(
            "Directory walking happens on the workers, not in the storage frontend",
        ))
    }
}

fn referenced_digests(result: &ActionResult) -> Vec<Digest> {
    let mut digests = Vec::new();
    for file in &result.output_files {
        if let Some(digest) = &file.digest {
            digests.push(digest.clone());
        }
    }
    for directory in &result.output_directories {
        if let Some(digest) = &directory.tree_digest {
            digests.push(digest.clone());
        }
    }
    for digest in [&result.stdout_digest, &result.stderr_digest]
        .into_iter()
        .flatten()
    {
        if !digest.hash.is_empty() {
            digests.push(digest.clone());
        }
    }
    digests
}

struct DepotActionCache {
    action_cache: ActionCacheInstance,
    blob_access: BlobAccessInstance,
}

#[async_trait]
impl ActionCache for DepotActionCache {
    async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let request = request.into_inner();
        let action_digest = request
            .action_digest
            .ok_or_else(|| Status::invalid_argument("Request lacks an action digest"))?;
        info!(
            "get_action_result({}/{})",
            action_digest.hash, action_digest.size_bytes
        );

        let result = self
            .action_cache
            .get_action_result(&request.instance_name, &action_digest)
            .await?;

        // A cached result is only useful if all of its outputs can still
        // be fetched; otherwise the client must rebuild.
        let missing = self
            .blob_access
            .find_missing(&request.instance_name, referenced_digests(&result))
            .await?;
        if !missing.is_empty() {
            info!(
                "Action result {}/{} references {} missing blobs",
                action_digest.hash,
                action_digest.size_bytes,
                missing.len()
            );
            return Err(Status::not_found(
                "Action result references outputs that are no longer present in the CAS",
            ));
        }

        Ok(Response::new(result))
    }

    async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let request = request.into_inner();
        let action_digest = request
            .action_digest
            .ok_or_else(|| Status::invalid_argument("Request lacks an action digest"))?;
        let action_result = request
            .action_result
            .ok_or_else(|| Status::invalid_argument("Request lacks an action result"))?;
        info!(
            "update_action_result({}/{})",
            action_digest.hash, action_digest.size_bytes
        );

        self.action_cache
            .put_action_result(&request.instance_name, &action_digest, &action_result)
            .await?;
        Ok(Response::new(action_result))
    }
}

struct DepotCapabilities {
    instance_name: String,
}

#[async_trait]
impl Capabilities for DepotCapabilities {
    async fn get_capabilities(
        &self,
        request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        if request.get_ref().instance_name != self.instance_name {
            return Err(Status::invalid_argument(format!(
                "Unknown instance '{}'",
                request.get_ref().instance_name
            )));
        }
        Ok(Response::new(ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_functions: vec![digest_function::Value::Sha256 as i32],
                action_cache_update_capabilities: Some(ActionCacheUpdateCapabilities {
                    update_enabled: true,
                }),
                max_batch_total_size_bytes: 4 * 1024 * 1024,
                symlink_absolute_path_strategy: symlink_absolute_path_strategy::Value::Disallowed
                    as i32,
            }),
            low_api_version: Some(SemVer {
                major: 2,
                minor: 0,
                patch: 0,
                prerelease: String::new(),
            }),
            high_api_version: Some(SemVer {
                major: 2,
                minor: 2,
                patch: 0,
                prerelease: String::new(),
            }),
        }))
    }
}
