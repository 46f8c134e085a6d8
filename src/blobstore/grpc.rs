//! Relay to a remote gRPC CAS
//!
//! Speaks the same ByteStream/ContentAddressableStorage services that
//! Bazel uses, so any conforming cache can serve as a backend.

use std::sync::{Arc, Mutex};

use async_stream::stream;
use tokio_stream::StreamExt;
use tonic::{async_trait, transport::Channel, Status};

use crate::build::bazel::remote::execution::v2::{
    content_addressable_storage_client::ContentAddressableStorageClient, Digest,
    FindMissingBlobsRequest,
};
use crate::google::bytestream::{byte_stream_client::ByteStreamClient, ReadRequest, WriteRequest};

use super::{BlobAccess, BlobAccessInstance, BlobStream, Result};

pub struct GrpcCasBlobAccess {
    bs_client: ByteStreamClient<Channel>,
    cas_client: ContentAddressableStorageClient<Channel>,
}

impl GrpcCasBlobAccess {
    pub async fn instantiate(address: &str) -> Result<BlobAccessInstance> {
        let bs_client = ByteStreamClient::connect(address.to_string())
            .await
            .map_err(|e| Status::unavailable(format!("ByteStream connect failed: {:?}", e)))?;
        let cas_client = ContentAddressableStorageClient::connect(address.to_string())
            .await
            .map_err(|e| Status::unavailable(format!("CAS connect failed: {:?}", e)))?;
        Ok(Arc::new(Self {
            bs_client,
            cas_client,
        }))
    }

    fn read_resource(instance: &str, digest: &Digest) -> String {
        if instance.is_empty() {
            format!("blobs/{}/{}", digest.hash, digest.size_bytes)
        } else {
            format!("{}/blobs/{}/{}", instance, digest.hash, digest.size_bytes)
        }
    }

    fn write_resource(instance: &str, digest: &Digest) -> String {
        let uuid = uuid::Uuid::new_v4();
        if instance.is_empty() {
            format!("uploads/{}/blobs/{}/{}", uuid, digest.hash, digest.size_bytes)
        } else {
            format!(
                "{}/uploads/{}/blobs/{}/{}",
                instance, uuid, digest.hash, digest.size_bytes
            )
        }
    }
}

#[async_trait]
impl BlobAccess for GrpcCasBlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        let request = ReadRequest {
            resource_name: Self::read_resource(instance, digest),
            read_offset: 0,
            read_limit: 0,
        };
        let mut client = self.bs_client.clone();
        let response = match client.read(request).await {
            Ok(response) => response,
            Err(status) => return super::error_stream(status),
        };
        Box::pin(
            response
                .into_inner()
                .map(|message| message.map(|m| m.data)),
        )
    }

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        _size_bytes: i64,
        data: BlobStream,
    ) -> Result<()> {
        let resource_name = Self::write_resource(instance, digest);

        // The outbound request stream cannot return an error itself, so a
        // failure while reading the source is parked here and the stream is
        // cut short, aborting the RPC.
        let source_error = Arc::new(Mutex::new(None));
        let outbound = build_outbound(resource_name, data, Arc::clone(&source_error));

        let mut client = self.bs_client.clone();
        let response = match client.write(outbound).await {
            Ok(response) => response,
            Err(status) => {
                return Err(source_error.lock().unwrap().take().unwrap_or(status));
            }
        };
        let committed = response.into_inner().committed_size;
        if committed != digest.size_bytes {
            return Err(Status::data_loss(format!(
                "Committed {} bytes, expected {}",
                committed, digest.size_bytes
            )));
        }
        Ok(())
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        let request = FindMissingBlobsRequest {
            instance_name: instance.to_string(),
            blob_digests: digests,
        };
        let mut client = self.cas_client.clone();
        let response = client.find_missing_blobs(request).await?;
        Ok(response.into_inner().missing_blob_digests)
    }

    async fn delete(&self, _instance: &str, _digest: &Digest) -> Result<()> {
        Err(Status::unimplemented(
            "Bazel remote execution protocol does not support object deletion",
        ))
    }
}

fn build_outbound(
    mut resource_name: String,
    mut data: BlobStream,
    stream_error: Arc<Mutex<Option<Status>>>,
) -> impl tokio_stream::Stream<Item = WriteRequest> {
    stream! {
        let mut write_offset = 0;
        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(status) => {
                    *stream_error.lock().unwrap() = Some(status);
                    return;
                }
            };
            let len = chunk.len() as i64;
            yield WriteRequest {
                resource_name: std::mem::take(&mut resource_name),
                write_offset,
                finish_write: false,
                data: chunk,
            };
            write_offset += len;
        }
        yield WriteRequest {
            resource_name: std::mem::take(&mut resource_name),
            write_offset,
            finish_write: true,
            data: Vec::new(),
        };
    }
}
