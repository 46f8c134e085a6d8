//! Bazel HTTP caching protocol backend
//!
//! Blobs live under `{address}/{prefix}/{hash}`; existence is probed with
//! HEAD requests. The protocol has no deletion.

use std::sync::Arc;

use bytes::Bytes;
use tokio_stream::StreamExt;
use tonic::{async_trait, Status};

use crate::build::bazel::remote::execution::v2::Digest;

use super::{BlobAccess, BlobAccessInstance, BlobStream, Result};

fn convert_unexpected_status(status: reqwest::StatusCode) -> Status {
    Status::unknown(format!(
        "Unexpected status code from remote cache: {}",
        status
    ))
}

fn map_transport_error(err: reqwest::Error) -> Status {
    Status::unavailable(format!("HTTP request failed: {}", err))
}

pub struct HttpBlobAccess {
    client: reqwest::Client,
    address: String,
    prefix: String,
}

impl HttpBlobAccess {
    pub fn instantiate(address: &str, prefix: &str) -> BlobAccessInstance {
        Arc::new(Self {
            client: reqwest::Client::new(),
            address: address.to_string(),
            prefix: prefix.to_string(),
        })
    }

    fn url_for(&self, digest: &Digest) -> String {
        format!("{}/{}/{}", self.address, self.prefix, digest.hash)
    }
}

#[async_trait]
impl BlobAccess for HttpBlobAccess {
    async fn get(&self, _instance: &str, digest: &Digest) -> BlobStream {
        let url = self.url_for(digest);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => return super::error_stream(map_transport_error(err)),
        };
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => {
                super::error_stream(Status::not_found(url))
            }
            reqwest::StatusCode::OK => {
                let stream = response.bytes_stream().map(|chunk| match chunk {
                    Ok(bytes) => Ok(bytes.to_vec()),
                    Err(err) => Err(map_transport_error(err)),
                });
                Box::pin(stream)
            }
            status => super::error_stream(convert_unexpected_status(status)),
        }
    }

    async fn put(
        &self,
        _instance: &str,
        digest: &Digest,
        size_bytes: i64,
        data: BlobStream,
    ) -> Result<()> {
        let body = reqwest::Body::wrap_stream(data.map(|chunk| chunk.map(Bytes::from)));
        let response = self
            .client
            .put(self.url_for(digest))
            .header(reqwest::header::CONTENT_LENGTH, size_bytes)
            .body(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(()),
            status => Err(convert_unexpected_status(status)),
        }
    }

    async fn find_missing(&self, _instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        let mut missing = Vec::new();
        for digest in digests {
            let response = self
                .client
                .head(self.url_for(&digest))
                .send()
                .await
                .map_err(map_transport_error)?;
            match response.status() {
                reqwest::StatusCode::NOT_FOUND => missing.push(digest),
                reqwest::StatusCode::OK => {}
                status => return Err(convert_unexpected_status(status)),
            }
        }
        Ok(missing)
    }

    async fn delete(&self, _instance: &str, _digest: &Digest) -> Result<()> {
        Err(Status::unimplemented(
            "Bazel HTTP caching protocol does not support object deletion",
        ))
    }
}
