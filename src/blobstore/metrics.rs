//! Operation counters and latency histograms per logical store

use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use tokio_stream::StreamExt;

use crate::build::bazel::remote::execution::v2::Digest;

use super::{BlobAccess, BlobAccessInstance, BlobStream, Result};

use tonic::async_trait;

/// Wraps a [`BlobAccess`] and records, for each operation, an invocation
/// count and a latency histogram labelled with the logical store name.
/// For `get`, latency covers the whole stream up to EOF or first error.
pub struct MetricsBlobAccess {
    backend: BlobAccessInstance,
    store_name: String,
    operations: Counter<u64>,
    duration: Histogram<f64>,
}

impl MetricsBlobAccess {
    pub fn instantiate(backend: BlobAccessInstance, store_name: &str) -> BlobAccessInstance {
        let meter = opentelemetry::global::meter("casdepot");
        Arc::new(Self {
            backend,
            store_name: store_name.to_string(),
            operations: meter
                .u64_counter("casdepot.blobstore.operations")
                .with_description("Blob store operations per store and operation")
                .build(),
            duration: meter
                .f64_histogram("casdepot.blobstore.operation_duration")
                .with_unit("s")
                .with_description("Blob store operation latency")
                .build(),
        })
    }

    fn labels(&self, operation: &'static str) -> [KeyValue; 2] {
        [
            KeyValue::new("store", self.store_name.clone()),
            KeyValue::new("operation", operation),
        ]
    }
}

#[async_trait]
impl BlobAccess for MetricsBlobAccess {
    async fn get(&self, instance: &str, digest: &Digest) -> BlobStream {
        let labels = self.labels("get");
        self.operations.add(1, &labels);
        let duration = self.duration.clone();
        let start = Instant::now();
        let mut inner = self.backend.get(instance, digest).await;
        Box::pin(stream! {
            while let Some(item) = inner.next().await {
                let terminal = item.is_err();
                yield item;
                if terminal {
                    duration.record(start.elapsed().as_secs_f64(), &labels);
                    return;
                }
            }
            duration.record(start.elapsed().as_secs_f64(), &labels);
        })
    }

    async fn put(
        &self,
        instance: &str,
        digest: &Digest,
        size_bytes: i64,
        data: BlobStream,
    ) -> Result<()> {
        let labels = self.labels("put");
        self.operations.add(1, &labels);
        let start = Instant::now();
        let result = self.backend.put(instance, digest, size_bytes, data).await;
        self.duration
            .record(start.elapsed().as_secs_f64(), &labels);
        result
    }

    async fn find_missing(&self, instance: &str, digests: Vec<Digest>) -> Result<Vec<Digest>> {
        let labels = self.labels("find_missing");
        self.operations.add(1, &labels);
        let start = Instant::now();
        let result = self.backend.find_missing(instance, digests).await;
        self.duration
            .record(start.elapsed().as_secs_f64(), &labels);
        result
    }

    async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        let labels = self.labels("delete");
        self.operations.add(1, &labels);
        let start = Instant::now();
        let result = self.backend.delete(instance, digest).await;
        self.duration
            .record(start.elapsed().as_secs_f64(), &labels);
        result
    }
}
