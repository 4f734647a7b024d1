//! Kinesis sink backend.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kinesis::error::DisplayErrorContext;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::Client;
use tracing::debug;

use super::{SinkBackend, SinkError};

/// Appends each payload as one record on a stream.
pub struct KinesisBackend {
    client: Client,
    stream_name: String,
    partition_key: String,
}

impl KinesisBackend {
    /// Build a client from the default AWS credential and region chain.
    pub async fn connect(stream_name: &str, partition_key: &str) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::with_client(Client::new(&sdk_config), stream_name, partition_key)
    }

    pub fn with_client(client: Client, stream_name: &str, partition_key: &str) -> Self {
        Self {
            client,
            stream_name: stream_name.to_string(),
            partition_key: partition_key.to_string(),
        }
    }
}

#[async_trait]
impl SinkBackend for KinesisBackend {
    fn name(&self) -> &'static str {
        "kinesis"
    }

    async fn write(&self, payload: &[u8]) -> Result<(), SinkError> {
        let output = self
            .client
            .put_record()
            .stream_name(&self.stream_name)
            .partition_key(&self.partition_key)
            .data(Blob::new(payload))
            .send()
            .await
            .map_err(|e| SinkError::Write {
                backend: "kinesis",
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!(
            stream = %self.stream_name,
            shard_id = output.shard_id(),
            sequence_number = output.sequence_number(),
            "Record written"
        );
        Ok(())
    }
}
