//! AMQP sink backend.

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use super::{SinkBackend, SinkError};

/// Publishes each payload to an exchange with a fixed routing key.
pub struct AmqpBackend {
    connection: Connection,
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl AmqpBackend {
    pub async fn connect(uri: &str, exchange: &str, routing_key: &str) -> Result<Self, SinkError> {
        let connect_err = |e: lapin::Error| SinkError::Connect {
            backend: "amqp",
            message: e.to_string(),
        };

        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(connect_err)?;
        let channel = connection.create_channel().await.map_err(connect_err)?;

        info!(exchange, routing_key, "Connected to AMQP broker");
        Ok(Self {
            connection,
            channel,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }
}

fn write_error(e: lapin::Error) -> SinkError {
    SinkError::Write {
        backend: "amqp",
        message: e.to_string(),
    }
}

#[async_trait]
impl SinkBackend for AmqpBackend {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn write(&self, payload: &[u8]) -> Result<(), SinkError> {
        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(write_error)?;
        confirm.await.map_err(write_error)?;

        debug!(exchange = %self.exchange, "Message published");
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.connection
            .close(200, "firehose stopping")
            .await
            .map_err(|e| SinkError::Write {
                backend: "amqp",
                message: format!("close: {e}"),
            })
    }
}
