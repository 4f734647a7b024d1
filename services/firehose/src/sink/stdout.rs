//! Console sink backend: newline-delimited JSON.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{SinkBackend, SinkError};

/// Writes each payload followed by a newline.
pub struct ConsoleBackend<W> {
    writer: Mutex<W>,
}

impl ConsoleBackend<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> ConsoleBackend<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

fn write_error(e: std::io::Error) -> SinkError {
    SinkError::Write {
        backend: "stdout",
        message: e.to_string(),
    }
}

#[async_trait]
impl<W> SinkBackend for ConsoleBackend<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn write(&self, payload: &[u8]) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await.map_err(write_error)?;
        writer.write_all(b"\n").await.map_err(write_error)?;
        writer.flush().await.map_err(write_error)
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.writer.lock().await.flush().await.map_err(write_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_one_line_per_payload() {
        let backend = ConsoleBackend::new(Vec::new());
        backend.write(br#"{"Name":"a"}"#).await.unwrap();
        backend.write(br#"{"Name":"b"}"#).await.unwrap();
        backend.close().await.unwrap();

        let written = backend.writer.lock().await.clone();
        assert_eq!(written, b"{\"Name\":\"a\"}\n{\"Name\":\"b\"}\n");
    }
}
