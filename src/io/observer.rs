//! Observer connections - the far end of the notification hub
//!
//! Each registered observer is driven by its own writer task which owns an
//! `ObserverConnection`. A delivery error ends that task and unregisters the
//! observer; it is never reported back to the publisher.

use crate::domain::OccupancyEvent;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Why an event could not reach an observer
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("observer closed")]
    Closed,
    #[error("observer write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("event encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A live observer that accepts occupancy events in order
#[async_trait]
pub trait ObserverConnection: Send + 'static {
    /// Deliver one event. Any error is final for this connection.
    async fn deliver(&mut self, event: &OccupancyEvent) -> Result<(), DeliveryError>;

    /// Short label for logs (peer address, test name)
    fn label(&self) -> String;
}

/// In-process observer backed by an mpsc channel
pub struct ChannelObserver {
    tx: mpsc::Sender<OccupancyEvent>,
    label: String,
}

impl ChannelObserver {
    /// Create an observer and the receiver that reads its events
    pub fn new(label: &str, buffer_size: usize) -> (Self, mpsc::Receiver<OccupancyEvent>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (Self { tx, label: label.to_string() }, rx)
    }
}

#[async_trait]
impl ObserverConnection for ChannelObserver {
    async fn deliver(&mut self, event: &OccupancyEvent) -> Result<(), DeliveryError> {
        self.tx.send(*event).await.map_err(|_| DeliveryError::Closed)
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

/// Observer that writes one JSON object per line, e.g. to a TCP socket
pub struct JsonLinesObserver<W> {
    writer: W,
    label: String,
    buf: Vec<u8>,
}

impl<W> JsonLinesObserver<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W, label: &str) -> Self {
        Self { writer, label: label.to_string(), buf: Vec::with_capacity(96) }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ObserverConnection for JsonLinesObserver<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn deliver(&mut self, event: &OccupancyEvent) -> Result<(), DeliveryError> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, event)?;
        self.buf.push(b'\n');
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}
