use std::io;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Receiving half of the outgoing message queue.
///
/// Every item is one complete, encoded message, so writing items one
/// after another never interleaves two messages.
#[derive(Debug)]
pub struct Outgoing {
    receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl Outgoing {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    ///
    /// Return `None` once every sender is gone and the queue is empty.
    ///
    /// # Cancel Safety
    ///
    /// This function is cancel safe.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Return a message if one is ready.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok()
    }

    /// Refuse further messages while keeping the queued ones readable.
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Write `first` and every message that is already queued behind it,
    /// then flush `writer`.
    ///
    /// Return the number of bytes written.
    ///
    /// # Cancel Safety
    ///
    /// This function is not cancel safe, a message might be partially
    /// written.
    pub async fn write_batch<W>(&mut self, writer: &mut W, first: Bytes) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = first.len();
        writer.write_all(&first).await?;

        while let Some(bytes) = self.try_recv() {
            written += bytes.len();
            writer.write_all(&bytes).await?;
        }

        writer.flush().await?;

        Ok(written)
    }
}
