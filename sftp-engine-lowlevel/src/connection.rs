#![forbid(unsafe_code)]

use super::awaitable_responses::{AwaitableResponses, ResponseReceiver, Ticket};
use super::*;

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Parameters of the lowlevel connection.
#[derive(Debug, Copy, Clone)]
pub struct ConnectionOptions {
    /// How long [`WriteEnd`] awaitables wait for a response,
    /// `None` waits forever.
    pub request_timeout: Option<Duration>,

    /// Largest request id, ids wrap to 0 after it.
    pub max_id: u32,

    /// Capacity of the buffer in front of the reader.
    pub read_buffer_size: NonZeroUsize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            max_id: u32::MAX,
            read_buffer_size: NonZeroUsize::new(64 * 1024).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

#[derive(Debug)]
struct SharedDataInner<Auxiliary> {
    queue: mpsc::UnboundedSender<Bytes>,
    responses: Arc<AwaitableResponses>,
    request_timeout: Option<Duration>,

    auxiliary: Auxiliary,
}

/// SharedData contains both the outgoing queue and the pending responses,
/// since every request needs both: an id from the table and a slot in
/// the queue.
#[derive(Debug)]
pub struct SharedData<Auxiliary = ()>(Arc<SharedDataInner<Auxiliary>>);

impl<Auxiliary> Clone for SharedData<Auxiliary> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<Auxiliary> SharedData<Auxiliary> {
    fn new(
        queue: mpsc::UnboundedSender<Bytes>,
        options: &ConnectionOptions,
        auxiliary: Auxiliary,
    ) -> Self {
        SharedData(Arc::new(SharedDataInner {
            queue,
            responses: Arc::new(AwaitableResponses::new(options.max_id)),
            request_timeout: options.request_timeout,

            auxiliary,
        }))
    }

    pub(crate) fn responses(&self) -> &Arc<AwaitableResponses> {
        &self.0.responses
    }

    pub(crate) fn request_timeout(&self) -> Option<Duration> {
        self.0.request_timeout
    }

    /// Returned the auxiliary data.
    pub fn get_auxiliary(&self) -> &Auxiliary {
        &self.0.auxiliary
    }

    /// Number of requests that are still waited for.
    pub fn pending_requests(&self) -> usize {
        self.0.responses.live()
    }

    /// Number of request ids in use, including those whose waiter gave up
    /// before the response arrived.
    pub fn reserved_ids(&self) -> usize {
        self.0.responses.len()
    }

    /// Wait until no request is waited for.
    ///
    /// # Cancel Safety
    ///
    /// This function is cancel safe.
    pub async fn wait_for_pending_requests(&self) {
        self.0.responses.wait_drained().await
    }

    /// Fail every pending request with [`Error::ConnectionClosed`] and
    /// refuse new ones.
    pub fn close_pending_requests(&self) {
        self.0.responses.close_all()
    }

    pub(crate) fn push(&self, bytes: Bytes) -> Result<(), Error> {
        self.0.queue.send(bytes).map_err(|_| Error::ConnectionClosed)
    }

    /// Reserve an id, encode the request with it and queue it.
    pub(crate) fn send_request(
        &self,
        inner: RequestInner,
    ) -> Result<(Ticket, ResponseReceiver), Error> {
        let (ticket, receiver) = self.0.responses.insert(inner.kind())?;

        let mut buf = BytesMut::new();
        Request {
            request_id: ticket.id,
            inner,
        }
        .encode_into(&mut buf);

        if let Err(err) = self.push(buf.freeze()) {
            self.0.responses.remove(ticket);
            return Err(err);
        }

        Ok((ticket, receiver))
    }
}

/// Create both ends of a connection and queue the `SSH_FXP_INIT` message.
///
/// The returned [`Outgoing`] has to be drained into the writer of the
/// transport, then [`ReadEnd::receive_server_hello`] must be called
/// before any response is read.
pub fn connect<R: AsyncRead>(
    reader: R,
    options: ConnectionOptions,
) -> Result<(WriteEnd, ReadEnd<R>, Outgoing), Error> {
    connect_with_auxiliary(reader, options, ())
}

/// Same as [`connect`], with auxiliary data stored alongside the shared
/// state and reachable from every [`WriteEnd`] through
/// [`SharedData::get_auxiliary`].
pub fn connect_with_auxiliary<R: AsyncRead, Auxiliary>(
    reader: R,
    options: ConnectionOptions,
    auxiliary: Auxiliary,
) -> Result<
    (
        WriteEnd<Auxiliary>,
        ReadEnd<R, Auxiliary>,
        Outgoing,
    ),
    Error,
> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let shared_data = SharedData::new(sender, &options, auxiliary);

    let write_end = WriteEnd::new(shared_data.clone());
    write_end.send_hello(SSH2_FILEXFER_VERSION)?;

    let read_end = ReadEnd::new(reader, options.read_buffer_size, shared_data);

    Ok((write_end, read_end, Outgoing::new(receiver)))
}
