#![forbid(unsafe_code)]

use super::awaitable_responses::{AwaitableResponses, ResponseReceiver, Ticket};
use super::{Error, FileAttrs, Handle, Limits, NameEntry, ResponseInner, StatusCode};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// The data returned by [`crate::WriteEnd::send_read_request`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Data {
    /// May be shorter than requested.
    Buffer(Bytes),

    /// EOF is reached before any data can be read.
    Eof,
}

/// Shared part of every awaitable.
///
/// Dropping it before the response arrives marks the request id stale,
/// so the late response is discarded and the id is not reused until then.
#[derive(Debug)]
struct AwaitableInner {
    ticket: Ticket,
    receiver: ResponseReceiver,
    responses: Arc<AwaitableResponses>,
    timeout: Option<Duration>,
    done: bool,
}

impl AwaitableInner {
    async fn wait(mut self) -> Result<ResponseInner, Error> {
        let res = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut self.receiver).await {
                Ok(res) => res,
                Err(_elapsed) => {
                    tracing::debug!(request_id = self.ticket.id, "request timed out");
                    return Err(Error::Timeout);
                }
            },
            None => (&mut self.receiver).await,
        };
        self.done = true;

        // The sender is only dropped without sending when the table is
        // torn down.
        let response = res.map_err(|_| Error::ConnectionClosed)??;

        match response {
            ResponseInner::Status {
                status_code: StatusCode::Failure(err_code),
                err_msg,
            } => Err(Error::SftpError(err_code, err_msg)),

            response => Ok(response),
        }
    }
}

impl Drop for AwaitableInner {
    fn drop(&mut self) {
        if !self.done {
            self.responses.mark_stale(self.ticket);
        }
    }
}

macro_rules! def_awaitable {
    ($name:ident, $res:ty, | $response_name:ident | $post_processing:block) => {
        /// Awaitable
        ///
        /// Dropping it without waiting is fine, the response is
        /// discarded when it arrives.
        #[repr(transparent)]
        #[derive(Debug)]
        pub struct $name(AwaitableInner);

        impl $name {
            pub(crate) fn new(
                ticket: Ticket,
                receiver: ResponseReceiver,
                responses: Arc<AwaitableResponses>,
                timeout: Option<Duration>,
            ) -> Self {
                Self(AwaitableInner {
                    ticket,
                    receiver,
                    responses,
                    timeout,
                    done: false,
                })
            }

            /// Return the id this request was sent with.
            pub fn request_id(&self) -> u32 {
                self.0.ticket.id
            }

            /// Wait for the response.
            ///
            /// Fails with [`Error::Timeout`] if the request timeout elapses
            /// first and with [`Error::ConnectionClosed`] if the session is
            /// torn down.
            ///
            /// # Cancel Safety
            ///
            /// It is perfectly safe to cancel the future.
            pub async fn wait(self) -> Result<$res, Error> {
                let $response_name = self.0.wait().await?;
                $post_processing
            }
        }
    };
}

fn unexpected() -> Error {
    Error::ProtocolViolation(&"unexpected response")
}

def_awaitable!(AwaitableStatus, (), |response| {
    match response {
        ResponseInner::Status {
            status_code: StatusCode::Success,
            ..
        } => Ok(()),
        _ => Err(unexpected()),
    }
});

def_awaitable!(AwaitableHandle, Handle, |response| {
    match response {
        ResponseInner::Handle(handle) => Ok(handle),
        _ => Err(unexpected()),
    }
});

def_awaitable!(AwaitableData, Data, |response| {
    match response {
        ResponseInner::Data(data) => Ok(Data::Buffer(data)),
        _ => Err(unexpected()),
    }
});

def_awaitable!(AwaitableNameEntries, Vec<NameEntry>, |response| {
    match response {
        ResponseInner::Name(entries) => Ok(entries),
        _ => Err(unexpected()),
    }
});

def_awaitable!(AwaitableName, Bytes, |response| {
    match response {
        ResponseInner::Name(entries) => {
            let mut entries = entries.into_iter();
            match (entries.next(), entries.next()) {
                (Some(entry), None) => Ok(entry.filename),
                _ => Err(Error::ProtocolViolation(&"expected exactly one name entry")),
            }
        }
        _ => Err(unexpected()),
    }
});

def_awaitable!(AwaitableAttrs, FileAttrs, |response| {
    match response {
        ResponseInner::Attrs(attrs) => Ok(attrs),
        _ => Err(unexpected()),
    }
});

def_awaitable!(AwaitableLimits, Limits, |response| {
    match response {
        ResponseInner::ExtendedReply(data) => {
            Limits::decode(data).map_err(|_| Error::MalformedPacket(&"malformed limits reply"))
        }
        _ => Err(unexpected()),
    }
});

fn is_eof(err: &Error) -> bool {
    matches!(err, Error::SftpError(super::SftpErrorKind::Eof, _))
}

impl AwaitableData {
    /// Like [`AwaitableData::wait`], but `SSH_FX_EOF` becomes [`Data::Eof`].
    ///
    /// # Cancel Safety
    ///
    /// It is perfectly safe to cancel the future.
    pub async fn wait_data(self) -> Result<Data, Error> {
        match self.wait().await {
            Err(err) if is_eof(&err) => Ok(Data::Eof),
            res => res,
        }
    }
}

impl AwaitableNameEntries {
    /// Like [`AwaitableNameEntries::wait`], but `SSH_FX_EOF` becomes an
    /// empty list.
    ///
    /// # Cancel Safety
    ///
    /// It is perfectly safe to cancel the future.
    pub async fn wait_entries(self) -> Result<Vec<NameEntry>, Error> {
        match self.wait().await {
            Err(err) if is_eof(&err) => Ok(Vec::new()),
            res => res,
        }
    }
}
