#![forbid(unsafe_code)]

use super::connection::SharedData;
use super::wire::{MAX_HELLO_LEN, MAX_PACKET_LEN};
use super::*;

use std::fmt::Debug;
use std::io;
use std::num::NonZeroUsize;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use pin_project::pin_project;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Receiving half of a connection.
///
/// A single task drives it, handing every response to the request waiting
/// on its id.
#[derive(Debug)]
#[pin_project]
pub struct ReadEnd<R, Auxiliary = ()> {
    #[pin]
    reader: BufReader<R>,
    shared_data: SharedData<Auxiliary>,
}

impl<R: AsyncRead, Auxiliary> ReadEnd<R, Auxiliary> {
    /// The server hello has to be received before anything else.
    pub fn new(
        reader: R,
        reader_buffer_len: NonZeroUsize,
        shared_data: SharedData<Auxiliary>,
    ) -> Self {
        Self {
            reader: BufReader::with_capacity(reader_buffer_len.get(), reader),
            shared_data,
        }
    }

    async fn read_exact_bytes(self: Pin<&mut Self>, len: usize) -> Result<Bytes, io::Error> {
        let mut buf = BytesMut::zeroed(len);
        self.project().reader.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }

    async fn read_len(self: Pin<&mut Self>) -> Result<u32, io::Error> {
        self.project().reader.read_u32().await
    }

    /// Receive `SSH_FXP_VERSION` and return the extensions it advertises.
    pub async fn receive_server_hello_pinned(
        mut self: Pin<&mut Self>,
    ) -> Result<Extensions, Error> {
        let len = self.as_mut().read_len().await?;
        if len > MAX_HELLO_LEN {
            return Err(Error::SftpServerHelloMsgTooLong { len });
        }

        let body = self.read_exact_bytes(len as usize).await?;
        let server_version = ServerVersion::decode_body(body)?;

        if server_version.version != SSH2_FILEXFER_VERSION {
            Err(Error::UnsupportedSftpProtocol {
                version: server_version.version,
            })
        } else {
            Ok(Extensions::new(&server_version.extensions))
        }
    }

    /// Read one response and hand it to the request waiting for it.
    ///
    /// Every error is fatal to the connection, after which
    /// [`SharedData::close_pending_requests`] should be called.
    ///
    /// Not cancel safe: a dropped future may leave half a packet in the
    /// buffer.
    pub async fn read_in_one_packet_pinned(mut self: Pin<&mut Self>) -> Result<(), Error> {
        let len = self.as_mut().read_len().await?;

        // Type and id take 5 bytes.
        if len < 5 {
            return Err(Error::MalformedPacket(&"packet shorter than its header"));
        }
        if len > MAX_PACKET_LEN {
            return Err(Error::MalformedPacket(&"packet exceeds maximum length"));
        }

        let body = self.as_mut().read_exact_bytes(len as usize).await?;
        let response = Response::decode_body(body)?;

        tracing::trace!(response_id = response.response_id, "received response");

        self.shared_data
            .responses()
            .complete(response.response_id, response.inner)
    }

    /// Wait until bytes are buffered, failing with
    /// [`io::ErrorKind::UnexpectedEof`] once the peer closed. Cancel safe.
    pub async fn ready_for_read_pinned(self: Pin<&mut Self>) -> Result<(), io::Error> {
        if self.project().reader.fill_buf().await?.is_empty() {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "sftp server closed the connection"))
        } else {
            Ok(())
        }
    }
}

impl<R, Auxiliary> ReadEnd<R, Auxiliary>
where
    Self: Unpin,
    R: AsyncRead,
{
    /// See [`ReadEnd::receive_server_hello_pinned`].
    pub async fn receive_server_hello(&mut self) -> Result<Extensions, Error> {
        Pin::new(self).receive_server_hello_pinned().await
    }

    /// See [`ReadEnd::read_in_one_packet_pinned`].
    pub async fn read_in_one_packet(&mut self) -> Result<(), Error> {
        Pin::new(self).read_in_one_packet_pinned().await
    }

    /// See [`ReadEnd::ready_for_read_pinned`].
    pub async fn ready_for_read(&mut self) -> Result<(), io::Error> {
        Pin::new(self).ready_for_read_pinned().await
    }
}

impl<R, Auxiliary> ReadEnd<R, Auxiliary> {
    pub fn get_shared_data(&self) -> &SharedData<Auxiliary> {
        &self.shared_data
    }
}
