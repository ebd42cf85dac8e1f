#![forbid(unsafe_code)]

use std::{fmt, io, num::TryFromIntError, path::PathBuf, string::FromUtf8Error};

use serde::Serialize;
use thiserror::Error as ThisError;

/// Error code carried by a `SSH_FXP_STATUS` response that is not
/// `SSH_FX_OK`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SftpErrorKind {
    /// Indicates end-of-file condition.
    ///
    /// For `SSH_FXP_READ` it means that no more data is available in the file,
    /// and for `SSH_FXP_READDIR` it indicates that no more files are contained
    /// in the directory.
    Eof,

    /// A reference is made to a file which should exist but doesn't.
    NoSuchFile,

    /// The authenticated user does not have sufficient permissions to
    /// perform the operation.
    PermDenied,

    /// A generic catch-all error message.
    Failure,

    /// A badly formatted packet or protocol incompatibility is detected.
    BadMessage,

    /// A pseudo-error which indicates that the client has no connection
    /// to the server.
    NoConnection,

    /// A pseudo-error which indicates that the connection to the server
    /// has been lost.
    ConnectionLost,

    /// An attempt was made to perform an operation which is not supported
    /// by the server.
    OpUnsupported,

    /// Status code not defined by sftp v3.
    Unknown(u32),
}

impl fmt::Display for SftpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "Unknown({code})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Error message sent by the server alongside a failure status.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SftpErrMsg {
    /// ISO-10646 UTF-8 [RFC-2279]
    pub err_msg: Box<str>,

    /// [RFC-1766]
    pub language_tag: Box<str>,
}

impl fmt::Display for SftpErrMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.err_msg)
    }
}

/// Coarse classification of [`Error`], as reported to callers of the
/// operation facade.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub enum ErrorKind {
    /// A packet could not be decoded. Fatal to the session.
    MalformedPacket,
    /// The server sent something that does not match any request. Fatal to the session.
    ProtocolViolation,
    /// The underlying byte stream failed. Fatal to the session.
    TransportError,
    /// The handle was closed or invalidated.
    InvalidHandle,
    /// There is no established session.
    NotConnected,
    /// The request was not answered in time.
    Timeout,
    /// A transfer exhausted its retries and can be resumed from an offset.
    TransferFailed,
    /// Every request id is in use.
    ResourceExhausted,
    /// The server reported a failure status.
    RemoteOperationError,
    /// The session terminated while the request was pending.
    ConnectionClosed,
    /// The server does not speak sftp v3 or lacks a required extension.
    Unsupported,
    /// A local filesystem operation failed.
    LocalIoError,
    /// Content could not be decoded with the requested encoding.
    InvalidEncoding,
    /// Anything else.
    Other,
}

/// Error returned by
/// [`sftp-engine-lowlevel`](https://docs.rs/sftp-engine-lowlevel)
/// and [`sftp-engine`](https://docs.rs/sftp-engine)
#[non_exhaustive]
#[derive(Debug, ThisError)]
pub enum Error {
    /// Server speaks sftp protocol other than protocol 3.
    #[error("Server does not support sftp protocol v3: it replied with version {version}.")]
    UnsupportedSftpProtocol {
        /// The sftp protocol version the server replied with.
        version: u32,
    },

    /// Server returned a hello message that is too long.
    #[error("sftp server returned hello message of length {len}, which is longer than 4096.")]
    SftpServerHelloMsgTooLong {
        /// The length of the hello mesage
        len: u32,
    },

    /// The read task or the flush task of the session failed, the detailed
    /// error is returned by closing the session.
    #[error("Background task failed: {0}.")]
    BackgroundTaskFailure(&'static &'static str),

    /// The extension is not advertised by the server.
    #[error("Unsupported extension {0}.")]
    UnsupportedExtension(&'static &'static str),

    /// IO Error on the transport (Excluding [`io::ErrorKind::WouldBlock`]): {0}.
    #[error("IO Error (Excluding `io::ErrorKind::WouldBlock`): {0}.")]
    IOError(#[from] io::Error),

    /// IO Error on the local filesystem.
    #[error("Local IO Error on {path:?}: {source}.")]
    LocalIo {
        /// The local path the operation was applied to.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A packet is truncated, of unknown type or has an inconsistent length.
    #[error("Malformed packet: {0}.")]
    MalformedPacket(
        // Use `&&str` since `&str` takes 16 bytes while `&&str` only takes 8 bytes.
        &'static &'static str,
    ),

    /// Response from the sftp-server does not fit the request it answers.
    #[error("Protocol violation: {0}.")]
    ProtocolViolation(&'static &'static str),

    /// The response id is not pending.
    #[error("The response id {response_id} is invalid.")]
    InvalidResponseId {
        /// The invalid response id
        response_id: u32,
    },

    /// Sftp protocol can only send and receive at most [`u32::MAX`] data in one request.
    #[error("Sftp protocol can only send and receive at most u32::MAX data in one request.")]
    BufferTooLong(#[from] TryFromIntError),

    /// Handle returned by server is longer than the limit 256 bytes specified in sftp v3.
    #[error("Handle returned by server is longer than the limit 256 bytes specified in sftp v3")]
    HandleTooLong,

    /// The handle has been closed, either explicitly or because the session ended.
    #[error("The handle is closed")]
    InvalidHandle,

    /// The session is not connected, or has been closed.
    #[error("Not connected")]
    NotConnected,

    /// No response arrived within the request timeout.
    #[error("Request timed out")]
    Timeout,

    /// A transfer gave up; the destination holds every byte before `offset`.
    #[error("Transfer failed at offset {offset}: {source}")]
    TransferFailed {
        /// The watermark reached, from which the transfer can be resumed.
        offset: u64,
        /// The error of the chunk that exhausted its retries.
        #[source]
        source: Box<Error>,
    },

    /// Every request id is taken by a pending request.
    #[error("Request id space exhausted")]
    ResourceExhausted,

    /// Sftp server error
    #[error("Sftp server reported error kind {0}, msg: {1}")]
    SftpError(SftpErrorKind, SftpErrMsg),

    /// The session was torn down while the request was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Content is not valid UTF-8.
    #[error("Content is not valid utf-8: {0}")]
    InvalidEncoding(#[from] FromUtf8Error),

    /// Raised 2 errors when cleaning up.
    #[error(transparent)]
    RecursiveErrors(Box<RecursiveError>),

    /// tokio join error
    #[error("Failed to join tokio task")]
    TaskJoinError(#[from] tokio::task::JoinError),

    /// The `sftp` subsystem exited with failure.
    #[cfg(feature = "openssh")]
    #[error("sftp-server run on remote server failed: {0}.")]
    SftpServerFailure(std::process::ExitStatus),

    #[cfg(feature = "openssh")]
    #[error("Failed to create sftp from session: {0}")]
    RemoteChildSpawnError(#[from] openssh::Error),
}

#[derive(Debug, ThisError)]
#[error("OriginalError: {original_error}, curr err raised when cleaning up: {occuring_error}.")]
pub struct RecursiveError {
    /// Original error
    pub original_error: Error,

    /// Current error raised when performing cleanup
    /// for original error.
    #[source]
    pub occuring_error: Error,
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;

        match self {
            MalformedPacket(_) | BufferTooLong(_) | HandleTooLong => ErrorKind::MalformedPacket,
            ProtocolViolation(_) | InvalidResponseId { .. } | SftpServerHelloMsgTooLong { .. } => {
                ErrorKind::ProtocolViolation
            }
            IOError(_) => ErrorKind::TransportError,
            LocalIo { .. } => ErrorKind::LocalIoError,
            InvalidHandle => ErrorKind::InvalidHandle,
            NotConnected => ErrorKind::NotConnected,
            Timeout => ErrorKind::Timeout,
            TransferFailed { .. } => ErrorKind::TransferFailed,
            ResourceExhausted => ErrorKind::ResourceExhausted,
            SftpError(..) => ErrorKind::RemoteOperationError,
            ConnectionClosed | BackgroundTaskFailure(_) => ErrorKind::ConnectionClosed,
            UnsupportedSftpProtocol { .. } | UnsupportedExtension(_) => ErrorKind::Unsupported,
            InvalidEncoding(_) => ErrorKind::InvalidEncoding,
            RecursiveErrors(err) => err.original_error.kind(),
            TaskJoinError(_) => ErrorKind::Other,
            #[cfg(feature = "openssh")]
            SftpServerFailure(_) | RemoteChildSpawnError(_) => ErrorKind::TransportError,
        }
    }

    /// Return true if the session cannot survive this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MalformedPacket | ErrorKind::ProtocolViolation | ErrorKind::TransportError
        )
    }

    /// Return true if repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SftpError(..) | Error::Timeout)
    }

    /// Return the status code if this is an error reported by the server.
    pub fn sftp_error_kind(&self) -> Option<SftpErrorKind> {
        match self {
            Error::SftpError(kind, _) => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let remote = Error::SftpError(SftpErrorKind::NoSuchFile, SftpErrMsg::default());
        assert_eq!(remote.kind(), ErrorKind::RemoteOperationError);
        assert!(remote.is_retryable());
        assert!(!remote.is_fatal());

        assert!(Error::MalformedPacket(&"truncated").is_fatal());
        assert!(Error::InvalidResponseId { response_id: 7 }.is_fatal());
        assert!(Error::IOError(io::ErrorKind::BrokenPipe.into()).is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::ConnectionClosed.is_retryable());

        let failed = Error::TransferFailed {
            offset: 64,
            source: Box::new(Error::Timeout),
        };
        assert_eq!(failed.kind(), ErrorKind::TransferFailed);
    }

    #[test]
    fn sftp_error_kind_display() {
        assert_eq!(SftpErrorKind::NoSuchFile.to_string(), "NoSuchFile");
        assert_eq!(SftpErrorKind::Unknown(42).to_string(), "Unknown(42)");
    }
}
