//! This crate provides the wire codec of sftp v3 and a request correlator
//! on top of an async byte stream.
//!
//! It supports sending multiple requests concurrently using [`WriteEnd`]
//! (it can be [`WriteEnd::clone`]d), however receiving responses have to be done
//! sequentially using [`ReadEnd::read_in_one_packet`].
//!
//! Encoded requests are put on a queue instead of being written directly;
//! drain the [`Outgoing`] half returned by [`connect`] into the writer of
//! the transport.
//!
//! This crate supports all operations of sftp v3, in addition to the
//! following extensions:
//!  - [`WriteEnd::send_limits_request`]
//!  - [`WriteEnd::send_fsync_request`]
//!  - [`WriteEnd::send_hardlink_request`]
//!  - [`WriteEnd::send_posix_rename_request`]

#![forbid(unsafe_code)]

pub use sftp_engine_error::{Error, ErrorKind, SftpErrMsg, SftpErrorKind};

/// Default size of buffer for up/download in openssh-portable
pub const OPENSSH_PORTABLE_DEFAULT_COPY_BUFLEN: usize = 32768;

/// Maximum depth to descend in directory trees in openssh-portable
pub const OPENSSH_PORTABLE_MAX_DIR_DEPTH: usize = 64;

pub mod constants;

mod wire;
pub use wire::{Decode, Encode, MAX_HANDLE_LEN, MAX_HELLO_LEN, MAX_PACKET_LEN};

mod file_attrs;
pub use file_attrs::{FileAttrs, FileType, Permissions, UnixTimeStamp};

mod handle;
pub use handle::Handle;

mod request;
pub use request::{
    decode_handle, decode_two_paths, Hello, OpenFlags, Request, RequestInner, RequestKind,
};

mod response;
pub use response::{
    Extensions, Limits, NameEntry, Response, ResponseInner, ServerVersion, StatusCode,
};

mod awaitable_responses;

mod awaitables;
pub use awaitables::{
    AwaitableAttrs, AwaitableData, AwaitableHandle, AwaitableLimits, AwaitableName,
    AwaitableNameEntries, AwaitableStatus, Data,
};

mod queue;
pub use queue::Outgoing;

mod connection;
pub use connection::{connect, connect_with_auxiliary, ConnectionOptions, SharedData};

mod read_end;
pub use read_end::ReadEnd;

mod write_end;
pub use write_end::{bytes_to_path, path_to_bytes, WriteEnd};

use constants::SSH2_FILEXFER_VERSION;
