//! Pipelined sftp v3 client engine.
//!
//! [`Sftp`] drives an already authenticated byte stream: it negotiates the
//! protocol, runs a single reader task and a single writer task, and lets
//! any number of callers issue requests concurrently, each waiting only for
//! its own response.
//!
//! On top of it sit:
//!  - [`file::File`] and [`fs::Fs`], the remote filesystem API,
//!  - the transfer engine ([`Sftp::get`], [`Sftp::put`], [`Sftp::get_dir`],
//!    [`Sftp::put_dir`]), which keeps a window of chunk requests in flight
//!    and can resume from the offset a failed transfer reports,
//!  - [`facade::Client`], one call per user-level operation, with a local
//!    filesystem passthrough selected when the host is the local machine.
//!
//! All requests are encoded into complete messages before they reach the
//! writer task, so cancelling a future never leaves a partial message on
//! the wire. Cancelling does not undo a request that was already queued:
//! if you cancel a future that changes the remote filesystem in any way,
//! the change would still happen.

#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use sftp_engine_error::{Error, ErrorKind, RecursiveError, SftpErrMsg, SftpErrorKind};
pub use sftp_engine_lowlevel as lowlevel;

pub use lowlevel::{Extensions, UnixTimeStamp};
pub use tokio_util::sync::CancellationToken;

mod utils;

mod options;
pub use options::SftpOptions;

mod auxiliary;
use auxiliary::Auxiliary;
pub use auxiliary::SessionState;

mod tasks;

mod session;
use session::Session;

mod sftp;
pub use sftp::Sftp;

mod handle;
use handle::OwnedHandle;

/// Module contains types for manipulating files.
pub mod file;

/// Module contains types for manipulating directories.
pub mod fs;

/// Module contains types for manipulating metadata of files or directories.
pub mod metadata;

/// Module contains the pipelined transfer engine.
pub mod transfer;

/// Module contains the operation facade.
pub mod facade;

mod local;
pub use local::LocalFs;

#[cfg(feature = "openssh")]
mod openssh_connector;
#[cfg(feature = "openssh")]
pub use openssh_connector::OpensshConnector;

type WriteEnd = lowlevel::WriteEnd<Auxiliary>;
type ReadEnd<R> = lowlevel::ReadEnd<R, Auxiliary>;
type SharedData = lowlevel::SharedData<Auxiliary>;
