#![forbid(unsafe_code)]

use super::connection::SharedData;
use super::*;

use std::convert::TryFrom;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use bytes::Bytes;

/// Convert a path into the bytes sent on the wire.
#[cfg(unix)]
pub fn path_to_bytes(path: &Path) -> Bytes {
    use std::os::unix::ffi::OsStrExt;

    Bytes::copy_from_slice(path.as_os_str().as_bytes())
}

/// Convert a path into the bytes sent on the wire.
#[cfg(not(unix))]
pub fn path_to_bytes(path: &Path) -> Bytes {
    Bytes::from(path.to_string_lossy().into_owned())
}

/// Convert bytes received on the wire into a path.
#[cfg(unix)]
pub fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    PathBuf::from(OsStr::from_bytes(bytes))
}

/// Convert bytes received on the wire into a path.
#[cfg(not(unix))]
pub fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Sends requests, it can be cloned freely and used from many tasks at
/// once.
#[derive(Debug)]
pub struct WriteEnd<Auxiliary = ()> {
    shared_data: SharedData<Auxiliary>,
}

impl<Auxiliary> Clone for WriteEnd<Auxiliary> {
    fn clone(&self) -> Self {
        Self::new(self.shared_data.clone())
    }
}

impl<Auxiliary> WriteEnd<Auxiliary> {
    /// Create a [`WriteEnd`] from [`SharedData`].
    pub fn new(shared_data: SharedData<Auxiliary>) -> Self {
        Self { shared_data }
    }

    /// Consume the [`WriteEnd`] and return the stored [`SharedData`].
    pub fn into_shared_data(self) -> SharedData<Auxiliary> {
        self.shared_data
    }
}

impl<Auxiliary> Deref for WriteEnd<Auxiliary> {
    type Target = SharedData<Auxiliary>;

    fn deref(&self) -> &Self::Target {
        &self.shared_data
    }
}

macro_rules! send {
    ($self:ident, $awaitable:ident, $request:expr) => {{
        let shared_data = &$self.shared_data;
        let (ticket, receiver) = shared_data.send_request($request)?;
        Ok($awaitable::new(
            ticket,
            receiver,
            shared_data.responses().clone(),
            shared_data.request_timeout(),
        ))
    }};
}

impl<Auxiliary> WriteEnd<Auxiliary> {
    pub(crate) fn send_hello(&self, version: u32) -> Result<(), Error> {
        self.shared_data.push(
            Hello {
                version,
                extensions: Vec::new(),
            }
            .encode(),
        )
    }

    pub fn send_open_file_request(
        &self,
        filename: &Path,
        flags: OpenFlags,
        attrs: FileAttrs,
    ) -> Result<AwaitableHandle, Error> {
        send!(
            self,
            AwaitableHandle,
            RequestInner::Open {
                filename: path_to_bytes(filename),
                flags,
                attrs,
            }
        )
    }

    pub fn send_close_request(&self, handle: Handle) -> Result<AwaitableStatus, Error> {
        send!(self, AwaitableStatus, RequestInner::Close(handle))
    }

    /// Use [`AwaitableData::wait_data`] to have EOF reported as
    /// [`Data::Eof`].
    ///
    /// The server may return less than `len` bytes.
    pub fn send_read_request(
        &self,
        handle: Handle,
        offset: u64,
        len: u32,
    ) -> Result<AwaitableData, Error> {
        send!(
            self,
            AwaitableData,
            RequestInner::Read {
                handle,
                offset,
                len
            }
        )
    }

    /// Fails with [`Error::BufferTooLong`] if `data` is longer than
    /// [`u32::MAX`].
    pub fn send_write_request(
        &self,
        handle: Handle,
        offset: u64,
        data: Bytes,
    ) -> Result<AwaitableStatus, Error> {
        u32::try_from(data.len())?;

        send!(
            self,
            AwaitableStatus,
            RequestInner::Write {
                handle,
                offset,
                data
            }
        )
    }

    pub fn send_remove_request(&self, path: &Path) -> Result<AwaitableStatus, Error> {
        send!(self, AwaitableStatus, RequestInner::Remove(path_to_bytes(path)))
    }

    pub fn send_rename_request(
        &self,
        oldpath: &Path,
        newpath: &Path,
    ) -> Result<AwaitableStatus, Error> {
        send!(
            self,
            AwaitableStatus,
            RequestInner::Rename {
                oldpath: path_to_bytes(oldpath),
                newpath: path_to_bytes(newpath),
            }
        )
    }

    /// * `attrs` - [`FileAttrs::get_size`] must be equal to `None`.
    pub fn send_mkdir_request(
        &self,
        path: &Path,
        attrs: FileAttrs,
    ) -> Result<AwaitableStatus, Error> {
        send!(
            self,
            AwaitableStatus,
            RequestInner::Mkdir {
                path: path_to_bytes(path),
                attrs,
            }
        )
    }

    pub fn send_rmdir_request(&self, path: &Path) -> Result<AwaitableStatus, Error> {
        send!(self, AwaitableStatus, RequestInner::Rmdir(path_to_bytes(path)))
    }

    pub fn send_opendir_request(&self, path: &Path) -> Result<AwaitableHandle, Error> {
        send!(self, AwaitableHandle, RequestInner::Opendir(path_to_bytes(path)))
    }

    /// Return a batch of entries in the directory specified by the
    /// `handle`, `.` and `..` included.
    ///
    /// The `filename` only contains the basename.
    ///
    /// Use [`AwaitableNameEntries::wait_entries`] to have EOF reported as
    /// an empty batch.
    pub fn send_readdir_request(&self, handle: Handle) -> Result<AwaitableNameEntries, Error> {
        send!(self, AwaitableNameEntries, RequestInner::Readdir(handle))
    }

    pub fn send_stat_request(&self, path: &Path) -> Result<AwaitableAttrs, Error> {
        send!(self, AwaitableAttrs, RequestInner::Stat(path_to_bytes(path)))
    }

    /// Does not follow symlink
    pub fn send_lstat_request(&self, path: &Path) -> Result<AwaitableAttrs, Error> {
        send!(self, AwaitableAttrs, RequestInner::Lstat(path_to_bytes(path)))
    }

    pub fn send_fstat_request(&self, handle: Handle) -> Result<AwaitableAttrs, Error> {
        send!(self, AwaitableAttrs, RequestInner::Fstat(handle))
    }

    pub fn send_setstat_request(
        &self,
        path: &Path,
        attrs: FileAttrs,
    ) -> Result<AwaitableStatus, Error> {
        send!(
            self,
            AwaitableStatus,
            RequestInner::Setstat {
                path: path_to_bytes(path),
                attrs,
            }
        )
    }

    /// * `handle` - Must be opened with write access.
    pub fn send_fsetstat_request(
        &self,
        handle: Handle,
        attrs: FileAttrs,
    ) -> Result<AwaitableStatus, Error> {
        send!(
            self,
            AwaitableStatus,
            RequestInner::Fsetstat { handle, attrs }
        )
    }

    pub fn send_readlink_request(&self, path: &Path) -> Result<AwaitableName, Error> {
        send!(self, AwaitableName, RequestInner::Readlink(path_to_bytes(path)))
    }

    pub fn send_realpath_request(&self, path: &Path) -> Result<AwaitableName, Error> {
        send!(self, AwaitableName, RequestInner::Realpath(path_to_bytes(path)))
    }

    /// Create symlink `linkpath` pointing at `targetpath`.
    pub fn send_symlink_request(
        &self,
        targetpath: &Path,
        linkpath: &Path,
    ) -> Result<AwaitableStatus, Error> {
        send!(
            self,
            AwaitableStatus,
            RequestInner::Symlink {
                linkpath: path_to_bytes(linkpath),
                targetpath: path_to_bytes(targetpath),
            }
        )
    }

    /// Return limits of the server
    ///
    /// # Precondition
    ///
    /// Requires [`Extensions::limits`] to be true.
    pub fn send_limits_request(&self) -> Result<AwaitableLimits, Error> {
        send!(self, AwaitableLimits, RequestInner::limits())
    }

    /// # Precondition
    ///
    /// Requires [`Extensions::fsync`] to be true.
    pub fn send_fsync_request(&self, handle: &Handle) -> Result<AwaitableStatus, Error> {
        send!(self, AwaitableStatus, RequestInner::fsync(handle))
    }

    /// # Precondition
    ///
    /// Requires [`Extensions::hardlink`] to be true.
    pub fn send_hardlink_request(
        &self,
        oldpath: &Path,
        newpath: &Path,
    ) -> Result<AwaitableStatus, Error> {
        send!(
            self,
            AwaitableStatus,
            RequestInner::hardlink(path_to_bytes(oldpath), path_to_bytes(newpath))
        )
    }

    /// Unlike [`WriteEnd::send_rename_request`], this replaces `newpath`
    /// if it exists.
    ///
    /// # Precondition
    ///
    /// Requires [`Extensions::posix_rename`] to be true.
    pub fn send_posix_rename_request(
        &self,
        oldpath: &Path,
        newpath: &Path,
    ) -> Result<AwaitableStatus, Error> {
        send!(
            self,
            AwaitableStatus,
            RequestInner::posix_rename(path_to_bytes(oldpath), path_to_bytes(newpath))
        )
    }
}
