use super::{
    handle::HandleKind,
    lowlevel::{Data, FileAttrs, OpenFlags},
    metadata::{MetaData, MetaDataBuilder, Permissions},
    Error, OwnedHandle, Session,
};

use std::{cmp::min, path::Path};

use bytes::Bytes;
use futures_util::future::try_join_all;

/// How [`OpenOptions::open`] opens a remote file.
///
/// Every flag is off by default, see [`crate::Sftp::open`] and
/// [`crate::Sftp::create`] for the common combinations.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    session: Session,
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
}

impl OpenOptions {
    pub(super) fn new(session: Session) -> Self {
        Self {
            session,
            read: false,
            write: false,
            append: false,
            truncate: false,
            create: false,
            create_new: false,
        }
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    /// Writes land at the offset given to [`File::write_at`] and leave the
    /// rest of the file intact.
    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// Let the server place every write at the end of the file, implies
    /// [`OpenOptions::write`].
    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    /// Empty an existing file, only honored together with
    /// [`OpenOptions::create`].
    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    /// Create the file if it is missing.
    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Create the file and fail if it exists, overriding
    /// [`OpenOptions::create`] and [`OpenOptions::truncate`].
    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    fn flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::empty();

        flags.set(OpenFlags::READ, self.read);
        flags.set(OpenFlags::WRITE, self.write || self.append);
        flags.set(OpenFlags::APPEND, self.append);

        if self.create_new {
            flags |= OpenFlags::CREATE | OpenFlags::EXCL;
        } else if self.create {
            flags |= OpenFlags::CREATE;
            flags.set(OpenFlags::TRUNC, self.truncate);
        }

        flags
    }

    /// # Cancel Safety
    ///
    /// This function is cancel safe.
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<File, Error> {
        async fn inner(this: &OpenOptions, path: &Path) -> Result<File, Error> {
            let flags = this.flags();

            let handle = this
                .session
                .send_request(|write_end| {
                    Ok(write_end
                        .send_open_file_request(path, flags, FileAttrs::new())?
                        .wait())
                })
                .await?;

            Ok(File {
                inner: OwnedHandle::new(
                    this.session.clone(),
                    handle,
                    HandleKind::File,
                    path.to_owned(),
                ),
            })
        }

        inner(self, path.as_ref()).await
    }
}

/// A reference to the remote file.
///
/// Cloning [`File`] instance would return a new one that shares the same
/// underlying file handle. Every operation takes an offset, so clones can
/// read and write concurrently.
///
/// Dropping the last clone closes the handle in the background.
#[derive(Debug, Clone)]
pub struct File {
    inner: OwnedHandle,
}

impl File {
    /// The maximum amount of bytes that can be read in one request.
    pub fn max_read_len(&self) -> Result<u32, Error> {
        self.inner.session().limits().map(|limits| limits.read_len)
    }

    /// The maximum amount of bytes that can be written in one request.
    pub fn max_write_len(&self) -> Result<u32, Error> {
        self.inner.session().limits().map(|limits| limits.write_len)
    }

    /// Return the remote path the file was opened with.
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Close the [`File`] after every operation in flight finished.
    ///
    /// Operations through other clones fail with [`Error::InvalidHandle`]
    /// afterwards.
    ///
    /// # Cancel Safety
    ///
    /// This function is cancel safe.
    pub async fn close(self) -> Result<(), Error> {
        self.inner.close().await
    }

    /// Apply the attributes set in `metadata`.
    pub async fn set_metadata(&self, metadata: MetaData) -> Result<(), Error> {
        let attrs = metadata.into_inner();

        self.inner
            .send_request(|write_end, handle| {
                Ok(write_end.send_fsetstat_request(handle, attrs)?.wait())
            })
            .await
    }

    /// Truncate or zero-extend the file to `size` bytes.
    pub async fn set_len(&self, size: u64) -> Result<(), Error> {
        self.set_metadata(MetaDataBuilder::new().len(size).create())
            .await
    }

    pub async fn set_permissions(&self, perm: Permissions) -> Result<(), Error> {
        self.set_metadata(MetaDataBuilder::new().permissions(perm).create())
            .await
    }

    /// Ask the server to flush the file to disk.
    ///
    /// # Precondition
    ///
    /// Requires extension `fsync@openssh.com`, otherwise it fails with
    /// [`Error::UnsupportedExtension`].
    ///
    /// # Cancel Safety
    ///
    /// This function is cancel safe.
    pub async fn sync_all(&self) -> Result<(), Error> {
        if !self.inner.session().extensions()?.fsync {
            return Err(Error::UnsupportedExtension(&"fsync"));
        }

        self.inner
            .send_request(|write_end, handle| Ok(write_end.send_fsync_request(&handle)?.wait()))
            .await
    }

    pub async fn metadata(&self) -> Result<MetaData, Error> {
        self.inner
            .send_request(|write_end, handle| Ok(write_end.send_fstat_request(handle)?.wait()))
            .await
            .map(MetaData::new)
    }

    /// Read at most `len` bytes at `offset`.
    ///
    /// `len` is clamped to [`File::max_read_len`] and the server may return
    /// less than requested. Return `None` at EOF or if `len == 0`.
    ///
    /// # Cancel Safety
    ///
    /// This function is cancel safe.
    pub async fn read_at(&self, offset: u64, len: u32) -> Result<Option<Bytes>, Error> {
        if len == 0 {
            return Ok(None);
        }

        let len = min(len, self.max_read_len()?);

        let data = self
            .inner
            .send_request(|write_end, handle| {
                Ok(write_end.send_read_request(handle, offset, len)?.wait_data())
            })
            .await?;

        Ok(match data {
            Data::Buffer(buffer) if !buffer.is_empty() => Some(buffer),
            Data::Buffer(_) | Data::Eof => None,
        })
    }

    /// Write the whole of `data` at `offset`.
    ///
    /// `data` longer than [`File::max_write_len`] is split into several
    /// requests that are all in flight at once.
    ///
    /// # Cancel Safety
    ///
    /// This function is cancel safe, though part of `data` may have been
    /// written when it is cancelled.
    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let max_write_len = self.max_write_len()? as usize;

        let writes = (0..data.len()).step_by(max_write_len).map(|start| {
            let end = min(start + max_write_len, data.len());
            let chunk = data.slice(start..end);

            self.inner.send_request(move |write_end, handle| {
                Ok(write_end
                    .send_write_request(handle, offset + start as u64, chunk)?
                    .wait())
            })
        });

        try_join_all(writes).await?;

        Ok(())
    }
}
