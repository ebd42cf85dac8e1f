use crate::{
    lowlevel::{bytes_to_path, NameEntry},
    metadata::{FileType, MetaData},
    Error, OwnedHandle,
};

use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    task::{ready, Context, Poll},
    vec::IntoIter,
};

use futures_core::stream::{FusedStream, Stream};

type ResponseFuture = Pin<Box<dyn Future<Output = Result<Vec<NameEntry>, Error>> + Send>>;

/// An open remote directory.
#[derive(Debug, Clone)]
pub struct Dir(pub(super) OwnedHandle);

impl Dir {
    /// Read dir.
    pub fn read_dir(self) -> ReadDir {
        ReadDir::new(self)
    }

    /// Close dir.
    ///
    /// # Cancel Safety
    ///
    /// This function is cancel safe.
    pub async fn close(self) -> Result<(), Error> {
        self.0.close().await
    }
}

/// One entry yielded by [`ReadDir`], never `.` or `..`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    filename: PathBuf,
    longname: Box<str>,
    metadata: MetaData,
}

impl DirEntry {
    fn new(entry: NameEntry) -> Self {
        Self {
            filename: bytes_to_path(&entry.filename),
            longname: String::from_utf8_lossy(&entry.longname).into(),
            metadata: MetaData::new(entry.attrs),
        }
    }

    /// Name of the entry, without its directory.
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Return the `ls -l` like line the server sent for the entry.
    pub fn longname(&self) -> &str {
        &self.longname
    }

    /// Attributes sent along with the name, symlinks are not followed.
    pub fn metadata(&self) -> &MetaData {
        &self.metadata
    }

    pub fn file_type(&self) -> Option<FileType> {
        self.metadata.file_type()
    }
}

/// Reads the entries in a directory, in the order the server sends
/// them, without `.` and `..`.
///
/// The directory is closed once [`ReadDir`] is dropped.
pub struct ReadDir {
    dir: Dir,

    // Invariant: entries.is_none() => future.is_none()
    future: Option<ResponseFuture>,
    entries: Option<IntoIter<NameEntry>>,
}

impl fmt::Debug for ReadDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadDir")
            .field("dir", &self.dir)
            .field("pending", &self.future.is_some())
            .field("entries", &self.entries)
            .finish()
    }
}

impl ReadDir {
    fn new(dir: Dir) -> Self {
        Self {
            dir,
            future: None,
            entries: Some(Vec::new().into_iter()),
        }
    }

    fn new_request(dir: &Dir) -> ResponseFuture {
        let handle = dir.0.clone();

        Box::pin(async move {
            handle
                .send_request(|write_end, handle| {
                    Ok(write_end.send_readdir_request(handle)?.wait_entries())
                })
                .await
        })
    }
}

fn is_dot_entry(entry: &NameEntry) -> bool {
    &entry.filename[..] == b"." || &entry.filename[..] == b".."
}

impl Stream for ReadDir {
    type Item = Result<DirEntry, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            let entries = match &mut this.entries {
                Some(entries) => entries,
                None => return Poll::Ready(None),
            };

            if let Some(entry) = entries.find(|entry| !is_dot_entry(entry)) {
                return Poll::Ready(Some(Ok(DirEntry::new(entry))));
            }

            let dir = &this.dir;
            let future = this.future.get_or_insert_with(|| Self::new_request(dir));

            let res = ready!(future.as_mut().poll(cx));
            // future is ready, reset it to None
            this.future = None;

            match res {
                Ok(batch) if batch.is_empty() => {
                    this.entries = None;
                    return Poll::Ready(None);
                }
                Ok(batch) => this.entries = Some(batch.into_iter()),
                Err(err) => {
                    this.entries = None;
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
    }
}

impl FusedStream for ReadDir {
    fn is_terminated(&self) -> bool {
        self.entries.is_none()
    }
}
