//! Chunked transfers between a remote file and a local file or buffer.
//!
//! A transfer keeps up to `window` chunk requests in flight, applies each
//! chunk at its own offset as soon as it arrives and tracks the watermark,
//! the end of the contiguous prefix that has been applied. A failed or
//! cancelled transfer leaves the destination truncated to the watermark,
//! so that it can be resumed with [`TransferRequest::resume_from`].

use super::{Error, Session};

use std::cmp::min;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

mod watermark;
use watermark::Watermark;

mod download;
pub(crate) use download::{download, get_file};

mod upload;
pub(crate) use upload::{put_file, upload};

mod tree;
pub(crate) use tree::{get_dir, put_dir};

/// Which way the bytes moved.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Download,
    Upload,
}

/// How a transfer that did not fail ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferOutcome {
    Completed,
    /// The destination holds exactly the bytes before the watermark.
    Cancelled,
}

/// Result of a single file transfer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub direction: Direction,
    /// Bytes moved by this call, excluding the resumed prefix.
    pub bytes: u64,
    pub watermark: u64,
    pub outcome: TransferOutcome,
}

/// Result of a directory transfer.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirTransferReport {
    pub files: u64,
    pub bytes: u64,
    /// Symlinks, special files, directories nested too deep and entries
    /// whose name is not a single path component.
    pub skipped: u64,
    pub cancelled: bool,
}

/// Source and destination of a transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    remote: PathBuf,
    local: PathBuf,
    resume_from: Option<u64>,
    cancel: Option<CancellationToken>,
}

impl TransferRequest {
    pub fn new(remote: impl Into<PathBuf>, local: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
            resume_from: None,
            cancel: None,
        }
    }

    /// Continue a transfer that stopped at `offset`, keeping the bytes of
    /// the destination before it.
    ///
    /// Ignored by directory transfers.
    #[must_use]
    pub fn resume_from(mut self, offset: u64) -> Self {
        self.resume_from = Some(offset);
        self
    }

    /// Stop issuing chunk requests once `token` is cancelled.
    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn remote(&self) -> &Path {
        &self.remote
    }

    pub fn local(&self) -> &Path {
        &self.local
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct TransferConfig {
    chunk_len: u32,
    window: usize,
    max_retries: u8,
}

impl TransferConfig {
    pub(crate) fn download(session: &Session) -> Result<Self, Error> {
        let read_len = session.limits()?.read_len;
        Ok(Self::new(session, read_len))
    }

    pub(crate) fn upload(session: &Session) -> Result<Self, Error> {
        let write_len = session.limits()?.write_len;
        Ok(Self::new(session, write_len))
    }

    fn new(session: &Session, max_len: u32) -> Self {
        let options = &session.auxiliary().options;

        Self {
            chunk_len: min(options.get_chunk_size(), max_len),
            window: options.get_window(),
            max_retries: options.get_max_retries(),
        }
    }
}

/// Wait for `cancel`, or forever if there is none.
async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Destination of a download.
pub(crate) trait LocalSink: Send {
    fn write_at(&mut self, offset: u64, data: &[u8])
        -> impl Future<Output = Result<(), Error>> + Send;

    fn truncate(&mut self, len: u64) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Source of an upload.
pub(crate) trait LocalSource: Send {
    fn len(&mut self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Read up to `len` bytes at `offset`, fewer only at EOF.
    fn read_at(&mut self, offset: u64, len: u32)
        -> impl Future<Output = Result<Bytes, Error>> + Send;
}

/// A local file used as either end of a transfer.
#[derive(Debug)]
pub(crate) struct LocalFile {
    file: fs::File,
    path: PathBuf,
}

impl LocalFile {
    fn local_err(&self) -> impl FnOnce(std::io::Error) -> Error + '_ {
        |source| Error::LocalIo {
            path: self.path.clone(),
            source,
        }
    }

    /// Open `path` for writing, creating it if needed.
    pub(crate) async fn create(path: &Path, truncate: bool) -> Result<Self, Error> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)
            .await
            .map_err(|source| Error::LocalIo {
                path: path.to_owned(),
                source,
            })?;

        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub(crate) async fn open(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)
            .await
            .map_err(|source| Error::LocalIo {
                path: path.to_owned(),
                source,
            })?;

        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }
}

impl LocalSink for LocalFile {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let res = async {
            self.file.seek(SeekFrom::Start(offset)).await?;
            self.file.write_all(data).await?;
            // Data is durably applied before it counts towards the watermark.
            self.file.flush().await
        }
        .await;

        res.map_err(self.local_err())
    }

    async fn truncate(&mut self, len: u64) -> Result<(), Error> {
        let res = async {
            self.file.flush().await?;
            self.file.set_len(len).await
        }
        .await;

        res.map_err(self.local_err())
    }
}

impl LocalSource for LocalFile {
    async fn len(&mut self) -> Result<u64, Error> {
        let res = self.file.metadata().await;
        res.map(|metadata| metadata.len()).map_err(self.local_err())
    }

    async fn read_at(&mut self, offset: u64, len: u32) -> Result<Bytes, Error> {
        let res = async {
            self.file.seek(SeekFrom::Start(offset)).await?;

            let mut buffer = BytesMut::zeroed(len as usize);
            let mut filled = 0;
            while filled < buffer.len() {
                match self.file.read(&mut buffer[filled..]).await? {
                    0 => break,
                    n => filled += n,
                }
            }
            buffer.truncate(filled);

            Ok(buffer.freeze())
        }
        .await;

        res.map_err(self.local_err())
    }
}

/// In-memory destination, used by [`crate::fs::Fs::read`].
#[derive(Debug, Default)]
pub(crate) struct MemorySink(pub(crate) Vec<u8>);

impl LocalSink for MemorySink {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let start = offset as usize;
        let end = start + data.len();

        if self.0.len() < end {
            self.0.resize(end, 0);
        }
        self.0[start..end].copy_from_slice(data);

        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> Result<(), Error> {
        self.0.resize(len as usize, 0);
        Ok(())
    }
}

/// In-memory source, used by [`crate::fs::Fs::write`].
#[derive(Debug)]
pub(crate) struct MemorySource(pub(crate) Bytes);

impl LocalSource for MemorySource {
    async fn len(&mut self) -> Result<u64, Error> {
        Ok(self.0.len() as u64)
    }

    async fn read_at(&mut self, offset: u64, len: u32) -> Result<Bytes, Error> {
        let start = min(offset as usize, self.0.len());
        let end = min(start + len as usize, self.0.len());

        Ok(self.0.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_out_of_order() {
        let mut sink = MemorySink::default();

        sink.write_at(4, b"efgh").await.unwrap();
        sink.write_at(0, b"abcd").await.unwrap();
        assert_eq!(sink.0, b"abcdefgh");

        sink.truncate(2).await.unwrap();
        assert_eq!(sink.0, b"ab");
    }

    #[tokio::test]
    async fn local_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunked");

        let mut sink = LocalFile::create(&path, true).await.unwrap();
        sink.write_at(3, b"def").await.unwrap();
        sink.write_at(0, b"abc").await.unwrap();
        sink.truncate(5).await.unwrap();
        drop(sink);

        let mut source = LocalFile::open(&path).await.unwrap();
        assert_eq!(source.len().await.unwrap(), 5);
        assert_eq!(&source.read_at(1, 16).await.unwrap()[..], b"bcde");
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = TransferReport {
            direction: Direction::Download,
            bytes: 3,
            watermark: 3,
            outcome: TransferOutcome::Completed,
        };

        assert_eq!(
            serde_json::to_value(report).unwrap(),
            serde_json::json!({
                "direction": "download",
                "bytes": 3,
                "watermark": 3,
                "outcome": "completed",
            })
        );
    }
}
