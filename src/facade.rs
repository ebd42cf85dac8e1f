//! One call per user-level operation.
//!
//! [`Client`] picks its backend when it connects: a remote [`Sftp`] session,
//! or [`LocalFs`] when the host names the local machine. Every call returns
//! an [`OpResult`] that serializes with camelCase keys; only a call made
//! without a usable session returns `Err(Error::NotConnected)`.

use super::{
    fs::DirEntry,
    metadata::{Class, MetaData, Permissions},
    transfer::{Direction, DirTransferReport, TransferReport, TransferRequest},
    Error, ErrorKind, LocalFs, SessionState, Sftp, SftpOptions,
};

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::TryStreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

/// Uniform result of a facade call.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// For errors reported by the server, the name of the status code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The message sent by the server alongside a failure status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl<T> OpResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_kind: None,
            message: None,
            detail: None,
        }
    }

    pub fn err(err: &Error) -> Self {
        let (message, detail) = match err {
            Error::SftpError(kind, msg) => (
                kind.to_string(),
                Some(msg.err_msg.to_string()).filter(|msg| !msg.is_empty()),
            ),
            err => (err.to_string(), None),
        };

        Self {
            success: false,
            data: None,
            error_kind: Some(err.kind()),
            message: Some(message),
            detail,
        }
    }

    /// Return the data of a successful call.
    pub fn into_data(self) -> Option<T> {
        self.data
    }
}

impl<T> From<Result<T, Error>> for OpResult<T> {
    fn from(res: Result<T, Error>) -> Self {
        match res {
            Ok(data) => Self::ok(data),
            Err(err) => {
                tracing::debug!(error = %err, kind = ?err.kind(), "operation failed");
                Self::err(&err)
            }
        }
    }
}

/// `rwx` triads of the permission bits.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct Rights {
    pub user: String,
    pub group: String,
    pub other: String,
}

impl Rights {
    pub fn from_mode(mode: u32) -> Self {
        let perm = Permissions::from(mode);

        Self {
            user: perm.triad(Class::Owner),
            group: perm.triad(Class::Group),
            other: perm.triad(Class::Other),
        }
    }
}

/// Milliseconds since the unix epoch.
fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

pub(crate) fn system_time_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(millis)
        .unwrap_or(0)
}

/// One entry of [`Operations::list`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    /// `d` for directories, `l` for symlinks, `-` for anything else.
    #[serde(rename = "type")]
    pub kind: char,
    pub name: String,
    pub size: u64,
    /// Milliseconds since the unix epoch.
    pub modify_time: u64,
    /// Milliseconds since the unix epoch.
    pub access_time: u64,
    pub rights: Rights,
    pub owner: u32,
    pub group: u32,
}

impl ListEntry {
    fn from_dir_entry(entry: &DirEntry) -> Self {
        let info = StatInfo::from_metadata(entry.metadata());

        Self {
            kind: info.kind(),
            name: entry.filename().to_string_lossy().into_owned(),
            size: info.size,
            modify_time: info.modify_time,
            access_time: info.access_time,
            rights: Rights::from_mode(info.mode),
            owner: info.uid,
            group: info.gid,
        }
    }
}

/// Result of [`Operations::stat`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatInfo {
    /// Permission bits, without the file type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub access_time: u64,
    pub modify_time: u64,
    pub is_directory: bool,
    pub is_file: bool,
    pub is_symbolic_link: bool,
}

impl StatInfo {
    fn from_metadata(metadata: &MetaData) -> Self {
        let file_type = metadata.file_type();
        let timestamp = |time: Option<crate::UnixTimeStamp>| {
            time.map(|time| millis(time.as_duration())).unwrap_or(0)
        };

        Self {
            mode: metadata.permissions().map_or(0, |perm| perm.mode()),
            uid: metadata.uid().unwrap_or(0),
            gid: metadata.gid().unwrap_or(0),
            size: metadata.len().unwrap_or(0),
            access_time: timestamp(metadata.accessed()),
            modify_time: timestamp(metadata.modified()),
            is_directory: file_type.is_some_and(|t| t.is_dir()),
            is_file: file_type.is_some_and(|t| t.is_file()),
            is_symbolic_link: file_type.is_some_and(|t| t.is_symlink()),
        }
    }

    pub(crate) fn kind(&self) -> char {
        if self.is_directory {
            'd'
        } else if self.is_symbolic_link {
            'l'
        } else {
            '-'
        }
    }
}

/// How [`Operations::read_file`] returns the content.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Encoding {
    Utf8,
    Binary,
}

/// Content returned by [`Operations::read_file`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    pub(crate) fn decode(content: Bytes, encoding: Encoding) -> Result<Self, Error> {
        match encoding {
            Encoding::Utf8 => Ok(Self::Text(String::from_utf8(content.into())?)),
            Encoding::Binary => Ok(Self::Binary(content.into())),
        }
    }
}

/// The operations offered by a backend of [`Client`].
pub trait Operations {
    /// Entries of the directory, without `.` and `..`.
    fn list(&self, path: &Path) -> impl Future<Output = Result<Vec<ListEntry>, Error>> + Send;

    fn stat(&self, path: &Path) -> impl Future<Output = Result<StatInfo, Error>> + Send;

    fn mkdir(&self, path: &Path, recursive: bool)
        -> impl Future<Output = Result<(), Error>> + Send;

    fn rmdir(&self, path: &Path, recursive: bool)
        -> impl Future<Output = Result<(), Error>> + Send;

    fn rename(&self, from: &Path, to: &Path) -> impl Future<Output = Result<(), Error>> + Send;

    fn delete(&self, path: &Path) -> impl Future<Output = Result<(), Error>> + Send;

    fn chmod(&self, path: &Path, mode: u32) -> impl Future<Output = Result<(), Error>> + Send;

    fn read_file(
        &self,
        path: &Path,
        encoding: Encoding,
    ) -> impl Future<Output = Result<FileContent, Error>> + Send;

    fn write_file(
        &self,
        path: &Path,
        content: Bytes,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn get(
        &self,
        request: &TransferRequest,
    ) -> impl Future<Output = Result<TransferReport, Error>> + Send;

    fn put(
        &self,
        request: &TransferRequest,
    ) -> impl Future<Output = Result<TransferReport, Error>> + Send;

    fn get_dir(
        &self,
        request: &TransferRequest,
    ) -> impl Future<Output = Result<DirTransferReport, Error>> + Send;

    fn put_dir(
        &self,
        request: &TransferRequest,
    ) -> impl Future<Output = Result<DirTransferReport, Error>> + Send;
}

impl Operations for Sftp {
    async fn list(&self, path: &Path) -> Result<Vec<ListEntry>, Error> {
        self.fs()
            .read_dir(path)
            .await?
            .map_ok(|entry| ListEntry::from_dir_entry(&entry))
            .try_collect()
            .await
    }

    async fn stat(&self, path: &Path) -> Result<StatInfo, Error> {
        self.fs()
            .metadata(path)
            .await
            .map(|metadata| StatInfo::from_metadata(&metadata))
    }

    async fn mkdir(&self, path: &Path, recursive: bool) -> Result<(), Error> {
        if recursive {
            self.fs().create_dir_all(path).await
        } else {
            self.fs().create_dir(path).await
        }
    }

    async fn rmdir(&self, path: &Path, recursive: bool) -> Result<(), Error> {
        if recursive {
            self.fs().remove_dir_all(path).await
        } else {
            self.fs().remove_dir(path).await
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        self.fs().rename(from, to).await
    }

    async fn delete(&self, path: &Path) -> Result<(), Error> {
        self.fs().remove_file(path).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), Error> {
        self.fs().set_permissions(path, mode.into()).await
    }

    async fn read_file(&self, path: &Path, encoding: Encoding) -> Result<FileContent, Error> {
        FileContent::decode(self.fs().read(path).await?, encoding)
    }

    async fn write_file(&self, path: &Path, content: Bytes) -> Result<(), Error> {
        self.fs().write(path, content).await
    }

    async fn get(&self, request: &TransferRequest) -> Result<TransferReport, Error> {
        Sftp::get(self, request).await
    }

    async fn put(&self, request: &TransferRequest) -> Result<TransferReport, Error> {
        Sftp::put(self, request).await
    }

    async fn get_dir(&self, request: &TransferRequest) -> Result<DirTransferReport, Error> {
        Sftp::get_dir(self, request).await
    }

    async fn put_dir(&self, request: &TransferRequest) -> Result<DirTransferReport, Error> {
        Sftp::put_dir(self, request).await
    }
}

/// How the user authenticates, passed as is to the [`Connector`].
#[derive(Clone, Eq, PartialEq)]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
    Agent,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(..)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            credential: Credential::Agent,
        }
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    /// Return true if the host names the local machine.
    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// Opens an authenticated channel running the `sftp` subsystem.
pub trait Connector {
    type Writer: AsyncWrite + Send + 'static;
    type Reader: AsyncRead + Send + 'static;

    fn connect(
        &self,
        params: &ConnectParams,
    ) -> impl Future<Output = Result<(Self::Writer, Self::Reader), Error>> + Send;
}

#[derive(Debug)]
enum Backend {
    Remote(Sftp),
    Local(LocalFs),
}

/// Run `$call` against whichever backend `$client` has.
macro_rules! dispatch {
    ($client:ident, |$ops:ident| $call:expr) => {
        match $client.backend()? {
            Backend::Remote($ops) => Ok(OpResult::from($call.await)),
            Backend::Local($ops) => Ok(OpResult::from($call.await)),
        }
    };
}

/// The operation facade.
#[derive(Debug)]
pub struct Client {
    backend: Option<Backend>,
}

impl Client {
    /// Connect to `params.host`, or use the local filesystem if the host
    /// names the local machine, in which case `connector` is not used.
    pub async fn connect<C: Connector>(
        params: &ConnectParams,
        connector: &C,
        options: SftpOptions,
    ) -> Result<Self, Error> {
        let backend = if params.is_local() {
            tracing::debug!(host = %params.host, "using local filesystem");
            Backend::Local(LocalFs::new())
        } else {
            tracing::debug!(host = %params.host, port = params.port, user = %params.username, "connecting");

            let (writer, reader) = connector.connect(params).await?;
            Backend::Remote(Sftp::new(writer, reader, options).await?)
        };

        Ok(Self {
            backend: Some(backend),
        })
    }

    /// Wrap an established session.
    pub fn from_sftp(sftp: Sftp) -> Self {
        Self {
            backend: Some(Backend::Remote(sftp)),
        }
    }

    /// Return true if calls go to the local filesystem.
    pub fn is_local(&self) -> bool {
        matches!(self.backend, Some(Backend::Local(_)))
    }

    /// Return the state of the session, the local filesystem is always
    /// `Ready`.
    pub fn state(&self) -> SessionState {
        match &self.backend {
            None => SessionState::Disconnected,
            Some(Backend::Remote(sftp)) => sftp.state(),
            Some(Backend::Local(_)) => SessionState::Ready,
        }
    }

    fn backend(&self) -> Result<&Backend, Error> {
        match &self.backend {
            Some(Backend::Remote(sftp)) if sftp.state() != SessionState::Ready => {
                Err(Error::NotConnected)
            }
            Some(backend) => Ok(backend),
            None => Err(Error::NotConnected),
        }
    }

    /// Close the session. Later calls fail with [`Error::NotConnected`].
    pub async fn disconnect(&mut self) -> Result<OpResult<()>, Error> {
        match self.backend.take() {
            None => Err(Error::NotConnected),
            Some(Backend::Local(_)) => Ok(OpResult::ok(())),
            Some(Backend::Remote(sftp)) => Ok(sftp.close().await.into()),
        }
    }

    pub async fn list(&self, path: impl AsRef<Path>) -> Result<OpResult<Vec<ListEntry>>, Error> {
        let path = path.as_ref();
        dispatch!(self, |ops| ops.list(path))
    }

    pub async fn stat(&self, path: impl AsRef<Path>) -> Result<OpResult<StatInfo>, Error> {
        let path = path.as_ref();
        dispatch!(self, |ops| ops.stat(path))
    }

    pub async fn mkdir(
        &self,
        path: impl AsRef<Path>,
        recursive: bool,
    ) -> Result<OpResult<()>, Error> {
        let path = path.as_ref();
        dispatch!(self, |ops| ops.mkdir(path, recursive))
    }

    pub async fn rmdir(
        &self,
        path: impl AsRef<Path>,
        recursive: bool,
    ) -> Result<OpResult<()>, Error> {
        let path = path.as_ref();
        dispatch!(self, |ops| ops.rmdir(path, recursive))
    }

    pub async fn rename(
        &self,
        from: impl AsRef<Path>,
        to: impl AsRef<Path>,
    ) -> Result<OpResult<()>, Error> {
        let (from, to) = (from.as_ref(), to.as_ref());
        dispatch!(self, |ops| ops.rename(from, to))
    }

    pub async fn delete(&self, path: impl AsRef<Path>) -> Result<OpResult<()>, Error> {
        let path = path.as_ref();
        dispatch!(self, |ops| ops.delete(path))
    }

    pub async fn chmod(&self, path: impl AsRef<Path>, mode: u32) -> Result<OpResult<()>, Error> {
        let path = path.as_ref();
        dispatch!(self, |ops| ops.chmod(path, mode))
    }

    pub async fn read_file(
        &self,
        path: impl AsRef<Path>,
        encoding: Encoding,
    ) -> Result<OpResult<FileContent>, Error> {
        let path = path.as_ref();
        dispatch!(self, |ops| ops.read_file(path, encoding))
    }

    pub async fn write_file(
        &self,
        path: impl AsRef<Path>,
        content: impl Into<Bytes>,
    ) -> Result<OpResult<()>, Error> {
        let path = path.as_ref();
        let content = content.into();
        dispatch!(self, |ops| ops.write_file(path, content.clone()))
    }

    pub async fn get(
        &self,
        remote: impl Into<PathBuf>,
        local: impl Into<PathBuf>,
    ) -> Result<OpResult<TransferReport>, Error> {
        self.transfer(&TransferRequest::new(remote, local), Direction::Download)
            .await
    }

    pub async fn put(
        &self,
        local: impl Into<PathBuf>,
        remote: impl Into<PathBuf>,
    ) -> Result<OpResult<TransferReport>, Error> {
        self.transfer(&TransferRequest::new(remote, local), Direction::Upload)
            .await
    }

    /// Run a single file transfer described by `request`, which may carry
    /// a resume offset or a cancellation token.
    pub async fn transfer(
        &self,
        request: &TransferRequest,
        direction: Direction,
    ) -> Result<OpResult<TransferReport>, Error> {
        match direction {
            Direction::Download => dispatch!(self, |ops| ops.get(request)),
            Direction::Upload => dispatch!(self, |ops| ops.put(request)),
        }
    }

    pub async fn get_dir(
        &self,
        remote: impl Into<PathBuf>,
        local: impl Into<PathBuf>,
    ) -> Result<OpResult<DirTransferReport>, Error> {
        self.transfer_dir(&TransferRequest::new(remote, local), Direction::Download)
            .await
    }

    pub async fn put_dir(
        &self,
        local: impl Into<PathBuf>,
        remote: impl Into<PathBuf>,
    ) -> Result<OpResult<DirTransferReport>, Error> {
        self.transfer_dir(&TransferRequest::new(remote, local), Direction::Upload)
            .await
    }

    /// Run a directory transfer described by `request`.
    pub async fn transfer_dir(
        &self,
        request: &TransferRequest,
        direction: Direction,
    ) -> Result<OpResult<DirTransferReport>, Error> {
        match direction {
            Direction::Download => dispatch!(self, |ops| ops.get_dir(request)),
            Direction::Upload => dispatch!(self, |ops| ops.put_dir(request)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{SftpErrMsg, SftpErrorKind};

    use pretty_assertions::assert_eq;

    #[test]
    fn rights_from_mode() {
        assert_eq!(
            Rights::from_mode(0o754),
            Rights {
                user: "rwx".into(),
                group: "r-x".into(),
                other: "r--".into(),
            }
        );
    }

    #[test]
    fn remote_error_result() {
        let err = Error::SftpError(
            SftpErrorKind::NoSuchFile,
            SftpErrMsg {
                err_msg: "No such file".into(),
                language_tag: "en".into(),
            },
        );

        assert_eq!(
            serde_json::to_value(OpResult::<()>::from(Err(err))).unwrap(),
            serde_json::json!({
                "success": false,
                "errorKind": "RemoteOperationError",
                "message": "NoSuchFile",
                "detail": "No such file",
            })
        );
    }

    #[test]
    fn utf8_decoding() {
        assert_eq!(
            FileContent::decode(Bytes::from_static(b"hi"), Encoding::Utf8).unwrap(),
            FileContent::Text("hi".into())
        );
        assert!(matches!(
            FileContent::decode(Bytes::from_static(b"\xff"), Encoding::Utf8),
            Err(Error::InvalidEncoding(_))
        ));
    }

    #[test]
    fn local_hosts() {
        assert!(ConnectParams::new("localhost", "user").is_local());
        assert!(ConnectParams::new("::1", "user").is_local());
        assert!(!ConnectParams::new("example.com", "user").is_local());
    }

    #[test]
    fn password_is_not_logged() {
        let credential = Credential::Password("hunter2".into());
        assert_eq!(format!("{credential:?}"), "Password(..)");
    }
}
