use super::{
    auxiliary::{self, Auxiliary, SessionState},
    file::{File, OpenOptions},
    fs::Fs,
    lowlevel::{self, connect_with_auxiliary, Extensions},
    tasks::{create_flush_task, create_read_task},
    transfer::{self, DirTransferReport, TransferReport, TransferRequest},
    utils::{chain_cleanup, ResultExt},
    Error, Session, SftpOptions, WriteEnd,
};

use std::cmp::min;
use std::path::Path;

use derive_destructure2::destructure;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot::Receiver;
use tokio::task::JoinHandle;

/// A file-oriented channel to a remote host.
///
/// Every method takes `&self`, so a single [`Sftp`] can serve any number
/// of concurrent callers.
#[derive(Debug, destructure)]
pub struct Sftp {
    session: Session,
    flush_task: JoinHandle<Result<(), Error>>,
    read_task: JoinHandle<Result<(), Error>>,
}

impl Sftp {
    /// Create [`Sftp`] over an authenticated byte stream whose other end
    /// runs the `sftp` subsystem.
    ///
    /// Returns once the version negotiation, and the limits query if the
    /// server supports it, are done.
    pub async fn new<W, R>(writer: W, reader: R, options: SftpOptions) -> Result<Self, Error>
    where
        W: AsyncWrite + Send + 'static,
        R: AsyncRead + Send + 'static,
    {
        let (write_end, read_end, outgoing) = connect_with_auxiliary(
            reader,
            options.connection_options(),
            Auxiliary::new(options),
        )?;

        let (rx, read_task) = create_read_task(read_end);
        let flush_task = create_flush_task(writer, outgoing, (*write_end).clone());

        Self::init(flush_task, read_task, write_end, rx).await
    }

    async fn init(
        flush_task: JoinHandle<Result<(), Error>>,
        read_task: JoinHandle<Result<(), Error>>,
        write_end: WriteEnd,
        rx: Receiver<Extensions>,
    ) -> Result<Self, Error> {
        // Dropping `sftp` stops both tasks, should this future be cancelled.
        let sftp = Self {
            session: Session::new(write_end),
            flush_task,
            read_task,
        };

        let extensions = match rx.await {
            Ok(extensions) => extensions,
            // The read task exited before the hello, its error explains why.
            Err(_) => return Err(sftp.close_for_error(&"read").await),
        };

        match sftp.set_limits(extensions).await {
            Ok(()) => (),
            Err(Error::ConnectionClosed) => return Err(sftp.close_for_error(&"read").await),
            Err(err) => return Err(err),
        }

        let auxiliary = sftp.auxiliary();
        // The read task may have faulted the session since the limits reply.
        if !auxiliary.transition(SessionState::Connecting, SessionState::Ready) {
            return Err(sftp.close_for_error(&"read").await);
        }

        tracing::debug!(?extensions, limits = ?auxiliary.limits(), "sftp session ready");

        Ok(sftp)
    }

    /// Close a session that failed to initialize, returning the error of
    /// the background task that failed.
    async fn close_for_error(self, task: &'static &'static str) -> Error {
        match self.close().await {
            Err(err) => err,
            Ok(()) => Error::BackgroundTaskFailure(task),
        }
    }

    async fn set_limits(&self, extensions: Extensions) -> Result<(), Error> {
        let options = self.auxiliary().options;

        let default_len = lowlevel::OPENSSH_PORTABLE_DEFAULT_COPY_BUFLEN as u64;

        // Each read/write request also carries a header and a handle, which
        // is at most 256 bytes long.
        let max_len = u64::from(lowlevel::MAX_PACKET_LEN - 1024);

        let (read_len, write_len) = if extensions.limits {
            let limits = self
                .session
                .cancel_if_task_failed(self.session.send_limits_request()?.wait())
                .await?;

            tracing::debug!(?limits, "server limits");

            let or_default = |len| if len == 0 { default_len } else { len };

            (or_default(limits.read_len), or_default(limits.write_len))
        } else {
            (default_len, default_len)
        };

        let clamp = |len: u64, max: Option<u32>| {
            let len = min(len, max_len) as u32;
            max.map_or(len, |max| min(max, len))
        };

        let limits = auxiliary::Limits {
            read_len: clamp(read_len, options.get_max_read_len()),
            write_len: clamp(write_len, options.get_max_write_len()),
        };

        // `set_limits` runs once, before the session becomes `Ready`.
        let _ = self
            .auxiliary()
            .conn_info
            .set(auxiliary::ConnInfo { limits, extensions });

        Ok(())
    }

    /// Close sftp connection.
    ///
    /// Requests in flight are given up to the request timeout to be
    /// answered, then every open handle is invalidated and the background
    /// tasks are stopped.
    pub async fn close(self) -> Result<(), Error> {
        let (session, flush_task, read_task) = self.destructure();
        let auxiliary = session.auxiliary();

        auxiliary.transition(SessionState::Ready, SessionState::Closing);

        let drained = session.wait_for_pending_requests();
        match auxiliary.options.get_request_timeout() {
            Some(timeout) => {
                if tokio::time::timeout(timeout, drained).await.is_err() {
                    tracing::warn!(
                        pending = session.pending_requests(),
                        "closing with requests still pending"
                    );
                }
            }
            None => drained.await,
        }

        auxiliary.handles.invalidate_all();
        auxiliary.order_shutdown();

        // read_task stops on shutdown, flush_task writes out whatever is
        // still queued first.
        let res = read_task.await.flatten();
        let res = chain_cleanup(res, flush_task.await.flatten());

        auxiliary.mark_disconnected();

        tracing::debug!("sftp session closed");

        res
    }

    /// Return the state of the session.
    pub fn state(&self) -> SessionState {
        self.auxiliary().state()
    }

    /// Return the extensions the server advertised.
    pub fn extensions(&self) -> Extensions {
        // `Sftp` is only returned once `conn_info` is set.
        self.session.extensions().unwrap_or_default()
    }

    /// Return the number of file and directory handles currently open.
    pub fn open_handles(&self) -> usize {
        self.auxiliary().handles.len()
    }

    pub fn options(&self) -> OpenOptions {
        OpenOptions::new(self.session.clone())
    }

    /// Open `path` for writing, creating it if missing and emptying it
    /// otherwise.
    pub async fn create(&self, path: impl AsRef<Path>) -> Result<File, Error> {
        self.options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
    }

    /// Open `path` for reading.
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<File, Error> {
        self.options().read(true).open(path).await
    }

    /// Relative paths given to the returned [`Fs`] are resolved by the
    /// server, usually against the home directory of the user.
    pub fn fs(&self) -> Fs {
        Fs::new(self.session.clone(), "".into())
    }

    /// Download the remote file `request.remote()` into the local file
    /// `request.local()`.
    ///
    /// On failure the local file holds exactly the bytes before the offset
    /// reported by [`Error::TransferFailed`].
    pub async fn get(&self, request: &TransferRequest) -> Result<TransferReport, Error> {
        transfer::get_file(&self.session, request).await
    }

    /// Upload the local file `request.local()` to `request.remote()`.
    pub async fn put(&self, request: &TransferRequest) -> Result<TransferReport, Error> {
        transfer::put_file(&self.session, request).await
    }

    /// Download the remote tree `request.remote()` into `request.local()`.
    ///
    /// Only directories and regular files are copied, anything else is
    /// counted in [`DirTransferReport::skipped`].
    pub async fn get_dir(&self, request: &TransferRequest) -> Result<DirTransferReport, Error> {
        transfer::get_dir(&self.session, request).await
    }

    /// Upload the local tree `request.local()` into `request.remote()`.
    pub async fn put_dir(&self, request: &TransferRequest) -> Result<DirTransferReport, Error> {
        transfer::put_dir(&self.session, request).await
    }
}

impl Sftp {
    pub(super) fn auxiliary(&self) -> &Auxiliary {
        self.session.auxiliary()
    }
}

impl Drop for Sftp {
    fn drop(&mut self) {
        let auxiliary = self.auxiliary();

        // This will terminate read_task and flush_task.
        auxiliary.handles.invalidate_all();
        auxiliary.order_shutdown();

        auxiliary.mark_disconnected();
    }
}
