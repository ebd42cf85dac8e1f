use super::{
    facade::{ConnectParams, Connector},
    utils::ErrorExt,
    Error,
};

use std::io;
use std::sync::{Mutex, PoisonError};

use openssh::{ChildStdin, ChildStdout, Session, Stdio};
use tokio::{sync::oneshot, task::JoinHandle};

/// [`Connector`] running the `sftp` subsystem over an established
/// [`openssh::Session`].
///
/// Authentication happens when the [`openssh::Session`] is created, so
/// [`ConnectParams::credential`] is not looked at. The session can serve a
/// single connection.
#[derive(Debug)]
pub struct OpensshConnector {
    session: Mutex<Option<Session>>,
    child: Mutex<Option<JoinHandle<Option<Error>>>>,
}

impl OpensshConnector {
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            child: Mutex::new(None),
        }
    }

    /// Wait for the remote `sftp` subsystem to exit and the
    /// [`openssh::Session`] to close, returning whatever error they raised.
    ///
    /// Call it after [`crate::Sftp::close`].
    pub async fn wait(&self) -> Result<(), Error> {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match child {
            Some(child) => match child.await? {
                Some(err) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

fn missing_pipe(name: &str) -> Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("sftp subsystem has no {name}"),
    )
    .into()
}

impl Connector for OpensshConnector {
    type Writer = ChildStdin;
    type Reader = ChildStdout;

    async fn connect(&self, params: &ConnectParams) -> Result<(ChildStdin, ChildStdout), Error> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::NotConnected)?;

        tracing::debug!(host = %params.host, "spawning sftp subsystem");

        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let res = session
                .subsystem("sftp")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .await;

            let mut child = match res {
                Ok(child) => child,
                Err(err) => {
                    let _ = tx.send(Err(err.into()));
                    return None;
                }
            };

            let pipes = match (child.stdin().take(), child.stdout().take()) {
                (Some(stdin), Some(stdout)) => Ok((stdin, stdout)),
                (None, _) => Err(missing_pipe("stdin")),
                (_, None) => Err(missing_pipe("stdout")),
            };
            let _ = tx.send(pipes);

            let original_error = match child.wait().await {
                Ok(exit_status) if exit_status.success() => None,
                Ok(exit_status) => Some(Error::SftpServerFailure(exit_status)),
                Err(err) => Some(err.into()),
            };

            let occuring_error = session.close().await.err().map(Error::from);

            let err = match (original_error, occuring_error) {
                (Some(original_error), Some(occuring_error)) => {
                    Some(original_error.error_on_cleanup(occuring_error))
                }
                (Some(err), None) | (None, Some(err)) => Some(err),
                (None, None) => None,
            };

            if let Some(err) = &err {
                tracing::error!(error = %err, "sftp subsystem failed");
            }

            err
        });

        let res = rx.await;

        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        match res {
            Ok(pipes) => pipes,
            // The task exits without sending only if it panicked.
            Err(_) => Err(match self.wait().await {
                Err(err) => err,
                Ok(()) => Error::BackgroundTaskFailure(&"openssh subsystem"),
            }),
        }
    }
}
