use super::lowlevel::{Extensions, Outgoing};
use super::{Error, ReadEnd, SharedData};

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::pin;
use tokio::sync::oneshot;
use tokio::task::{spawn, JoinHandle};

/// Tear the session down after a background task failed.
fn on_task_failure(shared_data: &SharedData, task: &str, err: &Error) {
    tracing::error!(task, error = %err, "sftp background task failed");

    shared_data.close_pending_requests();
    shared_data.get_auxiliary().fault();
}

pub(super) fn create_flush_task<W: AsyncWrite + Send + 'static>(
    writer: W,
    mut outgoing: Outgoing,
    shared_data: SharedData,
) -> JoinHandle<Result<(), Error>> {
    spawn(async move {
        pin!(writer);

        let auxiliary = shared_data.get_auxiliary();
        let shutdown_token = &auxiliary.shutdown_token;

        let res: Result<(), Error> = async {
            loop {
                tokio::select! {
                    biased;

                    bytes = outgoing.recv() => match bytes {
                        Some(first) => {
                            let n = outgoing.write_batch(&mut writer, first).await?;
                            tracing::trace!(bytes = n, "flushed requests");
                        }
                        None => break,
                    },
                    _ = shutdown_token.cancelled() => break,
                }
            }

            // Whatever was queued before the shutdown, including
            // fire-and-forget close requests, is still written.
            outgoing.close();
            if let Some(first) = outgoing.try_recv() {
                outgoing.write_batch(&mut writer, first).await?;
            }

            writer.shutdown().await?;

            Ok(())
        }
        .await;

        if let Err(err) = &res {
            on_task_failure(&shared_data, "flush", err);
        }

        res
    })
}

pub(super) fn create_read_task<R: AsyncRead + Send + 'static>(
    read_end: ReadEnd<R>,
) -> (oneshot::Receiver<Extensions>, JoinHandle<Result<(), Error>>) {
    let (tx, rx) = oneshot::channel();

    let handle = spawn(async move {
        let shared_data = read_end.get_shared_data().clone();
        let auxiliary = shared_data.get_auxiliary();
        let shutdown_token = &auxiliary.shutdown_token;

        pin!(read_end);

        let res: Result<(), Error> = async {
            // Receive version and extensions
            let extensions = read_end.as_mut().receive_server_hello_pinned().await?;
            tracing::debug!(?extensions, "sftp v3 negotiated");

            // `Sftp::new` might have been cancelled, in which case nobody
            // waits for the extensions.
            let _ = tx.send(extensions);

            loop {
                let ready = tokio::select! {
                    biased;

                    _ = shutdown_token.cancelled() => break Ok(()),
                    ready = read_end.as_mut().ready_for_read_pinned() => ready,
                };

                match ready {
                    Ok(()) => read_end.as_mut().read_in_one_packet_pinned().await?,
                    Err(err)
                        if err.kind() == io::ErrorKind::UnexpectedEof
                            && shutdown_token.is_cancelled() =>
                    {
                        break Ok(())
                    }
                    Err(err) => break Err(err.into()),
                }
            }
        }
        .await;

        match &res {
            Err(err) => on_task_failure(&shared_data, "read", err),
            // Responses to requests sent after the shutdown, such as
            // fire-and-forget closes, are never read.
            Ok(()) => shared_data.close_pending_requests(),
        }

        res
    });

    (rx, handle)
}
