use super::{
    cancelled, Direction, LocalFile, LocalSource, TransferConfig, TransferOutcome,
    TransferReport, TransferRequest, Watermark,
};
use crate::{file::File, file::OpenOptions, utils::chain_cleanup, utils::ErrorExt, Error, Session};

use std::cmp::min;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

/// Write one chunk, retrying errors that may go away.
async fn write_chunk(
    file: &File,
    offset: u64,
    data: Bytes,
    max_retries: u8,
) -> (u64, u64, Result<(), Error>) {
    let len = data.len() as u64;
    let mut attempt = 0;

    loop {
        match file.write_at(offset, data.clone()).await {
            Err(err) if err.is_retryable() && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(offset, attempt, error = %err, "retrying chunk");
            }
            res => break (offset, len, res),
        }
    }
}

/// Copy `source` into `file`, starting at `start`.
pub(crate) async fn upload<S: LocalSource>(
    file: &File,
    source: &mut S,
    start: u64,
    config: TransferConfig,
    cancel: Option<&CancellationToken>,
) -> Result<TransferReport, Error> {
    let mut end = source.len().await?;

    let mut watermark = Watermark::new(start);
    let mut next_offset = start;

    let mut failure: Option<Error> = None;
    let mut is_cancelled = false;

    let mut in_flight = FuturesUnordered::new();

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            is_cancelled = true;
            break;
        }

        while failure.is_none() && in_flight.len() < config.window && next_offset < end {
            let len = min(u64::from(config.chunk_len), end - next_offset) as u32;

            let data = match source.read_at(next_offset, len).await {
                Ok(data) => data,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };

            if data.is_empty() {
                // The local file shrank since its length was taken.
                end = next_offset;
                break;
            }

            let offset = next_offset;
            next_offset += data.len() as u64;

            in_flight.push(write_chunk(file, offset, data, config.max_retries));
        }

        let next = tokio::select! {
            biased;

            _ = cancelled(cancel) => {
                is_cancelled = true;
                break;
            }
            next = in_flight.next() => next,
        };

        let Some((offset, len, res)) = next else {
            break;
        };

        match res {
            Ok(()) => {
                watermark.complete(offset, offset + len);
                tracing::trace!(offset, len, "chunk acknowledged");
            }
            Err(err) => {
                tracing::debug!(offset, error = %err, "chunk failed");
                failure.get_or_insert(err);
            }
        }
    }

    // Writes still in flight are abandoned, the server applies them
    // before the truncation below since it handles requests in order.
    drop(in_flight);

    let position = watermark.get();

    if let Some(err) = failure {
        let err = Error::TransferFailed {
            offset: position,
            source: Box::new(err),
        };
        return Err(match file.set_len(position).await {
            Ok(()) => err,
            Err(cleanup_err) => err.error_on_cleanup(cleanup_err),
        });
    }

    if is_cancelled || start > 0 {
        file.set_len(position).await?;
    }

    Ok(TransferReport {
        direction: Direction::Upload,
        bytes: position - start,
        watermark: position,
        outcome: if is_cancelled {
            TransferOutcome::Cancelled
        } else {
            TransferOutcome::Completed
        },
    })
}

/// Upload the local file `request.local()` to `request.remote()`.
pub(crate) async fn put_file(
    session: &Session,
    request: &TransferRequest,
) -> Result<TransferReport, Error> {
    let config = TransferConfig::upload(session)?;

    let mut source = LocalFile::open(request.local()).await?;

    let file = OpenOptions::new(session.clone())
        .write(true)
        .create(true)
        .truncate(request.resume_from.is_none())
        .open(request.remote())
        .await?;

    let start = request.resume_from.unwrap_or(0);

    tracing::debug!(
        local = ?request.local(),
        remote = ?request.remote(),
        start,
        "upload started"
    );

    let res = upload(&file, &mut source, start, config, request.cancel.as_ref()).await;

    if let Ok(report) = &res {
        tracing::debug!(remote = ?request.remote(), ?report, "upload finished");
    }

    chain_cleanup(res, file.close().await)
}
