use super::{
    cancelled, Direction, LocalFile, LocalSink, TransferConfig, TransferOutcome, TransferReport,
    TransferRequest, Watermark,
};
use crate::{file::File, file::OpenOptions, utils::chain_cleanup, utils::ErrorExt, Error, Session};

use std::cmp::min;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Copy, Clone)]
struct Chunk {
    offset: u64,
    len: u32,
}

/// Read one chunk, retrying errors that may go away.
async fn read_chunk(
    file: &File,
    chunk: Chunk,
    max_retries: u8,
) -> (Chunk, Result<Option<Bytes>, Error>) {
    let mut attempt = 0;

    loop {
        match file.read_at(chunk.offset, chunk.len).await {
            Err(err) if err.is_retryable() && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(offset = chunk.offset, attempt, error = %err, "retrying chunk");
            }
            res => break (chunk, res),
        }
    }
}

/// Copy `file` into `sink`, starting at `start`.
///
/// * `size` - bounds the transfer if known, otherwise EOF does.
pub(crate) async fn download<S: LocalSink>(
    file: &File,
    sink: &mut S,
    start: u64,
    size: Option<u64>,
    config: TransferConfig,
    cancel: Option<&CancellationToken>,
) -> Result<TransferReport, Error> {
    let mut watermark = Watermark::new(start);
    let mut next_offset = start;
    let mut end = size;

    // Remainders of short reads, issued before any new chunk.
    let mut remainders: Vec<Chunk> = Vec::new();

    let mut failure: Option<Error> = None;
    let mut is_cancelled = false;

    let mut in_flight = FuturesUnordered::new();

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            is_cancelled = true;
            break;
        }

        while failure.is_none() && in_flight.len() < config.window {
            let chunk = if let Some(chunk) = remainders.pop() {
                chunk
            } else {
                if end.is_some_and(|end| next_offset >= end) {
                    break;
                }

                let len = match end {
                    Some(end) => min(u64::from(config.chunk_len), end - next_offset) as u32,
                    None => config.chunk_len,
                };
                let chunk = Chunk {
                    offset: next_offset,
                    len,
                };
                next_offset += u64::from(len);
                chunk
            };

            in_flight.push(read_chunk(file, chunk, config.max_retries));
        }

        let next = tokio::select! {
            biased;

            _ = cancelled(cancel) => {
                is_cancelled = true;
                break;
            }
            next = in_flight.next() => next,
        };

        let Some((chunk, res)) = next else {
            break;
        };

        match res {
            Ok(Some(data)) => {
                if let Err(err) = sink.write_at(chunk.offset, &data).await {
                    failure.get_or_insert(err);
                    continue;
                }

                let len = data.len() as u64;
                watermark.complete(chunk.offset, chunk.offset + len);
                tracing::trace!(offset = chunk.offset, len, "chunk applied");

                let remainder = Chunk {
                    offset: chunk.offset + len,
                    len: chunk.len - min(len, u64::from(chunk.len)) as u32,
                };
                if remainder.len > 0 && end.map_or(true, |end| remainder.offset < end) {
                    remainders.push(remainder);
                }
            }
            // Nothing exists at or after this offset.
            Ok(None) => end = Some(end.map_or(chunk.offset, |end| min(end, chunk.offset))),
            Err(err) => {
                tracing::debug!(offset = chunk.offset, error = %err, "chunk failed");
                failure.get_or_insert(err);
            }
        }
    }

    // Requests still in flight are abandoned, their responses are
    // discarded once they arrive.
    drop(in_flight);

    let position = watermark.get();

    // Drop whatever lies past the watermark: chunks that arrived ahead of
    // a gap, or stale bytes of a resumed destination.
    let truncated = sink.truncate(position).await;

    if let Some(err) = failure {
        let err = Error::TransferFailed {
            offset: position,
            source: Box::new(err),
        };
        return Err(match truncated {
            Ok(()) => err,
            Err(cleanup_err) => err.error_on_cleanup(cleanup_err),
        });
    }
    truncated?;

    Ok(TransferReport {
        direction: Direction::Download,
        bytes: position - start,
        watermark: position,
        outcome: if is_cancelled {
            TransferOutcome::Cancelled
        } else {
            TransferOutcome::Completed
        },
    })
}

/// Download `request.remote()` into the local file `request.local()`.
pub(crate) async fn get_file(
    session: &Session,
    request: &TransferRequest,
) -> Result<TransferReport, Error> {
    let config = TransferConfig::download(session)?;

    let file = OpenOptions::new(session.clone())
        .read(true)
        .open(request.remote())
        .await?;

    let res = async {
        let size = file.metadata().await?.len();
        let start = request.resume_from.unwrap_or(0);

        tracing::debug!(
            remote = ?request.remote(),
            local = ?request.local(),
            start,
            size,
            "download started"
        );

        let mut sink = LocalFile::create(request.local(), request.resume_from.is_none()).await?;

        download(&file, &mut sink, start, size, config, request.cancel.as_ref()).await
    }
    .await;

    if let Ok(report) = &res {
        tracing::debug!(remote = ?request.remote(), ?report, "download finished");
    }

    chain_cleanup(res, file.close().await)
}
