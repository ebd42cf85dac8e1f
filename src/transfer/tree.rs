use super::{get_file, put_file, DirTransferReport, TransferOutcome, TransferReport, TransferRequest};
use crate::{
    fs::Fs, lowlevel::OPENSSH_PORTABLE_MAX_DIR_DEPTH, utils::ResultExt, Error, Session,
    SftpErrorKind,
};

use std::future::Future;
use std::path::{Component, Path, PathBuf};

use futures_util::TryStreamExt;
use tokio::task::{JoinError, JoinSet};

/// File transfers of one directory job, at most `limit` at a time.
struct Jobs {
    set: JoinSet<Result<TransferReport, Error>>,
    limit: usize,
    report: DirTransferReport,
    failure: Option<Error>,
}

impl Jobs {
    fn new(limit: usize) -> Self {
        Self {
            set: JoinSet::new(),
            limit,
            report: DirTransferReport::default(),
            failure: None,
        }
    }

    fn fail(&mut self, err: Error) {
        self.failure.get_or_insert(err);
    }

    fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    fn skip(&mut self, path: &Path, reason: &'static str) {
        tracing::debug!(?path, reason, "skipping entry");
        self.report.skipped += 1;
    }

    fn record(&mut self, res: Result<Result<TransferReport, Error>, JoinError>) {
        match res.flatten() {
            Ok(report) => {
                self.report.bytes += report.bytes;
                match report.outcome {
                    TransferOutcome::Completed => self.report.files += 1,
                    TransferOutcome::Cancelled => self.report.cancelled = true,
                }
            }
            Err(err) => self.fail(err),
        }
    }

    /// Wait for a free slot, then start `job` unless the directory job
    /// failed or was cancelled in the meantime.
    async fn spawn<F>(&mut self, request: &TransferRequest, job: F)
    where
        F: Future<Output = Result<TransferReport, Error>> + Send + 'static,
    {
        while self.set.len() >= self.limit {
            match self.set.join_next().await {
                Some(res) => self.record(res),
                None => break,
            }
        }

        if !self.should_stop(request) {
            self.set.spawn(job);
        }
    }

    /// Return `true` once no further entry should be visited.
    fn should_stop(&mut self, request: &TransferRequest) -> bool {
        if request.is_cancelled() {
            self.report.cancelled = true;
        }
        self.report.cancelled || self.is_failed()
    }

    /// Wait for the transfers in flight, then return the first failure.
    async fn finish(mut self) -> Result<DirTransferReport, Error> {
        while let Some(res) = self.set.join_next().await {
            self.record(res);
        }

        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.report),
        }
    }
}

fn local_err(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::LocalIo {
        path: path.to_owned(),
        source,
    }
}

/// Return `true` if `name` is a single normal path component, so joining
/// it onto a directory never leaves that directory.
fn is_plain_name(name: &Path) -> bool {
    let mut components = name.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn file_request(parent: &TransferRequest, remote: PathBuf, local: PathBuf) -> TransferRequest {
    TransferRequest {
        remote,
        local,
        resume_from: None,
        cancel: parent.cancel.clone(),
    }
}

/// Download the tree at `request.remote()` into `request.local()`.
pub(crate) async fn get_dir(
    session: &Session,
    request: &TransferRequest,
) -> Result<DirTransferReport, Error> {
    let fs = Fs::new(session.clone(), PathBuf::new());
    let mut jobs = Jobs::new(session.auxiliary().options.get_max_concurrent_transfers());

    let mut dirs = vec![(request.remote.clone(), request.local.clone(), 0)];

    while let Some((remote_dir, local_dir, depth)) = dirs.pop() {
        if jobs.should_stop(request) {
            break;
        }

        if let Err(err) = tokio::fs::create_dir_all(&local_dir)
            .await
            .map_err(local_err(&local_dir))
        {
            jobs.fail(err);
            break;
        }

        let entries = match fs.read_dir(&remote_dir).await {
            Ok(read_dir) => read_dir.try_collect::<Vec<_>>().await,
            Err(err) => Err(err),
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(err) => {
                jobs.fail(err);
                break;
            }
        };

        for entry in entries {
            if jobs.should_stop(request) {
                break;
            }
            if !is_plain_name(entry.filename()) {
                jobs.skip(entry.filename(), "unsafe file name");
                continue;
            }

            let remote = remote_dir.join(entry.filename());
            let local = local_dir.join(entry.filename());

            match entry.file_type() {
                Some(file_type) if file_type.is_dir() => {
                    if depth + 1 > OPENSSH_PORTABLE_MAX_DIR_DEPTH {
                        jobs.skip(&remote, "directory nested too deep");
                    } else {
                        dirs.push((remote, local, depth + 1));
                    }
                }
                Some(file_type) if file_type.is_file() => {
                    let session = session.clone();
                    let file = file_request(request, remote, local);

                    jobs.spawn(request, async move { get_file(&session, &file).await })
                        .await;
                }
                _ => jobs.skip(&remote, "not a regular file"),
            }
        }
    }

    jobs.finish().await
}

/// Create `path` unless it is already a directory.
async fn ensure_remote_dir(fs: &Fs, path: &Path) -> Result<(), Error> {
    match fs.create_dir(path).await {
        Ok(()) => Ok(()),
        Err(Error::SftpError(SftpErrorKind::Failure | SftpErrorKind::PermDenied, msg)) => {
            match fs.metadata(path).await {
                Ok(metadata) if metadata.file_type().is_some_and(|t| t.is_dir()) => Ok(()),
                _ => Err(Error::SftpError(SftpErrorKind::Failure, msg)),
            }
        }
        Err(err) => Err(err),
    }
}

/// Upload the local tree at `request.local()` into `request.remote()`.
pub(crate) async fn put_dir(
    session: &Session,
    request: &TransferRequest,
) -> Result<DirTransferReport, Error> {
    let fs = Fs::new(session.clone(), PathBuf::new());
    let mut jobs = Jobs::new(session.auxiliary().options.get_max_concurrent_transfers());

    let mut dirs = vec![(request.local.clone(), request.remote.clone(), 0)];

    while let Some((local_dir, remote_dir, depth)) = dirs.pop() {
        if jobs.should_stop(request) {
            break;
        }

        if let Err(err) = ensure_remote_dir(&fs, &remote_dir).await {
            jobs.fail(err);
            break;
        }

        let entries = match read_local_dir(&local_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                jobs.fail(err);
                break;
            }
        };

        for (name, file_type) in entries {
            if jobs.should_stop(request) {
                break;
            }
            if !is_plain_name(&name) {
                jobs.skip(&name, "unsafe file name");
                continue;
            }

            let local = local_dir.join(&name);
            let remote = remote_dir.join(&name);

            if file_type.is_dir() {
                if depth + 1 > OPENSSH_PORTABLE_MAX_DIR_DEPTH {
                    jobs.skip(&local, "directory nested too deep");
                } else {
                    dirs.push((local, remote, depth + 1));
                }
            } else if file_type.is_file() {
                let session = session.clone();
                let file = file_request(request, remote, local);

                jobs.spawn(request, async move { put_file(&session, &file).await })
                    .await;
            } else {
                jobs.skip(&local, "not a regular file");
            }
        }
    }

    jobs.finish().await
}

/// Entries of a local directory sorted by name, symlinks not followed.
async fn read_local_dir(path: &Path) -> Result<Vec<(PathBuf, std::fs::FileType)>, Error> {
    let mut read_dir = tokio::fs::read_dir(path).await.map_err(local_err(path))?;
    let mut entries = Vec::new();

    while let Some(entry) = read_dir.next_entry().await.map_err(local_err(path))? {
        let file_type = entry.file_type().await.map_err(local_err(path))?;
        entries.push((PathBuf::from(entry.file_name()), file_type));
    }

    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names() {
        assert!(is_plain_name(Path::new("file")));
        assert!(is_plain_name(Path::new(".hidden")));
        assert!(is_plain_name(Path::new("a..b")));

        assert!(!is_plain_name(Path::new("")));
        assert!(!is_plain_name(Path::new("..")));
        assert!(!is_plain_name(Path::new("../escaped")));
        assert!(!is_plain_name(Path::new("a/../../x")));
        assert!(!is_plain_name(Path::new("sub/file")));
        assert!(!is_plain_name(Path::new("/etc/x")));
        assert!(!is_plain_name(Path::new("./file")));
    }
}
