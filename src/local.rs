use super::{
    facade::{system_time_millis, Encoding, FileContent, ListEntry, Operations, Rights, StatInfo},
    lowlevel::OPENSSH_PORTABLE_MAX_DIR_DEPTH,
    transfer::{Direction, DirTransferReport, TransferOutcome, TransferReport, TransferRequest},
    Error,
};

use std::fs::Metadata;
use std::io;
use std::path::Path;

use bytes::Bytes;
use tokio::fs;

fn local_err(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::LocalIo {
        path: path.to_owned(),
        source,
    }
}

#[cfg(unix)]
fn mode_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

#[cfg(unix)]
fn owner_of(metadata: &Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;

    (metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn owner_of(_metadata: &Metadata) -> (u32, u32) {
    (0, 0)
}

fn stat_info(metadata: &Metadata) -> StatInfo {
    let (uid, gid) = owner_of(metadata);
    let file_type = metadata.file_type();

    StatInfo {
        mode: mode_of(metadata),
        uid,
        gid,
        size: metadata.len(),
        access_time: metadata.accessed().map_or(0, system_time_millis),
        modify_time: metadata.modified().map_or(0, system_time_millis),
        is_directory: file_type.is_dir(),
        is_file: file_type.is_file(),
        is_symbolic_link: file_type.is_symlink(),
    }
}

/// The local filesystem, offering the same operations as a remote session.
///
/// Used by [`crate::facade::Client`] when the host names the local machine.
/// Transfers are plain copies: resume offsets and cancellation tokens are
/// not looked at.
#[derive(Debug, Clone, Default)]
pub struct LocalFs(());

impl LocalFs {
    pub fn new() -> Self {
        Self(())
    }

    async fn copy(from: &Path, to: &Path, direction: Direction) -> Result<TransferReport, Error> {
        let bytes = fs::copy(from, to).await.map_err(local_err(from))?;

        tracing::debug!(?from, ?to, bytes, "copied file");

        Ok(TransferReport {
            direction,
            bytes,
            watermark: bytes,
            outcome: TransferOutcome::Completed,
        })
    }

    /// Copy the tree at `from` into `to`, skipping symlinks and special
    /// files.
    async fn copy_tree(from: &Path, to: &Path) -> Result<DirTransferReport, Error> {
        let mut report = DirTransferReport::default();
        let mut dirs = vec![(from.to_owned(), to.to_owned(), 0)];

        while let Some((from_dir, to_dir, depth)) = dirs.pop() {
            fs::create_dir_all(&to_dir)
                .await
                .map_err(local_err(&to_dir))?;

            let mut read_dir = fs::read_dir(&from_dir)
                .await
                .map_err(local_err(&from_dir))?;

            while let Some(entry) = read_dir.next_entry().await.map_err(local_err(&from_dir))? {
                let from = entry.path();
                let to = to_dir.join(entry.file_name());
                let file_type = entry.file_type().await.map_err(local_err(&from))?;

                if file_type.is_dir() && depth < OPENSSH_PORTABLE_MAX_DIR_DEPTH {
                    dirs.push((from, to, depth + 1));
                } else if file_type.is_file() {
                    report.bytes += fs::copy(&from, &to).await.map_err(local_err(&from))?;
                    report.files += 1;
                } else {
                    tracing::debug!(path = ?from, "skipping entry");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }
}

impl Operations for LocalFs {
    async fn list(&self, path: &Path) -> Result<Vec<ListEntry>, Error> {
        let mut read_dir = fs::read_dir(path).await.map_err(local_err(path))?;
        let mut entries = Vec::new();

        while let Some(entry) = read_dir.next_entry().await.map_err(local_err(path))? {
            let entry_path = entry.path();
            let metadata = fs::symlink_metadata(&entry_path)
                .await
                .map_err(local_err(&entry_path))?;
            let info = stat_info(&metadata);

            entries.push(ListEntry {
                kind: info.kind(),
                name: entry.file_name().to_string_lossy().into_owned(),
                size: info.size,
                modify_time: info.modify_time,
                access_time: info.access_time,
                rights: Rights::from_mode(info.mode),
                owner: info.uid,
                group: info.gid,
            });
        }

        Ok(entries)
    }

    async fn stat(&self, path: &Path) -> Result<StatInfo, Error> {
        let metadata = fs::metadata(path).await.map_err(local_err(path))?;
        Ok(stat_info(&metadata))
    }

    async fn mkdir(&self, path: &Path, recursive: bool) -> Result<(), Error> {
        let res = if recursive {
            fs::create_dir_all(path).await
        } else {
            fs::create_dir(path).await
        };
        res.map_err(local_err(path))
    }

    async fn rmdir(&self, path: &Path, recursive: bool) -> Result<(), Error> {
        let res = if recursive {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_dir(path).await
        };
        res.map_err(local_err(path))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        fs::rename(from, to).await.map_err(local_err(from))
    }

    async fn delete(&self, path: &Path) -> Result<(), Error> {
        fs::remove_file(path).await.map_err(local_err(path))
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), Error> {
        #[cfg(unix)]
        let perm = {
            use std::os::unix::fs::PermissionsExt;

            std::fs::Permissions::from_mode(mode)
        };

        #[cfg(not(unix))]
        let perm = {
            let mut perm = fs::metadata(path)
                .await
                .map_err(local_err(path))?
                .permissions();
            perm.set_readonly(mode & 0o222 == 0);
            perm
        };

        fs::set_permissions(path, perm)
            .await
            .map_err(local_err(path))
    }

    async fn read_file(&self, path: &Path, encoding: Encoding) -> Result<FileContent, Error> {
        let content = fs::read(path).await.map_err(local_err(path))?;
        FileContent::decode(Bytes::from(content), encoding)
    }

    async fn write_file(&self, path: &Path, content: Bytes) -> Result<(), Error> {
        fs::write(path, content).await.map_err(local_err(path))
    }

    async fn get(&self, request: &TransferRequest) -> Result<TransferReport, Error> {
        Self::copy(request.remote(), request.local(), Direction::Download).await
    }

    async fn put(&self, request: &TransferRequest) -> Result<TransferReport, Error> {
        Self::copy(request.local(), request.remote(), Direction::Upload).await
    }

    async fn get_dir(&self, request: &TransferRequest) -> Result<DirTransferReport, Error> {
        Self::copy_tree(request.remote(), request.local()).await
    }

    async fn put_dir(&self, request: &TransferRequest) -> Result<DirTransferReport, Error> {
        Self::copy_tree(request.local(), request.remote()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn list_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new();

        fs.mkdir(&dir.path().join("a/b"), true).await.unwrap();
        fs.write_file(&dir.path().join("a/file"), Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let mut entries = fs.list(&dir.path().join("a")).await.unwrap();
        entries.sort_by(|x, y| x.name.cmp(&y.name));

        let summary: Vec<_> = entries.iter().map(|e| (e.kind, e.name.as_str(), e.size)).collect();
        assert_eq!(summary[1], ('-', "file", 5));
        assert_eq!(summary[0].0, 'd');

        assert_eq!(
            fs.read_file(&dir.path().join("a/file"), Encoding::Utf8)
                .await
                .unwrap(),
            FileContent::Text("hello".into())
        );
    }

    #[tokio::test]
    async fn missing_file_is_local_io() {
        let dir = tempfile::tempdir().unwrap();

        let err = LocalFs::new()
            .delete(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LocalIo { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn copy_tree_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");

        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("one"), b"1").unwrap();
        std::fs::write(src.join("nested/two"), b"22").unwrap();

        let report = LocalFs::new()
            .put_dir(&TransferRequest::new(&dst, &src))
            .await
            .unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 3);
        assert_eq!(std::fs::read(dst.join("nested/two")).unwrap(), b"22");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chmod_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"").unwrap();

        let fs = LocalFs::new();
        fs.chmod(&path, 0o640).await.unwrap();

        assert_eq!(fs.stat(&path).await.unwrap().mode & 0o777, 0o640);
    }
}
