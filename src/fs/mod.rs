use super::{
    file::OpenOptions,
    handle::HandleKind,
    lowlevel::{bytes_to_path, FileAttrs},
    metadata::{MetaData, MetaDataBuilder, Permissions},
    transfer::{self, MemorySink, MemorySource, TransferConfig},
    utils::chain_cleanup,
    Error, OwnedHandle, Session, SftpErrorKind,
};

use std::{
    borrow::Cow,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
};

use bytes::Bytes;
use futures_util::TryStreamExt;

mod dir;
pub use dir::{Dir, DirEntry, ReadDir};

/// A struct used to perform operations on remote filesystem.
///
/// Relative paths are resolved against its working directory.
#[derive(Debug, Clone)]
pub struct Fs {
    session: Session,
    cwd: PathBuf,
}

impl Fs {
    pub(super) fn new(session: Session, cwd: PathBuf) -> Self {
        Self { session, cwd }
    }

    /// Return current working dir.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Set current working dir.
    ///
    /// * `cwd` - Can include `~`.
    ///   If it is empty, then it is set to use the default
    ///   directory set by the remote `sftp-server`.
    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = cwd.into();
    }

    fn concat_path_if_needed<'path>(&self, path: &'path Path) -> Cow<'path, Path> {
        if path.is_absolute() || self.cwd.as_os_str().is_empty() {
            Cow::Borrowed(path)
        } else {
            Cow::Owned(self.cwd.join(path))
        }
    }

    /// Open a remote dir
    pub async fn open_dir(&self, path: impl AsRef<Path>) -> Result<Dir, Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<Dir, Error> {
            let path = fs.concat_path_if_needed(path);

            let handle = fs
                .session
                .send_request(|write_end| Ok(write_end.send_opendir_request(&path)?.wait()))
                .await?;

            Ok(Dir(OwnedHandle::new(
                fs.session.clone(),
                handle,
                HandleKind::Dir,
                path.into_owned(),
            )))
        }

        inner(self, path.as_ref()).await
    }

    /// Return entries of the dir, the dir is closed once [`ReadDir`]
    /// is dropped.
    pub async fn read_dir(&self, path: impl AsRef<Path>) -> Result<ReadDir, Error> {
        self.open_dir(path).await.map(Dir::read_dir)
    }

    /// Create a directory on the remote filesystem.
    pub async fn create_dir(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<(), Error> {
            let path = fs.concat_path_if_needed(path);

            fs.session
                .send_request(|write_end| {
                    Ok(write_end.send_mkdir_request(&path, FileAttrs::new())?.wait())
                })
                .await
        }

        inner(self, path.as_ref()).await
    }

    /// Create a directory and every missing parent.
    pub async fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<(), Error> {
            let path = fs.concat_path_if_needed(path);

            let mut missing = Vec::new();
            for ancestor in path.ancestors() {
                if ancestor.as_os_str().is_empty() {
                    break;
                }

                match fs.metadata(ancestor).await {
                    Ok(metadata) if metadata.file_type().is_some_and(|t| t.is_dir()) => break,
                    Ok(_) => {
                        return Err(Error::SftpError(
                            SftpErrorKind::Failure,
                            Default::default(),
                        ))
                    }
                    Err(Error::SftpError(SftpErrorKind::NoSuchFile, _)) => missing.push(ancestor),
                    Err(err) => return Err(err),
                }
            }

            for dir in missing.into_iter().rev() {
                fs.create_dir(dir).await?;
            }

            Ok(())
        }

        inner(self, path.as_ref()).await
    }

    /// Removes an existing, empty directory.
    pub async fn remove_dir(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<(), Error> {
            let path = fs.concat_path_if_needed(path);

            fs.session
                .send_request(|write_end| Ok(write_end.send_rmdir_request(&path)?.wait()))
                .await
        }

        inner(self, path.as_ref()).await
    }

    /// Removes a directory and everything inside it.
    ///
    /// Symlinks are removed, never followed.
    pub async fn remove_dir_all(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = self.concat_path_if_needed(path.as_ref()).into_owned();
        self.remove_dir_all_impl(path).await
    }

    fn remove_dir_all_impl(
        &self,
        path: PathBuf,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>> {
        Box::pin(async move {
            let entries: Vec<DirEntry> = self.read_dir(&path).await?.try_collect().await?;

            for entry in entries {
                let child = path.join(entry.filename());

                if entry.file_type().is_some_and(|t| t.is_dir()) {
                    self.remove_dir_all_impl(child).await?;
                } else {
                    self.remove_file(&child).await?;
                }
            }

            self.remove_dir(&path).await
        })
    }

    /// Removes a file from remote filesystem.
    pub async fn remove_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<(), Error> {
            let path = fs.concat_path_if_needed(path);

            fs.session
                .send_request(|write_end| Ok(write_end.send_remove_request(&path)?.wait()))
                .await
        }

        inner(self, path.as_ref()).await
    }

    /// Rename a file or directory to a new name.
    ///
    /// Uses `posix-rename@openssh.com` when the server supports it, which
    /// replaces an existing `to`; plain sftp v3 rename fails instead.
    pub async fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), Error> {
        async fn inner(fs: &Fs, from: &Path, to: &Path) -> Result<(), Error> {
            let from = fs.concat_path_if_needed(from);
            let to = fs.concat_path_if_needed(to);

            let posix_rename = fs.session.extensions()?.posix_rename;

            fs.session
                .send_request(|write_end| {
                    if posix_rename {
                        Ok(write_end.send_posix_rename_request(&from, &to)?.wait())
                    } else {
                        Ok(write_end.send_rename_request(&from, &to)?.wait())
                    }
                })
                .await
        }

        inner(self, from.as_ref(), to.as_ref()).await
    }

    /// Creates a new hard link on the remote filesystem.
    ///
    /// # Precondition
    ///
    /// Requires extension `hardlink@openssh.com`, otherwise it fails with
    /// [`Error::UnsupportedExtension`].
    pub async fn hard_link(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
    ) -> Result<(), Error> {
        async fn inner(fs: &Fs, src: &Path, dst: &Path) -> Result<(), Error> {
            let src = fs.concat_path_if_needed(src);
            let dst = fs.concat_path_if_needed(dst);

            if !fs.session.extensions()?.hardlink {
                return Err(Error::UnsupportedExtension(&"hardlink"));
            }

            fs.session
                .send_request(|write_end| Ok(write_end.send_hardlink_request(&src, &dst)?.wait()))
                .await
        }

        inner(self, src.as_ref(), dst.as_ref()).await
    }

    /// Creates a new symlink `dst` pointing at `src` on the remote filesystem.
    pub async fn symlink(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<(), Error> {
        async fn inner(fs: &Fs, src: &Path, dst: &Path) -> Result<(), Error> {
            let dst = fs.concat_path_if_needed(dst);

            fs.session
                .send_request(|write_end| Ok(write_end.send_symlink_request(src, &dst)?.wait()))
                .await
        }

        inner(self, src.as_ref(), dst.as_ref()).await
    }

    /// Reads a symbolic link, returning the file that the link points to.
    pub async fn read_link(&self, path: impl AsRef<Path>) -> Result<PathBuf, Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<PathBuf, Error> {
            let path = fs.concat_path_if_needed(path);

            fs.session
                .send_request(|write_end| Ok(write_end.send_readlink_request(&path)?.wait()))
                .await
                .map(|target| bytes_to_path(&target))
        }

        inner(self, path.as_ref()).await
    }

    /// Returns the canonical, absolute form of a path with all intermediate
    /// components normalized and symbolic links resolved.
    pub async fn canonicalize(&self, path: impl AsRef<Path>) -> Result<PathBuf, Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<PathBuf, Error> {
            let path = fs.concat_path_if_needed(path);

            fs.session
                .send_request(|write_end| Ok(write_end.send_realpath_request(&path)?.wait()))
                .await
                .map(|resolved| bytes_to_path(&resolved))
        }

        inner(self, path.as_ref()).await
    }

    /// Change the metadata of a file or a directory.
    pub async fn set_metadata(
        &self,
        path: impl AsRef<Path>,
        metadata: MetaData,
    ) -> Result<(), Error> {
        async fn inner(fs: &Fs, path: &Path, attrs: FileAttrs) -> Result<(), Error> {
            let path = fs.concat_path_if_needed(path);

            fs.session
                .send_request(|write_end| Ok(write_end.send_setstat_request(&path, attrs)?.wait()))
                .await
        }

        inner(self, path.as_ref(), metadata.into_inner()).await
    }

    /// Changes the permissions found on a file or a directory.
    pub async fn set_permissions(
        &self,
        path: impl AsRef<Path>,
        perm: Permissions,
    ) -> Result<(), Error> {
        self.set_metadata(path, MetaDataBuilder::new().permissions(perm).create())
            .await
    }

    /// Given a path, queries the file system to get information about a file,
    /// directory, etc.
    pub async fn metadata(&self, path: impl AsRef<Path>) -> Result<MetaData, Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<MetaData, Error> {
            let path = fs.concat_path_if_needed(path);

            fs.session
                .send_request(|write_end| Ok(write_end.send_stat_request(&path)?.wait()))
                .await
                .map(MetaData::new)
        }

        inner(self, path.as_ref()).await
    }

    /// Queries the metadata about a file without following symlinks.
    pub async fn symlink_metadata(&self, path: impl AsRef<Path>) -> Result<MetaData, Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<MetaData, Error> {
            let path = fs.concat_path_if_needed(path);

            fs.session
                .send_request(|write_end| Ok(write_end.send_lstat_request(&path)?.wait()))
                .await
                .map(MetaData::new)
        }

        inner(self, path.as_ref()).await
    }

    /// Read the entire contents of a file.
    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Bytes, Error> {
        async fn inner(fs: &Fs, path: &Path) -> Result<Bytes, Error> {
            let path = fs.concat_path_if_needed(path);
            let config = TransferConfig::download(&fs.session)?;

            let file = OpenOptions::new(fs.session.clone())
                .read(true)
                .open(&path)
                .await?;

            let res = async {
                let size = file.metadata().await?.len();

                let mut sink = MemorySink::default();
                transfer::download(&file, &mut sink, 0, size, config, None).await?;

                Ok(Bytes::from(sink.0))
            }
            .await;

            chain_cleanup(res, file.close().await)
        }

        inner(self, path.as_ref()).await
    }

    /// Open/Create a file for writing and write the entire `contents` into it.
    pub async fn write(
        &self,
        path: impl AsRef<Path>,
        content: impl Into<Bytes>,
    ) -> Result<(), Error> {
        async fn inner(fs: &Fs, path: &Path, content: Bytes) -> Result<(), Error> {
            let path = fs.concat_path_if_needed(path);
            let config = TransferConfig::upload(&fs.session)?;

            let file = OpenOptions::new(fs.session.clone())
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await?;

            let mut source = MemorySource(content);
            let res = transfer::upload(&file, &mut source, 0, config, None)
                .await
                .map(drop);

            chain_cleanup(res, file.close().await)
        }

        inner(self, path.as_ref(), content.into()).await
    }
}
