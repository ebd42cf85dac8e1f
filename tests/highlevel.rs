mod common;
use common::*;

use sftp_engine::{fs::DirEntry, metadata::Permissions, Error, SessionState, SftpErrorKind, SftpOptions};

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{future::join_all, TryStreamExt};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn sftp_init() {
    let server = MockServer::new();
    let sftp = connect(&server, Default::default()).await;

    assert_eq!(sftp.state(), SessionState::Ready);
    assert!(sftp.extensions().posix_rename);
    assert!(sftp.extensions().fsync);
    assert!(!sftp.extensions().limits);

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_init_rejects_other_versions() {
    let server = MockServer::new();
    server.set_version(4);

    let (writer, reader) = server.serve();
    let err = sftp_engine::Sftp::new(writer, reader, Default::default())
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::UnsupportedSftpProtocol { version: 4 }),
        "{err:?}"
    );
}

#[tokio::test]
async fn sftp_init_applies_server_limits() {
    let server = MockServer::new();
    server.set_limits(Limits {
        packet_len: 0,
        read_len: 8,
        write_len: 0,
        open_handles: 0,
    });
    server.add_file("/f", pattern(20));

    let sftp = connect(&server, Default::default()).await;
    assert!(sftp.extensions().limits);

    let file = sftp.open("/f").await.unwrap();
    assert_eq!(file.max_read_len().unwrap(), 8);
    assert_eq!(file.max_write_len().unwrap(), 32768);

    // Longer reads are clamped.
    assert_eq!(&*file.read_at(0, 100).await.unwrap().unwrap(), &pattern(8)[..]);

    file.close().await.unwrap();
    sftp.close().await.unwrap();
}

#[tokio::test]
/// Test creating, writing, reading and removing a file.
async fn sftp_file_basics() {
    let server = MockServer::new();
    let sftp = connect(&server, Default::default()).await;

    let content = Bytes::from(b"HELLO, WORLD!\n".repeat(20));

    {
        let file = sftp
            .options()
            .write(true)
            .create_new(true)
            .open("/file")
            .await
            .unwrap();
        file.write_at(0, content.clone()).await.unwrap();
        file.close().await.unwrap();

        // create_new refuses existing files.
        sftp.options()
            .write(true)
            .create_new(true)
            .open("/file")
            .await
            .unwrap_err();

        let file = sftp.open("/file").await.unwrap();
        assert_eq!(file.read_at(0, 14).await.unwrap().unwrap(), content.slice(..14));
        assert_eq!(file.read_at(content.len() as u64, 14).await.unwrap(), None);
        assert_eq!(file.metadata().await.unwrap().len(), Some(content.len() as u64));
        file.close().await.unwrap();

        // Sftp::create opens the file truncated.
        sftp.create("/file").await.unwrap().close().await.unwrap();
        assert_eq!(server.file_content("/file"), Some(Vec::new()));

        sftp.fs().remove_file("/file").await.unwrap();
        assert!(!server.exists("/file"));
    }

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_file_write_is_split_by_max_write_len() {
    let server = MockServer::new();
    let options = SftpOptions::new().max_write_len(std::num::NonZeroU32::new(5).unwrap());
    let sftp = connect(&server, options).await;

    let file = sftp.create("/file").await.unwrap();
    file.write_at(0, Bytes::from_static(b"0123456789ab")).await.unwrap();
    file.close().await.unwrap();

    assert_eq!(server.count(RequestKind::Write), 3);
    assert_eq!(server.file_content("/file").unwrap(), b"0123456789ab");

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_file_metadata() {
    let server = MockServer::new();
    server.add_file("/file", b"hello".to_vec());

    let sftp = connect(&server, Default::default()).await;

    let file = sftp.options().write(true).open("/file").await.unwrap();

    file.set_len(2).await.unwrap();
    file.set_permissions(Permissions::from(0o600)).await.unwrap();
    file.sync_all().await.unwrap();

    let metadata = file.metadata().await.unwrap();
    assert_eq!(metadata.len(), Some(2));
    assert_eq!(metadata.permissions().unwrap().mode(), 0o600);
    assert_eq!(metadata.uid(), Some(UID));
    assert_eq!(metadata.gid(), Some(GID));
    assert!(metadata.file_type().unwrap().is_file());
    assert_eq!(
        metadata.modified().unwrap().as_duration(),
        Duration::from_secs(MTIME.into())
    );

    file.close().await.unwrap();
    assert_eq!(server.file_content("/file").unwrap(), b"he");

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_closed_handle_is_invalid() {
    let server = MockServer::new();
    server.add_file("/file", b"hello".to_vec());

    let sftp = connect(&server, Default::default()).await;

    let file = sftp.open("/file").await.unwrap();
    let clone = file.clone();
    assert_eq!(sftp.open_handles(), 1);

    file.close().await.unwrap();
    assert_eq!(sftp.open_handles(), 0);

    let err = clone.read_at(0, 5).await.unwrap_err();
    assert!(matches!(err, Error::InvalidHandle), "{err:?}");
    assert!(matches!(clone.clone().close().await, Err(Error::InvalidHandle)));

    // Nothing reached the server for the closed handle.
    drop(clone);
    assert_eq!(server.count(RequestKind::Read), 0);
    assert_eq!(server.count(RequestKind::Close), 1);

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_dropped_handle_is_closed() {
    let server = MockServer::new();
    server.add_file("/file", b"hello".to_vec());

    let sftp = connect(&server, Default::default()).await;

    let file = sftp.open("/file").await.unwrap();
    assert_eq!(server.open_handles(), 1);

    drop(file);
    assert_eq!(sftp.open_handles(), 0);
    eventually(|| server.open_handles() == 0).await;

    sftp.close().await.unwrap();
}

#[tokio::test]
/// Test creating, removing and iterating over dir, as well
/// as removing file.
async fn sftp_dir_basics() {
    let server = MockServer::new();
    server.set_readdir_batch(2);

    let sftp = connect(&server, Default::default()).await;

    {
        let fs = sftp.fs();

        fs.create_dir("/dir").await.unwrap();
        fs.create_dir("/dir/sub").await.unwrap();
        fs.write("/dir/file", "content").await.unwrap();

        let entries: Vec<DirEntry> = fs.read_dir("/dir").await.unwrap().try_collect().await.unwrap();
        let names: Vec<_> = entries.iter().map(|entry| entry.filename()).collect();
        assert_eq!(names, [Path::new("file"), Path::new("sub")]);

        assert!(entries[0].file_type().unwrap().is_file());
        assert!(entries[1].file_type().unwrap().is_dir());
        assert!(entries[0].longname().ends_with("file"));

        let dir = fs.open_dir("/dir").await.unwrap();
        dir.close().await.unwrap();

        fs.remove_dir("/dir").await.unwrap_err();
        fs.remove_file("/dir/file").await.unwrap();
        fs.remove_dir("/dir/sub").await.unwrap();
        fs.remove_dir("/dir").await.unwrap();
    }

    eventually(|| server.open_handles() == 0).await;
    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_fs_create_and_remove_dir_all() {
    let server = MockServer::new();
    server.add_dir("/a");

    let sftp = connect(&server, Default::default()).await;
    let fs = sftp.fs();

    fs.create_dir_all("/a/b/c").await.unwrap();
    assert!(server.is_dir("/a/b/c"));

    // Already existing is fine.
    fs.create_dir_all("/a/b").await.unwrap();

    fs.write("/a/b/c/file", "x").await.unwrap();
    fs.symlink("/a", "/a/b/link").await.unwrap();

    fs.remove_dir_all("/a/b").await.unwrap();
    assert!(!server.exists("/a/b"));
    assert!(server.is_dir("/a"));

    sftp.close().await.unwrap();
}

#[tokio::test]
/// Test creation of symlink and canonicalize/read_link
async fn sftp_fs_symlink() {
    let server = MockServer::new();
    let sftp = connect(&server, Default::default()).await;

    let content = b"hello, world!\n";

    {
        let fs = sftp.fs();

        fs.write("/file", Bytes::from_static(content)).await.unwrap();
        fs.symlink("/file", "/symlink").await.unwrap();

        assert_eq!(&*fs.read("/symlink").await.unwrap(), content);

        assert_eq!(fs.read_link("/symlink").await.unwrap(), Path::new("/file"));
        assert_eq!(fs.canonicalize("/dir/../file").await.unwrap(), Path::new("/file"));

        assert!(fs.metadata("/symlink").await.unwrap().file_type().unwrap().is_file());
        assert!(fs
            .symlink_metadata("/symlink")
            .await
            .unwrap()
            .file_type()
            .unwrap()
            .is_symlink());

        fs.remove_file("/symlink").await.unwrap();
    }

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_fs_hardlink() {
    let server = MockServer::new();
    let sftp = connect(&server, Default::default()).await;

    let fs = sftp.fs();

    fs.write("/file", "hello").await.unwrap();
    fs.hard_link("/file", "/hardlink").await.unwrap();

    assert_eq!(&*fs.read("/hardlink").await.unwrap(), b"hello");

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_fs_rename() {
    let server = MockServer::new();
    server.add_file("/a", b"a".to_vec());
    server.add_file("/b", b"b".to_vec());

    let sftp = connect(&server, Default::default()).await;
    let fs = sftp.fs();

    // posix-rename replaces the destination.
    fs.rename("/a", "/b").await.unwrap();
    assert_eq!(server.file_content("/b").unwrap(), b"a");
    assert!(!server.exists("/a"));

    let err = fs.rename("/a", "/c").await.unwrap_err();
    assert_eq!(err.sftp_error_kind(), Some(SftpErrorKind::NoSuchFile));

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_fs_rename_without_posix_rename() {
    let server = MockServer::new();
    server.set_posix_rename(false);
    server.add_file("/a", b"a".to_vec());
    server.add_file("/b", b"b".to_vec());

    let sftp = connect(&server, Default::default()).await;
    let fs = sftp.fs();

    let err = fs.rename("/a", "/b").await.unwrap_err();
    assert_eq!(err.sftp_error_kind(), Some(SftpErrorKind::Failure));

    fs.rename("/a", "/c").await.unwrap();
    assert_eq!(server.file_content("/c").unwrap(), b"a");

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_fs_cwd() {
    let server = MockServer::new();
    server.add_file("/home/user/file", b"data".to_vec());

    let sftp = connect(&server, Default::default()).await;

    let mut fs = sftp.fs();
    fs.set_cwd("/home/user");
    assert_eq!(fs.cwd(), Path::new("/home/user"));

    assert_eq!(&*fs.read("file").await.unwrap(), b"data");
    fs.set_permissions("file", Permissions::from(0o640)).await.unwrap();
    assert_eq!(server.permissions("/home/user/file"), Some(0o640));

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_reordered_responses() {
    let server = MockServer::new();
    for i in 0..8 {
        server.add_file(&format!("/file{i}"), pattern(i * 10));
    }
    server.set_reorder(true);

    let sftp = connect(&server, Default::default()).await;
    let fs = sftp.fs();

    let sizes = join_all((0..8).map(|i| {
        let fs = fs.clone();
        async move { fs.metadata(format!("/file{i}")).await.unwrap().len() }
    }))
    .await;

    assert_eq!(sizes, (0..8).map(|i| Some(i * 10)).collect::<Vec<_>>());

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_request_timeout() {
    let server = MockServer::new();
    server.add_file("/file", b"data".to_vec());
    server.swallow(RequestKind::Stat);

    let options = SftpOptions::new().request_timeout(Some(Duration::from_millis(100)));
    let sftp = connect(&server, options).await;

    let err = sftp.fs().metadata("/file").await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err:?}");

    // The session survives.
    assert_eq!(sftp.state(), SessionState::Ready);
    sftp.fs().symlink_metadata("/file").await.unwrap();

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_termination_fails_pending_requests() {
    let server = MockServer::new();
    server.add_file("/file", b"data".to_vec());
    server.swallow(RequestKind::Stat);

    let sftp = connect(&server, Default::default()).await;
    let file = sftp.open("/file").await.unwrap();

    let pending = {
        let fs = sftp.fs();
        tokio::spawn(async move { fs.metadata("/file").await })
    };
    eventually(|| server.count(RequestKind::Stat) == 1).await;

    server.kill();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed), "{err:?}");

    eventually(|| sftp.state() == SessionState::Faulted).await;

    // Handles are invalidated and new requests are refused.
    assert!(matches!(file.read_at(0, 4).await, Err(Error::InvalidHandle)));
    assert!(matches!(
        sftp.fs().metadata("/file").await,
        Err(Error::NotConnected)
    ));

    assert!(sftp.close().await.unwrap_err().is_fatal());
}
