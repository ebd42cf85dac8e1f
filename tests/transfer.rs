mod common;
use common::*;

use sftp_engine::{
    transfer::{Direction, TransferOutcome, TransferRequest},
    CancellationToken, Error, SftpOptions,
};

use std::num::NonZeroU16;
use std::time::Duration;

use pretty_assertions::assert_eq;

#[tokio::test]
/// A chunk that fails fewer times than the retry budget does not show.
async fn sftp_get_retries_failed_chunks() {
    let server = MockServer::new();
    let content = pattern(12);
    server.add_file("/remote", content.clone());
    server.fail_reads_at(4, 2);

    let sftp = connect(&server, chunked(4)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local");

    let report = sftp.get(&TransferRequest::new("/remote", &local)).await.unwrap();

    assert_eq!(report.direction, Direction::Download);
    assert_eq!(report.outcome, TransferOutcome::Completed);
    assert_eq!(report.bytes, 12);
    assert_eq!(report.watermark, 12);
    assert_eq!(std::fs::read(&local).unwrap(), content);

    assert_eq!(server.open_handles(), 0);
    sftp.close().await.unwrap();
}

#[tokio::test]
/// A failed download keeps exactly the bytes before the reported offset
/// and can be resumed from it.
async fn sftp_get_failure_then_resume() {
    let server = MockServer::new();
    let content = pattern(12);
    server.add_file("/remote", content.clone());
    server.fail_reads_at(8, 3);

    let sftp = connect(&server, chunked(4)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local");

    let err = sftp
        .get(&TransferRequest::new("/remote", &local))
        .await
        .unwrap_err();

    let offset = match err {
        Error::TransferFailed { offset, source } => {
            assert!(matches!(*source, Error::SftpError(..)), "{source:?}");
            offset
        }
        err => panic!("unexpected error {err:?}"),
    };
    assert_eq!(offset, 8);
    assert_eq!(std::fs::read(&local).unwrap(), &content[..8]);

    let report = sftp
        .get(&TransferRequest::new("/remote", &local).resume_from(offset))
        .await
        .unwrap();

    assert_eq!(report.bytes, 4);
    assert_eq!(report.watermark, 12);
    assert_eq!(std::fs::read(&local).unwrap(), content);

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_get_short_reads() {
    let server = MockServer::new();
    let content = pattern(10);
    server.add_file("/remote", content.clone());
    server.set_read_cap(3);

    let sftp = connect(&server, chunked(4)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local");

    let report = sftp.get(&TransferRequest::new("/remote", &local)).await.unwrap();

    assert_eq!(report.watermark, 10);
    assert_eq!(std::fs::read(&local).unwrap(), content);

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_get_out_of_order_chunks() {
    let server = MockServer::new();
    let content = pattern(64);
    server.add_file("/remote", content.clone());
    server.set_reorder(true);

    let sftp = connect(&server, chunked(4)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local");

    let report = sftp.get(&TransferRequest::new("/remote", &local)).await.unwrap();

    assert_eq!(report.watermark, 64);
    assert_eq!(std::fs::read(&local).unwrap(), content);

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_get_cancelled() {
    let server = MockServer::new();
    let content = pattern(12);
    server.add_file("/remote", content.clone());
    server.swallow_reads_from(4);

    let sftp = connect(&server, chunked(4)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local");

    let token = CancellationToken::new();
    let request = TransferRequest::new("/remote", &local).cancel_token(token.clone());

    let canceller = {
        let server = server.clone();
        tokio::spawn(async move {
            eventually(|| server.count(RequestKind::Read) >= 3).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        })
    };

    let report = sftp.get(&request).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(report.outcome, TransferOutcome::Cancelled);
    assert_eq!(report.watermark, 4);
    assert_eq!(std::fs::read(&local).unwrap(), &content[..4]);

    // The remote file was closed despite the abandoned reads.
    eventually(|| server.open_handles() == 0).await;
    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_get_missing_file() {
    let server = MockServer::new();
    let sftp = connect(&server, Default::default()).await;
    let dir = tempfile::tempdir().unwrap();

    let err = sftp
        .get(&TransferRequest::new("/missing", dir.path().join("local")))
        .await
        .unwrap_err();

    assert_eq!(
        err.sftp_error_kind(),
        Some(sftp_engine::SftpErrorKind::NoSuchFile)
    );
    assert!(!dir.path().join("local").exists());

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_put() {
    let server = MockServer::new();
    server.add_dir("/upload");

    let sftp = connect(&server, chunked(4)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local");
    let content = pattern(10);
    std::fs::write(&local, &content).unwrap();

    let report = sftp
        .put(&TransferRequest::new("/upload/remote", &local))
        .await
        .unwrap();

    assert_eq!(report.direction, Direction::Upload);
    assert_eq!(report.bytes, 10);
    assert_eq!(server.file_content("/upload/remote").unwrap(), content);
    assert_eq!(server.count(RequestKind::Write), 3);

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_put_failure_then_resume() {
    let server = MockServer::new();
    server.fail_writes_at(4, 3);

    let sftp = connect(&server, chunked(4)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local");
    let content = pattern(12);
    std::fs::write(&local, &content).unwrap();

    let err = sftp
        .put(&TransferRequest::new("/remote", &local))
        .await
        .unwrap_err();
    let Error::TransferFailed { offset, .. } = err else {
        panic!("unexpected error {err:?}");
    };
    assert_eq!(offset, 4);

    sftp.put(&TransferRequest::new("/remote", &local).resume_from(offset))
        .await
        .unwrap();
    assert_eq!(server.file_content("/remote").unwrap(), content);

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_get_dir() {
    let server = MockServer::new();
    server.add_file("/tree/a", b"a".to_vec());
    server.add_file("/tree/sub/b", b"bb".to_vec());
    server.add_dir("/tree/empty");
    server.add_symlink("/tree/link", "/tree/a");

    let sftp = connect(&server, Default::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("tree");

    let report = sftp
        .get_dir(&TransferRequest::new("/tree", &local))
        .await
        .unwrap();

    assert_eq!(report.files, 2);
    assert_eq!(report.bytes, 3);
    assert_eq!(report.skipped, 1);
    assert!(!report.cancelled);

    assert_eq!(std::fs::read(local.join("a")).unwrap(), b"a");
    assert_eq!(std::fs::read(local.join("sub/b")).unwrap(), b"bb");
    assert!(local.join("empty").is_dir());
    assert!(!local.join("link").exists());

    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_put_dir() {
    let server = MockServer::new();
    server.add_dir("/dst");

    let sftp = connect(&server, Default::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("tree");
    std::fs::create_dir_all(local.join("sub/deeper")).unwrap();
    std::fs::write(local.join("a"), b"a").unwrap();
    std::fs::write(local.join("sub/deeper/b"), b"bb").unwrap();

    let report = sftp
        .put_dir(&TransferRequest::new("/dst", &local))
        .await
        .unwrap();

    assert_eq!(report.files, 2);
    assert_eq!(report.bytes, 3);
    assert_eq!(server.file_content("/dst/a").unwrap(), b"a");
    assert_eq!(server.file_content("/dst/sub/deeper/b").unwrap(), b"bb");

    // Uploading again over the existing directories works.
    sftp.put_dir(&TransferRequest::new("/dst", &local))
        .await
        .unwrap();

    sftp.close().await.unwrap();
}

/// Options running at most `max` file transfers of a directory job at once.
fn transfers_at_once(max: u16) -> SftpOptions {
    SftpOptions::new().max_concurrent_transfers(NonZeroU16::new(max).unwrap())
}

#[tokio::test]
/// Names that would leave the destination directory are never joined
/// onto it.
async fn sftp_get_dir_skips_unsafe_names() {
    let server = MockServer::new();
    server.add_file("/tree/ok", b"ok".to_vec());
    server.add_file("/tree/evil", b"PWNED".to_vec());
    server.add_file("/tree/nested", b"PWNED".to_vec());
    server.add_file("/tree/absolute", b"PWNED".to_vec());
    server.list_as("/tree/evil", "../escaped");
    server.list_as("/tree/nested", "a/../../nested");

    let sftp = connect(&server, Default::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("dest");
    let absolute = dir.path().join("absolute");
    server.list_as("/tree/absolute", absolute.to_str().unwrap());

    let report = sftp
        .get_dir(&TransferRequest::new("/tree", &local))
        .await
        .unwrap();

    assert_eq!(report.files, 1);
    assert_eq!(report.bytes, 2);
    assert_eq!(report.skipped, 3);

    assert_eq!(std::fs::read(local.join("ok")).unwrap(), b"ok");
    assert!(!dir.path().join("escaped").exists());
    assert!(!dir.path().join("nested").exists());
    assert!(!absolute.exists());
    assert_eq!(server.count(RequestKind::Open), 1);

    sftp.close().await.unwrap();
}

#[tokio::test]
/// The first failing file stops the job: no other file is started.
async fn sftp_get_dir_stops_after_first_failure() {
    let server = MockServer::new();
    for name in ["a", "b", "c", "d"] {
        server.add_file(&format!("/tree/{name}"), b"x".to_vec());
    }
    // More failures than retries, for the first file only.
    server.fail_reads_at(0, 3);

    let sftp = connect(&server, transfers_at_once(1)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("tree");

    let err = sftp
        .get_dir(&TransferRequest::new("/tree", &local))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::TransferFailed { offset: 0, .. }),
        "{err:?}"
    );

    assert_eq!(server.count(RequestKind::Open), 1);
    for name in ["b", "c", "d"] {
        assert!(!local.join(name).exists(), "{name} was transferred");
    }

    eventually(|| server.open_handles() == 0).await;
    sftp.close().await.unwrap();
}

#[tokio::test]
async fn sftp_put_dir_stops_after_first_failure() {
    let server = MockServer::new();
    server.add_dir("/dst");
    server.fail_writes_at(0, 3);

    let sftp = connect(&server, transfers_at_once(1)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("tree");
    std::fs::create_dir(&local).unwrap();
    for name in ["a", "b", "c", "d"] {
        std::fs::write(local.join(name), b"x").unwrap();
    }

    let err = sftp
        .put_dir(&TransferRequest::new("/dst", &local))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::TransferFailed { offset: 0, .. }),
        "{err:?}"
    );

    assert_eq!(server.count(RequestKind::Open), 1);
    for name in ["b", "c", "d"] {
        assert!(!server.exists(&format!("/dst/{name}")), "{name} was transferred");
    }

    sftp.close().await.unwrap();
}

#[tokio::test]
/// At most `max_concurrent_transfers` files are in flight, and cancelling
/// the job starts no further file.
async fn sftp_get_dir_cap_and_cancel() {
    let server = MockServer::new();
    for name in ["a", "b", "c", "d"] {
        server.add_file(&format!("/tree/{name}"), b"x".to_vec());
    }
    server.swallow_reads_from(0);

    let sftp = connect(&server, transfers_at_once(2)).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("tree");

    let token = CancellationToken::new();
    let request = TransferRequest::new("/tree", &local).cancel_token(token.clone());

    let control = async {
        eventually(|| server.count(RequestKind::Open) >= 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let opened = server.count(RequestKind::Open);
        token.cancel();
        opened
    };

    let (res, opened) = tokio::join!(sftp.get_dir(&request), control);
    assert_eq!(opened, 2);

    let report = res.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.files, 0);
    assert_eq!(server.count(RequestKind::Open), 2);
    assert!(!local.join("c").exists());
    assert!(!local.join("d").exists());

    eventually(|| server.open_handles() == 0).await;
    sftp.close().await.unwrap();
}
