mod common;
use common::*;

use sftp_engine::{
    facade::{
        Client, ConnectParams, Connector, Credential, Encoding, FileContent, ListEntry, Rights,
    },
    Error, ErrorKind, SessionState,
};

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::io::DuplexStream;

/// Connects to a fresh in-memory server.
#[derive(Debug, Default)]
struct MockConnector {
    server: MockServer,
    connects: AtomicUsize,
}

impl Connector for MockConnector {
    type Writer = DuplexStream;
    type Reader = DuplexStream;

    async fn connect(&self, _params: &ConnectParams) -> Result<(DuplexStream, DuplexStream), Error> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(self.server.serve())
    }
}

async fn remote_client(connector: &MockConnector) -> Client {
    let params = ConnectParams::new("sftp.example.com", "user")
        .port(2222)
        .credential(Credential::Password("secret".into()));

    Client::connect(&params, connector, Default::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn facade_list() {
    let connector = MockConnector::default();
    connector.server.add_file("/dir/file", b"hello".to_vec());
    connector.server.add_dir("/dir/sub");
    connector.server.add_symlink("/dir/link", "/dir/file");

    let client = remote_client(&connector).await;
    assert!(!client.is_local());
    assert_eq!(client.state(), SessionState::Ready);

    let entries = client.list("/dir").await.unwrap().into_data().unwrap();

    let summary: Vec<_> = entries
        .iter()
        .map(|entry| (entry.kind, entry.name.as_str()))
        .collect();
    assert_eq!(summary, [('-', "file"), ('l', "link"), ('d', "sub")]);

    assert_eq!(
        entries[0],
        ListEntry {
            kind: '-',
            name: "file".into(),
            size: 5,
            modify_time: u64::from(MTIME) * 1000,
            access_time: u64::from(ATIME) * 1000,
            rights: Rights {
                user: "rw-".into(),
                group: "r--".into(),
                other: "r--".into(),
            },
            owner: UID,
            group: GID,
        }
    );

    let value = serde_json::to_value(&entries[2]).unwrap();
    assert_eq!(value["type"], "d");
    assert_eq!(value["modifyTime"], u64::from(MTIME) * 1000);
    assert_eq!(value["rights"]["user"], "rwx");
}

#[tokio::test]
async fn facade_stat_and_chmod() {
    let connector = MockConnector::default();
    connector.server.add_file("/file", b"hello".to_vec());

    let client = remote_client(&connector).await;

    let stat = client.stat("/file").await.unwrap().into_data().unwrap();
    assert_eq!(stat.mode, 0o644);
    assert_eq!(stat.size, 5);
    assert!(stat.is_file);
    assert!(!stat.is_directory);

    assert!(client.chmod("/file", 0o600).await.unwrap().success);
    assert_eq!(connector.server.permissions("/file"), Some(0o600));
}

#[tokio::test]
async fn facade_remote_error() {
    let connector = MockConnector::default();
    let client = remote_client(&connector).await;

    let res = client.rename("/missing", "/other").await.unwrap();

    assert_eq!(
        serde_json::to_value(&res).unwrap(),
        json!({
            "success": false,
            "errorKind": "RemoteOperationError",
            "message": "NoSuchFile",
            "detail": "No such file",
        })
    );

    // A failed call leaves the session usable.
    assert!(client.mkdir("/dir", false).await.unwrap().success);
}

#[tokio::test]
async fn facade_mkdir_and_rmdir_recursive() {
    let connector = MockConnector::default();
    let client = remote_client(&connector).await;

    assert!(client.mkdir("/a/b/c", true).await.unwrap().success);
    assert!(connector.server.is_dir("/a/b/c"));
    assert!(client.write_file("/a/b/c/f", "x").await.unwrap().success);

    let res = client.rmdir("/a", false).await.unwrap();
    assert_eq!(res.error_kind, Some(ErrorKind::RemoteOperationError));

    assert!(client.rmdir("/a", true).await.unwrap().success);
    assert!(!connector.server.exists("/a"));
}

#[tokio::test]
async fn facade_read_and_write_file() {
    let connector = MockConnector::default();
    connector.server.add_file("/binary", vec![0xff, 0xfe, 0x00]);

    let client = remote_client(&connector).await;

    assert!(client.write_file("/text", "héllo").await.unwrap().success);
    assert_eq!(
        client.read_file("/text", Encoding::Utf8).await.unwrap().into_data(),
        Some(FileContent::Text("héllo".into()))
    );

    assert_eq!(
        client
            .read_file("/binary", Encoding::Binary)
            .await
            .unwrap()
            .into_data(),
        Some(FileContent::Binary(vec![0xff, 0xfe, 0x00]))
    );

    let res = client.read_file("/binary", Encoding::Utf8).await.unwrap();
    assert!(!res.success);
    assert_eq!(res.error_kind, Some(ErrorKind::InvalidEncoding));

    assert!(client
        .write_file("/bytes", Bytes::from_static(&[1, 2, 3]))
        .await
        .unwrap()
        .success);
    assert!(client.delete("/bytes").await.unwrap().success);
    assert!(!connector.server.exists("/bytes"));
}

#[tokio::test]
async fn facade_transfers() {
    let connector = MockConnector::default();
    connector.server.add_file("/remote", pattern(100));
    connector.server.fail_reads_at(0, 3);

    let client = remote_client(&connector).await;
    let dir = tempfile::tempdir().unwrap();

    let res = client.get("/remote", dir.path().join("local")).await.unwrap();
    assert!(!res.success);
    assert_eq!(res.error_kind, Some(ErrorKind::TransferFailed));

    let res = client.get("/remote", dir.path().join("local")).await.unwrap();
    let report = res.into_data().unwrap();
    assert_eq!(report.bytes, 100);

    let res = client
        .put(dir.path().join("local"), "/copy")
        .await
        .unwrap();
    assert!(res.success);
    assert_eq!(connector.server.file_content("/copy").unwrap(), pattern(100));

    let res = client.get_dir("/", dir.path().join("tree")).await.unwrap();
    assert_eq!(res.into_data().unwrap().files, 2);
}

#[tokio::test]
async fn facade_disconnect() {
    let connector = MockConnector::default();
    let mut client = remote_client(&connector).await;

    assert!(client.disconnect().await.unwrap().success);
    assert_eq!(client.state(), SessionState::Disconnected);

    assert!(matches!(client.list("/").await, Err(Error::NotConnected)));
    assert!(matches!(client.disconnect().await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn facade_not_connected_after_transport_failure() {
    let connector = MockConnector::default();
    let client = remote_client(&connector).await;

    connector.server.kill();
    eventually(|| client.state() == SessionState::Faulted).await;

    assert!(matches!(client.stat("/").await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn facade_local_host() {
    let connector = MockConnector::default();
    let dir = tempfile::tempdir().unwrap();

    let params = ConnectParams::new("localhost", "user");
    let mut client = Client::connect(&params, &connector, Default::default())
        .await
        .unwrap();

    assert!(client.is_local());
    assert_eq!(connector.connects.load(Ordering::Relaxed), 0);

    let file = dir.path().join("file");
    assert!(client.write_file(&file, "local").await.unwrap().success);
    assert_eq!(
        client.read_file(&file, Encoding::Utf8).await.unwrap().into_data(),
        Some(FileContent::Text("local".into()))
    );

    let copy = dir.path().join("copy");
    let report = client.put(&file, &copy).await.unwrap().into_data().unwrap();
    assert_eq!(report.bytes, 5);

    let res = client.delete(dir.path().join("missing")).await.unwrap();
    assert_eq!(res.error_kind, Some(ErrorKind::LocalIoError));

    assert!(client.disconnect().await.unwrap().success);
    assert!(matches!(client.list(dir.path()).await, Err(Error::NotConnected)));
}
