#![allow(dead_code)]

use sftp_engine::{Sftp, SftpOptions};
pub use sftp_test_common::*;

use std::num::NonZeroU32;
use std::time::Duration;

use tokio::time::{sleep, timeout};

pub async fn connect(server: &MockServer, options: SftpOptions) -> Sftp {
    let (writer, reader) = server.serve();
    Sftp::new(writer, reader, options).await.unwrap()
}

/// Options splitting every transfer into chunks of `len` bytes.
pub fn chunked(len: u32) -> SftpOptions {
    SftpOptions::new().chunk_size(NonZeroU32::new(len).unwrap())
}

/// `len` bytes that differ from one offset to the next.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `cond` until it holds, panicking after a second.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(1), async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
