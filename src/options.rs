use std::num::{NonZeroU16, NonZeroU32, NonZeroUsize};
use std::time::Duration;

use sftp_engine_lowlevel::ConnectionOptions;

/// Options when creating [`super::Sftp`].
#[derive(Debug, Copy, Clone, Default)]
pub struct SftpOptions {
    chunk_size: Option<NonZeroU32>,
    window: Option<NonZeroU16>,
    max_retries: Option<u8>,
    max_concurrent_transfers: Option<NonZeroU16>,

    request_timeout: Option<Option<Duration>>,
    read_end_buffer_size: Option<NonZeroUsize>,

    max_read_len: Option<NonZeroU32>,
    max_write_len: Option<NonZeroU32>,
}

impl SftpOptions {
    /// Create a new [`SftpOptions`].
    pub const fn new() -> Self {
        Self {
            chunk_size: None,
            window: None,
            max_retries: None,
            max_concurrent_transfers: None,

            request_timeout: None,
            read_end_buffer_size: None,

            max_read_len: None,
            max_write_len: None,
        }
    }

    /// Set the length of each chunk issued by the transfer engine.
    ///
    /// It is clamped to the limits of the server.
    ///
    /// The default value is 32 KiB.
    #[must_use]
    pub const fn chunk_size(mut self, chunk_size: NonZeroU32) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub(super) fn get_chunk_size(&self) -> u32 {
        self.chunk_size
            .map(NonZeroU32::get)
            .unwrap_or(lowlevel_copy_buflen())
    }

    /// Set the number of chunk requests a single transfer keeps in flight.
    ///
    /// The default value is 16.
    #[must_use]
    pub const fn window(mut self, window: NonZeroU16) -> Self {
        self.window = Some(window);
        self
    }

    pub(super) fn get_window(&self) -> usize {
        self.window.map(NonZeroU16::get).unwrap_or(16).into()
    }

    /// Set how many times a failing chunk is retried before the transfer
    /// gives up.
    ///
    /// The default value is 2.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub(super) fn get_max_retries(&self) -> u8 {
        self.max_retries.unwrap_or(2)
    }

    /// Set the number of files a directory transfer moves concurrently.
    ///
    /// The default value is 4.
    #[must_use]
    pub const fn max_concurrent_transfers(mut self, max: NonZeroU16) -> Self {
        self.max_concurrent_transfers = Some(max);
        self
    }

    pub(super) fn get_max_concurrent_transfers(&self) -> usize {
        self.max_concurrent_transfers
            .map(NonZeroU16::get)
            .unwrap_or(4)
            .into()
    }

    /// Set how long a request waits for its response, `None` waits forever.
    ///
    /// The default value is 30 seconds.
    #[must_use]
    pub const fn request_timeout(mut self, request_timeout: Option<Duration>) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    pub(super) fn get_request_timeout(&self) -> Option<Duration> {
        self.request_timeout
            .unwrap_or(Some(Duration::from_secs(30)))
    }

    /// Set size of the buffer in front of the reader of the transport.
    ///
    /// The default value is 64 KiB.
    #[must_use]
    pub const fn read_end_buffer_size(mut self, size: NonZeroUsize) -> Self {
        self.read_end_buffer_size = Some(size);
        self
    }

    /// Set the maximum length of a single read request.
    ///
    /// If the server advertises a smaller limit, the server's limit is used.
    #[must_use]
    pub const fn max_read_len(mut self, max_read_len: NonZeroU32) -> Self {
        self.max_read_len = Some(max_read_len);
        self
    }

    pub(super) fn get_max_read_len(&self) -> Option<u32> {
        self.max_read_len.map(NonZeroU32::get)
    }

    /// Set the maximum length of a single write request.
    ///
    /// If the server advertises a smaller limit, the server's limit is used.
    #[must_use]
    pub const fn max_write_len(mut self, max_write_len: NonZeroU32) -> Self {
        self.max_write_len = Some(max_write_len);
        self
    }

    pub(super) fn get_max_write_len(&self) -> Option<u32> {
        self.max_write_len.map(NonZeroU32::get)
    }

    pub(super) fn connection_options(&self) -> ConnectionOptions {
        let default = ConnectionOptions::default();

        ConnectionOptions {
            request_timeout: self.get_request_timeout(),
            read_buffer_size: self.read_end_buffer_size.unwrap_or(default.read_buffer_size),
            ..default
        }
    }
}

const fn lowlevel_copy_buflen() -> u32 {
    sftp_engine_lowlevel::OPENSSH_PORTABLE_DEFAULT_COPY_BUFLEN as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = SftpOptions::new();

        assert_eq!(options.get_chunk_size(), 32 * 1024);
        assert_eq!(options.get_window(), 16);
        assert_eq!(options.get_max_retries(), 2);
        assert_eq!(options.get_max_concurrent_transfers(), 4);
        assert_eq!(options.get_request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(options.get_max_read_len(), None);
    }

    #[test]
    fn timeout_can_be_disabled() {
        let options = SftpOptions::new().request_timeout(None);

        assert_eq!(options.get_request_timeout(), None);
        assert_eq!(options.connection_options().request_timeout, None);
    }
}
