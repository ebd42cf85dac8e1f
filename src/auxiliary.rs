use super::handle::HandleTable;
use super::lowlevel::Extensions;
use super::{Error, SftpOptions};

use std::sync::atomic::{AtomicU8, Ordering};

use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a session.
///
/// `Disconnected -> Connecting -> Ready -> Closing -> Disconnected`, and
/// `Faulted` once the transport or the protocol failed. A session in
/// `Faulted` or `Disconnected` never becomes `Ready` again.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Closing = 3,
    Faulted = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::Closing,
            4 => Self::Faulted,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub(super) struct Limits {
    pub(super) read_len: u32,
    pub(super) write_len: u32,
}

#[derive(Debug)]
pub(super) struct ConnInfo {
    pub(super) limits: Limits,
    pub(super) extensions: Extensions,
}

#[derive(Debug)]
pub(super) struct Auxiliary {
    pub(super) conn_info: OnceCell<ConnInfo>,

    /// cancel_token is used to cancel waiting requests
    /// when the read_task/flush_task has failed.
    pub(super) cancel_token: CancellationToken,

    /// Cancelled by [`super::Sftp::close`] once every pending request has
    /// been answered, or when [`super::Sftp`] is dropped.
    pub(super) shutdown_token: CancellationToken,

    state: AtomicU8,

    pub(super) handles: HandleTable,

    pub(super) options: SftpOptions,
}

impl Auxiliary {
    pub(super) fn new(options: SftpOptions) -> Self {
        Self {
            conn_info: OnceCell::new(),

            cancel_token: CancellationToken::new(),
            shutdown_token: CancellationToken::new(),

            state: AtomicU8::new(SessionState::Connecting as u8),

            handles: HandleTable::default(),

            options,
        }
    }

    fn conn_info(&self) -> Result<&ConnInfo, Error> {
        // conn_info is only written during `Sftp::new`, before the state
        // becomes `Ready`.
        self.conn_info.get().ok_or(Error::NotConnected)
    }

    pub(super) fn extensions(&self) -> Result<Extensions, Error> {
        self.conn_info().map(|conn_info| conn_info.extensions)
    }

    pub(super) fn limits(&self) -> Result<Limits, Error> {
        self.conn_info().map(|conn_info| conn_info.limits)
    }

    pub(super) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`, unless another state was entered first.
    pub(super) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter `Disconnected` unless the session is `Faulted`.
    pub(super) fn mark_disconnected(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != SessionState::Faulted as u8)
                    .then_some(SessionState::Disconnected as u8)
            });
    }

    /// Return `Err(Error::NotConnected)` unless the session is `Ready`.
    pub(super) fn ensure_ready(&self) -> Result<(), Error> {
        match self.state() {
            SessionState::Ready => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    /// Move to `Faulted`, invalidate every handle and wake every waiter.
    pub(super) fn fault(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != SessionState::Disconnected as u8)
                    .then_some(SessionState::Faulted as u8)
            });

        self.handles.invalidate_all();
        self.cancel_token.cancel();
    }

    pub(super) fn order_shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_is_terminal() {
        let auxiliary = Auxiliary::new(SftpOptions::new());
        assert_eq!(auxiliary.state(), SessionState::Connecting);
        assert!(matches!(auxiliary.ensure_ready(), Err(Error::NotConnected)));

        assert!(auxiliary.transition(SessionState::Connecting, SessionState::Ready));
        auxiliary.ensure_ready().unwrap();

        auxiliary.fault();
        assert_eq!(auxiliary.state(), SessionState::Faulted);
        assert!(auxiliary.cancel_token.is_cancelled());
    }

    #[test]
    fn ready_does_not_override_fault() {
        let auxiliary = Auxiliary::new(SftpOptions::new());
        auxiliary.fault();

        assert!(!auxiliary.transition(SessionState::Connecting, SessionState::Ready));
        assert_eq!(auxiliary.state(), SessionState::Faulted);

        auxiliary.mark_disconnected();
        assert_eq!(auxiliary.state(), SessionState::Faulted);

        let auxiliary = Auxiliary::new(SftpOptions::new());
        assert!(auxiliary.transition(SessionState::Connecting, SessionState::Ready));
        assert_eq!(auxiliary.state(), SessionState::Ready);
    }

    #[test]
    fn fault_after_disconnect_keeps_disconnected() {
        let auxiliary = Auxiliary::new(SftpOptions::new());
        auxiliary.mark_disconnected();

        auxiliary.fault();
        assert_eq!(auxiliary.state(), SessionState::Disconnected);
    }
}
