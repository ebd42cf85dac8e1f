use super::lowlevel::Handle;
use super::{Error, Session, WriteEnd};

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::RwLock;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum HandleKind {
    File,
    Dir,
}

/// Handles that are still open on the server.
///
/// Only weak references are kept, so that dropping the last
/// [`OwnedHandle`] still closes it.
#[derive(Debug, Default)]
pub(super) struct HandleTable {
    slots: Mutex<HashMap<u64, Weak<HandleSlot>>>,
    next_key: AtomicU64,
}

impl HandleTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Weak<HandleSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, slot: &Arc<HandleSlot>) {
        self.lock().insert(slot.key, Arc::downgrade(slot));
    }

    fn unregister(&self, key: u64) {
        self.lock().remove(&key);
    }

    /// Mark every handle as closed without telling the server, used once
    /// the session is gone.
    pub(super) fn invalidate_all(&self) {
        // Upgraded slots are dropped after the lock is released, since
        // dropping the last one unregisters it.
        let slots: Vec<_> = self
            .lock()
            .drain()
            .filter_map(|(_key, slot)| slot.upgrade())
            .collect();

        for slot in slots {
            slot.live.store(false, Ordering::Release);
        }
    }

    /// Number of handles open on the server.
    pub(super) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[derive(Debug)]
struct HandleSlot {
    key: u64,
    session: Session,
    handle: Handle,
    kind: HandleKind,
    path: PathBuf,
    live: AtomicBool,

    /// Operations hold it shared, close holds it exclusively so that it
    /// never races an operation in flight.
    in_flight: RwLock<()>,
}

impl Drop for HandleSlot {
    fn drop(&mut self) {
        self.session.auxiliary().handles.unregister(self.key);

        if self.live.swap(false, Ordering::AcqRel) {
            tracing::debug!(path = ?self.path, kind = ?self.kind, "closing dropped handle");

            // The response is discarded once it arrives.
            if let Err(err) = self.session.send_close_request(self.handle.clone()) {
                tracing::error!(path = ?self.path, error = %err, "failed to close dropped handle");
            }
        }
    }
}

/// A handle shared by every clone of a remote file or directory.
#[derive(Debug, Clone)]
pub(super) struct OwnedHandle(Arc<HandleSlot>);

impl OwnedHandle {
    pub(super) fn new(session: Session, handle: Handle, kind: HandleKind, path: PathBuf) -> Self {
        let table = &session.auxiliary().handles;
        let key = table.next_key();

        tracing::debug!(?path, ?kind, "opened handle");

        let slot = Arc::new(HandleSlot {
            key,
            session: session.clone(),
            handle,
            kind,
            path,
            live: AtomicBool::new(true),
            in_flight: RwLock::new(()),
        });
        table.register(&slot);

        Self(slot)
    }

    pub(super) fn session(&self) -> &Session {
        &self.0.session
    }

    pub(super) fn path(&self) -> &Path {
        &self.0.path
    }

    /// Send a request on this handle and wait for its response.
    ///
    /// Fails with [`Error::InvalidHandle`] without sending anything if the
    /// handle is closed.
    pub(super) async fn send_request<Func, F, R>(&self, f: Func) -> Result<R, Error>
    where
        Func: FnOnce(&WriteEnd, Handle) -> Result<F, Error>,
        F: Future<Output = Result<R, Error>> + Send,
    {
        let _guard = self.0.in_flight.read().await;

        if !self.0.live.load(Ordering::Acquire) {
            return Err(Error::InvalidHandle);
        }

        let handle = self.0.handle.clone();
        self.0
            .session
            .send_request(|write_end| f(write_end, handle))
            .await
    }

    /// Close the handle after every operation in flight on it finished.
    ///
    /// Every later operation, through any clone, fails with
    /// [`Error::InvalidHandle`].
    pub(super) async fn close(&self) -> Result<(), Error> {
        let _guard = self.0.in_flight.write().await;

        if !self.0.live.swap(false, Ordering::AcqRel) {
            return Err(Error::InvalidHandle);
        }

        let slot = &self.0;
        slot.session.auxiliary().handles.unregister(slot.key);

        tracing::debug!(path = ?slot.path, kind = ?slot.kind, "closing handle");

        let handle = slot.handle.clone();
        slot.session
            .send_request(|write_end| Ok(write_end.send_close_request(handle)?.wait()))
            .await
    }
}
