#![forbid(unsafe_code)]

use super::{Error, RequestKind, ResponseInner};

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Notify};

pub(crate) type ResponseSender = oneshot::Sender<Result<ResponseInner, Error>>;
pub(crate) type ResponseReceiver = oneshot::Receiver<Result<ResponseInner, Error>>;

#[derive(Debug)]
enum Entry {
    Pending {
        serial: u64,
        kind: RequestKind,
        sender: ResponseSender,
    },

    /// The waiter gave up, but the server may still answer. The id stays
    /// reserved until it does so that a late response is never delivered
    /// to an unrelated request.
    Stale,
}

#[derive(Debug)]
struct Table {
    entries: HashMap<u32, Entry>,
    next_id: u32,
    next_serial: u64,
    live: usize,
    closed: bool,
}

/// Request ids that are waiting for a response, with the means to deliver
/// that response.
///
/// Ids are handed out from a wrapping counter that skips every id still in
/// the table.
#[derive(Debug)]
pub(crate) struct AwaitableResponses {
    table: Mutex<Table>,
    max_id: u32,
    drained: Notify,
}

/// Identifies one pending request.
///
/// `serial` is unique for the lifetime of the table, so a stale ticket
/// can never touch a later request that happens to reuse the id.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Ticket {
    pub(crate) id: u32,
    serial: u64,
}

impl AwaitableResponses {
    /// * `max_id` - the largest id handed out, wrapping to 0 afterwards.
    pub(crate) fn new(max_id: u32) -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                next_id: 0,
                next_serial: 0,
                live: 0,
                closed: false,
            }),
            max_id,
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // The table is left consistent at every await-free step, so a
        // panic elsewhere does not invalidate it.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve an id for a request of `kind`.
    ///
    /// Fails with [`Error::ResourceExhausted`] if every id is taken and
    /// with [`Error::ConnectionClosed`] after [`AwaitableResponses::close_all`].
    pub(crate) fn insert(&self, kind: RequestKind) -> Result<(Ticket, ResponseReceiver), Error> {
        let mut table = self.lock();

        if table.closed {
            return Err(Error::ConnectionClosed);
        }

        let space = u64::from(self.max_id) + 1;
        if table.entries.len() as u64 >= space {
            return Err(Error::ResourceExhausted);
        }

        let mut id = table.next_id;
        while table.entries.contains_key(&id) {
            id = if id >= self.max_id { 0 } else { id + 1 };
        }
        table.next_id = if id >= self.max_id { 0 } else { id + 1 };

        let serial = table.next_serial;
        table.next_serial += 1;

        let (sender, receiver) = oneshot::channel();
        table.entries.insert(
            id,
            Entry::Pending {
                serial,
                kind,
                sender,
            },
        );
        table.live += 1;

        Ok((Ticket { id, serial }, receiver))
    }

    /// Forget a request that was never sent.
    pub(crate) fn remove(&self, ticket: Ticket) {
        let mut table = self.lock();

        if let Some(Entry::Pending { serial, .. }) = table.entries.get(&ticket.id) {
            if *serial == ticket.serial {
                table.entries.remove(&ticket.id);
                self.decrement_live(&mut table);
            }
        }
    }

    /// The waiter of `ticket` gave up; discard whatever response arrives.
    pub(crate) fn mark_stale(&self, ticket: Ticket) {
        let mut table = self.lock();

        if let Some(entry) = table.entries.get_mut(&ticket.id) {
            if matches!(entry, Entry::Pending { serial, .. } if *serial == ticket.serial) {
                *entry = Entry::Stale;
                self.decrement_live(&mut table);
            }
        }
    }

    fn decrement_live(&self, table: &mut Table) {
        table.live -= 1;
        if table.live == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Deliver `response` to the request with `response_id`.
    ///
    /// Returns [`Error::InvalidResponseId`] if no request with this id is
    /// outstanding and [`Error::ProtocolViolation`] if the response type
    /// cannot answer the request. Both are fatal to the session.
    pub(crate) fn complete(&self, response_id: u32, response: ResponseInner) -> Result<(), Error> {
        let mut table = self.lock();

        let entry = table
            .entries
            .remove(&response_id)
            .ok_or(Error::InvalidResponseId { response_id })?;

        match entry {
            Entry::Stale => {
                tracing::warn!(response_id, "discarding late response");
                Ok(())
            }
            Entry::Pending { kind, sender, .. } => {
                self.decrement_live(&mut table);
                drop(table);

                if kind.accepts(&response) {
                    // The waiter may have been dropped in the meantime.
                    let _ = sender.send(Ok(response));
                    Ok(())
                } else {
                    let _ = sender.send(Err(Error::ProtocolViolation(
                        &"response type does not answer the request",
                    )));
                    Err(Error::ProtocolViolation(
                        &"response type does not answer the request",
                    ))
                }
            }
        }
    }

    /// Fail every pending request with [`Error::ConnectionClosed`] and
    /// refuse new ones.
    pub(crate) fn close_all(&self) {
        let mut table = self.lock();

        table.closed = true;
        table.live = 0;
        let entries: Vec<_> = table.entries.drain().collect();
        drop(table);

        for (_id, entry) in entries {
            if let Entry::Pending { sender, .. } = entry {
                let _ = sender.send(Err(Error::ConnectionClosed));
            }
        }

        self.drained.notify_waiters();
    }

    /// Number of requests that still have a waiter.
    pub(crate) fn live(&self) -> usize {
        self.lock().live
    }

    /// Number of ids in use, stale ones included.
    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Wait until no request has a waiter.
    pub(crate) async fn wait_drained(&self) {
        loop {
            // Created before checking so that a notification sent in
            // between is not missed.
            let notified = self.drained.notified();
            if self.live() == 0 {
                break;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StatusCode, SftpErrorKind};

    use bytes::Bytes;

    fn ok() -> ResponseInner {
        ResponseInner::status(StatusCode::Success, "")
    }

    #[test]
    fn ids_skip_pending_entries() {
        let responses = AwaitableResponses::new(2);

        let (a, _ra) = responses.insert(RequestKind::Stat).unwrap();
        let (b, _rb) = responses.insert(RequestKind::Stat).unwrap();
        let (c, _rc) = responses.insert(RequestKind::Stat).unwrap();
        assert_eq!((a.id, b.id, c.id), (0, 1, 2));

        assert!(matches!(
            responses.insert(RequestKind::Stat),
            Err(Error::ResourceExhausted)
        ));

        responses.complete(1, ok()).unwrap();

        // Wraps around and skips 0 and 2 which are still pending.
        let (d, _rd) = responses.insert(RequestKind::Stat).unwrap();
        assert_eq!(d.id, 1);
    }

    #[test]
    fn unknown_id_is_rejected() {
        let responses = AwaitableResponses::new(u32::MAX);
        assert!(matches!(
            responses.complete(5, ok()),
            Err(Error::InvalidResponseId { response_id: 5 })
        ));
    }

    #[test]
    fn stale_entry_swallows_late_response() {
        let responses = AwaitableResponses::new(u32::MAX);

        let (ticket, _receiver) = responses.insert(RequestKind::Read).unwrap();
        responses.mark_stale(ticket);
        assert_eq!(responses.live(), 0);
        assert_eq!(responses.len(), 1);

        responses
            .complete(ticket.id, ResponseInner::Data(Bytes::from_static(b"late")))
            .unwrap();
        assert_eq!(responses.len(), 0);
    }

    #[test]
    fn mismatched_type_is_a_violation() {
        let responses = AwaitableResponses::new(u32::MAX);

        let (ticket, mut receiver) = responses.insert(RequestKind::Stat).unwrap();
        let res = responses.complete(ticket.id, ResponseInner::Data(Bytes::new()));

        assert!(matches!(res, Err(Error::ProtocolViolation(_))));
        assert!(matches!(
            receiver.try_recv(),
            Ok(Err(Error::ProtocolViolation(_)))
        ));
    }

    #[test]
    fn close_all_fails_everything() {
        let responses = AwaitableResponses::new(u32::MAX);

        let (_t1, mut r1) = responses.insert(RequestKind::Open).unwrap();
        let (_t2, mut r2) = responses.insert(RequestKind::Write).unwrap();

        responses.close_all();

        assert!(matches!(r1.try_recv(), Ok(Err(Error::ConnectionClosed))));
        assert!(matches!(r2.try_recv(), Ok(Err(Error::ConnectionClosed))));
        assert!(matches!(
            responses.insert(RequestKind::Open),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn status_failure_is_delivered_as_is() {
        let responses = AwaitableResponses::new(u32::MAX);

        let (ticket, mut receiver) = responses.insert(RequestKind::Remove).unwrap();
        let status = ResponseInner::status(StatusCode::Failure(SftpErrorKind::NoSuchFile), "x");
        responses.complete(ticket.id, status.clone()).unwrap();

        assert_eq!(receiver.try_recv().unwrap().unwrap(), status);
    }

    #[tokio::test]
    async fn wait_drained_returns_once_idle() {
        let responses = std::sync::Arc::new(AwaitableResponses::new(u32::MAX));
        let (ticket, _receiver) = responses.insert(RequestKind::Stat).unwrap();

        let waiter = {
            let responses = responses.clone();
            tokio::spawn(async move { responses.wait_drained().await })
        };

        tokio::task::yield_now().await;
        responses.complete(ticket.id, ok()).unwrap();

        waiter.await.unwrap();
    }
}
