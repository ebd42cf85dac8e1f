use super::auxiliary::{Auxiliary, Limits};
use super::lowlevel::Extensions;
use super::{Error, WriteEnd};

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;

/// A [`WriteEnd`] that refuses to send once the session left `Ready`, and
/// stops waiting once a background task failed.
#[derive(Debug, Clone)]
pub(super) struct Session {
    inner: WriteEnd,
}

impl Deref for Session {
    type Target = WriteEnd;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Session {
    pub(super) fn new(inner: WriteEnd) -> Self {
        Self { inner }
    }

    pub(super) fn auxiliary(&self) -> &Auxiliary {
        self.inner.get_auxiliary()
    }

    pub(super) fn extensions(&self) -> Result<Extensions, Error> {
        self.auxiliary().extensions()
    }

    pub(super) fn limits(&self) -> Result<Limits, Error> {
        self.auxiliary().limits()
    }

    /// * `future` - must be cancel safe.
    pub(super) async fn cancel_if_task_failed<R, E, F>(&self, future: F) -> Result<R, Error>
    where
        F: Future<Output = Result<R, E>> + Send,
        E: Into<Error>,
    {
        async fn inner<R>(
            this: &Session,
            future: Pin<&mut (dyn Future<Output = Result<R, Error>> + Send)>,
        ) -> Result<R, Error> {
            let cancel_token = &this.auxiliary().cancel_token;

            if cancel_token.is_cancelled() {
                return Err(Error::ConnectionClosed);
            }

            tokio::select! {
                res = future => res,
                _ = cancel_token.cancelled() => Err(Error::ConnectionClosed),
            }
        }

        let future = async move { future.await.map_err(Into::into) };
        tokio::pin!(future);

        inner(self, future).await
    }

    /// Send a request built by `f` and wait for its response.
    pub(super) async fn send_request<Func, F, R>(&self, f: Func) -> Result<R, Error>
    where
        Func: FnOnce(&WriteEnd) -> Result<F, Error>,
        F: Future<Output = Result<R, Error>> + Send,
    {
        self.auxiliary().ensure_ready()?;

        let future = f(&self.inner)?;
        self.cancel_if_task_failed(future).await
    }
}
