use std::convert::identity;

use crate::{Error, RecursiveError};

pub(crate) trait ErrorExt {
    fn error_on_cleanup(self, occuring_error: Error) -> Self;
}

impl ErrorExt for Error {
    fn error_on_cleanup(self, occuring_error: Error) -> Self {
        Error::RecursiveErrors(Box::new(RecursiveError {
            original_error: self,
            occuring_error,
        }))
    }
}

pub(crate) trait ResultExt<T, E> {
    fn flatten(self) -> Result<T, E>;
}

impl<T, E, E2> ResultExt<T, E> for Result<Result<T, E>, E2>
where
    E: From<E2>,
{
    fn flatten(self) -> Result<T, E> {
        self.map_err(E::from).and_then(identity)
    }
}

/// Fold the result of a cleanup step into the result of the main step.
pub(crate) fn chain_cleanup<T>(res: Result<T, Error>, cleanup: Result<(), Error>) -> Result<T, Error> {
    match (res, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup_err)) => Err(err.error_on_cleanup(cleanup_err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_cleanup_keeps_both_errors() {
        let res = chain_cleanup::<()>(Err(Error::Timeout), Err(Error::ConnectionClosed));
        match res {
            Err(Error::RecursiveErrors(err)) => {
                assert!(matches!(err.original_error, Error::Timeout));
                assert!(matches!(err.occuring_error, Error::ConnectionClosed));
            }
            res => panic!("unexpected {res:?}"),
        }

        assert!(matches!(
            chain_cleanup(Ok(1), Err(Error::Timeout)),
            Err(Error::Timeout)
        ));
        assert!(matches!(chain_cleanup(Ok(1), Ok(())), Ok(1)));
    }

    #[test]
    fn flatten_join_result() {
        let res: Result<Result<u8, Error>, Error> = Ok(Err(Error::Timeout));
        assert!(matches!(res.flatten(), Err(Error::Timeout)));
    }
}
