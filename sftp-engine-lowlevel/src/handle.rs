use super::wire::{Decode, Encode, MAX_HANDLE_LEN};
use super::Error;

use std::fmt;
use std::ops::Deref;

use bytes::{Bytes, BytesMut};

/// Opaque token issued by the server for an open file or directory.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Handle(Bytes);

impl Handle {
    /// Fails with [`Error::HandleTooLong`] if `token` is longer than 256 bytes.
    pub fn new(token: Bytes) -> Result<Self, Error> {
        if token.len() > MAX_HANDLE_LEN {
            Err(Error::HandleTooLong)
        } else {
            Ok(Self(token))
        }
    }

    pub fn into_inner(self) -> Bytes {
        self.0
    }
}

impl Deref for Handle {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(")?;
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl Encode for Handle {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf)
    }
}

impl Decode for Handle {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Handle::new(Bytes::decode(buf)?)
    }
}
