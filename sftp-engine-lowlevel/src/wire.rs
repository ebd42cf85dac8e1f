//! Primitive encoding shared by every sftp message.
//!
//! Numbers are fixed-width big-endian, strings are `u32` length-prefixed
//! byte sequences. Strings are never interpreted as text here.

use super::Error;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest packet accepted from the peer: 256 KiB of payload plus room
/// for the header and a handle.
pub const MAX_PACKET_LEN: u32 = 256 * 1024 + 1024;

/// Longest version message accepted from the server.
pub const MAX_HELLO_LEN: u32 = 4096;

/// Longest handle allowed by sftp v3.
pub const MAX_HANDLE_LEN: usize = 256;

/// Serialize a value into the sftp wire format.
pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);
}

/// Deserialize a value from the sftp wire format, consuming the bytes read.
pub trait Decode: Sized {
    fn decode(buf: &mut Bytes) -> Result<Self, Error>;
}

pub(crate) fn truncated() -> Error {
    Error::MalformedPacket(&"packet is truncated")
}

impl Encode for u8 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }
}

impl Decode for u8 {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        if buf.remaining() < 1 {
            return Err(truncated());
        }
        Ok(buf.get_u8())
    }
}

impl Encode for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(*self);
    }
}

impl Decode for u32 {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        if buf.remaining() < 4 {
            return Err(truncated());
        }
        Ok(buf.get_u32())
    }
}

impl Encode for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(*self);
    }
}

impl Decode for u64 {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        if buf.remaining() < 8 {
            return Err(truncated());
        }
        Ok(buf.get_u64())
    }
}

impl Encode for [u8] {
    fn encode(&self, buf: &mut BytesMut) {
        // Callers bound every string well below u32::MAX: paths and
        // handles are short and data is clamped to the write length.
        debug_assert!(self.len() <= u32::MAX as usize);

        buf.put_u32(self.len() as u32);
        buf.put_slice(self);
    }
}

impl Encode for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        (**self).encode(buf)
    }
}

impl Decode for Bytes {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let len = u32::decode(buf)? as usize;
        if buf.remaining() < len {
            return Err(Error::MalformedPacket(&"string length exceeds packet"));
        }
        Ok(buf.split_to(len))
    }
}

impl<T: Encode> Encode for [(T, T)] {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        for (key, value) in self {
            key.encode(buf);
            value.encode(buf);
        }
    }
}

/// Decode `u32 count` followed by `count` string pairs.
pub(crate) fn decode_pairs(buf: &mut Bytes) -> Result<Vec<(Bytes, Bytes)>, Error> {
    let count = u32::decode(buf)? as usize;

    // Every pair takes at least 8 bytes, reject counts the packet
    // cannot possibly hold before allocating.
    if count > buf.remaining() / 8 {
        return Err(Error::MalformedPacket(&"pair count exceeds packet"));
    }

    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        pairs.push((Bytes::decode(buf)?, Bytes::decode(buf)?));
    }
    Ok(pairs)
}

/// Reserve the 4-byte length header and return where it starts.
pub(crate) fn begin_packet(buf: &mut BytesMut) -> usize {
    let start = buf.len();
    buf.put_u32(0);
    start
}

/// Fill in the length header reserved by [`begin_packet`].
pub(crate) fn finish_packet(buf: &mut BytesMut, start: usize) {
    let len = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Strip the length header of a complete packet, checking that it
/// matches the number of bytes actually present.
pub(crate) fn open_packet(mut packet: Bytes) -> Result<Bytes, Error> {
    let len = u32::decode(&mut packet)? as usize;
    if len != packet.remaining() {
        return Err(Error::MalformedPacket(
            &"length field inconsistent with packet size",
        ));
    }
    Ok(packet)
}

/// Every field of a packet body must be consumed.
pub(crate) fn ensure_consumed(body: &Bytes) -> Result<(), Error> {
    if body.has_remaining() {
        Err(Error::MalformedPacket(&"trailing bytes after packet body"))
    } else {
        Ok(())
    }
}
