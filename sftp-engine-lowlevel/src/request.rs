use super::constants::*;
use super::wire::{begin_packet, ensure_consumed, finish_packet, open_packet, Decode, Encode};
use super::{Error, FileAttrs, Handle, ResponseInner, StatusCode};

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

bitflags! {
    /// `pflags` of `SSH_FXP_OPEN`.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open the file for reading.
        const READ = SSH_FXF_READ;

        /// Open the file for writing.
        /// If both this and READ are specified, the file is opened for both
        /// reading and writing.
        const WRITE = SSH_FXF_WRITE;

        /// Force all writes to append data at the end of the file.
        const APPEND = SSH_FXF_APPEND;

        /// If this flag is specified, then a new file will be created if one does not
        /// already exist (if TRUNC is specified, the new file will
        /// be truncated to zero length if it previously exists).
        const CREATE = SSH_FXF_CREAT;

        /// Forces an existing file with the same name to be truncated to zero
        /// length when creating a file by specifying CREATE.
        /// CREATE MUST also be specified if this flag is used.
        const TRUNC = SSH_FXF_TRUNC;

        /// Causes the request to fail if the named file already exists.
        /// CREATE MUST also be specified if this flag is used.
        const EXCL = SSH_FXF_EXCL;
    }
}

/// `SSH_FXP_INIT`, the first packet sent by the client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Hello {
    pub version: u32,
    pub extensions: Vec<(Bytes, Bytes)>,
}

impl Hello {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let start = begin_packet(buf);
        buf.put_u8(SSH_FXP_INIT);
        buf.put_u32(self.version);
        for (name, data) in &self.extensions {
            name.encode(buf);
            data.encode(buf);
        }
        finish_packet(buf, start);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// * `packet` - includes the 4-byte length header.
    pub fn decode(packet: Bytes) -> Result<Self, Error> {
        Self::decode_body(open_packet(packet)?)
    }

    /// * `body` - excludes the 4-byte length header.
    pub fn decode_body(mut body: Bytes) -> Result<Self, Error> {
        if u8::decode(&mut body)? != SSH_FXP_INIT {
            return Err(Error::MalformedPacket(&"expected SSH_FXP_INIT"));
        }
        let version = u32::decode(&mut body)?;

        let mut extensions = Vec::new();
        while !body.is_empty() {
            extensions.push((Bytes::decode(&mut body)?, Bytes::decode(&mut body)?));
        }

        Ok(Self {
            version,
            extensions,
        })
    }
}

/// Operation tag of a pending request, used to check that a response
/// has a type the request can produce.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RequestKind {
    Open,
    Close,
    Read,
    Write,
    Lstat,
    Fstat,
    Setstat,
    Fsetstat,
    Opendir,
    Readdir,
    Remove,
    Mkdir,
    Rmdir,
    Realpath,
    Stat,
    Rename,
    Readlink,
    Symlink,
    Extended,
}

impl RequestKind {
    /// Return true if `response` is a valid answer to this kind of request.
    ///
    /// An error status answers every request, but a successful one only
    /// answers requests that expect no typed reply.
    pub fn accepts(self, response: &ResponseInner) -> bool {
        use RequestKind::*;

        match response {
            ResponseInner::Status {
                status_code: StatusCode::Success,
                ..
            } => !matches!(
                self,
                Open | Opendir | Read | Readdir | Realpath | Readlink | Stat | Lstat | Fstat
            ),
            ResponseInner::Status { .. } => true,
            ResponseInner::Handle(_) => matches!(self, Open | Opendir),
            ResponseInner::Data(_) => matches!(self, Read),
            ResponseInner::Name(_) => matches!(self, Readdir | Realpath | Readlink),
            ResponseInner::Attrs(_) => matches!(self, Stat | Lstat | Fstat),
            ResponseInner::ExtendedReply(_) => matches!(self, Extended),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RequestInner {
    /// Response with `Handle` or `Status`.
    Open {
        filename: Bytes,
        flags: OpenFlags,
        attrs: FileAttrs,
    },

    /// Response with `Status`.
    Close(Handle),

    /// Response with `Data`, or `Status` with `Eof`.
    Read { handle: Handle, offset: u64, len: u32 },

    /// Response with `Status`.
    Write {
        handle: Handle,
        offset: u64,
        data: Bytes,
    },

    /// Response with `Attrs`, does not follow symlinks.
    Lstat(Bytes),

    /// Response with `Attrs`.
    Fstat(Handle),

    /// Response with `Status`.
    Setstat { path: Bytes, attrs: FileAttrs },

    /// Response with `Status`.
    Fsetstat { handle: Handle, attrs: FileAttrs },

    /// Response with `Handle`.
    Opendir(Bytes),

    /// Response with `Name`, or `Status` with `Eof` once every entry is read.
    Readdir(Handle),

    /// Response with `Status`.
    Remove(Bytes),

    /// Response with `Status`.
    Mkdir { path: Bytes, attrs: FileAttrs },

    /// Response with `Status`.
    Rmdir(Bytes),

    /// Response with `Name` containing exactly one entry.
    Realpath(Bytes),

    /// Response with `Attrs`.
    Stat(Bytes),

    /// Response with `Status`.
    Rename { oldpath: Bytes, newpath: Bytes },

    /// Response with `Name` containing exactly one entry.
    Readlink(Bytes),

    /// Response with `Status`.
    ///
    /// Encoded in the order used by openssh-portable: target first, then
    /// the link, which is the reverse of the draft.
    Symlink { linkpath: Bytes, targetpath: Bytes },

    /// Response with `ExtendedReply` or `Status`.
    ///
    /// `data` is the already encoded, request specific payload.
    Extended { request: Bytes, data: Bytes },
}

impl RequestInner {
    pub fn kind(&self) -> RequestKind {
        use RequestInner::*;

        match self {
            Open { .. } => RequestKind::Open,
            Close(_) => RequestKind::Close,
            Read { .. } => RequestKind::Read,
            Write { .. } => RequestKind::Write,
            Lstat(_) => RequestKind::Lstat,
            Fstat(_) => RequestKind::Fstat,
            Setstat { .. } => RequestKind::Setstat,
            Fsetstat { .. } => RequestKind::Fsetstat,
            Opendir(_) => RequestKind::Opendir,
            Readdir(_) => RequestKind::Readdir,
            Remove(_) => RequestKind::Remove,
            Mkdir { .. } => RequestKind::Mkdir,
            Rmdir(_) => RequestKind::Rmdir,
            Realpath(_) => RequestKind::Realpath,
            Stat(_) => RequestKind::Stat,
            Rename { .. } => RequestKind::Rename,
            Readlink(_) => RequestKind::Readlink,
            Symlink { .. } => RequestKind::Symlink,
            Extended { .. } => RequestKind::Extended,
        }
    }

    fn packet_type(&self) -> u8 {
        use RequestInner::*;

        match self {
            Open { .. } => SSH_FXP_OPEN,
            Close(_) => SSH_FXP_CLOSE,
            Read { .. } => SSH_FXP_READ,
            Write { .. } => SSH_FXP_WRITE,
            Lstat(_) => SSH_FXP_LSTAT,
            Fstat(_) => SSH_FXP_FSTAT,
            Setstat { .. } => SSH_FXP_SETSTAT,
            Fsetstat { .. } => SSH_FXP_FSETSTAT,
            Opendir(_) => SSH_FXP_OPENDIR,
            Readdir(_) => SSH_FXP_READDIR,
            Remove(_) => SSH_FXP_REMOVE,
            Mkdir { .. } => SSH_FXP_MKDIR,
            Rmdir(_) => SSH_FXP_RMDIR,
            Realpath(_) => SSH_FXP_REALPATH,
            Stat(_) => SSH_FXP_STAT,
            Rename { .. } => SSH_FXP_RENAME,
            Readlink(_) => SSH_FXP_READLINK,
            Symlink { .. } => SSH_FXP_SYMLINK,
            Extended { .. } => SSH_FXP_EXTENDED,
        }
    }

    /// `limits@openssh.com`, answered with an `ExtendedReply`.
    pub fn limits() -> Self {
        Self::Extended {
            request: Bytes::from_static(EXT_LIMITS.as_bytes()),
            data: Bytes::new(),
        }
    }

    /// `fsync@openssh.com`, answered with a `Status`.
    pub fn fsync(handle: &Handle) -> Self {
        let mut data = BytesMut::new();
        handle.encode(&mut data);

        Self::Extended {
            request: Bytes::from_static(EXT_FSYNC.as_bytes()),
            data: data.freeze(),
        }
    }

    /// `posix-rename@openssh.com`, answered with a `Status`.
    pub fn posix_rename(oldpath: Bytes, newpath: Bytes) -> Self {
        Self::extended_with_two_paths(EXT_POSIX_RENAME, oldpath, newpath)
    }

    /// `hardlink@openssh.com`, answered with a `Status`.
    pub fn hardlink(oldpath: Bytes, newpath: Bytes) -> Self {
        Self::extended_with_two_paths(EXT_HARDLINK, oldpath, newpath)
    }

    fn extended_with_two_paths(name: &'static str, first: Bytes, second: Bytes) -> Self {
        let mut data = BytesMut::new();
        first.encode(&mut data);
        second.encode(&mut data);

        Self::Extended {
            request: Bytes::from_static(name.as_bytes()),
            data: data.freeze(),
        }
    }
}

/// A request packet, `SSH_FXP_INIT` excluded.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Request {
    pub request_id: u32,
    pub inner: RequestInner,
}

impl Request {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        use RequestInner::*;

        let start = begin_packet(buf);
        buf.put_u8(self.inner.packet_type());
        buf.put_u32(self.request_id);

        match &self.inner {
            Open {
                filename,
                flags,
                attrs,
            } => {
                filename.encode(buf);
                buf.put_u32(flags.bits());
                attrs.encode(buf);
            }
            Close(handle) | Fstat(handle) | Readdir(handle) => handle.encode(buf),
            Read {
                handle,
                offset,
                len,
            } => {
                handle.encode(buf);
                buf.put_u64(*offset);
                buf.put_u32(*len);
            }
            Write {
                handle,
                offset,
                data,
            } => {
                handle.encode(buf);
                buf.put_u64(*offset);
                data.encode(buf);
            }
            Lstat(path) | Opendir(path) | Remove(path) | Rmdir(path) | Realpath(path)
            | Stat(path) | Readlink(path) => path.encode(buf),
            Setstat { path, attrs } | Mkdir { path, attrs } => {
                path.encode(buf);
                attrs.encode(buf);
            }
            Fsetstat { handle, attrs } => {
                handle.encode(buf);
                attrs.encode(buf);
            }
            Rename { oldpath, newpath } => {
                oldpath.encode(buf);
                newpath.encode(buf);
            }
            Symlink {
                linkpath,
                targetpath,
            } => {
                targetpath.encode(buf);
                linkpath.encode(buf);
            }
            Extended { request, data } => {
                request.encode(buf);
                buf.put_slice(data);
            }
        }

        finish_packet(buf, start);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// * `packet` - includes the 4-byte length header.
    pub fn decode(packet: Bytes) -> Result<Self, Error> {
        Self::decode_body(open_packet(packet)?)
    }

    /// * `body` - excludes the 4-byte length header.
    pub fn decode_body(mut body: Bytes) -> Result<Self, Error> {
        use RequestInner::*;

        let buf = &mut body;

        let packet_type = u8::decode(buf)?;
        let request_id = u32::decode(buf)?;

        let inner = match packet_type {
            SSH_FXP_OPEN => Open {
                filename: Bytes::decode(buf)?,
                flags: OpenFlags::from_bits_retain(u32::decode(buf)?),
                attrs: FileAttrs::decode(buf)?,
            },
            SSH_FXP_CLOSE => Close(Handle::decode(buf)?),
            SSH_FXP_READ => Read {
                handle: Handle::decode(buf)?,
                offset: u64::decode(buf)?,
                len: u32::decode(buf)?,
            },
            SSH_FXP_WRITE => Write {
                handle: Handle::decode(buf)?,
                offset: u64::decode(buf)?,
                data: Bytes::decode(buf)?,
            },
            SSH_FXP_LSTAT => Lstat(Bytes::decode(buf)?),
            SSH_FXP_FSTAT => Fstat(Handle::decode(buf)?),
            SSH_FXP_SETSTAT => Setstat {
                path: Bytes::decode(buf)?,
                attrs: FileAttrs::decode(buf)?,
            },
            SSH_FXP_FSETSTAT => Fsetstat {
                handle: Handle::decode(buf)?,
                attrs: FileAttrs::decode(buf)?,
            },
            SSH_FXP_OPENDIR => Opendir(Bytes::decode(buf)?),
            SSH_FXP_READDIR => Readdir(Handle::decode(buf)?),
            SSH_FXP_REMOVE => Remove(Bytes::decode(buf)?),
            SSH_FXP_MKDIR => Mkdir {
                path: Bytes::decode(buf)?,
                attrs: FileAttrs::decode(buf)?,
            },
            SSH_FXP_RMDIR => Rmdir(Bytes::decode(buf)?),
            SSH_FXP_REALPATH => Realpath(Bytes::decode(buf)?),
            SSH_FXP_STAT => Stat(Bytes::decode(buf)?),
            SSH_FXP_RENAME => Rename {
                oldpath: Bytes::decode(buf)?,
                newpath: Bytes::decode(buf)?,
            },
            SSH_FXP_READLINK => Readlink(Bytes::decode(buf)?),
            SSH_FXP_SYMLINK => {
                let targetpath = Bytes::decode(buf)?;
                let linkpath = Bytes::decode(buf)?;
                Symlink {
                    linkpath,
                    targetpath,
                }
            }
            SSH_FXP_EXTENDED => {
                let request = Bytes::decode(buf)?;
                let data = buf.split_off(0);
                Extended { request, data }
            }
            _ => return Err(Error::MalformedPacket(&"unknown request type")),
        };

        ensure_consumed(&body)?;

        Ok(Self { request_id, inner })
    }
}

/// Split the payload of an extended request that carries two paths.
pub fn decode_two_paths(mut data: Bytes) -> Result<(Bytes, Bytes), Error> {
    let first = Bytes::decode(&mut data)?;
    let second = Bytes::decode(&mut data)?;
    ensure_consumed(&data)?;
    Ok((first, second))
}

/// Decode the handle carried by `fsync@openssh.com`.
pub fn decode_handle(mut data: Bytes) -> Result<Handle, Error> {
    let handle = Handle::decode(&mut data)?;
    ensure_consumed(&data)?;
    Ok(handle)
}
