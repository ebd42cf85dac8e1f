use super::constants::*;
use super::wire::{begin_packet, ensure_consumed, finish_packet, open_packet, Decode, Encode};
use super::{Error, FileAttrs, Handle, SftpErrMsg, SftpErrorKind};

use bytes::{BufMut, Bytes, BytesMut};

/// Extensions advertised by the server in `SSH_FXP_VERSION` that this
/// crate knows how to use.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Extensions {
    pub limits: bool,
    pub fsync: bool,
    pub posix_rename: bool,
    pub hardlink: bool,
}

impl Extensions {
    pub fn new(pairs: &[(Bytes, Bytes)]) -> Self {
        let mut extensions = Self::default();

        for (name, _data) in pairs {
            match &name[..] {
                name if name == EXT_LIMITS.as_bytes() => extensions.limits = true,
                name if name == EXT_FSYNC.as_bytes() => extensions.fsync = true,
                name if name == EXT_POSIX_RENAME.as_bytes() => extensions.posix_rename = true,
                name if name == EXT_HARDLINK.as_bytes() => extensions.hardlink = true,
                _ => (),
            }
        }

        extensions
    }
}

/// `SSH_FXP_VERSION`, the server's answer to `SSH_FXP_INIT`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerVersion {
    pub version: u32,
    pub extensions: Vec<(Bytes, Bytes)>,
}

impl ServerVersion {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let start = begin_packet(buf);
        buf.put_u8(SSH_FXP_VERSION);
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
        if u8::decode(&mut body)? != SSH_FXP_VERSION {
            return Err(Error::MalformedPacket(&"expected SSH_FXP_VERSION"));
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

/// Reply to `limits@openssh.com`.
///
/// Zero means the server does not impose a limit.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Limits {
    pub packet_len: u64,
    pub read_len: u64,
    pub write_len: u64,
    pub open_handles: u64,
}

impl Limits {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u64(self.packet_len);
        buf.put_u64(self.read_len);
        buf.put_u64(self.write_len);
        buf.put_u64(self.open_handles);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self, Error> {
        let limits = Self {
            packet_len: u64::decode(&mut data)?,
            read_len: u64::decode(&mut data)?,
            write_len: u64::decode(&mut data)?,
            open_handles: u64::decode(&mut data)?,
        };
        ensure_consumed(&data)?;
        Ok(limits)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatusCode {
    Success,
    Failure(SftpErrorKind),
}

impl StatusCode {
    fn from_raw(code: u32) -> Self {
        use SftpErrorKind::*;

        Self::Failure(match code {
            SSH_FX_OK => return Self::Success,
            SSH_FX_EOF => Eof,
            SSH_FX_NO_SUCH_FILE => NoSuchFile,
            SSH_FX_PERMISSION_DENIED => PermDenied,
            SSH_FX_FAILURE => Failure,
            SSH_FX_BAD_MESSAGE => BadMessage,
            SSH_FX_NO_CONNECTION => NoConnection,
            SSH_FX_CONNECTION_LOST => ConnectionLost,
            SSH_FX_OP_UNSUPPORTED => OpUnsupported,
            code => Unknown(code),
        })
    }

    fn into_raw(self) -> u32 {
        use SftpErrorKind::*;

        match self {
            Self::Success => SSH_FX_OK,
            Self::Failure(kind) => match kind {
                Eof => SSH_FX_EOF,
                NoSuchFile => SSH_FX_NO_SUCH_FILE,
                PermDenied => SSH_FX_PERMISSION_DENIED,
                Failure => SSH_FX_FAILURE,
                BadMessage => SSH_FX_BAD_MESSAGE,
                NoConnection => SSH_FX_NO_CONNECTION,
                ConnectionLost => SSH_FX_CONNECTION_LOST,
                OpUnsupported => SSH_FX_OP_UNSUPPORTED,
                Unknown(code) => code,
            },
        }
    }
}

/// One entry of `SSH_FXP_NAME`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NameEntry {
    /// Only the basename for `SSH_FXP_READDIR`, the full path for
    /// `SSH_FXP_REALPATH`.
    pub filename: Bytes,

    /// `ls -l` style line, not meant to be parsed.
    pub longname: Bytes,

    pub attrs: FileAttrs,
}

impl Encode for NameEntry {
    fn encode(&self, buf: &mut BytesMut) {
        self.filename.encode(buf);
        self.longname.encode(buf);
        self.attrs.encode(buf);
    }
}

impl Decode for NameEntry {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Ok(Self {
            filename: Bytes::decode(buf)?,
            longname: Bytes::decode(buf)?,
            attrs: FileAttrs::decode(buf)?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResponseInner {
    Status {
        status_code: StatusCode,
        err_msg: SftpErrMsg,
    },

    Handle(Handle),

    Data(Bytes),

    Name(Vec<NameEntry>),

    Attrs(FileAttrs),

    /// The request specific payload of `SSH_FXP_EXTENDED_REPLY`.
    ExtendedReply(Bytes),
}

impl ResponseInner {
    fn packet_type(&self) -> u8 {
        match self {
            Self::Status { .. } => SSH_FXP_STATUS,
            Self::Handle(_) => SSH_FXP_HANDLE,
            Self::Data(_) => SSH_FXP_DATA,
            Self::Name(_) => SSH_FXP_NAME,
            Self::Attrs(_) => SSH_FXP_ATTRS,
            Self::ExtendedReply(_) => SSH_FXP_EXTENDED_REPLY,
        }
    }

    /// Convenience constructor for a status response.
    pub fn status(status_code: StatusCode, err_msg: &str) -> Self {
        Self::Status {
            status_code,
            err_msg: SftpErrMsg {
                err_msg: err_msg.into(),
                language_tag: "en".into(),
            },
        }
    }
}

/// A response packet, `SSH_FXP_VERSION` excluded.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Response {
    pub response_id: u32,
    pub inner: ResponseInner,
}

fn decode_text(buf: &mut Bytes) -> Result<Box<str>, Error> {
    let bytes = Bytes::decode(buf)?;
    Ok(String::from_utf8_lossy(&bytes).into())
}

impl Response {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        use ResponseInner as R;

        let start = begin_packet(buf);
        buf.put_u8(self.inner.packet_type());
        buf.put_u32(self.response_id);

        match &self.inner {
            R::Status {
                status_code,
                err_msg,
            } => {
                buf.put_u32(status_code.into_raw());
                err_msg.err_msg.as_bytes().encode(buf);
                err_msg.language_tag.as_bytes().encode(buf);
            }
            R::Handle(handle) => handle.encode(buf),
            R::Data(data) => data.encode(buf),
            R::Name(entries) => {
                buf.put_u32(entries.len() as u32);
                for entry in entries {
                    entry.encode(buf);
                }
            }
            R::Attrs(attrs) => attrs.encode(buf),
            R::ExtendedReply(data) => buf.put_slice(data),
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
        use ResponseInner as R;

        let buf = &mut body;

        let packet_type = u8::decode(buf)?;
        let response_id = u32::decode(buf)?;

        let inner = match packet_type {
            SSH_FXP_STATUS => {
                let status_code = StatusCode::from_raw(u32::decode(buf)?);

                // Servers predating the draft omit the message and
                // the language tag.
                let err_msg = if buf.is_empty() {
                    SftpErrMsg::default()
                } else {
                    SftpErrMsg {
                        err_msg: decode_text(buf)?,
                        language_tag: decode_text(buf)?,
                    }
                };

                R::Status {
                    status_code,
                    err_msg,
                }
            }
            SSH_FXP_HANDLE => R::Handle(Handle::decode(buf)?),
            SSH_FXP_DATA => R::Data(Bytes::decode(buf)?),
            SSH_FXP_NAME => {
                let count = u32::decode(buf)? as usize;

                // Each entry takes at least 12 bytes.
                if count > buf.len() / 12 {
                    return Err(Error::MalformedPacket(&"name count exceeds packet"));
                }

                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(NameEntry::decode(buf)?);
                }
                R::Name(entries)
            }
            SSH_FXP_ATTRS => R::Attrs(FileAttrs::decode(buf)?),
            SSH_FXP_EXTENDED_REPLY => R::ExtendedReply(buf.split_off(0)),
            _ => return Err(Error::MalformedPacket(&"unknown response type")),
        };

        ensure_consumed(&body)?;

        Ok(Self { response_id, inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UnixTimeStamp;

    use pretty_assertions::assert_eq;

    fn round_trip(inner: ResponseInner) {
        let response = Response {
            response_id: 77,
            inner,
        };
        assert_eq!(Response::decode(response.encode()).unwrap(), response);
    }

    #[test]
    fn responses_round_trip() {
        let mut attrs = FileAttrs::new();
        attrs.set_size(120);
        attrs.set_id(1000, 1000);
        attrs.set_mode(0o100644);
        attrs.set_time(UnixTimeStamp::from_raw(1), UnixTimeStamp::from_raw(2));

        for inner in [
            ResponseInner::status(StatusCode::Success, "ok"),
            ResponseInner::status(StatusCode::Failure(SftpErrorKind::NoSuchFile), "gone"),
            ResponseInner::status(StatusCode::Failure(SftpErrorKind::Unknown(99)), ""),
            ResponseInner::Handle(Handle::new(Bytes::from_static(b"abc")).unwrap()),
            ResponseInner::Data(Bytes::from_static(b"chunk")),
            ResponseInner::Data(Bytes::new()),
            ResponseInner::Name(vec![
                NameEntry {
                    filename: Bytes::from_static(b"docs"),
                    longname: Bytes::from_static(b"drwxr-xr-x docs"),
                    attrs: FileAttrs::new(),
                },
                NameEntry {
                    filename: Bytes::from_static(b"a.txt"),
                    longname: Bytes::new(),
                    attrs: attrs.clone(),
                },
            ]),
            ResponseInner::Attrs(attrs),
            ResponseInner::ExtendedReply(
                Limits {
                    packet_len: 1,
                    read_len: 2,
                    write_len: 3,
                    open_handles: 4,
                }
                .encode(),
            ),
        ] {
            round_trip(inner);
        }
    }

    #[test]
    fn status_without_message() {
        let packet = Bytes::from_static(&[0, 0, 0, 9, SSH_FXP_STATUS, 0, 0, 0, 5, 0, 0, 0, 1]);
        let response = Response::decode(packet).unwrap();

        assert_eq!(response.response_id, 5);
        assert_eq!(
            response.inner,
            ResponseInner::Status {
                status_code: StatusCode::Failure(SftpErrorKind::Eof),
                err_msg: SftpErrMsg::default(),
            }
        );
    }

    #[test]
    fn unknown_response_type() {
        let packet = Bytes::from_static(&[0, 0, 0, 5, 150, 0, 0, 0, 1]);
        assert!(matches!(
            Response::decode(packet),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn truncated_response() {
        let full = Response {
            response_id: 1,
            inner: ResponseInner::Data(Bytes::from_static(b"0123456789")),
        }
        .encode();

        // Keep the original length header but drop the tail.
        let truncated = full.slice(..full.len() - 3);
        assert!(matches!(
            Response::decode(truncated),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn version_round_trip() {
        let version = ServerVersion {
            version: SSH2_FILEXFER_VERSION,
            extensions: vec![
                (
                    Bytes::from_static(EXT_LIMITS.as_bytes()),
                    Bytes::from_static(b"1"),
                ),
                (
                    Bytes::from_static(EXT_FSYNC.as_bytes()),
                    Bytes::from_static(b"1"),
                ),
            ],
        };
        let decoded = ServerVersion::decode(version.encode()).unwrap();
        assert_eq!(decoded, version);

        let extensions = Extensions::new(&decoded.extensions);
        assert!(extensions.limits);
        assert!(extensions.fsync);
        assert!(!extensions.posix_rename);
    }
}
