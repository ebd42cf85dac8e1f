use super::constants::*;
use super::wire::{decode_pairs, Decode, Encode};
use super::Error;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// Type of a file, derived from the `S_IFMT` bits of the permissions field.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    FIFO,
    Socket,
    BlockDevice,
    CharacterDevice,
}

impl FileType {
    fn from_mode(mode: u32) -> Option<Self> {
        use FileType::*;

        match mode & S_IFMT {
            S_IFREG => Some(RegularFile),
            S_IFDIR => Some(Directory),
            S_IFLNK => Some(Symlink),
            S_IFIFO => Some(FIFO),
            S_IFSOCK => Some(Socket),
            S_IFBLK => Some(BlockDevice),
            S_IFCHR => Some(CharacterDevice),
            _ => None,
        }
    }

    /// The `S_IFMT` bits of this type.
    pub const fn to_mode(self) -> u32 {
        use FileType::*;

        match self {
            RegularFile => S_IFREG,
            Directory => S_IFDIR,
            Symlink => S_IFLNK,
            FIFO => S_IFIFO,
            Socket => S_IFSOCK,
            BlockDevice => S_IFBLK,
            CharacterDevice => S_IFCHR,
        }
    }
}

bitflags! {
    /// Permission bits, the lower 12 bits of the mode.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Permissions: u32 {
        const SET_UID = 0o4000;
        const SET_GID = 0o2000;
        const SET_VTX = 0o1000;

        const READ_BY_OWNER = 0o400;
        const WRITE_BY_OWNER = 0o200;
        const EXECUTE_BY_OWNER = 0o100;

        const READ_BY_GROUP = 0o40;
        const WRITE_BY_GROUP = 0o20;
        const EXECUTE_BY_GROUP = 0o10;

        const READ_BY_OTHER = 0o4;
        const WRITE_BY_OTHER = 0o2;
        const EXECUTE_BY_OTHER = 0o1;
    }
}

/// Default value is 1970-01-01 00:00:00 UTC.
///
/// UnixTimeStamp stores number of seconds elapsed since 1970-01-01 00:00:00 UTC
/// as `u32`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct UnixTimeStamp(u32);

impl UnixTimeStamp {
    /// Create new unix timestamp from `system_time`.
    ///
    /// Return `None` if it is before the unix epoch or does not fit in `u32`.
    pub fn new(system_time: SystemTime) -> Option<Self> {
        let secs = system_time.duration_since(UNIX_EPOCH).ok()?.as_secs();
        u32::try_from(secs).ok().map(Self)
    }

    /// Return unix epoch, same as [`UnixTimeStamp::default`]
    pub const fn unix_epoch() -> Self {
        Self(0)
    }

    pub const fn from_raw(elapsed: u32) -> Self {
        Self(elapsed)
    }

    /// Into `u32` which is used to internally store the timestamp in seconds.
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    /// Convert timestamp to [`Duration`].
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0.into())
    }

    /// Convert timestamp back to [`SystemTime`].
    pub fn as_system_time(self) -> SystemTime {
        UNIX_EPOCH + self.as_duration()
    }
}

/// Attribute block of sftp v3.
///
/// Every field is optional; on the wire a presence bitmask precedes the
/// fields and the fields appear in the order their bits are tested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    size: Option<u64>,
    id: Option<(u32, u32)>,
    mode: Option<u32>,
    time: Option<(u32, u32)>,
    extended: Vec<(Bytes, Bytes)>,
}

impl FileAttrs {
    pub const fn new() -> Self {
        Self {
            size: None,
            id: None,
            mode: None,
            time: None,
            extended: Vec::new(),
        }
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = Some(size);
    }

    pub fn get_size(&self) -> Option<u64> {
        self.size
    }

    pub fn set_id(&mut self, uid: u32, gid: u32) {
        self.id = Some((uid, gid));
    }

    /// Return `(uid, gid)`.
    pub fn get_id(&self) -> Option<(u32, u32)> {
        self.id
    }

    /// Set only the permission bits, the file type bits are left unset.
    pub fn set_permissions(&mut self, permissions: Permissions) {
        self.mode = Some(permissions.bits());
    }

    pub fn get_permissions(&self) -> Option<Permissions> {
        self.mode.map(Permissions::from_bits_truncate)
    }

    /// Set the raw mode, including the file type bits.
    pub fn set_mode(&mut self, mode: u32) {
        self.mode = Some(mode);
    }

    pub fn get_mode(&self) -> Option<u32> {
        self.mode
    }

    pub fn get_filetype(&self) -> Option<FileType> {
        self.mode.and_then(FileType::from_mode)
    }

    pub fn set_time(&mut self, accessed: UnixTimeStamp, modified: UnixTimeStamp) {
        self.time = Some((accessed.into_raw(), modified.into_raw()));
    }

    /// Return `(atime, mtime)`.
    pub fn get_time(&self) -> Option<(UnixTimeStamp, UnixTimeStamp)> {
        self.time
            .map(|(atime, mtime)| (UnixTimeStamp(atime), UnixTimeStamp(mtime)))
    }

    pub fn push_extended(&mut self, extension_type: Bytes, extension_data: Bytes) {
        self.extended.push((extension_type, extension_data));
    }

    pub fn extended(&self) -> &[(Bytes, Bytes)] {
        &self.extended
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.id.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.mode.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.time.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= SSH_FILEXFER_ATTR_EXTENDED;
        }
        flags
    }
}

const KNOWN_FLAGS: u32 = SSH_FILEXFER_ATTR_SIZE
    | SSH_FILEXFER_ATTR_UIDGID
    | SSH_FILEXFER_ATTR_PERMISSIONS
    | SSH_FILEXFER_ATTR_ACMODTIME
    | SSH_FILEXFER_ATTR_EXTENDED;

impl Encode for FileAttrs {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.flags());

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((uid, gid)) = self.id {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(mode) = self.mode {
            buf.put_u32(mode);
        }
        if let Some((atime, mtime)) = self.time {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
        if !self.extended.is_empty() {
            self.extended[..].encode(buf);
        }
    }
}

impl Decode for FileAttrs {
    fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let flags = u32::decode(buf)?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(Error::MalformedPacket(&"unknown attribute flags"));
        }

        let mut attrs = FileAttrs::new();

        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(u64::decode(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.id = Some((u32::decode(buf)?, u32::decode(buf)?));
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.mode = Some(u32::decode(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.time = Some((u32::decode(buf)?, u32::decode(buf)?));
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            attrs.extended = decode_pairs(buf)?;
        }

        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn empty_attrs_is_just_flags() {
        let mut buf = BytesMut::new();
        FileAttrs::new().encode(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn fields_follow_flags_in_order() {
        let mut attrs = FileAttrs::new();
        attrs.set_time(UnixTimeStamp::from_raw(7), UnixTimeStamp::from_raw(9));
        attrs.set_size(0x10);

        let mut buf = BytesMut::new();
        attrs.encode(&mut buf);

        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 0x09, // SIZE | ACMODTIME
                0, 0, 0, 0, 0, 0, 0, 0x10, // size
                0, 0, 0, 7, // atime
                0, 0, 0, 9, // mtime
            ]
        );

        let decoded = FileAttrs::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, attrs);
    }

    #[test]
    fn file_type_from_mode() {
        let mut attrs = FileAttrs::new();
        attrs.set_mode(0o040755);

        assert_eq!(attrs.get_filetype(), Some(FileType::Directory));
        assert_eq!(
            attrs.get_permissions(),
            Some(Permissions::from_bits_truncate(0o755))
        );
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let mut buf = Bytes::from_static(&[0, 0, 0, 0x40]);
        assert!(matches!(
            FileAttrs::decode(&mut buf),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn missing_field_is_truncation() {
        // SIZE flag set but only 4 bytes of the u64 present.
        let mut buf = Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 0]);
        assert!(matches!(
            FileAttrs::decode(&mut buf),
            Err(Error::MalformedPacket(_))
        ));
    }
}
