use super::{
    lowlevel::{FileAttrs, FileType as SftpFileType, Permissions as SftpPermissions},
    UnixTimeStamp,
};

/// Attributes to change with [`crate::fs::Fs::set_metadata`] or
/// [`crate::file::File::set_metadata`].
///
/// Attributes that are not set are left untouched by the server.
#[derive(Debug, Default, Clone)]
pub struct MetaDataBuilder(FileAttrs);

impl MetaDataBuilder {
    pub const fn new() -> Self {
        Self(FileAttrs::new())
    }

    /// Change the owner to `(uid, gid)`.
    pub fn id(&mut self, (uid, gid): (u32, u32)) -> &mut Self {
        self.0.set_id(uid, gid);
        self
    }

    pub fn permissions(&mut self, perm: Permissions) -> &mut Self {
        self.0.set_permissions(perm.0);
        self
    }

    /// Truncate or extend the file to `len` bytes.
    pub fn len(&mut self, len: u64) -> &mut Self {
        self.0.set_size(len);
        self
    }

    pub fn time(&mut self, accessed: UnixTimeStamp, modified: UnixTimeStamp) -> &mut Self {
        self.0.set_time(accessed, modified);
        self
    }

    pub fn create(&self) -> MetaData {
        MetaData::new(self.0.clone())
    }
}

/// Attributes of a remote file, as reported by the server.
///
/// The server may leave any of them out, hence every getter returns an
/// [`Option`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MetaData(FileAttrs);

#[allow(clippy::len_without_is_empty)]
impl MetaData {
    pub(super) fn new(attrs: FileAttrs) -> Self {
        Self(attrs)
    }

    pub(super) fn into_inner(self) -> FileAttrs {
        self.0
    }

    /// Size in bytes.
    pub fn len(&self) -> Option<u64> {
        self.0.get_size()
    }

    pub fn uid(&self) -> Option<u32> {
        self.0.get_id().map(|(uid, _)| uid)
    }

    pub fn gid(&self) -> Option<u32> {
        self.0.get_id().map(|(_, gid)| gid)
    }

    pub fn permissions(&self) -> Option<Permissions> {
        self.0.get_permissions().map(Permissions)
    }

    /// Return `None` if the mode is missing or its type bits are unknown.
    pub fn file_type(&self) -> Option<FileType> {
        self.0.get_filetype().map(FileType)
    }

    pub fn accessed(&self) -> Option<UnixTimeStamp> {
        self.0.get_time().map(|(accessed, _)| accessed)
    }

    pub fn modified(&self) -> Option<UnixTimeStamp> {
        self.0.get_time().map(|(_, modified)| modified)
    }
}

/// Type of a remote file, returned by [`MetaData::file_type`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FileType(SftpFileType);

impl FileType {
    pub fn is_dir(&self) -> bool {
        self.0 == SftpFileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.0 == SftpFileType::RegularFile
    }

    pub fn is_symlink(&self) -> bool {
        self.0 == SftpFileType::Symlink
    }

    /// Sockets, fifos and devices.
    pub fn is_special(&self) -> bool {
        !(self.is_dir() || self.is_file() || self.is_symlink())
    }
}

/// Whose access a permission bit grants.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Class {
    Owner,
    Group,
    Other,
}

impl Class {
    /// `(read, write, execute)` bits of the class.
    fn bits(self) -> [SftpPermissions; 3] {
        use SftpPermissions as P;

        match self {
            Class::Owner => [P::READ_BY_OWNER, P::WRITE_BY_OWNER, P::EXECUTE_BY_OWNER],
            Class::Group => [P::READ_BY_GROUP, P::WRITE_BY_GROUP, P::EXECUTE_BY_GROUP],
            Class::Other => [P::READ_BY_OTHER, P::WRITE_BY_OTHER, P::EXECUTE_BY_OTHER],
        }
    }
}

/// Permission bits of a file, without its type bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Permissions(SftpPermissions);

impl Permissions {
    /// No permission at all.
    pub const fn new() -> Self {
        Self(SftpPermissions::empty())
    }

    pub fn can_read(&self, class: Class) -> bool {
        self.0.contains(class.bits()[0])
    }

    pub fn can_write(&self, class: Class) -> bool {
        self.0.contains(class.bits()[1])
    }

    pub fn can_execute(&self, class: Class) -> bool {
        self.0.contains(class.bits()[2])
    }

    /// Replace the `rwx` bits of `class`.
    pub fn set(&mut self, class: Class, read: bool, write: bool, execute: bool) -> &mut Self {
        let [r, w, x] = class.bits();

        self.0.set(r, read);
        self.0.set(w, write);
        self.0.set(x, execute);
        self
    }

    /// The `rwx` string of `class`, `-` standing for a missing bit.
    pub fn triad(&self, class: Class) -> String {
        class
            .bits()
            .iter()
            .zip(['r', 'w', 'x'])
            .map(|(bit, c)| if self.0.contains(*bit) { c } else { '-' })
            .collect()
    }

    /// Return `true` if nobody can write to the file.
    pub fn readonly(&self) -> bool {
        [Class::Owner, Class::Group, Class::Other]
            .into_iter()
            .all(|class| !self.can_write(class))
    }

    /// Numeric mode, such as `0o644`.
    pub fn mode(&self) -> u32 {
        self.0.bits()
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u32> for Permissions {
    /// Type bits of `mode` are dropped.
    fn from(mode: u32) -> Self {
        Self(SftpPermissions::from_bits_truncate(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_from_mode() {
        let perm = Permissions::from(0o100_640);

        assert!(perm.can_read(Class::Owner));
        assert!(perm.can_write(Class::Owner));
        assert!(!perm.can_execute(Class::Owner));
        assert!(perm.can_read(Class::Group));
        assert!(!perm.can_write(Class::Group));
        assert!(!perm.can_read(Class::Other));
        assert_eq!(perm.mode(), 0o640);
        assert_eq!(perm.triad(Class::Owner), "rw-");
        assert!(!perm.readonly());
    }

    #[test]
    fn permissions_set() {
        let mut perm = Permissions::new();
        perm.set(Class::Owner, true, false, true)
            .set(Class::Other, true, false, false);

        assert_eq!(perm.mode(), 0o504);
        assert!(perm.readonly());
    }

    #[test]
    fn metadata_getters() {
        let mut attrs = FileAttrs::new();
        attrs.set_mode(0o040_755);
        attrs.set_size(4096);
        attrs.set_time(UnixTimeStamp::from_raw(1), UnixTimeStamp::from_raw(2));

        let metadata = MetaData::new(attrs);
        assert!(metadata.file_type().unwrap().is_dir());
        assert_eq!(metadata.len(), Some(4096));
        assert_eq!(metadata.accessed(), Some(UnixTimeStamp::from_raw(1)));
        assert_eq!(metadata.modified(), Some(UnixTimeStamp::from_raw(2)));
        assert_eq!(metadata.uid(), None);
    }
}
