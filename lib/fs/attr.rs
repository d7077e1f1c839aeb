use std::time::{Duration, SystemTime};

use super::{EntryAttributes, FileKind, InodePerms};

const S_IFMT: u32 = 0o170_000;

impl FileKind {
    /// The `S_IF*` bits for this kind.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        u32::from(match self {
            Self::File => libc::S_IFREG,
            Self::Directory => libc::S_IFDIR,
            Self::Symlink => libc::S_IFLNK,
            Self::CharDevice => libc::S_IFCHR,
            Self::BlockDevice => libc::S_IFBLK,
            Self::NamedPipe => libc::S_IFIFO,
            Self::Socket => libc::S_IFSOCK,
        })
    }

    /// Decode the file type bits of a `st_mode` value.
    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        let bits = mode & S_IFMT;
        [
            Self::File,
            Self::Directory,
            Self::Symlink,
            Self::CharDevice,
            Self::BlockDevice,
            Self::NamedPipe,
            Self::Socket,
        ]
        .into_iter()
        .find(|kind| kind.mode_bits() == bits)
    }
}

impl InodePerms {
    /// Extract the permission bits of a `st_mode` value.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "masked to the low 12 bits before narrowing"
    )]
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate((mode & 0o7777) as u16)
    }
}

impl EntryAttributes {
    /// The full `st_mode`: file type bits plus permissions.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | u32::from(self.perm.bits())
    }

    /// Set `kind` and `perm` from a `st_mode` value. Unknown type bits leave `kind` alone.
    pub fn set_mode(&mut self, mode: u32) {
        if let Some(kind) = FileKind::from_mode(mode) {
            self.kind = kind;
        }
        self.perm = InodePerms::from_mode(mode);
    }

    /// Validity for an entry reply (`lookup`, `mknod`, `mkdir`, `symlink`, `link`, `create`).
    ///
    /// `fuser` sends one TTL for both the name and the attributes it carries, so the shorter of
    /// the two timeouts is used. A longer `attr_timeout` still applies to `getattr`/`setattr`.
    #[must_use]
    pub fn entry_reply_ttl(&self) -> Duration {
        self.entry_timeout.min(self.attr_timeout)
    }
}

fn to_systime(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.unsigned_abs());
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs.cast_unsigned()) + nanos
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

/// Mirror the attributes of a host file, for pass-through file systems.
///
/// Fails with the raw `st_mode` when the file type is not one [`FileKind`] knows.
impl TryFrom<std::fs::Metadata> for EntryAttributes {
    type Error = u32;

    #[expect(
        clippy::cast_possible_truncation,
        reason = "nlink/blksize/rdev narrowing matches the FUSE attribute layout"
    )]
    fn try_from(meta: std::fs::Metadata) -> Result<Self, Self::Error> {
        use std::os::unix::fs::MetadataExt as _;

        let kind = FileKind::from_mode(meta.mode()).ok_or(meta.mode())?;
        Ok(Self {
            perm: InodePerms::from_mode(meta.mode()),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            size: meta.size(),
            blksize: meta.blksize() as u32,
            blocks: meta.blocks(),
            atime: to_systime(meta.atime(), meta.atime_nsec()),
            mtime: to_systime(meta.mtime(), meta.mtime_nsec()),
            ctime: to_systime(meta.ctime(), meta.ctime_nsec()),
            // Not available in std::fs::Metadata.
            crtime: SystemTime::UNIX_EPOCH,
            ..Self::new(meta.ino(), kind)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn mode_combines_kind_and_perm() {
        let mut attr = EntryAttributes::new(2, FileKind::File);
        attr.perm = InodePerms::from_mode(0o644);
        assert_eq!(attr.mode(), 0o100_644);

        attr.set_mode(0o040_755);
        assert_eq!(attr.kind, FileKind::Directory);
        assert_eq!(attr.perm, InodePerms::from_mode(0o755));
    }

    #[test]
    fn entry_replies_use_the_shorter_timeout() {
        let mut attr = EntryAttributes::new(2, FileKind::File);
        attr.entry_timeout = Duration::from_secs(30);
        attr.attr_timeout = Duration::from_secs(2);
        assert_eq!(attr.entry_reply_ttl(), Duration::from_secs(2));

        attr.attr_timeout = Duration::from_secs(60);
        assert_eq!(attr.entry_reply_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn unknown_type_bits_are_rejected() {
        assert_eq!(FileKind::from_mode(0o644), None);
        assert_eq!(FileKind::from_mode(0o120_777), Some(FileKind::Symlink));
    }

    #[test]
    fn metadata_of_a_temp_dir_is_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let meta = std::fs::metadata(dir.path()).unwrap();
        let attr = EntryAttributes::try_from(meta).unwrap();
        assert_eq!(attr.kind, FileKind::Directory);
        assert_ne!(attr.ino, 0);
        assert!(attr.mtime > SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn negative_seconds_land_before_the_epoch() {
        let t = to_systime(-2, 500_000_000);
        assert_eq!(
            SystemTime::UNIX_EPOCH.duration_since(t).unwrap(),
            Duration::from_millis(1500)
        );
    }
}
