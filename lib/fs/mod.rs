//! Request dispatch, inode lifecycle and the types shared by handlers and transports.

/// Attribute conversions between [`EntryAttributes`], file modes and `std::fs::Metadata`.
pub mod attr;
/// Routes decoded requests to an [`ops::Operations`] implementation.
pub mod dispatch;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`dispatch::Dispatcher`].
pub mod fuser;
/// A read-only file system exposing one file.
pub mod hello;
/// Per-inode count of references held by the kernel.
pub mod ledger;
/// Directory-entry table with stable readdir cursors and atomic rename.
pub mod namespace;
/// Out-of-band cache invalidation towards the kernel.
pub mod notify;
/// The handler capability set.
pub mod ops;
/// Readdir reply sink and dirent buffers.
pub mod readdir;

pub use dispatch::Dispatcher;
pub use ledger::Ledger;
pub use notify::Invalidator;
pub use ops::Operations;
pub use readdir::ReaddirSink;

use std::time::{Duration, SystemTime};

use bitflags::bitflags;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// The root directory. Never returned by `lookup` as a fresh allocation.
pub const ROOT_INODE: InodeAddr = 1;

/// Identity of the process that issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequestContext {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
    /// Process id. Zero for requests the kernel issues on its own behalf.
    pub pid: u32,
    /// File mode creation mask, applied by the handler to `mode` arguments.
    pub umask: u32,
}

bitflags! {
    /// Permission bits for an inode, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;

        /// Other: read, write, and execute.
        const OTHER_RWX = Self::OTHER_READ.bits()
            | Self::OTHER_WRITE.bits()
            | Self::OTHER_EXECUTE.bits();
        /// Group: read, write, and execute.
        const GROUP_RWX = Self::GROUP_READ.bits()
            | Self::GROUP_WRITE.bits()
            | Self::GROUP_EXECUTE.bits();
        /// Owner: read, write, and execute.
        const OWNER_RWX = Self::OWNER_READ.bits()
            | Self::OWNER_WRITE.bits()
            | Self::OWNER_EXECUTE.bits();
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK;
        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Synchronous data integrity writes.
        const DSYNC = libc::O_DSYNC;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Set close-on-exec.
        const CLOEXEC = libc::O_CLOEXEC;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;

        /// Do not update access time (Linux only).
        #[cfg(target_os = "linux")]
        const NOATIME = libc::O_NOATIME;
    }
}

impl OpenFlags {
    /// Whether the access mode permits writing.
    #[must_use]
    pub fn wants_write(self) -> bool {
        let mode = self.bits() & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }
}

bitflags! {
    /// Flags accepted by `rename`. Values follow the Linux `renameat2(2)` ABI, which the FUSE
    /// protocol forwards unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RenameFlags: u32 {
        /// Fail with `EEXIST` instead of replacing an existing target.
        const NOREPLACE = 1 << 0;
        /// Atomically swap source and target. Both must exist.
        const EXCHANGE  = 1 << 1;
        /// Leave a whiteout at the source. Overlay file systems only.
        const WHITEOUT  = 1 << 2;
    }
}

bitflags! {
    /// Which fields of the [`EntryAttributes`] passed to `setattr` carry new values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SetattrFields: u32 {
        /// `perm` changed.
        const MODE  = 1 << 0;
        /// `uid` changed.
        const UID   = 1 << 1;
        /// `gid` changed.
        const GID   = 1 << 2;
        /// `size` changed (truncate).
        const SIZE  = 1 << 3;
        /// `atime` changed.
        const ATIME = 1 << 4;
        /// `mtime` changed.
        const MTIME = 1 << 5;
        /// `ctime` changed.
        const CTIME = 1 << 6;
    }
}

bitflags! {
    /// Options attached to an open file handle. Bit values match the kernel's `FOPEN_*` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileInfoFlags: u32 {
        /// Bypass the page cache for this handle.
        const DIRECT_IO   = 1 << 0;
        /// Keep previously cached data on open.
        const KEEP_CACHE  = 1 << 1;
        /// The file does not support seeking.
        const NONSEEKABLE = 1 << 2;
    }
}

/// The kind of a file system object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A character device.
    CharDevice,
    /// A block device.
    BlockDevice,
    /// A named pipe.
    NamedPipe,
    /// A Unix domain socket.
    Socket,
}

/// Attributes of an inode, together with how long the kernel may cache them.
///
/// Returned by every reply that names an inode. A `lookup` reply with `ino == 0` is a negative
/// entry: the kernel remembers the name as absent for `entry_timeout` and no reference is
/// granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryAttributes {
    /// Inode number. Zero only in negative lookup replies.
    pub ino: InodeAddr,
    /// Generation number; (`ino`, `generation`) must be unique over the file system's lifetime.
    pub generation: u64,
    /// How long the kernel may cache the name to inode mapping.
    pub entry_timeout: Duration,
    /// How long the kernel may cache these attributes.
    pub attr_timeout: Duration,
    /// Object kind.
    pub kind: FileKind,
    /// Permission bits.
    pub perm: InodePerms,
    /// Number of hard links.
    pub nlink: u32,
    /// Owner.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Device number, for device nodes.
    pub rdev: u32,
    /// Size in bytes.
    pub size: u64,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Last access.
    pub atime: SystemTime,
    /// Last modification.
    pub mtime: SystemTime,
    /// Last status change.
    pub ctime: SystemTime,
    /// Creation (macOS only; ignored elsewhere).
    pub crtime: SystemTime,
}

impl EntryAttributes {
    /// Cache lifetime used when a handler does not pick its own.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Preferred block size reported when a handler does not pick its own.
    pub const DEFAULT_BLKSIZE: u32 = 4096;

    /// Attributes for `ino` of the given kind, with every other field zeroed and timestamps at
    /// the Unix epoch.
    #[must_use]
    pub fn new(ino: InodeAddr, kind: FileKind) -> Self {
        Self {
            ino,
            generation: 0,
            entry_timeout: Self::DEFAULT_TIMEOUT,
            attr_timeout: Self::DEFAULT_TIMEOUT,
            kind,
            perm: InodePerms::empty(),
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blksize: Self::DEFAULT_BLKSIZE,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
        }
    }

    /// A negative lookup reply, cached by the kernel for `entry_timeout`.
    #[must_use]
    pub fn negative(entry_timeout: Duration) -> Self {
        Self {
            entry_timeout,
            nlink: 0,
            ..Self::new(0, FileKind::File)
        }
    }

    /// Whether this is a negative lookup reply.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.ino == 0
    }
}

/// An open file handle plus the options the kernel should apply to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileInfo {
    /// The handle passed back on every later request for this open instance.
    pub fh: FileHandle,
    /// Caching options for the handle.
    pub options: FileInfoFlags,
}

impl FileInfo {
    /// A handle with default caching.
    #[must_use]
    pub fn new(fh: FileHandle) -> Self {
        Self {
            fh,
            options: FileInfoFlags::empty(),
        }
    }
}

/// File system statistics returned by `statfs`.
///
/// Block-related sizes are in units of `fragment_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatvfsData {
    /// Preferred block size (bytes).
    pub block_size: u32,
    /// Fundamental block size (bytes).
    pub fragment_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Number of file nodes available to unprivileged users.
    pub available_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
