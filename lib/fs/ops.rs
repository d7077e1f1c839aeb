//! The handler capability set.
//!
//! A concrete file system implements [`Operations`], overriding the requests it supports. Every
//! request method defaults to failing with [`Errno::ENOSYS`]; the dispatcher remembers that
//! answer and stops calling the method for the rest of the session.
//!
//! Methods that return [`EntryAttributes`] for a named object (`lookup`, `mknod`, `mkdir`,
//! `symlink`, `link`, `create`) hand the kernel a new reference to it. The dispatcher records that
//! in the session [`Ledger`](super::Ledger); implementations that defer reclamation until the
//! kernel has forgotten an inode should consult the same ledger.

use std::ffi::{OsStr, OsString};
use std::future::Future;

use bytes::Bytes;
use tracing::error;

use super::readdir::ReaddirSink;
use super::{
    EntryAttributes, FileHandle, FileInfo, InodeAddr, OpenFlags, RenameFlags, RequestContext,
    SetattrFields, StatvfsData,
};
use crate::errno::{Errno, OpResult};

/// A file system served through the dispatcher.
///
/// Implementations are shared by every in-flight request, so all methods take `&self`; mutable
/// state needs interior synchronization. Request futures must be `Send` because the worker-pool
/// concurrency model runs them on any runtime thread.
#[expect(unused_variables, reason = "default bodies ignore their arguments")]
pub trait Operations: Send + Sync + 'static {
    /// Called once when the session starts, before the first request.
    fn init(&self) {}

    /// Resolve `name` in directory `parent`.
    ///
    /// Must also handle `.` and `..` if the file system supports them. An `ino` of zero is a
    /// negative entry, cached by the kernel for `entry_timeout`.
    fn lookup(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<EntryAttributes>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// The kernel dropped references to inodes.
    ///
    /// The batch has already been applied to the ledger. Errors are logged and otherwise
    /// ignored; there is no request to fail.
    fn forget(&self, batch: &[(InodeAddr, u64)]) -> impl Future<Output = OpResult<()>> + Send {
        async { Ok(()) }
    }

    /// Attributes of `ino`.
    fn getattr(
        &self,
        ino: InodeAddr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<EntryAttributes>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Change the attributes selected by `fields` to the values in `attr`.
    ///
    /// `fh` is set when the change came through an open handle (`ftruncate`, `fchmod`).
    fn setattr(
        &self,
        ino: InodeAddr,
        attr: &EntryAttributes,
        fields: SetattrFields,
        fh: Option<FileHandle>,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<EntryAttributes>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Target of symbolic link `ino`.
    fn readlink(
        &self,
        ino: InodeAddr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<OsString>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Create a device node, FIFO or socket.
    fn mknod(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<EntryAttributes>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Create a directory.
    fn mkdir(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<EntryAttributes>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Remove a non-directory entry.
    ///
    /// The inode may still be referenced by the kernel or open handles; only the name goes
    /// away. Reclaim the inode once its ledger count is zero and no links remain.
    fn unlink(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Remove an empty directory. Same deferred reclamation as [`Operations::unlink`].
    fn rmdir(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Create a symbolic link `name` in `parent` pointing at `target`.
    fn symlink(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        target: &OsStr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<EntryAttributes>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Rename or exchange a directory entry.
    ///
    /// `flags` is empty, [`RenameFlags::NOREPLACE`] or [`RenameFlags::EXCHANGE`]; conflicting
    /// combinations are rejected before this is called. The mutation must be one atomic step
    /// relative to concurrent lookups. A replaced target loses one link.
    fn rename(
        &self,
        old_parent: InodeAddr,
        old_name: &OsStr,
        new_parent: InodeAddr,
        new_name: &OsStr,
        flags: RenameFlags,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Create hard link `new_name` in `new_parent` to `ino`.
    fn link(
        &self,
        ino: InodeAddr,
        new_parent: InodeAddr,
        new_name: &OsStr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<EntryAttributes>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Open `ino`. `O_CREAT`, `O_EXCL` and `O_NOCTTY` are filtered by the kernel.
    fn open(
        &self,
        ino: InodeAddr,
        flags: OpenFlags,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<FileInfo>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Read up to `size` bytes at `offset`. Short reads are only allowed at end of file.
    fn read(
        &self,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> impl Future<Output = OpResult<Bytes>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write(
        &self,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> impl Future<Output = OpResult<u32>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// A file descriptor referring to `fh` was closed. May be called several times per handle.
    fn flush(&self, fh: FileHandle) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// The last reference to `fh` is gone. The reply is not seen by any process.
    fn release(&self, fh: FileHandle) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Flush buffered data (and metadata unless `datasync`) to stable storage.
    fn fsync(&self, fh: FileHandle, datasync: bool) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Open directory `ino` for listing.
    fn opendir(
        &self,
        ino: InodeAddr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<FileHandle>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Stream the entries of directory handle `fh` that follow cursor `start_id`.
    ///
    /// `start_id` is zero for a fresh listing, otherwise a `next_id` previously offered to
    /// the sink. Stop as soon as [`ReaddirSink::reply`] returns `false`. Entries added or
    /// removed during a listing may or may not appear, but must not make other entries repeat
    /// or vanish; anchor cursors to a monotonic entry id, not a position.
    fn readdir(
        &self,
        fh: FileHandle,
        start_id: u64,
        sink: &mut ReaddirSink<'_>,
    ) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// The directory handle `fh` is closed.
    fn releasedir(&self, fh: FileHandle) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Flush directory contents of `fh` to stable storage.
    fn fsyncdir(
        &self,
        fh: FileHandle,
        datasync: bool,
    ) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// File system statistics.
    fn statfs(&self, ctx: &RequestContext) -> impl Future<Output = OpResult<StatvfsData>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Whether the caller may access `ino` with `mask` (`R_OK`, `W_OK`, `X_OK`, `F_OK`).
    ///
    /// Not called when the session mounts with `default_permissions`.
    fn access(
        &self,
        ino: InodeAddr,
        mask: i32,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<bool>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Create and open a regular file.
    fn create(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<(FileInfo, EntryAttributes)>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Set extended attribute `name` of `ino`.
    fn setxattr(
        &self,
        ino: InodeAddr,
        name: &OsStr,
        value: &[u8],
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Value of extended attribute `name`. Fail with [`Errno::ENOATTR`] if it is not set.
    fn getxattr(
        &self,
        ino: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<Bytes>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Names of all extended attributes of `ino`.
    fn listxattr(
        &self,
        ino: InodeAddr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<Vec<OsString>>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Remove extended attribute `name`. Fail with [`Errno::ENOATTR`] if it is not set.
    fn removexattr(
        &self,
        ino: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> impl Future<Output = OpResult<()>> + Send {
        async { Err(Errno::ENOSYS.into()) }
    }

    /// Dump diagnostic state to the log.
    ///
    /// Triggered by setting the `fuse_stacktrace` extended attribute on the root directory.
    fn stacktrace(&self) {
        let trace = std::backtrace::Backtrace::force_capture();
        error!("stacktrace requested:\n{trace}");
    }
}
