//! Routes decoded requests to an [`Operations`] implementation and turns outcomes into replies.
//!
//! Each request method returns the kernel-facing outcome, `Result<T, Errno>`; the transport
//! converts it into exactly one reply. The dispatcher owns the rules every file system would
//! otherwise have to get right on its own:
//!
//! - Replies naming an inode grant the kernel one reference in the session [`Ledger`]. A
//!   negative `lookup` (inode zero) grants nothing.
//! - An errno from the handler reaches the kernel verbatim. A defect or a panic is logged and
//!   answered with `EIO`; the session keeps serving.
//! - The first `ENOSYS` for an opcode is remembered, and later requests for it are answered
//!   without calling the handler.
//! - `forget` is applied to the ledger first and never fails.
//! - Listings of one directory handle run one at a time.
//! - [`Dispatcher::shutdown`] waits for granting requests still in flight, so the forget it
//!   synthesizes covers every reference handed out. Granting requests arriving later are answered
//!   `ENOTCONN`.

use std::any::Any;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::FutureExt as _;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tracing::{Instrument as _, debug, error, info};

use super::ledger::Ledger;
use super::ops::Operations;
use super::readdir::{DirentBuffer, ReaddirSink, ReaddirStats};
use super::{
    EntryAttributes, FileHandle, FileInfo, InodeAddr, OpenFlags, ROOT_INODE, RenameFlags,
    RequestContext, SetattrFields, StatvfsData,
};
use crate::errno::{Errno, OpError, OpResult};

/// Extended attribute on the root directory whose assignment triggers
/// [`Operations::stacktrace`].
pub const STACKTRACE_XATTR: &str = "fuse_stacktrace";

/// The request kinds the dispatcher routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[expect(missing_docs, reason = "variants are named after the FUSE opcodes")]
pub enum Opcode {
    Lookup,
    Forget,
    Getattr,
    Setattr,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Flush,
    Release,
    Fsync,
    Opendir,
    Readdir,
    Releasedir,
    Fsyncdir,
    Statfs,
    Access,
    Create,
    Setxattr,
    Getxattr,
    Listxattr,
    Removexattr,
}

impl Opcode {
    /// Lower-case protocol name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Forget => "forget",
            Self::Getattr => "getattr",
            Self::Setattr => "setattr",
            Self::Readlink => "readlink",
            Self::Mknod => "mknod",
            Self::Mkdir => "mkdir",
            Self::Unlink => "unlink",
            Self::Rmdir => "rmdir",
            Self::Symlink => "symlink",
            Self::Rename => "rename",
            Self::Link => "link",
            Self::Open => "open",
            Self::Read => "read",
            Self::Write => "write",
            Self::Flush => "flush",
            Self::Release => "release",
            Self::Fsync => "fsync",
            Self::Opendir => "opendir",
            Self::Readdir => "readdir",
            Self::Releasedir => "releasedir",
            Self::Fsyncdir => "fsyncdir",
            Self::Statfs => "statfs",
            Self::Access => "access",
            Self::Create => "create",
            Self::Setxattr => "setxattr",
            Self::Getxattr => "getxattr",
            Self::Listxattr => "listxattr",
            Self::Removexattr => "removexattr",
        }
    }

    const fn bit(self) -> u64 {
        1 << (self as u8)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opcodes the handler answered with `ENOSYS`, one bit each.
#[derive(Debug, Default)]
struct Unimplemented(AtomicU64);

impl Unimplemented {
    fn contains(&self, op: Opcode) -> bool {
        self.0.load(Ordering::Acquire) & op.bit() != 0
    }

    /// Returns `true` if `op` was not marked before.
    fn mark(&self, op: Opcode) -> bool {
        self.0.fetch_or(op.bit(), Ordering::AcqRel) & op.bit() == 0
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Per-session request router.
///
/// Shared between all in-flight requests, typically behind an `Arc`.
pub struct Dispatcher<F> {
    ops: F,
    ledger: Arc<Ledger>,
    unimplemented: Unimplemented,
    dir_streams: scc::HashMap<FileHandle, Arc<tokio::sync::Mutex<()>>>,
    /// `true` once shut down. Granting requests hold a read guard until their grant is applied.
    closed: RwLock<bool>,
}

impl<F: fmt::Debug> fmt::Debug for Dispatcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("ops", &self.ops)
            .field("ledger", &self.ledger)
            .field("unimplemented", &self.unimplemented)
            .finish_non_exhaustive()
    }
}

impl<F: Operations> Dispatcher<F> {
    /// A dispatcher with a fresh ledger.
    pub fn new(ops: F) -> Self {
        Self::with_ledger(ops, Arc::new(Ledger::new()))
    }

    /// A dispatcher granting into `ledger`, which the handler may also hold to defer
    /// reclamation.
    pub fn with_ledger(ops: F, ledger: Arc<Ledger>) -> Self {
        Self {
            ops,
            ledger,
            unimplemented: Unimplemented::default(),
            dir_streams: scc::HashMap::new(),
            closed: RwLock::new(false),
        }
    }

    /// The handler.
    pub fn operations(&self) -> &F {
        &self.ops
    }

    /// The session ledger.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Whether the handler has answered `op` with `ENOSYS`.
    pub fn is_unimplemented(&self, op: Opcode) -> bool {
        self.unimplemented.contains(op)
    }

    /// Run one handler call and map its outcome to what the kernel sees.
    async fn call<T>(
        &self,
        op: Opcode,
        fut: impl Future<Output = OpResult<T>>,
    ) -> Result<T, Errno> {
        if self.unimplemented.contains(op) {
            return Err(Errno::ENOSYS);
        }

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(OpError::Errno(errno))) => {
                if errno == Errno::ENOSYS && self.unimplemented.mark(op) {
                    info!(%op, "handler does not implement operation");
                }
                Err(errno)
            }
            Ok(Err(OpError::Defect(err))) => {
                error!(%op, error = %err, "handler failed with an internal defect");
                Err(Errno::EIO)
            }
            Err(payload) => {
                error!(%op, panic = panic_message(&*payload), "handler panicked");
                Err(Errno::EIO)
            }
        }
    }

    /// Admit a request that may grant references. Refused once the session has shut down.
    async fn admit(&self, op: Opcode) -> Result<RwLockReadGuard<'_, bool>, Errno> {
        let closed = self.closed.read().await;
        if *closed {
            debug!(%op, "request after shutdown");
            return Err(Errno::ENOTCONN);
        }
        Ok(closed)
    }

    /// Grant the reference carried by a successful entry-creating reply.
    fn grant_entry(&self, op: Opcode, attr: EntryAttributes) -> Result<EntryAttributes, Errno> {
        if attr.is_negative() {
            error!(%op, "handler returned inode 0 for a created entry");
            return Err(Errno::EIO);
        }
        self.ledger.grant(attr.ino);
        Ok(attr)
    }

    /// Start the session. A panicking `init` is logged and otherwise ignored.
    pub fn init(&self) {
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| self.ops.init())) {
            error!(panic = panic_message(&*payload), "init handler panicked");
        }
    }

    /// Resolve `name` in `parent`. A positive entry grants one reference.
    pub async fn lookup(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> Result<EntryAttributes, Errno> {
        let _admitted = self.admit(Opcode::Lookup).await?;
        let attr = self
            .call(Opcode::Lookup, self.ops.lookup(parent, name, ctx))
            .await?;
        if attr.is_negative() {
            debug!(parent, ?name, "negative lookup");
        } else {
            self.ledger.grant(attr.ino);
        }
        Ok(attr)
    }

    /// Apply a forget batch to the ledger.
    ///
    /// Synchronous so that it can run on the transport thread in arrival order, before the batch
    /// is handed to the handler. Underflows are logged.
    pub fn apply_forget(&self, batch: &[(InodeAddr, u64)]) {
        if let Err(err) = self.ledger.release(batch) {
            error!(error = %err, "kernel forgot more references than it was granted");
        }
    }

    /// Hand an already-applied forget batch to the handler. Never fails.
    pub async fn deliver_forget(&self, batch: &[(InodeAddr, u64)]) {
        match AssertUnwindSafe(self.ops.forget(batch)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "forget handler failed"),
            Err(payload) => error!(panic = panic_message(&*payload), "forget handler panicked"),
        }
    }

    /// Apply and deliver a forget batch.
    pub async fn forget(&self, batch: &[(InodeAddr, u64)]) {
        self.apply_forget(batch);
        self.deliver_forget(batch).await;
    }

    /// Route a forget batch received on a thread that does not drive `runtime`.
    ///
    /// On a multi-threaded runtime the ledger is updated before returning and only delivery is
    /// spawned. On a current-thread runtime both steps run as one task on that runtime, so
    /// handler bodies never see a count change between two `.await` points. Per-inode order
    /// holds either way: a forget only follows the reply that granted it.
    pub fn submit_forget(
        self: &Arc<Self>,
        runtime: &Handle,
        batch: Vec<(InodeAddr, u64)>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        match runtime.runtime_flavor() {
            RuntimeFlavor::CurrentThread => runtime.spawn(
                async move { dispatcher.forget(&batch).await }.in_current_span(),
            ),
            _ => {
                self.apply_forget(&batch);
                runtime.spawn(
                    async move { dispatcher.deliver_forget(&batch).await }.in_current_span(),
                )
            }
        }
    }

    /// Attributes of `ino`.
    pub async fn getattr(
        &self,
        ino: InodeAddr,
        ctx: &RequestContext,
    ) -> Result<EntryAttributes, Errno> {
        self.call(Opcode::Getattr, self.ops.getattr(ino, ctx)).await
    }

    /// Change attributes of `ino`.
    pub async fn setattr(
        &self,
        ino: InodeAddr,
        attr: &EntryAttributes,
        fields: SetattrFields,
        fh: Option<FileHandle>,
        ctx: &RequestContext,
    ) -> Result<EntryAttributes, Errno> {
        self.call(
            Opcode::Setattr,
            self.ops.setattr(ino, attr, fields, fh, ctx),
        )
        .await
    }

    /// Target of a symbolic link.
    pub async fn readlink(&self, ino: InodeAddr, ctx: &RequestContext) -> Result<OsString, Errno> {
        self.call(Opcode::Readlink, self.ops.readlink(ino, ctx)).await
    }

    /// Create a special file. Grants one reference.
    pub async fn mknod(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        ctx: &RequestContext,
    ) -> Result<EntryAttributes, Errno> {
        let _admitted = self.admit(Opcode::Mknod).await?;
        let attr = self
            .call(Opcode::Mknod, self.ops.mknod(parent, name, mode, rdev, ctx))
            .await?;
        self.grant_entry(Opcode::Mknod, attr)
    }

    /// Create a directory. Grants one reference.
    pub async fn mkdir(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
        ctx: &RequestContext,
    ) -> Result<EntryAttributes, Errno> {
        let _admitted = self.admit(Opcode::Mkdir).await?;
        let attr = self
            .call(Opcode::Mkdir, self.ops.mkdir(parent, name, mode, ctx))
            .await?;
        self.grant_entry(Opcode::Mkdir, attr)
    }

    /// Remove a name.
    pub async fn unlink(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> Result<(), Errno> {
        self.call(Opcode::Unlink, self.ops.unlink(parent, name, ctx))
            .await
    }

    /// Remove an empty directory.
    pub async fn rmdir(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> Result<(), Errno> {
        self.call(Opcode::Rmdir, self.ops.rmdir(parent, name, ctx))
            .await
    }

    /// Create a symbolic link. Grants one reference.
    pub async fn symlink(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        target: &OsStr,
        ctx: &RequestContext,
    ) -> Result<EntryAttributes, Errno> {
        let _admitted = self.admit(Opcode::Symlink).await?;
        let attr = self
            .call(
                Opcode::Symlink,
                self.ops.symlink(parent, name, target, ctx),
            )
            .await?;
        self.grant_entry(Opcode::Symlink, attr)
    }

    /// Rename or exchange. Conflicting or unknown flags fail with `EINVAL` before the handler
    /// is consulted.
    pub async fn rename(
        &self,
        old_parent: InodeAddr,
        old_name: &OsStr,
        new_parent: InodeAddr,
        new_name: &OsStr,
        flags: RenameFlags,
        ctx: &RequestContext,
    ) -> Result<(), Errno> {
        if flags.contains(RenameFlags::NOREPLACE | RenameFlags::EXCHANGE)
            || flags.bits() & !RenameFlags::all().bits() != 0
        {
            debug!(?flags, "rejecting rename flags");
            return Err(Errno::EINVAL);
        }
        self.call(
            Opcode::Rename,
            self.ops
                .rename(old_parent, old_name, new_parent, new_name, flags, ctx),
        )
        .await
    }

    /// Create a hard link. Grants one reference.
    pub async fn link(
        &self,
        ino: InodeAddr,
        new_parent: InodeAddr,
        new_name: &OsStr,
        ctx: &RequestContext,
    ) -> Result<EntryAttributes, Errno> {
        let _admitted = self.admit(Opcode::Link).await?;
        let attr = self
            .call(Opcode::Link, self.ops.link(ino, new_parent, new_name, ctx))
            .await?;
        self.grant_entry(Opcode::Link, attr)
    }

    /// Open a file.
    pub async fn open(
        &self,
        ino: InodeAddr,
        flags: OpenFlags,
        ctx: &RequestContext,
    ) -> Result<FileInfo, Errno> {
        self.call(Opcode::Open, self.ops.open(ino, flags, ctx)).await
    }

    /// Read from an open file.
    pub async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> Result<Bytes, Errno> {
        self.call(Opcode::Read, self.ops.read(fh, offset, size))
            .await
    }

    /// Write to an open file.
    pub async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        self.call(Opcode::Write, self.ops.write(fh, offset, data))
            .await
    }

    /// A descriptor of `fh` was closed.
    pub async fn flush(&self, fh: FileHandle) -> Result<(), Errno> {
        self.call(Opcode::Flush, self.ops.flush(fh)).await
    }

    /// Last reference to `fh` dropped.
    pub async fn release(&self, fh: FileHandle) -> Result<(), Errno> {
        self.call(Opcode::Release, self.ops.release(fh)).await
    }

    /// Sync an open file.
    pub async fn fsync(&self, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        self.call(Opcode::Fsync, self.ops.fsync(fh, datasync)).await
    }

    fn dir_stream(&self, fh: FileHandle) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.dir_streams.read_sync(&fh, |_, v| Arc::clone(v)) {
            return lock;
        }
        match self.dir_streams.entry_sync(fh) {
            scc::hash_map::Entry::Occupied(occ) => Arc::clone(occ.get()),
            scc::hash_map::Entry::Vacant(vac) => {
                let lock = Arc::new(tokio::sync::Mutex::new(()));
                vac.insert_entry(Arc::clone(&lock));
                lock
            }
        }
    }

    /// Open a directory for listing.
    pub async fn opendir(
        &self,
        ino: InodeAddr,
        ctx: &RequestContext,
    ) -> Result<FileHandle, Errno> {
        let fh = self
            .call(Opcode::Opendir, self.ops.opendir(ino, ctx))
            .await?;
        self.dir_stream(fh);
        Ok(fh)
    }

    /// List directory handle `fh` from cursor `start_id` into `buffer`.
    ///
    /// Waits for any listing already in flight on the same handle. References for accepted
    /// entries are granted only if the handler succeeds.
    pub async fn readdir(
        &self,
        fh: FileHandle,
        start_id: u64,
        buffer: &mut dyn DirentBuffer,
    ) -> Result<ReaddirStats, Errno> {
        let _admitted = self.admit(Opcode::Readdir).await?;
        let stream = self.dir_stream(fh);
        let _in_flight = stream.lock().await;

        let mut sink = ReaddirSink::new(buffer, &self.ledger);
        self.call(Opcode::Readdir, self.ops.readdir(fh, start_id, &mut sink))
            .await?;
        Ok(sink.commit())
    }

    /// Close a directory handle.
    pub async fn releasedir(&self, fh: FileHandle) -> Result<(), Errno> {
        let result = self
            .call(Opcode::Releasedir, self.ops.releasedir(fh))
            .await;
        _ = self.dir_streams.remove_sync(&fh);
        result
    }

    /// Sync a directory.
    pub async fn fsyncdir(&self, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        self.call(Opcode::Fsyncdir, self.ops.fsyncdir(fh, datasync))
            .await
    }

    /// File system statistics.
    pub async fn statfs(&self, ctx: &RequestContext) -> Result<StatvfsData, Errno> {
        self.call(Opcode::Statfs, self.ops.statfs(ctx)).await
    }

    /// Permission check. The transport answers `false` with `EACCES`.
    pub async fn access(
        &self,
        ino: InodeAddr,
        mask: i32,
        ctx: &RequestContext,
    ) -> Result<bool, Errno> {
        self.call(Opcode::Access, self.ops.access(ino, mask, ctx))
            .await
    }

    /// Create and open a file. Grants one reference.
    pub async fn create(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
        ctx: &RequestContext,
    ) -> Result<(FileInfo, EntryAttributes), Errno> {
        let _admitted = self.admit(Opcode::Create).await?;
        let (info, attr) = self
            .call(
                Opcode::Create,
                self.ops.create(parent, name, mode, flags, ctx),
            )
            .await?;
        match self.grant_entry(Opcode::Create, attr) {
            Ok(attr) => Ok((info, attr)),
            Err(errno) => {
                // The kernel never learns about the handle; close it here.
                if let Err(err) = self.call(Opcode::Release, self.ops.release(info.fh)).await {
                    debug!(fh = info.fh, error = %err, "releasing handle of a failed create");
                }
                Err(errno)
            }
        }
    }

    /// Set an extended attribute. Setting [`STACKTRACE_XATTR`] on the root runs
    /// [`Operations::stacktrace`] instead.
    pub async fn setxattr(
        &self,
        ino: InodeAddr,
        name: &OsStr,
        value: &[u8],
        ctx: &RequestContext,
    ) -> Result<(), Errno> {
        if ino == ROOT_INODE && name == STACKTRACE_XATTR {
            if let Err(payload) =
                std::panic::catch_unwind(AssertUnwindSafe(|| self.ops.stacktrace()))
            {
                error!(panic = panic_message(&*payload), "stacktrace handler panicked");
            }
            return Ok(());
        }
        self.call(
            Opcode::Setxattr,
            self.ops.setxattr(ino, name, value, ctx),
        )
        .await
    }

    /// Read an extended attribute.
    pub async fn getxattr(
        &self,
        ino: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> Result<Bytes, Errno> {
        self.call(Opcode::Getxattr, self.ops.getxattr(ino, name, ctx))
            .await
    }

    /// List extended attribute names.
    pub async fn listxattr(
        &self,
        ino: InodeAddr,
        ctx: &RequestContext,
    ) -> Result<Vec<OsString>, Errno> {
        self.call(Opcode::Listxattr, self.ops.listxattr(ino, ctx))
            .await
    }

    /// Remove an extended attribute.
    pub async fn removexattr(
        &self,
        ino: InodeAddr,
        name: &OsStr,
        ctx: &RequestContext,
    ) -> Result<(), Errno> {
        self.call(
            Opcode::Removexattr,
            self.ops.removexattr(ino, name, ctx),
        )
        .await
    }

    /// End of session: hand the handler one forget batch covering every reference the kernel
    /// never returned.
    ///
    /// Waits for granting requests already admitted; later ones are refused with `ENOTCONN`.
    pub async fn shutdown(&self) {
        let outstanding = {
            let mut closed = self.closed.write().await;
            *closed = true;
            self.ledger.drain()
        };
        if outstanding.is_empty() {
            debug!("no lookup references outstanding at shutdown");
            return;
        }
        info!(
            inodes = outstanding.len(),
            "synthesizing forget for references still held at shutdown"
        );
        self.deliver_forget(&outstanding).await;
    }
}
