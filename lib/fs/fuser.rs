//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to a [`Dispatcher`].
//!
//! `fuser` calls back on its session thread. Every callback copies its arguments, spawns the
//! request onto the session runtime and returns, so slow handlers never stall the channel.
//! Forget batches go through [`Dispatcher::submit_forget`]: with a worker pool they are applied
//! to the ledger before returning, on a current-thread runtime they are applied by a task on
//! that runtime. Either way per-inode grant/forget order equals arrival order.

use std::ffi::OsStr;
use std::future::Future;
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{Instrument as _, debug, instrument, warn};

use super::dispatch::Dispatcher;
use super::notify::{ByteRange, Notification, NotifySink};
use super::ops::Operations;
use super::readdir::{Dirent, DirentBuffer};
use super::{
    EntryAttributes, FileKind, InodeAddr, OpenFlags, RenameFlags, RequestContext, SetattrFields,
};
use crate::errno::Errno;

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyData,
    fuser::ReplyOpen,
    fuser::ReplyWrite,
    fuser::ReplyEmpty,
    fuser::ReplyStatfs,
    fuser::ReplyCreate,
    fuser::ReplyXattr,
);

/// Extension trait on dispatcher outcomes for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, Errno> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.raw());
            }
        }
    }
}

impl From<FileKind> for fuser::FileType {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::File => Self::RegularFile,
            FileKind::Directory => Self::Directory,
            FileKind::Symlink => Self::Symlink,
            FileKind::CharDevice => Self::CharDevice,
            FileKind::BlockDevice => Self::BlockDevice,
            FileKind::NamedPipe => Self::NamedPipe,
            FileKind::Socket => Self::Socket,
        }
    }
}

/// Convert [`EntryAttributes`] to the fuser-specific `FileAttr`.
fn to_fuser_attr(attr: &EntryAttributes) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: attr.kind.into(),
        perm: attr.perm.bits(),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn context(req: &fuser::Request<'_>) -> RequestContext {
    RequestContext {
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
        umask: 0,
    }
}

fn resolve_time(time: fuser::TimeOrNow) -> SystemTime {
    match time {
        fuser::TimeOrNow::SpecificTime(t) => t,
        fuser::TimeOrNow::Now => SystemTime::now(),
    }
}

/// Answer a getxattr/listxattr request: a size probe when `size` is zero, the value otherwise.
fn reply_xattr(reply: fuser::ReplyXattr, size: u32, value: &[u8]) {
    let Ok(len) = u32::try_from(value.len()) else {
        reply.error(libc::E2BIG);
        return;
    };
    if size == 0 {
        reply.size(len);
    } else if len > size {
        reply.error(libc::ERANGE);
    } else {
        reply.data(value);
    }
}

impl DirentBuffer for fuser::ReplyDirectory {
    fn push(&mut self, entry: Dirent<'_>) -> bool {
        // `add` returns true when the buffer is full.
        !self.add(
            entry.ino,
            entry.next_id.cast_signed(),
            entry.kind.into(),
            entry.name,
        )
    }
}

/// Bridges a [`Dispatcher`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter<F: Operations> {
    dispatcher: Arc<Dispatcher<F>>,
    runtime: tokio::runtime::Handle,
    writeback_cache: bool,
    ended: Arc<tokio::sync::Notify>,
}

impl<F: Operations> FuserAdapter<F> {
    /// Create an adapter that runs requests on `runtime`.
    pub fn new(
        dispatcher: Arc<Dispatcher<F>>,
        runtime: tokio::runtime::Handle,
        writeback_cache: bool,
    ) -> Self {
        Self {
            dispatcher,
            runtime,
            writeback_cache,
            ended: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Notified once when the kernel ends the session (unmount).
    pub fn ended(&self) -> Arc<tokio::sync::Notify> {
        Arc::clone(&self.ended)
    }

    fn spawn(&self, request: impl Future<Output = ()> + Send + 'static) {
        drop(self.runtime.spawn(request.in_current_span()));
    }

    fn dispatcher(&self) -> Arc<Dispatcher<F>> {
        Arc::clone(&self.dispatcher)
    }

    fn forget_batch(&self, batch: Vec<(InodeAddr, u64)>) {
        drop(self.dispatcher.submit_forget(&self.runtime, batch));
    }
}

impl<F: Operations> fuser::Filesystem for FuserAdapter<F> {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        if self.writeback_cache
            && let Err(unsupported) = config.add_capabilities(fuser::consts::FUSE_WRITEBACK_CACHE)
        {
            warn!("kernel does not support writeback caching (capabilities {unsupported:#x})");
        }
        self.dispatcher.init();
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("kernel ended the session");
        self.ended.notify_one();
    }

    #[instrument(name = "FuserAdapter::lookup", skip(self, req, reply))]
    fn lookup(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let ctx = context(req);
        let name = name.to_os_string();
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .lookup(parent, &name, &ctx)
                .await
                .fuse_reply(reply, |attr, reply| {
                    reply.entry(&attr.entry_reply_ttl(), &to_fuser_attr(&attr), attr.generation);
                });
        });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.forget_batch(vec![(ino, nlookup)]);
    }

    #[instrument(name = "FuserAdapter::batch_forget", skip_all, fields(len = nodes.len()))]
    fn batch_forget(&mut self, _req: &fuser::Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        self.forget_batch(nodes.iter().map(|n| (n.nodeid, n.nlookup)).collect());
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, req, _fh, reply))]
    fn getattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let ctx = context(req);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .getattr(ino, &ctx)
                .await
                .fuse_reply(reply, |attr, reply| {
                    reply.attr(&attr.attr_timeout, &to_fuser_attr(&attr));
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(self, req, _crtime, _chgtime, _bkuptime, _flags, reply)
    )]
    fn setattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let mut attr = EntryAttributes::new(ino, FileKind::File);
        let mut fields = SetattrFields::empty();
        if let Some(mode) = mode {
            attr.set_mode(mode);
            fields |= SetattrFields::MODE;
        }
        if let Some(uid) = uid {
            attr.uid = uid;
            fields |= SetattrFields::UID;
        }
        if let Some(gid) = gid {
            attr.gid = gid;
            fields |= SetattrFields::GID;
        }
        if let Some(size) = size {
            attr.size = size;
            fields |= SetattrFields::SIZE;
        }
        if let Some(atime) = atime {
            attr.atime = resolve_time(atime);
            fields |= SetattrFields::ATIME;
        }
        if let Some(mtime) = mtime {
            attr.mtime = resolve_time(mtime);
            fields |= SetattrFields::MTIME;
        }
        if let Some(ctime) = ctime {
            attr.ctime = ctime;
            fields |= SetattrFields::CTIME;
        }

        let ctx = context(req);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .setattr(ino, &attr, fields, fh, &ctx)
                .await
                .fuse_reply(reply, |attr, reply| {
                    reply.attr(&attr.attr_timeout, &to_fuser_attr(&attr));
                });
        });
    }

    #[instrument(name = "FuserAdapter::readlink", skip(self, req, reply))]
    fn readlink(&mut self, req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        let ctx = context(req);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .readlink(ino, &ctx)
                .await
                .fuse_reply(reply, |target, reply| reply.data(target.as_bytes()));
        });
    }

    #[instrument(name = "FuserAdapter::mknod", skip(self, req, reply))]
    fn mknod(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        let ctx = RequestContext {
            umask,
            ..context(req)
        };
        let name = name.to_os_string();
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .mknod(parent, &name, mode, rdev, &ctx)
                .await
                .fuse_reply(reply, |attr, reply| {
                    reply.entry(&attr.entry_reply_ttl(), &to_fuser_attr(&attr), attr.generation);
                });
        });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, req, reply))]
    fn mkdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let ctx = RequestContext {
            umask,
            ..context(req)
        };
        let name = name.to_os_string();
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .mkdir(parent, &name, mode, &ctx)
                .await
                .fuse_reply(reply, |attr, reply| {
                    reply.entry(&attr.entry_reply_ttl(), &to_fuser_attr(&attr), attr.generation);
                });
        });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, req, reply))]
    fn unlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let ctx = context(req);
        let name = name.to_os_string();
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .unlink(parent, &name, &ctx)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, req, reply))]
    fn rmdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let ctx = context(req);
        let name = name.to_os_string();
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .rmdir(parent, &name, &ctx)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::symlink", skip(self, req, reply))]
    fn symlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: fuser::ReplyEntry,
    ) {
        let ctx = context(req);
        let link_name = link_name.to_os_string();
        let target = target.as_os_str().to_os_string();
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .symlink(parent, &link_name, &target, &ctx)
                .await
                .fuse_reply(reply, |attr, reply| {
                    reply.entry(&attr.entry_reply_ttl(), &to_fuser_attr(&attr), attr.generation);
                });
        });
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, req, reply))]
    fn rename(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let ctx = context(req);
        let name = name.to_os_string();
        let newname = newname.to_os_string();
        let flags = RenameFlags::from_bits_retain(flags);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .rename(parent, &name, newparent, &newname, flags, &ctx)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::link", skip(self, req, reply))]
    fn link(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let ctx = context(req);
        let newname = newname.to_os_string();
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .link(ino, newparent, &newname, &ctx)
                .await
                .fuse_reply(reply, |attr, reply| {
                    reply.entry(&attr.entry_reply_ttl(), &to_fuser_attr(&attr), attr.generation);
                });
        });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, req, reply))]
    fn open(&mut self, req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let ctx = context(req);
        let flags = OpenFlags::from_bits_truncate(flags);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .open(ino, flags, &ctx)
                .await
                .fuse_reply(reply, |info, reply| {
                    debug!(handle = info.fh, "replying...");
                    reply.opened(info.fh, info.options.bits());
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .read(fh, offset.cast_unsigned(), size)
                .await
                .fuse_reply(reply, |data, reply| {
                    debug!(read_bytes = data.len(), "replying...");
                    reply.data(&data);
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, data, _write_flags, _flags, _lock_owner, reply),
        fields(len = data.len())
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let data = Bytes::copy_from_slice(data);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .write(fh, offset.cast_unsigned(), &data)
                .await
                .fuse_reply(reply, |written, reply| reply.written(written));
        });
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .flush(fh)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .release(fh)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _ino, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .fsync(fh, datasync)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, req, _flags, reply))]
    fn opendir(&mut self, req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        let ctx = context(req);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .opendir(ino, &ctx)
                .await
                .fuse_reply(reply, |fh, reply| reply.opened(fh, 0));
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _ino, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            match dispatcher
                .readdir(fh, offset.cast_unsigned(), &mut reply)
                .await
            {
                Ok(stats) => {
                    debug!(?stats, "finalizing reply...");
                    reply.ok();
                }
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.raw());
                }
            }
        });
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _ino, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .releasedir(fh)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::fsyncdir", skip(self, _req, _ino, reply))]
    fn fsyncdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .fsyncdir(fh, datasync)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, req, _ino, reply))]
    fn statfs(&mut self, req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let ctx = context(req);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .statfs(&ctx)
                .await
                .fuse_reply(reply, |stats, reply| {
                    debug!(?stats, "replying...");
                    reply.statfs(
                        stats.total_blocks,
                        stats.free_blocks,
                        stats.available_blocks,
                        stats.total_inodes,
                        stats.free_inodes,
                        stats.block_size,
                        stats.max_filename_length,
                        stats.fragment_size,
                    );
                });
        });
    }

    #[instrument(
        name = "FuserAdapter::setxattr",
        skip(self, req, value, _flags, _position, reply)
    )]
    fn setxattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let ctx = context(req);
        let name = name.to_os_string();
        let value = Bytes::copy_from_slice(value);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .setxattr(ino, &name, &value, &ctx)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::getxattr", skip(self, req, reply))]
    fn getxattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        let ctx = context(req);
        let name = name.to_os_string();
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .getxattr(ino, &name, &ctx)
                .await
                .fuse_reply(reply, |value, reply| reply_xattr(reply, size, &value));
        });
    }

    #[instrument(name = "FuserAdapter::listxattr", skip(self, req, reply))]
    fn listxattr(&mut self, req: &fuser::Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        let ctx = context(req);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .listxattr(ino, &ctx)
                .await
                .fuse_reply(reply, |names, reply| {
                    let mut encoded = Vec::new();
                    for name in &names {
                        encoded.extend_from_slice(name.as_bytes());
                        encoded.push(0);
                    }
                    reply_xattr(reply, size, &encoded);
                });
        });
    }

    #[instrument(name = "FuserAdapter::removexattr", skip(self, req, reply))]
    fn removexattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let ctx = context(req);
        let name = name.to_os_string();
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .removexattr(ino, &name, &ctx)
                .await
                .fuse_reply(reply, |(), reply| reply.ok());
        });
    }

    #[instrument(name = "FuserAdapter::access", skip(self, req, reply))]
    fn access(&mut self, req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        let ctx = context(req);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .access(ino, mask, &ctx)
                .await
                .fuse_reply(reply, |allowed, reply| {
                    if allowed {
                        reply.ok();
                    } else {
                        reply.error(libc::EACCES);
                    }
                });
        });
    }

    #[instrument(name = "FuserAdapter::create", skip(self, req, reply))]
    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let ctx = RequestContext {
            umask,
            ..context(req)
        };
        let name = name.to_os_string();
        let flags = OpenFlags::from_bits_truncate(flags);
        let dispatcher = self.dispatcher();
        self.spawn(async move {
            dispatcher
                .create(parent, &name, mode, flags, &ctx)
                .await
                .fuse_reply(reply, |(info, attr), reply| {
                    reply.created(
                        &attr.entry_reply_ttl(),
                        &to_fuser_attr(&attr),
                        attr.generation,
                        info.fh,
                        info.options.bits(),
                    );
                });
        });
    }
}

/// Delivers [`Notification`]s through a mounted session's [`fuser::Notifier`].
pub struct FuserNotifySink(fuser::Notifier);

impl FuserNotifySink {
    /// Wrap the notifier of a mounted session.
    #[must_use]
    pub fn new(notifier: fuser::Notifier) -> Self {
        Self(notifier)
    }
}

impl NotifySink for FuserNotifySink {
    fn deliver(&mut self, notification: &Notification) -> std::io::Result<()> {
        match notification {
            Notification::InvalidateEntry { parent, name } => self.0.inval_entry(*parent, name),
            Notification::InvalidateInode { ino, range } => {
                // A negative offset drops attributes only.
                let (offset, len) = range.map_or((-1, 0), |ByteRange { offset, len }| {
                    (offset.cast_signed(), len.cast_signed())
                });
                self.0.inval_inode(*ino, offset, len)
            }
            Notification::Store { ino, offset, data } => self.0.store(*ino, *offset, data),
            Notification::Delete {
                parent,
                child,
                name,
            } => self.0.delete(*parent, *child, name),
        }
    }
}
