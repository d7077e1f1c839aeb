//! A read-only file system with a single file, `message`, containing `hello world\n`.
//!
//! Besides serving as a smoke test for a mount, the root directory accepts a `command` extended
//! attribute that pushes cache notifications for `message` through an [`Invalidator`]:
//!
//! | value          | effect                                   |
//! |----------------|------------------------------------------|
//! | `forget_entry` | invalidate the `message` entry           |
//! | `forget_inode` | invalidate attributes and cached content |
//! | `store`        | push the content into the page cache     |

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tracing::debug;

use super::notify::{ByteRange, Invalidator};
use super::ops::Operations;
use super::readdir::ReaddirSink;
use super::{
    EntryAttributes, FileHandle, FileInfo, FileKind, InodeAddr, InodePerms, OpenFlags,
    ROOT_INODE, RequestContext, StatvfsData,
};
use crate::errno::{Errno, OpResult};

/// Inode of `message`.
pub const MESSAGE_INODE: InodeAddr = ROOT_INODE + 1;

/// Name of the only file.
pub const MESSAGE_NAME: &str = "message";

/// Content of the only file.
pub const MESSAGE: &[u8] = b"hello world\n";

/// Extended attribute on the root that triggers cache notifications.
pub const COMMAND_XATTR: &str = "command";

/// Fixed timestamp reported for both inodes.
const STAMP: Duration = Duration::new(1_438_467_123, 985_654_000);

/// The single-file file system.
#[derive(Debug)]
pub struct HelloFs {
    invalidator: Option<Invalidator>,
    entry_timeout: Duration,
    attr_timeout: Duration,
    uid: u32,
    gid: u32,
    lookups: AtomicU64,
    reads: AtomicU64,
}

impl Default for HelloFs {
    fn default() -> Self {
        Self::new()
    }
}

impl HelloFs {
    /// Owned by the current user, with the default cache timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            invalidator: None,
            entry_timeout: EntryAttributes::DEFAULT_TIMEOUT,
            attr_timeout: EntryAttributes::DEFAULT_TIMEOUT,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            lookups: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    /// Enable the `command` extended attribute.
    #[must_use]
    pub fn with_invalidator(mut self, invalidator: Invalidator) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// Cache lifetimes advertised for the name and the attributes of every inode.
    #[must_use]
    pub fn with_timeouts(mut self, entry_timeout: Duration, attr_timeout: Duration) -> Self {
        self.entry_timeout = entry_timeout;
        self.attr_timeout = attr_timeout;
        self
    }

    /// How many times `lookup` found `message`.
    pub fn lookup_calls(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// How many `read` requests reached the handler.
    pub fn read_calls(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn attributes(&self, ino: InodeAddr) -> Result<EntryAttributes, Errno> {
        let (kind, perm, size) = match ino {
            ROOT_INODE => (FileKind::Directory, 0o755, 0),
            MESSAGE_INODE => (FileKind::File, 0o644, MESSAGE.len() as u64),
            _ => return Err(Errno::ENOENT),
        };
        let stamp = SystemTime::UNIX_EPOCH + STAMP;
        Ok(EntryAttributes {
            entry_timeout: self.entry_timeout,
            attr_timeout: self.attr_timeout,
            perm: InodePerms::from_mode(perm),
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            size,
            blocks: size.div_ceil(512),
            atime: stamp,
            mtime: stamp,
            ctime: stamp,
            crtime: stamp,
            ..EntryAttributes::new(ino, kind)
        })
    }

    fn run_command(&self, command: &[u8]) -> Result<(), Errno> {
        let invalidator = self.invalidator.as_ref().ok_or(Errno::ENOTSUP)?;
        match command {
            b"forget_entry" => invalidator.invalidate_entry(ROOT_INODE, MESSAGE_NAME),
            b"forget_inode" => invalidator.invalidate_inode(MESSAGE_INODE, Some(ByteRange::ALL)),
            b"store" => invalidator.notify_store(MESSAGE_INODE, 0, Bytes::from_static(MESSAGE)),
            _ => return Err(Errno::EINVAL),
        }
        debug!(command = %String::from_utf8_lossy(command), "queued cache notification");
        Ok(())
    }
}

impl Operations for HelloFs {
    async fn lookup(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        _ctx: &RequestContext,
    ) -> OpResult<EntryAttributes> {
        if parent != ROOT_INODE || name != MESSAGE_NAME {
            return Err(Errno::ENOENT.into());
        }
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.attributes(MESSAGE_INODE)?)
    }

    async fn getattr(&self, ino: InodeAddr, _ctx: &RequestContext) -> OpResult<EntryAttributes> {
        Ok(self.attributes(ino)?)
    }

    async fn opendir(&self, ino: InodeAddr, _ctx: &RequestContext) -> OpResult<FileHandle> {
        if ino != ROOT_INODE {
            return Err(Errno::ENOTDIR.into());
        }
        Ok(ino)
    }

    async fn readdir(
        &self,
        fh: FileHandle,
        start_id: u64,
        sink: &mut ReaddirSink<'_>,
    ) -> OpResult<()> {
        if fh != ROOT_INODE {
            return Err(Errno::EBADF.into());
        }
        if start_id == 0 {
            let attr = self.attributes(MESSAGE_INODE)?;
            sink.reply(OsStr::new(MESSAGE_NAME), &attr, 1);
        }
        Ok(())
    }

    async fn releasedir(&self, _fh: FileHandle) -> OpResult<()> {
        Ok(())
    }

    async fn open(
        &self,
        ino: InodeAddr,
        flags: OpenFlags,
        _ctx: &RequestContext,
    ) -> OpResult<FileInfo> {
        match ino {
            MESSAGE_INODE if flags.wants_write() => Err(Errno::EACCES.into()),
            MESSAGE_INODE => Ok(FileInfo::new(ino)),
            ROOT_INODE => Err(Errno::EISDIR.into()),
            _ => Err(Errno::ENOENT.into()),
        }
    }

    async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> OpResult<Bytes> {
        if fh != MESSAGE_INODE {
            return Err(Errno::EBADF.into());
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = Bytes::from_static(MESSAGE);
        let start = usize::try_from(offset).map_or(data.len(), |o| o.min(data.len()));
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn release(&self, _fh: FileHandle) -> OpResult<()> {
        Ok(())
    }

    async fn statfs(&self, _ctx: &RequestContext) -> OpResult<StatvfsData> {
        Ok(StatvfsData {
            block_size: 512,
            fragment_size: 512,
            total_blocks: (MESSAGE.len() as u64).div_ceil(512),
            total_inodes: 2,
            max_filename_length: 255,
            ..StatvfsData::default()
        })
    }

    async fn setxattr(
        &self,
        ino: InodeAddr,
        name: &OsStr,
        value: &[u8],
        _ctx: &RequestContext,
    ) -> OpResult<()> {
        if ino != ROOT_INODE || name != COMMAND_XATTR {
            return Err(Errno::ENOTSUP.into());
        }
        Ok(self.run_command(value)?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::fs::notify;

    #[tokio::test]
    async fn reads_are_clamped_to_the_content() {
        let fs = HelloFs::new();
        let tail = fs.read(MESSAGE_INODE, 6, 100).await.unwrap();
        assert_eq!(&tail[..], b"world\n");
        let past_end = fs.read(MESSAGE_INODE, 64, 10).await.unwrap();
        assert!(past_end.is_empty());
        assert_eq!(fs.read_calls(), 2);
    }

    #[tokio::test]
    async fn commands_queue_notifications() {
        let (invalidator, mut queue) = notify::channel();
        let fs = HelloFs::new().with_invalidator(invalidator);
        let ctx = RequestContext::default();

        fs.setxattr(ROOT_INODE, OsStr::new(COMMAND_XATTR), b"forget_entry", &ctx)
            .await
            .unwrap();
        assert_eq!(
            queue.try_next(),
            Some(notify::Notification::InvalidateEntry {
                parent: ROOT_INODE,
                name: MESSAGE_NAME.into(),
            })
        );

        let err = fs
            .setxattr(ROOT_INODE, OsStr::new(COMMAND_XATTR), b"bogus", &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EINVAL));
        assert_eq!(queue.try_next(), None);
    }

    #[tokio::test]
    async fn commands_need_an_invalidator() {
        let fs = HelloFs::new();
        let err = fs
            .setxattr(
                ROOT_INODE,
                OsStr::new(COMMAND_XATTR),
                b"store",
                &RequestContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ENOTSUP));
    }
}
