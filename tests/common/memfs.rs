#![allow(missing_docs, clippy::unwrap_used)]

//! A small read-write in-memory file system built on `Namespace`, with kernel-aware reclamation:
//! an inode is dropped only when no name refers to it and the ledger shows no kernel reference.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use fuse_dispatch::errno::{Errno, OpResult};
use fuse_dispatch::fs::namespace::{Namespace, RenameOutcome};
use fuse_dispatch::fs::{
    EntryAttributes, FileHandle, FileInfo, FileKind, InodeAddr, InodePerms, Ledger, OpenFlags,
    Operations, ROOT_INODE, ReaddirSink, RenameFlags, RequestContext,
};

#[derive(Debug, Clone)]
struct Node {
    attr: EntryAttributes,
    parent: InodeAddr,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct MemFs {
    ns: Namespace,
    ledger: Arc<Ledger>,
    nodes: Mutex<HashMap<InodeAddr, Node>>,
    handles: Mutex<HashMap<FileHandle, InodeAddr>>,
    next_ino: AtomicU64,
    next_fh: AtomicU64,
    reclaimed: Mutex<Vec<InodeAddr>>,
    fail_readdir: AtomicBool,
}

impl MemFs {
    /// An empty file system whose reclamation consults `ledger`.
    pub fn new(ledger: Arc<Ledger>) -> Self {
        let fs = Self {
            ns: Namespace::new(),
            ledger,
            nodes: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_ino: AtomicU64::new(ROOT_INODE + 1),
            next_fh: AtomicU64::new(1),
            reclaimed: Mutex::new(Vec::new()),
            fail_readdir: AtomicBool::new(false),
        };
        fs.ns.add_directory(ROOT_INODE);
        fs.nodes.lock().insert(
            ROOT_INODE,
            Node {
                attr: Self::make_attr(ROOT_INODE, FileKind::Directory, 0o755),
                parent: ROOT_INODE,
                data: Vec::new(),
            },
        );
        fs
    }

    fn make_attr(ino: InodeAddr, kind: FileKind, perm: u32) -> EntryAttributes {
        EntryAttributes {
            perm: InodePerms::from_mode(perm),
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            uid: 1000,
            gid: 1000,
            ..EntryAttributes::new(ino, kind)
        }
    }

    fn insert(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        kind: FileKind,
        perm: u32,
        data: &[u8],
    ) -> Result<EntryAttributes, Errno> {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        if kind == FileKind::Directory {
            self.ns.add_directory(ino);
        }
        if let Err(e) = self.ns.link(parent, name, ino) {
            if kind == FileKind::Directory {
                self.ns.remove_directory(ino)?;
            }
            return Err(e);
        }
        let mut attr = Self::make_attr(ino, kind, perm);
        attr.size = data.len() as u64;
        self.nodes.lock().insert(
            ino,
            Node {
                attr,
                parent,
                data: data.to_vec(),
            },
        );
        Ok(attr)
    }

    /// Create a file directly, without granting anything to the kernel.
    pub fn add_file(&self, parent: InodeAddr, name: &str, data: &[u8]) -> InodeAddr {
        self.insert(parent, OsStr::new(name), FileKind::File, 0o644, data)
            .unwrap()
            .ino
    }

    /// Create a directory directly, without granting anything to the kernel.
    pub fn add_dir(&self, parent: InodeAddr, name: &str) -> InodeAddr {
        self.insert(parent, OsStr::new(name), FileKind::Directory, 0o755, &[])
            .unwrap()
            .ino
    }

    /// The inode `name` in `parent` refers to, bypassing the dispatcher.
    pub fn resolve(&self, parent: InodeAddr, name: &str) -> Option<InodeAddr> {
        self.ns.lookup(parent, OsStr::new(name))
    }

    /// Whether `ino` still has storage.
    pub fn exists(&self, ino: InodeAddr) -> bool {
        self.nodes.lock().contains_key(&ino)
    }

    /// Inodes whose storage was dropped, in order.
    pub fn reclaimed(&self) -> Vec<InodeAddr> {
        self.reclaimed.lock().clone()
    }

    /// Make the next `readdir` offer its entries and then fail.
    pub fn fail_next_readdir(&self) {
        self.fail_readdir.store(true, Ordering::SeqCst);
    }

    /// Drop `ino` if nothing refers to it any more.
    fn try_reclaim(&self, ino: InodeAddr) {
        if ino == ROOT_INODE || self.ns.link_count(ino) > 0 || self.ledger.count(ino) > 0 {
            return;
        }
        if self.nodes.lock().remove(&ino).is_some() {
            _ = self.ns.remove_directory(ino);
            self.reclaimed.lock().push(ino);
        }
    }

    fn attr(&self, ino: InodeAddr) -> Result<EntryAttributes, Errno> {
        self.nodes
            .lock()
            .get(&ino)
            .map(|n| n.attr)
            .ok_or(Errno::ENOENT)
    }

    fn kind_of(&self, parent: InodeAddr, name: &OsStr) -> Result<(InodeAddr, FileKind), Errno> {
        let ino = self.ns.lookup(parent, name).ok_or(Errno::ENOENT)?;
        Ok((ino, self.attr(ino)?.kind))
    }

    fn handle_target(&self, fh: FileHandle) -> Result<InodeAddr, Errno> {
        self.handles.lock().get(&fh).copied().ok_or(Errno::EBADF)
    }

    fn new_handle(&self, ino: InodeAddr) -> FileHandle {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, ino);
        fh
    }
}

impl Operations for MemFs {
    async fn lookup(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        _ctx: &RequestContext,
    ) -> OpResult<EntryAttributes> {
        let ino = self.ns.lookup(parent, name).ok_or(Errno::ENOENT)?;
        Ok(self.attr(ino)?)
    }

    async fn forget(&self, batch: &[(InodeAddr, u64)]) -> OpResult<()> {
        for &(ino, _) in batch {
            self.try_reclaim(ino);
        }
        Ok(())
    }

    async fn getattr(&self, ino: InodeAddr, _ctx: &RequestContext) -> OpResult<EntryAttributes> {
        Ok(self.attr(ino)?)
    }

    async fn mkdir(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
        ctx: &RequestContext,
    ) -> OpResult<EntryAttributes> {
        Ok(self.insert(parent, name, FileKind::Directory, mode & !ctx.umask, &[])?)
    }

    async fn unlink(&self, parent: InodeAddr, name: &OsStr, _ctx: &RequestContext) -> OpResult<()> {
        let (_, kind) = self.kind_of(parent, name)?;
        if kind == FileKind::Directory {
            return Err(Errno::EISDIR.into());
        }
        let unlinked = self.ns.unlink(parent, name)?;
        if let Some(node) = self.nodes.lock().get_mut(&unlinked.ino) {
            node.attr.nlink = unlinked.remaining_links;
        }
        self.try_reclaim(unlinked.ino);
        Ok(())
    }

    async fn rmdir(&self, parent: InodeAddr, name: &OsStr, _ctx: &RequestContext) -> OpResult<()> {
        let (ino, kind) = self.kind_of(parent, name)?;
        if kind != FileKind::Directory {
            return Err(Errno::ENOTDIR.into());
        }
        if self.ns.has_children(ino) {
            return Err(Errno::ENOTEMPTY.into());
        }
        self.ns.unlink(parent, name)?;
        self.try_reclaim(ino);
        Ok(())
    }

    async fn rename(
        &self,
        old_parent: InodeAddr,
        old_name: &OsStr,
        new_parent: InodeAddr,
        new_name: &OsStr,
        flags: RenameFlags,
        _ctx: &RequestContext,
    ) -> OpResult<()> {
        let (ino, kind) = self.kind_of(old_parent, old_name)?;
        if let Ok((_, target_kind)) = self.kind_of(new_parent, new_name)
            && !flags.contains(RenameFlags::EXCHANGE)
        {
            match (kind, target_kind) {
                (FileKind::Directory, FileKind::Directory) => {}
                (FileKind::Directory, _) => return Err(Errno::ENOTDIR.into()),
                (_, FileKind::Directory) => return Err(Errno::EISDIR.into()),
                _ => {}
            }
        }

        match self
            .ns
            .rename(old_parent, old_name, new_parent, new_name, flags)?
        {
            RenameOutcome::Replaced {
                displaced,
                remaining_links,
            } => {
                {
                    let mut nodes = self.nodes.lock();
                    if let Some(node) = nodes.get_mut(&displaced) {
                        node.attr.nlink = remaining_links;
                    }
                    if let Some(node) = nodes.get_mut(&ino) {
                        node.parent = new_parent;
                    }
                }
                self.try_reclaim(displaced);
            }
            RenameOutcome::Moved => {
                if let Some(node) = self.nodes.lock().get_mut(&ino) {
                    node.parent = new_parent;
                }
            }
            RenameOutcome::Unchanged | RenameOutcome::Exchanged => {}
        }
        Ok(())
    }

    async fn link(
        &self,
        ino: InodeAddr,
        new_parent: InodeAddr,
        new_name: &OsStr,
        _ctx: &RequestContext,
    ) -> OpResult<EntryAttributes> {
        if self.attr(ino)?.kind == FileKind::Directory {
            return Err(Errno::EPERM.into());
        }
        self.ns.link(new_parent, new_name, ino)?;
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&ino).ok_or(Errno::ENOENT)?;
        node.attr.nlink = self.ns.link_count(ino);
        Ok(node.attr)
    }

    async fn open(
        &self,
        ino: InodeAddr,
        _flags: OpenFlags,
        _ctx: &RequestContext,
    ) -> OpResult<FileInfo> {
        if self.attr(ino)?.kind == FileKind::Directory {
            return Err(Errno::EISDIR.into());
        }
        Ok(FileInfo::new(self.new_handle(ino)))
    }

    async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> OpResult<Bytes> {
        let ino = self.handle_target(fh)?;
        let nodes = self.nodes.lock();
        let data = &nodes.get(&ino).ok_or(Errno::ENOENT)?.data;
        let start = usize::try_from(offset).map_or(data.len(), |o| o.min(data.len()));
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> OpResult<u32> {
        let ino = self.handle_target(fh)?;
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&ino).ok_or(Errno::ENOENT)?;
        let start = usize::try_from(offset).map_err(|_| Errno::EINVAL)?;
        let end = start + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);
        node.attr.size = node.data.len() as u64;
        Ok(u32::try_from(data.len()).map_err(|_| Errno::EINVAL)?)
    }

    async fn flush(&self, _fh: FileHandle) -> OpResult<()> {
        Ok(())
    }

    async fn release(&self, fh: FileHandle) -> OpResult<()> {
        self.handles.lock().remove(&fh);
        Ok(())
    }

    async fn opendir(&self, ino: InodeAddr, _ctx: &RequestContext) -> OpResult<FileHandle> {
        if !self.ns.is_directory(ino) {
            return Err(Errno::ENOTDIR.into());
        }
        Ok(self.new_handle(ino))
    }

    /// Cursor 1 resumes after `.`, 2 after `..`; entry cursors are namespace ids shifted by two.
    async fn readdir(
        &self,
        fh: FileHandle,
        start_id: u64,
        sink: &mut ReaddirSink<'_>,
    ) -> OpResult<()> {
        let dir = self.handle_target(fh)?;
        let parent = self.nodes.lock().get(&dir).map_or(ROOT_INODE, |n| n.parent);

        if start_id < 1 && !sink.reply(OsStr::new("."), &self.attr(dir)?, 1) {
            return Ok(());
        }
        if start_id < 2 && !sink.reply(OsStr::new(".."), &self.attr(parent)?, 2) {
            return Ok(());
        }
        for entry in self.ns.entries_after(dir, start_id.saturating_sub(2)) {
            let Ok(attr) = self.attr(entry.ino) else {
                continue;
            };
            if !sink.reply(&entry.name, &attr, entry.id + 2) {
                break;
            }
        }

        if self.fail_readdir.swap(false, Ordering::SeqCst) {
            return Err(Errno::EIO.into());
        }
        Ok(())
    }

    async fn releasedir(&self, fh: FileHandle) -> OpResult<()> {
        self.handles.lock().remove(&fh);
        Ok(())
    }

    async fn create(
        &self,
        parent: InodeAddr,
        name: &OsStr,
        mode: u32,
        _flags: OpenFlags,
        ctx: &RequestContext,
    ) -> OpResult<(FileInfo, EntryAttributes)> {
        let attr = self.insert(parent, name, FileKind::File, mode & !ctx.umask, &[])?;
        Ok((FileInfo::new(self.new_handle(attr.ino)), attr))
    }

    async fn access(&self, ino: InodeAddr, mask: i32, ctx: &RequestContext) -> OpResult<bool> {
        let attr = self.attr(ino)?;
        if mask == libc::F_OK || ctx.uid == 0 {
            return Ok(true);
        }
        let perm = attr.perm.bits();
        let granted = if ctx.uid == attr.uid {
            (perm >> 6) & 0o7
        } else if ctx.gid == attr.gid {
            (perm >> 3) & 0o7
        } else {
            perm & 0o7
        };
        let wanted = u16::try_from(mask & 0o7).unwrap_or(0o7);
        Ok(granted & wanted == wanted)
    }
}
