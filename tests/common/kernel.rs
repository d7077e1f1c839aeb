#![allow(missing_docs, clippy::unwrap_used)]

//! Stands in for the kernel side of a mount: a dentry cache and a page cache in front of a
//! dispatcher. Cached names are served without asking the file system until `entry_timeout`
//! passes or a notification drops them.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use fuse_dispatch::errno::Errno;
use fuse_dispatch::fs::notify::{Notification, NotifySink};
use fuse_dispatch::fs::readdir::{OwnedDirent, VecDirentBuffer};
use fuse_dispatch::fs::{
    Dispatcher, EntryAttributes, FileHandle, InodeAddr, OpenFlags, Operations, ROOT_INODE,
};

use super::ctx;

#[derive(Debug, Clone, Copy)]
struct Dentry {
    attr: EntryAttributes,
    expires: Instant,
}

pub struct FakeKernel<F: Operations> {
    dispatcher: Arc<Dispatcher<F>>,
    dentries: Mutex<HashMap<(InodeAddr, OsString), Dentry>>,
    pages: Mutex<HashMap<InodeAddr, Bytes>>,
    delivered: Mutex<Vec<Notification>>,
}

impl<F: Operations> FakeKernel<F> {
    pub fn new(dispatcher: Arc<Dispatcher<F>>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            dentries: Mutex::new(HashMap::new()),
            pages: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<F>> {
        &self.dispatcher
    }

    /// A notification sink that applies to this kernel's caches.
    pub fn sink(self: &Arc<Self>) -> KernelSink<F> {
        KernelSink(Arc::clone(self))
    }

    /// Resolve one name, from the dentry cache if it is still fresh.
    pub async fn lookup(&self, parent: InodeAddr, name: &str) -> Result<EntryAttributes, Errno> {
        let key = (parent, OsString::from(name));
        let cached = self
            .dentries
            .lock()
            .get(&key)
            .filter(|d| d.expires > Instant::now())
            .map(|d| d.attr);

        let attr = match cached {
            Some(attr) => attr,
            None => {
                let attr = self
                    .dispatcher
                    .lookup(parent, OsStr::new(name), &ctx())
                    .await?;
                let expires = Instant::now() + attr.entry_timeout;
                self.dentries.lock().insert(key, Dentry { attr, expires });
                attr
            }
        };
        if attr.is_negative() {
            return Err(Errno::ENOENT);
        }
        Ok(attr)
    }

    /// `stat(2)` of a `/`-separated path relative to the mount root.
    pub async fn stat(&self, path: &str) -> Result<EntryAttributes, Errno> {
        let mut attr = self.dispatcher.getattr(ROOT_INODE, &ctx()).await?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            attr = self.lookup(attr.ino, component).await?;
        }
        Ok(attr)
    }

    /// Open `ino` with `flags` and read it to the end, from the page cache if present.
    pub async fn read_to_end(&self, ino: InodeAddr, flags: OpenFlags) -> Result<Bytes, Errno> {
        if let Some(data) = self.pages.lock().get(&ino).cloned() {
            return Ok(data);
        }

        let info = self.dispatcher.open(ino, flags, &ctx()).await?;
        let result = self.read_handle(info.fh).await;
        self.dispatcher.release(info.fh).await?;
        let data = result?;
        self.pages.lock().insert(ino, data.clone());
        Ok(data)
    }

    async fn read_handle(&self, fh: FileHandle) -> Result<Bytes, Errno> {
        const CHUNK: u32 = 4096;
        let mut out = BytesMut::new();
        loop {
            let chunk = self.dispatcher.read(fh, out.len() as u64, CHUNK).await?;
            out.extend_from_slice(&chunk);
            if chunk.len() < CHUNK as usize {
                return Ok(out.freeze());
            }
        }
    }

    /// Every entry of directory `dir`, paging through 4 KiB reply buffers.
    pub async fn list(&self, dir: InodeAddr) -> Result<Vec<OwnedDirent>, Errno> {
        let fh = self.dispatcher.opendir(dir, &ctx()).await?;
        let mut entries = Vec::new();
        let mut cursor = 0;
        loop {
            let mut buffer = VecDirentBuffer::with_capacity(4096);
            self.dispatcher.readdir(fh, cursor, &mut buffer).await?;
            let page = buffer.into_entries();
            let Some(last) = page.last() else {
                break;
            };
            cursor = last.next_id;
            entries.extend(page);
        }
        self.dispatcher.releasedir(fh).await?;
        Ok(entries)
    }

    /// Whether a fresh dentry for `name` in `parent` is cached.
    pub fn is_cached(&self, parent: InodeAddr, name: &str) -> bool {
        self.dentries
            .lock()
            .get(&(parent, OsString::from(name)))
            .is_some_and(|d| d.expires > Instant::now())
    }

    /// Whether content of `ino` is in the page cache.
    pub fn has_pages(&self, ino: InodeAddr) -> bool {
        self.pages.lock().contains_key(&ino)
    }

    /// Notifications applied so far, in delivery order.
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }

    fn apply(&self, notification: &Notification) -> std::io::Result<()> {
        self.delivered.lock().push(notification.clone());
        let had_entry = match notification {
            Notification::InvalidateEntry { parent, name }
            | Notification::Delete { parent, name, .. } => self
                .dentries
                .lock()
                .remove(&(*parent, name.clone()))
                .is_some(),
            Notification::InvalidateInode { ino, range } => {
                if range.is_some() {
                    self.pages.lock().remove(ino);
                }
                true
            }
            Notification::Store { ino, offset, data } => {
                let mut pages = self.pages.lock();
                let mut content = pages.get(ino).map(|b| b.to_vec()).unwrap_or_default();
                let start = usize::try_from(*offset).unwrap();
                if content.len() < start + data.len() {
                    content.resize(start + data.len(), 0);
                }
                content[start..start + data.len()].copy_from_slice(data);
                pages.insert(*ino, Bytes::from(content));
                true
            }
        };
        if had_entry {
            Ok(())
        } else {
            Err(std::io::Error::from_raw_os_error(libc::ENOENT))
        }
    }
}

pub struct KernelSink<F: Operations>(Arc<FakeKernel<F>>);

impl<F: Operations> NotifySink for KernelSink<F> {
    fn deliver(&mut self, notification: &Notification) -> std::io::Result<()> {
        self.0.apply(notification)
    }
}
