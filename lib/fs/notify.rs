//! Out-of-band cache invalidation.
//!
//! File systems whose contents change behind the kernel's back use an [`Invalidator`] to tell
//! it which cached names, attributes or pages are stale. Calls only enqueue a [`Notification`];
//! a dedicated worker thread delivers them to the transport in order. They never block, so they
//! are safe from inside a request handler (where a synchronous kernel notification for the same
//! entry would deadlock) and from unrelated background code.
//!
//! Delivery is best-effort. The kernel answers `ENOENT` when it had nothing cached, which is
//! not an error. There is no confirmation; callers that must observe the effect retry.

use std::ffi::OsString;
use std::thread::JoinHandle;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use super::InodeAddr;

/// A byte range of cached file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// First byte.
    pub offset: u64,
    /// Length in bytes. Zero means up to the end of the file.
    pub len: u64,
}

impl ByteRange {
    /// The whole file.
    pub const ALL: Self = Self { offset: 0, len: 0 };
}

/// A message for the kernel's caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Drop the cached binding of `name` in `parent`.
    InvalidateEntry {
        /// Directory holding the entry.
        parent: InodeAddr,
        /// Entry name.
        name: OsString,
    },
    /// Drop cached attributes of `ino`, and cached content in `range` if given.
    InvalidateInode {
        /// Inode.
        ino: InodeAddr,
        /// Content to drop; `None` drops attributes only.
        range: Option<ByteRange>,
    },
    /// Replace cached content of `ino` at `offset` with `data`.
    Store {
        /// Inode.
        ino: InodeAddr,
        /// Byte offset.
        offset: u64,
        /// Fresh content.
        data: Bytes,
    },
    /// `name` in `parent`, which referred to `child`, was deleted.
    Delete {
        /// Directory that held the entry.
        parent: InodeAddr,
        /// Inode the entry referred to.
        child: InodeAddr,
        /// Entry name.
        name: OsString,
    },
}

/// Where a notification worker sends notifications.
pub trait NotifySink: Send + 'static {
    /// Push one notification to the kernel, blocking until it has been written.
    fn deliver(&mut self, notification: &Notification) -> std::io::Result<()>;
}

enum Command {
    Deliver(Notification),
    Stop,
}

/// Handle for issuing cache invalidations. Cheap to clone.
#[derive(Clone)]
pub struct Invalidator {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invalidator")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Create an invalidator and the queue its notifications land in.
#[must_use]
pub fn channel() -> (Invalidator, NotificationQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = NotificationQueue {
        tx: tx.downgrade(),
        rx,
    };
    (Invalidator { tx }, queue)
}

impl Invalidator {
    fn send(&self, notification: Notification) {
        trace!(?notification, "queueing notification");
        if self.tx.send(Command::Deliver(notification)).is_err() {
            debug!("notification dropped, the session is gone");
        }
    }

    /// The kernel's binding of `name` in `parent` is stale; the next lookup must ask again.
    pub fn invalidate_entry(&self, parent: InodeAddr, name: impl Into<OsString>) {
        self.send(Notification::InvalidateEntry {
            parent,
            name: name.into(),
        });
    }

    /// The cached attributes of `ino`, and the content in `range` if given, are stale.
    pub fn invalidate_inode(&self, ino: InodeAddr, range: Option<ByteRange>) {
        self.send(Notification::InvalidateInode { ino, range });
    }

    /// Push fresh content for `ino` at `offset` into the kernel's page cache.
    pub fn notify_store(&self, ino: InodeAddr, offset: u64, data: impl Into<Bytes>) {
        self.send(Notification::Store {
            ino,
            offset,
            data: data.into(),
        });
    }

    /// `name` in `parent`, referring to `child`, is gone. Also detaches the kernel's dentry if it
    /// is in use, which a plain entry invalidation cannot do.
    pub fn notify_delete(&self, parent: InodeAddr, child: InodeAddr, name: impl Into<OsString>) {
        self.send(Notification::Delete {
            parent,
            child,
            name: name.into(),
        });
    }
}

/// The receiving end of an [`Invalidator`].
pub struct NotificationQueue {
    tx: mpsc::WeakUnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl std::fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationQueue")
            .field("pending", &self.rx.len())
            .finish_non_exhaustive()
    }
}

impl NotificationQueue {
    /// Take the next queued notification without waiting.
    pub fn try_next(&mut self) -> Option<Notification> {
        loop {
            match self.rx.try_recv().ok()? {
                Command::Deliver(notification) => return Some(notification),
                Command::Stop => {}
            }
        }
    }

    /// Wait for the next notification. `None` once every [`Invalidator`] is dropped.
    pub async fn next(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await? {
                Command::Deliver(notification) => return Some(notification),
                Command::Stop => {}
            }
        }
    }

    /// Deliver notifications to `sink` on a dedicated thread until stopped.
    ///
    /// Notifications queued before the call are delivered first.
    pub fn spawn_worker<S: NotifySink>(self, mut sink: S) -> std::io::Result<NotifyWorker> {
        let stop = self.tx.upgrade();
        let mut rx = self.rx;
        let thread = std::thread::Builder::new()
            .name("fuse-notify".to_owned())
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        Command::Deliver(notification) => deliver(&mut sink, &notification),
                        Command::Stop => break,
                    }
                }
                debug!("notification worker exiting");
            })?;
        Ok(NotifyWorker { stop, thread })
    }
}

fn deliver<S: NotifySink>(sink: &mut S, notification: &Notification) {
    match sink.deliver(notification) {
        Ok(()) => trace!(?notification, "notification delivered"),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
            debug!(?notification, "kernel had nothing cached");
        }
        Err(e) => warn!(error = %e, ?notification, "notification delivery failed"),
    }
}

/// A running notification worker.
#[derive(Debug)]
pub struct NotifyWorker {
    stop: Option<mpsc::UnboundedSender<Command>>,
    thread: JoinHandle<()>,
}

impl NotifyWorker {
    /// Deliver what is already queued, then stop the worker and wait for it.
    pub fn stop(self) {
        if let Some(stop) = &self.stop {
            _ = stop.send(Command::Stop);
        }
        drop(self.stop);
        if self.thread.join().is_err() {
            error!("notification worker panicked");
        }
    }
}
