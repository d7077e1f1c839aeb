//! Back-pressure and lookup-count bookkeeping for directory listings.
//!
//! A handler streams entries into a [`ReaddirSink`], one at a time, each tagged with the cursor
//! the kernel will hand back to resume *after* it. The sink answers whether the entry fit in the
//! reply buffer. Accepted entries cost the kernel a lookup reference, except `.` and `..`; those
//! grants are committed only once the handler returns successfully, because an error reply
//! carries no entries.

use std::ffi::{OsStr, OsString};

use tracing::{debug, trace};

use super::ledger::Ledger;
use super::{EntryAttributes, FileKind, InodeAddr};

/// One directory entry as placed into a reply buffer.
#[derive(Debug, Clone, Copy)]
pub struct Dirent<'a> {
    /// Inode the entry names.
    pub ino: InodeAddr,
    /// Cursor to resume after this entry.
    pub next_id: u64,
    /// Object kind, reported as `d_type`.
    pub kind: FileKind,
    /// Entry name.
    pub name: &'a OsStr,
}

/// A size-bounded reply buffer supplied by the transport.
pub trait DirentBuffer: Send {
    /// Append `entry`. Returns `false`, without adding anything, when it does not fit.
    fn push(&mut self, entry: Dirent<'_>) -> bool;
}

/// Size of one `struct fuse_dirent` record carrying a name of `name_len` bytes.
#[must_use]
pub const fn dirent_size(name_len: usize) -> usize {
    // ino, off, namelen, type
    const HEADER: usize = 8 + 8 + 4 + 4;
    (HEADER + name_len).next_multiple_of(8)
}

/// An owned directory entry held by a [`VecDirentBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedDirent {
    /// Inode the entry names.
    pub ino: InodeAddr,
    /// Cursor to resume after this entry.
    pub next_id: u64,
    /// Object kind.
    pub kind: FileKind,
    /// Entry name.
    pub name: OsString,
}

/// An in-memory reply buffer bounded by the kernel's encoded dirent size.
///
/// Behaves like the buffer the kernel supplies to `readdir`: it accepts entries until the next
/// one would exceed `capacity` bytes.
#[derive(Debug, Clone)]
pub struct VecDirentBuffer {
    capacity: usize,
    used: usize,
    entries: Vec<OwnedDirent>,
}

impl VecDirentBuffer {
    /// A buffer of `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            entries: Vec::new(),
        }
    }

    /// A buffer that fits exactly `count` entries with names of `name_len` bytes.
    #[must_use]
    pub fn for_entries(count: usize, name_len: usize) -> Self {
        Self::with_capacity(count * dirent_size(name_len))
    }

    /// Entries accepted so far.
    #[must_use]
    pub fn entries(&self) -> &[OwnedDirent] {
        &self.entries
    }

    /// Consume the buffer, returning its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<OwnedDirent> {
        self.entries
    }

    /// Encoded bytes used.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }
}

impl DirentBuffer for VecDirentBuffer {
    fn push(&mut self, entry: Dirent<'_>) -> bool {
        let size = dirent_size(entry.name.len());
        if self.used + size > self.capacity {
            return false;
        }
        self.used += size;
        self.entries.push(OwnedDirent {
            ino: entry.ino,
            next_id: entry.next_id,
            kind: entry.kind,
            name: entry.name.to_os_string(),
        });
        true
    }
}

fn is_dot_or_dotdot(name: &OsStr) -> bool {
    name == "." || name == ".."
}

/// Counts reported by a completed `readdir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaddirStats {
    /// Entries placed into the reply.
    pub accepted: usize,
    /// Lookup references granted for them.
    pub granted: usize,
    /// Whether the handler ran into a full buffer.
    pub filled: bool,
}

/// The reply sink handed to [`Operations::readdir`](super::ops::Operations::readdir).
pub struct ReaddirSink<'a> {
    buffer: &'a mut dyn DirentBuffer,
    ledger: &'a Ledger,
    pending: Vec<InodeAddr>,
    accepted: usize,
    filled: bool,
}

impl<'a> ReaddirSink<'a> {
    /// A sink writing into `buffer` and granting into `ledger` on commit.
    pub fn new(buffer: &'a mut dyn DirentBuffer, ledger: &'a Ledger) -> Self {
        Self {
            buffer,
            ledger,
            pending: Vec::new(),
            accepted: 0,
            filled: false,
        }
    }

    /// Offer an entry.
    ///
    /// `next_id` is the cursor at which a later `readdir` resumes, strictly after this entry.
    /// Returns `true` if the entry was accepted; the handler should then continue. Returns
    /// `false` if the buffer is full; the handler must stop. Once full, every further offer is
    /// refused.
    pub fn reply(&mut self, name: &OsStr, attr: &EntryAttributes, next_id: u64) -> bool {
        if self.filled {
            debug!(?name, "entry offered after the reply buffer filled up");
            return false;
        }

        let accepted = self.buffer.push(Dirent {
            ino: attr.ino,
            next_id,
            kind: attr.kind,
            name,
        });
        if !accepted {
            trace!(?name, "reply buffer full");
            self.filled = true;
            return false;
        }

        self.accepted += 1;
        if !is_dot_or_dotdot(name) {
            self.pending.push(attr.ino);
        }
        true
    }

    /// Whether an offer has already been refused.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.filled
    }

    /// Grant one reference per accepted entry.
    pub(crate) fn commit(self) -> ReaddirStats {
        for &ino in &self.pending {
            self.ledger.grant(ino);
        }
        ReaddirStats {
            accepted: self.accepted,
            granted: self.pending.len(),
            filled: self.filled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirent_records_are_eight_byte_aligned() {
        assert_eq!(dirent_size(0), 24);
        assert_eq!(dirent_size(1), 32);
        assert_eq!(dirent_size(8), 32);
        assert_eq!(dirent_size(9), 40);
    }

    #[test]
    fn vec_buffer_refuses_what_does_not_fit() {
        let mut buf = VecDirentBuffer::for_entries(1, 7);
        let entry = Dirent {
            ino: 2,
            next_id: 1,
            kind: FileKind::File,
            name: OsStr::new("message"),
        };
        assert!(buf.push(entry));
        assert!(!buf.push(Dirent {
            next_id: 2,
            ..entry
        }));
        assert_eq!(buf.entries().len(), 1);
    }

    #[test]
    fn nothing_is_granted_before_commit() {
        let ledger = Ledger::new();
        let mut buf = VecDirentBuffer::with_capacity(4096);
        let mut sink = ReaddirSink::new(&mut buf, &ledger);
        assert!(sink.reply(OsStr::new("a"), &EntryAttributes::new(5, FileKind::File), 1));
        assert_eq!(ledger.count(5), 0);

        let stats = sink.commit();
        assert_eq!(stats.granted, 1);
        assert_eq!(ledger.count(5), 1);
    }
}
