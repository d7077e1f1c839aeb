//! A directory-entry table for handler implementations.
//!
//! Every entry gets an id from a session-wide monotonic counter when it is first linked. The id
//! is the entry's readdir cursor: a listing resumes at "ids strictly greater than `start_id`", so
//! entries linked or unlinked while a listing is in progress never make other entries repeat or
//! vanish. A renamed entry keeps its id; a rename that replaces a target keeps the target's id.
//!
//! All mutations, including cross-directory renames, happen under one write lock, so concurrent
//! lookups observe either the old or the new binding of both names, never a mix.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{InodeAddr, RenameFlags};
use crate::errno::Errno;

/// A directory entry, as returned by [`Namespace::entries_after`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedEntry {
    /// Cursor id of the entry.
    pub id: u64,
    /// Entry name.
    pub name: OsString,
    /// Inode the entry names.
    pub ino: InodeAddr,
}

/// Result of removing a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unlinked {
    /// The inode the name referred to.
    pub ino: InodeAddr,
    /// Names still referring to it.
    pub remaining_links: u32,
}

/// Result of a successful [`Namespace::rename`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    /// Source and target were the same binding; nothing changed.
    Unchanged,
    /// The entry moved to a previously free name.
    Moved,
    /// The target name now refers to the moved inode; `displaced` lost one link.
    Replaced {
        /// The inode the target name referred to before.
        displaced: InodeAddr,
        /// Names still referring to `displaced`.
        remaining_links: u32,
    },
    /// The two names swapped inodes.
    Exchanged,
}

#[derive(Debug)]
struct Entry {
    name: OsString,
    ino: InodeAddr,
}

#[derive(Debug, Default)]
struct Directory {
    entries: BTreeMap<u64, Entry>,
    by_name: FxHashMap<OsString, u64>,
}

impl Directory {
    fn id_of(&self, name: &OsStr) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    fn ino_of(&self, id: u64) -> Option<InodeAddr> {
        self.entries.get(&id).map(|e| e.ino)
    }

    fn insert(&mut self, id: u64, name: OsString, ino: InodeAddr) {
        self.by_name.insert(name.clone(), id);
        self.entries.insert(id, Entry { name, ino });
    }

    fn remove(&mut self, id: u64) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.by_name.remove(&entry.name);
        Some(entry)
    }

    fn rebind(&mut self, id: u64, ino: InodeAddr) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.ino = ino;
        }
    }
}

#[derive(Debug)]
struct Tables {
    dirs: FxHashMap<InodeAddr, Directory>,
    links: FxHashMap<InodeAddr, u32>,
    next_id: u64,
}

impl Tables {
    fn find(&self, parent: InodeAddr, name: &OsStr) -> Option<(u64, InodeAddr)> {
        let dir = self.dirs.get(&parent)?;
        let id = dir.id_of(name)?;
        Some((id, dir.ino_of(id)?))
    }

    fn drop_link(&mut self, ino: InodeAddr) -> u32 {
        let Some(count) = self.links.get_mut(&ino) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            self.links.remove(&ino);
        }
        remaining
    }

    fn has_children(&self, ino: InodeAddr) -> bool {
        self.dirs.get(&ino).is_some_and(|d| !d.entries.is_empty())
    }
}

/// Name to inode bindings for every directory of a file system.
#[derive(Debug)]
pub struct Namespace {
    tables: RwLock<Tables>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    /// An empty namespace. Cursor ids start at 1; 0 means "from the start".
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                dirs: FxHashMap::default(),
                links: FxHashMap::default(),
                next_id: 1,
            }),
        }
    }

    /// Register `dir` as an (empty) directory. A no-op if it already is one.
    pub fn add_directory(&self, dir: InodeAddr) {
        self.tables.write().dirs.entry(dir).or_default();
    }

    /// Forget directory `dir`. Fails with `ENOTEMPTY` if it still has entries.
    pub fn remove_directory(&self, dir: InodeAddr) -> Result<(), Errno> {
        let mut tables = self.tables.write();
        if tables.has_children(dir) {
            return Err(Errno::ENOTEMPTY);
        }
        tables.dirs.remove(&dir);
        Ok(())
    }

    /// Bind `name` in `parent` to `ino`, returning the new entry's cursor id.
    ///
    /// Fails with `EEXIST` if the name is taken and `ENOTDIR` if `parent` is not a directory.
    pub fn link(&self, parent: InodeAddr, name: &OsStr, ino: InodeAddr) -> Result<u64, Errno> {
        let mut tables = self.tables.write();
        let id = tables.next_id;
        let dir = tables.dirs.get_mut(&parent).ok_or(Errno::ENOTDIR)?;
        if dir.id_of(name).is_some() {
            return Err(Errno::EEXIST);
        }
        dir.insert(id, name.to_os_string(), ino);
        tables.next_id += 1;
        *tables.links.entry(ino).or_insert(0) += 1;
        Ok(id)
    }

    /// Remove `name` from `parent`.
    pub fn unlink(&self, parent: InodeAddr, name: &OsStr) -> Result<Unlinked, Errno> {
        let mut tables = self.tables.write();
        let dir = tables.dirs.get_mut(&parent).ok_or(Errno::ENOTDIR)?;
        let id = dir.id_of(name).ok_or(Errno::ENOENT)?;
        let entry = dir.remove(id).ok_or(Errno::ENOENT)?;
        let remaining_links = tables.drop_link(entry.ino);
        Ok(Unlinked {
            ino: entry.ino,
            remaining_links,
        })
    }

    /// The inode `name` refers to in `parent`.
    #[must_use]
    pub fn lookup(&self, parent: InodeAddr, name: &OsStr) -> Option<InodeAddr> {
        self.tables.read().find(parent, name).map(|(_, ino)| ino)
    }

    /// Entries of `dir` whose cursor id is greater than `start_id`, in cursor order.
    #[must_use]
    pub fn entries_after(&self, dir: InodeAddr, start_id: u64) -> Vec<NamedEntry> {
        let tables = self.tables.read();
        let Some(dir) = tables.dirs.get(&dir) else {
            return Vec::new();
        };
        dir.entries
            .range(start_id.saturating_add(1)..)
            .map(|(&id, entry)| NamedEntry {
                id,
                name: entry.name.clone(),
                ino: entry.ino,
            })
            .collect()
    }

    /// Whether `dir` is a known directory with at least one entry.
    #[must_use]
    pub fn has_children(&self, dir: InodeAddr) -> bool {
        self.tables.read().has_children(dir)
    }

    /// Whether `ino` is registered as a directory.
    #[must_use]
    pub fn is_directory(&self, ino: InodeAddr) -> bool {
        self.tables.read().dirs.contains_key(&ino)
    }

    /// Names referring to `ino`, across all directories.
    #[must_use]
    pub fn link_count(&self, ino: InodeAddr) -> u32 {
        self.tables.read().links.get(&ino).copied().unwrap_or(0)
    }

    /// Move, replace or exchange a binding in one step.
    ///
    /// - `NOREPLACE` and `EXCHANGE` together, or `WHITEOUT`: `EINVAL`.
    /// - Missing source: `ENOENT`.
    /// - `EXCHANGE` with a missing target: `ENOENT`. Otherwise both names swap inodes and link
    ///   counts are unchanged.
    /// - `NOREPLACE` with an existing target: `EEXIST`, nothing changes.
    /// - Existing target otherwise: the target entry is rebound to the source inode, the source
    ///   entry disappears and the displaced inode loses a link. A displaced directory that still
    ///   has entries fails with `ENOTEMPTY`.
    ///
    /// Kind checks (`EISDIR`, `ENOTDIR` between source and target) are left to the caller.
    pub fn rename(
        &self,
        old_parent: InodeAddr,
        old_name: &OsStr,
        new_parent: InodeAddr,
        new_name: &OsStr,
        flags: RenameFlags,
    ) -> Result<RenameOutcome, Errno> {
        if flags.contains(RenameFlags::NOREPLACE | RenameFlags::EXCHANGE)
            || flags.contains(RenameFlags::WHITEOUT)
        {
            return Err(Errno::EINVAL);
        }

        let mut tables = self.tables.write();
        if !tables.dirs.contains_key(&new_parent) {
            return Err(Errno::ENOTDIR);
        }
        let (src_id, src_ino) = tables.find(old_parent, old_name).ok_or(Errno::ENOENT)?;
        if old_parent == new_parent && old_name == new_name {
            return Ok(RenameOutcome::Unchanged);
        }
        let target = tables.find(new_parent, new_name);

        if flags.contains(RenameFlags::EXCHANGE) {
            let (dst_id, dst_ino) = target.ok_or(Errno::ENOENT)?;
            if let Some(dir) = tables.dirs.get_mut(&old_parent) {
                dir.rebind(src_id, dst_ino);
            }
            if let Some(dir) = tables.dirs.get_mut(&new_parent) {
                dir.rebind(dst_id, src_ino);
            }
            return Ok(RenameOutcome::Exchanged);
        }

        match target {
            Some(_) if flags.contains(RenameFlags::NOREPLACE) => Err(Errno::EEXIST),
            Some((_, dst_ino)) if dst_ino == src_ino => {
                // Two links to the same inode: rename(2) leaves both in place.
                Ok(RenameOutcome::Unchanged)
            }
            Some((dst_id, dst_ino)) => {
                if tables.has_children(dst_ino) {
                    return Err(Errno::ENOTEMPTY);
                }
                if let Some(dir) = tables.dirs.get_mut(&old_parent) {
                    dir.remove(src_id);
                }
                if let Some(dir) = tables.dirs.get_mut(&new_parent) {
                    dir.rebind(dst_id, src_ino);
                }
                let remaining_links = tables.drop_link(dst_ino);
                Ok(RenameOutcome::Replaced {
                    displaced: dst_ino,
                    remaining_links,
                })
            }
            None => {
                let entry = tables
                    .dirs
                    .get_mut(&old_parent)
                    .and_then(|dir| dir.remove(src_id))
                    .ok_or(Errno::ENOENT)?;
                if let Some(dir) = tables.dirs.get_mut(&new_parent) {
                    dir.insert(src_id, new_name.to_os_string(), entry.ino);
                }
                Ok(RenameOutcome::Moved)
            }
        }
    }
}
