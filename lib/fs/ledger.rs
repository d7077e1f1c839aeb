//! The kernel's lookup counts, as seen from user space.
//!
//! Every reply that hands the kernel an inode (`lookup`, `mknod`, `mkdir`, `symlink`, `link`,
//! `create`, and each accepted `readdir` entry) adds one reference. `forget` batches take them
//! away. A file system may reclaim an inode only once its count is zero *and* no directory entry
//! names it any more; the ledger only counts, reconciling the two is up to the handler.
//!
//! Keys whose count drops to zero are removed, so [`Ledger::len`] is the number of inodes the
//! kernel currently knows about.
//!
//! ```
//! use fuse_dispatch::fs::Ledger;
//!
//! let ledger = Ledger::new();
//! ledger.grant(7);
//! ledger.grant(7);
//! ledger.release(&[(7, 1)]).unwrap();
//! assert_eq!(ledger.count(7), 1);
//! ```

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::error;

use super::InodeAddr;

/// The kernel tried to drop more references than it holds.
///
/// Always a protocol violation or a dispatcher bug, never a user error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("forget of {requested} references to inode {ino} exceeds the {held} held by the kernel")]
pub struct Underflow {
    /// The inode.
    pub ino: InodeAddr,
    /// References held before the forget.
    pub held: u64,
    /// References the forget asked to drop.
    pub requested: u64,
}

/// Errors reported by [`Ledger::release`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// One or more entries of a forget batch would have gone below zero. Those counts were
    /// clamped to zero; the rest of the batch was applied.
    #[error("lookup count underflow on {} inode(s)", .0.len())]
    Underflow(Vec<Underflow>),
}

/// Per-inode count of references held by the kernel.
///
/// One instance per session. All methods take `&self`; a single mutex orders every grant and
/// forget, so per-inode operations are observed in the order they acquire it.
#[derive(Debug, Default)]
pub struct Ledger {
    counts: Mutex<FxHashMap<InodeAddr, u64>>,
}

impl Ledger {
    /// An empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference to `ino`, returning the count **after** incrementing.
    pub fn grant(&self, ino: InodeAddr) -> u64 {
        let mut counts = self.counts.lock();
        let count = counts.entry(ino).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop references for every `(ino, n)` pair of a forget batch.
    ///
    /// A pair asking for more than is held clamps that inode to zero and is reported in the
    /// error; the remaining pairs are still applied. Inodes reaching zero are removed.
    pub fn release(&self, batch: &[(InodeAddr, u64)]) -> Result<(), LedgerError> {
        let mut violations = Vec::new();
        {
            let mut counts = self.counts.lock();
            for &(ino, n) in batch {
                let held = counts.get(&ino).copied().unwrap_or(0);
                if n > held {
                    violations.push(Underflow {
                        ino,
                        held,
                        requested: n,
                    });
                }
                let remaining = held.saturating_sub(n);
                if remaining == 0 {
                    counts.remove(&ino);
                } else {
                    counts.insert(ino, remaining);
                }
            }
        }

        if violations.is_empty() {
            return Ok(());
        }
        for v in &violations {
            error!(ino = v.ino, held = v.held, requested = v.requested, "lookup count underflow");
        }
        Err(LedgerError::Underflow(violations))
    }

    /// References the kernel currently holds on `ino`.
    #[must_use]
    pub fn count(&self, ino: InodeAddr) -> u64 {
        self.counts.lock().get(&ino).copied().unwrap_or(0)
    }

    /// Number of inodes with a nonzero count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    /// Whether the kernel holds no references at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }

    /// Take every outstanding `(ino, count)` pair, leaving the ledger empty.
    ///
    /// Used at shutdown to synthesize the forgets the kernel will never send. Sorted by inode.
    pub fn drain(&self) -> Vec<(InodeAddr, u64)> {
        let mut outstanding: Vec<_> = self.counts.lock().drain().collect();
        outstanding.sort_unstable();
        outstanding
    }
}
