//! FUSE request dispatch and inode lifecycle.
//!
//! A file system implements [`fs::Operations`]; a [`fs::Dispatcher`] routes kernel requests to
//! it, keeps the per-inode lookup-count [`fs::Ledger`] and maps outcomes to replies, and a
//! [`session::Session`] mounts it through `fuser`.

/// POSIX error codes and the handler error channel.
pub mod errno;
/// Request dispatch, inode lifecycle and the types shared by handlers and transports.
pub mod fs;
/// Session configuration and mount lifecycle.
pub mod session;
