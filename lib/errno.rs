//! POSIX error codes and the error channel handlers reply through.
//!
//! Handlers signal failure with [`OpError`]. An [`OpError::Errno`] is a legitimate protocol
//! answer and reaches the kernel verbatim. An [`OpError::Defect`] is a bug in the handler: the
//! dispatcher logs it and answers the request with [`Errno::EIO`].

use std::fmt;

use thiserror::Error;

/// A POSIX error code as sent to the kernel in a reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Errno(i32);

impl Errno {
    /// Operation not permitted.
    pub const EPERM: Self = Self(libc::EPERM);
    /// No such file or directory.
    pub const ENOENT: Self = Self(libc::ENOENT);
    /// Input/output error. Used for handler defects.
    pub const EIO: Self = Self(libc::EIO);
    /// Bad file handle.
    pub const EBADF: Self = Self(libc::EBADF);
    /// Permission denied.
    pub const EACCES: Self = Self(libc::EACCES);
    /// Entry already exists.
    pub const EEXIST: Self = Self(libc::EEXIST);
    /// Cross-device link.
    pub const EXDEV: Self = Self(libc::EXDEV);
    /// Not a directory.
    pub const ENOTDIR: Self = Self(libc::ENOTDIR);
    /// Is a directory.
    pub const EISDIR: Self = Self(libc::EISDIR);
    /// Invalid argument.
    pub const EINVAL: Self = Self(libc::EINVAL);
    /// Read-only file system.
    pub const EROFS: Self = Self(libc::EROFS);
    /// Result too large for the supplied buffer.
    pub const ERANGE: Self = Self(libc::ERANGE);
    /// Name too long.
    pub const ENAMETOOLONG: Self = Self(libc::ENAMETOOLONG);
    /// Operation not implemented. Sticky for the rest of the session.
    pub const ENOSYS: Self = Self(libc::ENOSYS);
    /// Directory not empty.
    pub const ENOTEMPTY: Self = Self(libc::ENOTEMPTY);
    /// Operation not supported.
    pub const ENOTSUP: Self = Self(libc::ENOTSUP);
    /// The session has shut down.
    pub const ENOTCONN: Self = Self(libc::ENOTCONN);

    /// Extended attribute not found.
    #[cfg(target_os = "linux")]
    pub const ENOATTR: Self = Self(libc::ENODATA);
    /// Extended attribute not found.
    #[cfg(not(target_os = "linux"))]
    pub const ENOATTR: Self = Self(libc::ENOATTR);

    /// Wrap a raw error code.
    #[must_use]
    pub const fn from_raw(code: i32) -> Self {
        Self(code)
    }

    /// The raw error code, as placed in a reply header.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", nix::errno::Errno::from_raw(self.0))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&nix::errno::Errno::from_raw(self.0), f)
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for i32 {
    fn from(errno: Errno) -> Self {
        errno.0
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(errno: nix::errno::Errno) -> Self {
        Self(errno as i32)
    }
}

/// Failure returned by an [`Operations`](crate::fs::ops::Operations) method.
#[derive(Debug, Error)]
pub enum OpError {
    /// A protocol-level answer, forwarded to the kernel unchanged.
    #[error(transparent)]
    Errno(#[from] Errno),

    /// A bug in the handler. Logged and answered with `EIO`.
    #[error("internal defect: {0}")]
    Defect(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl OpError {
    /// Report a handler defect.
    pub fn defect(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Defect(err.into())
    }

    /// The errno this failure carries, if it is not a defect.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Errno(e) => Some(*e),
            Self::Defect(_) => None,
        }
    }
}

/// I/O errors that carry an OS error code are protocol answers. Anything else is a defect.
impl From<std::io::Error> for OpError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Self::Errno(Errno::from_raw(code)),
            None => Self::Defect(Box::new(err)),
        }
    }
}

/// Result type of every handler method.
pub type OpResult<T> = Result<T, OpError>;
