//! FUSE availability checks, run before attempting a mount.

#[cfg(target_os = "linux")]
use std::path::PathBuf;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::path::Path;

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The kernel device is absent: the module is not loaded or not exposed in this container.
    #[cfg(target_os = "linux")]
    #[error(
        "{path} does not exist. Load the fuse kernel module (`modprobe fuse`) or, inside a \
         container, pass the device through."
    )]
    DeviceMissing {
        /// Expected device path.
        path: &'static str,
    },

    /// The device exists but is not a character device.
    #[cfg(target_os = "linux")]
    #[error("{path} exists but is not a character device.")]
    NotADevice {
        /// Device path.
        path: &'static str,
    },

    /// No setuid mount helper on `PATH`.
    #[cfg(target_os = "linux")]
    #[error("Neither fusermount3 nor fusermount was found on PATH. Install fuse3.")]
    MountHelperMissing,

    /// macFUSE is not installed at all.
    #[cfg(target_os = "macos")]
    #[error(
        "macFUSE is not installed. fuse-dispatch requires macFUSE to mount file systems.\n\
         Install it from: https://macfuse.github.io/"
    )]
    MacFuseMissing,
}

#[cfg(target_os = "linux")]
const FUSE_DEVICE: &str = "/dev/fuse";

#[cfg(target_os = "linux")]
const MOUNT_HELPERS: [&str; 2] = ["fusermount3", "fusermount"];

#[cfg(target_os = "macos")]
const MACFUSE_MOUNT_HELPER: &str =
    "/Library/Filesystems/macfuse.fs/Contents/Resources/mount_macfuse";

#[cfg(target_os = "linux")]
/// The first executable named `name` on `PATH`.
fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(target_os = "linux")]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;

    std::fs::metadata(path)
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// On Linux this checks for the `/dev/fuse` character device and a `fusermount` helper.
#[cfg(target_os = "linux")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    use std::os::unix::fs::FileTypeExt as _;

    let meta = std::fs::metadata(FUSE_DEVICE)
        .map_err(|_| FuseCheckError::DeviceMissing { path: FUSE_DEVICE })?;
    if !meta.file_type().is_char_device() {
        return Err(FuseCheckError::NotADevice { path: FUSE_DEVICE });
    }

    let helper = MOUNT_HELPERS
        .iter()
        .find_map(|name| find_on_path(name))
        .ok_or(FuseCheckError::MountHelperMissing)?;
    tracing::debug!(helper = %helper.display(), "found FUSE mount helper");
    Ok(())
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// On macOS this checks for the macFUSE mount helper.
#[cfg(target_os = "macos")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if Path::new(MACFUSE_MOUNT_HELPER).is_file() {
        Ok(())
    } else {
        Err(FuseCheckError::MacFuseMissing)
    }
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// Elsewhere this is a no-op; the mount itself reports what is missing.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    Ok(())
}
