use std::path::{Path, PathBuf};

use fuse_dispatch::fs::Dispatcher;
use fuse_dispatch::fs::hello::HelloFs;
use fuse_dispatch::fs::notify;
use fuse_dispatch::session::Session;
use tokio::select;
use tracing::{debug, error, info};

use crate::app_config;

mod managed_fuse {
    //! fuser only performs a regular unmount when its session is dropped. After every session we
    //! make sure the mount point is really gone, detaching it if something still holds it busy.
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{debug, error};

    /// The mount point could not be released.
    #[derive(Debug, thiserror::Error)]
    #[error("failed to unmount {}: {source}", mount_point.display())]
    pub struct UnmountError {
        mount_point: PathBuf,
        #[source]
        source: Errno,
    }

    impl From<UnmountError> for std::io::Error {
        fn from(err: UnmountError) -> Self {
            Self::other(err)
        }
    }

    fn force_unmount(mount_point: &Path) -> nix::Result<()> {
        #[cfg(target_os = "macos")]
        {
            nix::mount::unmount(mount_point, nix::mount::MntFlags::MNT_FORCE)
        }

        #[cfg(target_os = "linux")]
        {
            nix::mount::umount2(mount_point, nix::mount::MntFlags::MNT_DETACH)
        }
    }

    /// Confirm that nothing is mounted on `mount_point` any more.
    pub fn ensure_unmounted(mount_point: &Path) -> Result<(), UnmountError> {
        const UMOUNT_ATTEMPT_COUNT: usize = 10;
        const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

        debug!(mount_point = ?mount_point, "Confirming unmount of FUSE filesystem...");

        let mut last = Errno::EBUSY;
        for attempt in 1..=UMOUNT_ATTEMPT_COUNT {
            match force_unmount(mount_point) {
                Ok(()) => {
                    debug!("Successfully unmounted FUSE filesystem on attempt {attempt}");
                    return Ok(());
                }
                Err(Errno::EBUSY) => {
                    debug!("FUSE filesystem still busy on attempt {attempt}. Retrying...");
                    std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                }
                Err(Errno::EINVAL | Errno::ENOENT) => {
                    debug!("FUSE filesystem already unmounted (attempt {attempt})");
                    return Ok(());
                }
                Err(e) => {
                    error!("Failed to unmount FUSE filesystem on attempt {attempt}: {e}");
                    last = e;
                    break;
                }
            }
        }

        Err(UnmountError {
            mount_point: mount_point.to_path_buf(),
            source: last,
        })
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Mount the demonstration file system and serve it until a signal arrives or the kernel ends
/// the session.
pub async fn run(
    config: app_config::Config,
    mount_point: PathBuf,
    handle: tokio::runtime::Handle,
) -> Result<(), std::io::Error> {
    prepare_mount_point(&mount_point).await?;

    let (invalidator, queue) = notify::channel();
    let fs = HelloFs::new().with_invalidator(invalidator);
    let session = Session::new(config.session, Dispatcher::new(fs), queue);

    info!("Mounting filesystem at {}.", mount_point.display());
    let mounted = session.mount(&mount_point, handle)?;
    info!("fuse-dispatch is running. Press Ctrl+C to stop.");

    let waited = select! {
        res = wait_for_exit() => res,
        () = mounted.ended() => {
            info!("Filesystem was unmounted externally.");
            Ok(())
        }
    };

    mounted.unmount().await;
    let unmounted = tokio::task::spawn_blocking(move || {
        managed_fuse::ensure_unmounted(&mount_point)
    })
    .await
    .map_err(std::io::Error::other)?;

    waited?;
    unmounted?;
    Ok(())
}

/// Build the runtime the configuration asks for and run the daemon on it.
pub fn spawn(config: app_config::Config, mount_point: PathBuf) -> Result<(), std::io::Error> {
    let concurrency = config.session.concurrency();
    debug!(?concurrency, "Building runtime...");
    let runtime = concurrency.build_runtime()?;
    runtime.block_on(run(config, mount_point, runtime.handle().clone()))
}
