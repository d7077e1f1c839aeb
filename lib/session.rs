//! Session configuration, concurrency model selection and the mount lifecycle.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::fs::dispatch::Dispatcher;
use crate::fs::fuser::{FuserAdapter, FuserNotifySink};
use crate::fs::notify::{NotificationQueue, NotifyWorker};
use crate::fs::ops::Operations;

fn default_fsname() -> String {
    "fuse-dispatch".to_owned()
}

/// Options chosen once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionConfig {
    /// Run every handler on one thread, interleaving only at `.await` points.
    pub single_threaded: bool,

    /// Worker threads for the worker-pool model. Defaults to the available parallelism.
    pub workers: Option<usize>,

    /// Let the kernel check permissions. `access` is then never called.
    pub default_permissions: bool,

    /// Ask the kernel to coalesce writes in its page cache.
    pub writeback_cache: bool,

    /// Label shown as the mount source.
    pub fsname: String,

    /// Let users other than the mounting one access the file system.
    pub allow_other: bool,

    /// Unmount automatically when the process exits.
    pub auto_unmount: bool,

    /// Mount read-only.
    pub read_only: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            single_threaded: false,
            workers: None,
            default_permissions: true,
            writeback_cache: false,
            fsname: default_fsname(),
            allow_other: false,
            auto_unmount: false,
            read_only: false,
        }
    }
}

impl SessionConfig {
    /// Validate the configuration.
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers == Some(0) {
            errors.push("workers must be at least 1.".to_owned());
        }
        if self.single_threaded && self.workers.is_some_and(|w| w > 1) {
            errors.push("workers cannot be combined with single-threaded.".to_owned());
        }
        if self.fsname.is_empty() {
            errors.push("fsname must not be empty.".to_owned());
        } else if self.fsname.contains([',', '\0']) {
            errors.push(format!(
                "fsname '{}' must not contain commas or NUL bytes.",
                self.fsname.escape_debug()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The scheduling model these options select.
    #[must_use]
    pub fn concurrency(&self) -> ConcurrencyModel {
        if self.single_threaded {
            return ConcurrencyModel::SingleThreaded;
        }
        let workers = self
            .workers
            .and_then(NonZeroUsize::new)
            .or_else(|| std::thread::available_parallelism().ok())
            .unwrap_or(NonZeroUsize::MIN);
        ConcurrencyModel::WorkerPool { workers }
    }

    /// Options passed to the kernel at mount time.
    #[must_use]
    pub fn mount_options(&self) -> Vec<fuser::MountOption> {
        let mut opts = vec![
            fuser::MountOption::FSName(self.fsname.clone()),
            fuser::MountOption::NoDev,
            fuser::MountOption::Exec,
        ];
        opts.push(if self.read_only {
            fuser::MountOption::RO
        } else {
            fuser::MountOption::RW
        });
        if self.default_permissions {
            opts.push(fuser::MountOption::DefaultPermissions);
        }
        if self.allow_other {
            opts.push(fuser::MountOption::AllowOther);
        }
        if self.auto_unmount {
            opts.push(fuser::MountOption::AutoUnmount);
        }
        opts
    }
}

/// How request handlers are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyModel {
    /// Requests run in parallel on a pool of runtime threads.
    WorkerPool {
        /// Number of threads.
        workers: NonZeroUsize,
    },
    /// Requests run on the thread driving the runtime, one handler body at a time.
    SingleThreaded,
}

impl ConcurrencyModel {
    /// Build the runtime that executes handlers.
    pub fn build_runtime(self) -> std::io::Result<tokio::runtime::Runtime> {
        match self {
            Self::WorkerPool { workers } => tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers.get())
                .thread_name("fuse-dispatch-worker")
                .enable_all()
                .build(),
            Self::SingleThreaded => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build(),
        }
    }
}

/// A dispatcher ready to be mounted.
pub struct Session<F: Operations> {
    config: SessionConfig,
    dispatcher: Arc<Dispatcher<F>>,
    queue: NotificationQueue,
}

impl<F: Operations> Session<F> {
    /// Pair a dispatcher with the queue its file system's [`Invalidator`](crate::fs::Invalidator)
    /// feeds.
    pub fn new(config: SessionConfig, dispatcher: Dispatcher<F>, queue: NotificationQueue) -> Self {
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            queue,
        }
    }

    /// The dispatcher requests will be routed through.
    pub fn dispatcher(&self) -> &Arc<Dispatcher<F>> {
        &self.dispatcher
    }

    /// Mount on `mount_point`, running handlers on `runtime`.
    ///
    /// Notifications queued before this call are delivered once the mount is up.
    pub fn mount(
        self,
        mount_point: &Path,
        runtime: tokio::runtime::Handle,
    ) -> std::io::Result<MountedSession<F>> {
        let adapter = FuserAdapter::new(
            Arc::clone(&self.dispatcher),
            runtime,
            self.config.writeback_cache,
        );
        let ended = adapter.ended();
        let options = self.config.mount_options();
        debug!(?options, mount_point = %mount_point.display(), "mounting");

        let background = fuser::spawn_mount2(adapter, mount_point, &options)?;
        let worker = self
            .queue
            .spawn_worker(FuserNotifySink::new(background.notifier()))?;
        info!(mount_point = %mount_point.display(), "session mounted");

        Ok(MountedSession {
            mount_point: mount_point.to_path_buf(),
            dispatcher: self.dispatcher,
            background,
            worker,
            ended,
        })
    }
}

/// A live mount.
pub struct MountedSession<F: Operations> {
    mount_point: PathBuf,
    dispatcher: Arc<Dispatcher<F>>,
    background: fuser::BackgroundSession,
    worker: NotifyWorker,
    ended: Arc<tokio::sync::Notify>,
}

impl<F: Operations> MountedSession<F> {
    /// Where the file system is mounted.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// The dispatcher serving this mount.
    pub fn dispatcher(&self) -> &Arc<Dispatcher<F>> {
        &self.dispatcher
    }

    /// Resolves once the kernel ends the session, e.g. after an external `umount`.
    pub async fn ended(&self) {
        self.ended.notified().await;
    }

    /// Stop notifications, unmount, then hand the handler a forget for every reference the kernel
    /// still held. Requests still in flight finish their grants first.
    pub async fn unmount(self) {
        let Self {
            mount_point,
            dispatcher,
            background,
            worker,
            ended: _,
        } = self;

        debug!(mount_point = %mount_point.display(), "stopping session");
        let stopped = tokio::task::spawn_blocking(move || {
            worker.stop();
            background.join();
        })
        .await;
        if let Err(e) = stopped {
            error!(error = %e, "session teardown panicked");
        }

        dispatcher.shutdown().await;
        info!(mount_point = %mount_point.display(), "session ended");
    }
}
