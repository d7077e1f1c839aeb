#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::OsStr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use common::{ctx, os};
use fuse_dispatch::errno::{Errno, OpResult};
use fuse_dispatch::fs::{
    Dispatcher, EntryAttributes, FileKind, InodeAddr, Ledger, Operations, ROOT_INODE,
    RequestContext,
};
use fuse_dispatch::session::ConcurrencyModel;

const FILE_INODE: InodeAddr = 42;

/// Parks `lookup("parked")` until released, and flags any count change seen inside a handler
/// body that does not await.
#[derive(Debug, Default)]
struct Gated {
    ledger: Arc<Ledger>,
    entered: Notify,
    release: Notify,
    torn: AtomicBool,
    forgotten: Mutex<Vec<Vec<(InodeAddr, u64)>>>,
}

impl Operations for Gated {
    async fn lookup(
        &self,
        _parent: InodeAddr,
        name: &OsStr,
        _ctx: &RequestContext,
    ) -> OpResult<EntryAttributes> {
        if name == "parked" {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let before = self.ledger.count(FILE_INODE);
        std::thread::sleep(Duration::from_micros(200));
        if self.ledger.count(FILE_INODE) != before {
            self.torn.store(true, Ordering::SeqCst);
        }
        Ok(EntryAttributes::new(FILE_INODE, FileKind::File))
    }

    async fn forget(&self, batch: &[(InodeAddr, u64)]) -> OpResult<()> {
        self.forgotten.lock().push(batch.to_vec());
        Ok(())
    }
}

fn gated() -> Arc<Dispatcher<Gated>> {
    let ledger = Arc::new(Ledger::new());
    let fs = Gated {
        ledger: Arc::clone(&ledger),
        ..Gated::default()
    };
    Arc::new(Dispatcher::with_ledger(fs, ledger))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_lookups_in_flight() {
    let dispatcher = gated();
    let lookup = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.lookup(ROOT_INODE, os("parked"), &ctx()).await }
    });
    dispatcher.operations().entered.notified().await;

    let shutdown = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !shutdown.is_finished(),
        "shutdown finished while a lookup was still running"
    );

    dispatcher.operations().release.notify_one();
    assert_eq!(lookup.await.unwrap().unwrap().ino, FILE_INODE);
    shutdown.await.unwrap();

    assert!(dispatcher.ledger().is_empty());
    assert_eq!(
        *dispatcher.operations().forgotten.lock(),
        vec![vec![(FILE_INODE, 1)]]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn granting_requests_after_shutdown_are_refused() {
    let dispatcher = gated();
    dispatcher.shutdown().await;

    let err = dispatcher
        .lookup(ROOT_INODE, os("a"), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err, Errno::ENOTCONN);
    assert!(dispatcher.ledger().is_empty());
    assert!(dispatcher.operations().forgotten.lock().is_empty());
}

#[test]
fn current_thread_forgets_are_applied_by_the_runtime() {
    let runtime = ConcurrencyModel::SingleThreaded.build_runtime().unwrap();
    let dispatcher = gated();
    runtime
        .block_on(dispatcher.lookup(ROOT_INODE, os("a"), &ctx()))
        .unwrap();

    let handle = runtime.handle().clone();
    let transport = Arc::clone(&dispatcher);
    let delivery = std::thread::spawn(move || {
        transport.submit_forget(&handle, vec![(FILE_INODE, 1)])
    })
    .join()
    .unwrap();
    assert_eq!(
        dispatcher.ledger().count(FILE_INODE),
        1,
        "the transport thread must not touch the ledger"
    );

    runtime.block_on(delivery).unwrap();
    assert!(dispatcher.ledger().is_empty());
    assert_eq!(
        *dispatcher.operations().forgotten.lock(),
        vec![vec![(FILE_INODE, 1)]]
    );
}

#[test]
fn worker_pool_forgets_are_applied_before_returning() {
    let runtime = ConcurrencyModel::WorkerPool {
        workers: NonZeroUsize::new(2).unwrap(),
    }
    .build_runtime()
    .unwrap();
    let dispatcher = gated();
    runtime
        .block_on(dispatcher.lookup(ROOT_INODE, os("a"), &ctx()))
        .unwrap();

    let delivery = dispatcher.submit_forget(runtime.handle(), vec![(FILE_INODE, 1)]);
    assert!(dispatcher.ledger().is_empty());

    runtime.block_on(delivery).unwrap();
    assert_eq!(dispatcher.operations().forgotten.lock().len(), 1);
}

#[test]
fn single_threaded_handlers_never_see_a_count_move() {
    let runtime = ConcurrencyModel::SingleThreaded.build_runtime().unwrap();
    let dispatcher = gated();
    runtime.block_on(async {
        for _ in 0..50 {
            dispatcher.lookup(ROOT_INODE, os("a"), &ctx()).await.unwrap();
        }
    });

    let handle = runtime.handle().clone();
    let transport = {
        let dispatcher = Arc::clone(&dispatcher);
        std::thread::spawn(move || {
            (0..50)
                .map(|_| dispatcher.submit_forget(&handle, vec![(FILE_INODE, 1)]))
                .collect::<Vec<_>>()
        })
    };
    runtime.block_on(async {
        for _ in 0..20 {
            dispatcher.lookup(ROOT_INODE, os("a"), &ctx()).await.unwrap();
            tokio::task::yield_now().await;
        }
    });
    let deliveries = transport.join().unwrap();
    runtime.block_on(async {
        for delivery in deliveries {
            delivery.await.unwrap();
        }
    });

    assert!(!dispatcher.operations().torn.load(Ordering::SeqCst));
    assert_eq!(dispatcher.ledger().count(FILE_INODE), 20);
    assert_eq!(dispatcher.operations().forgotten.lock().len(), 50);
}
