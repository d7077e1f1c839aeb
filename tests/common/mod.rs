#![allow(dead_code, missing_docs, clippy::unwrap_used)]

pub mod kernel;
pub mod memfs;

use std::ffi::OsStr;
use std::time::Duration;

use fuse_dispatch::fs::RequestContext;

/// Context of an ordinary process owned by uid/gid 1000.
pub fn ctx() -> RequestContext {
    RequestContext {
        uid: 1000,
        gid: 1000,
        pid: 4242,
        umask: 0o022,
    }
}

pub fn os(name: &str) -> &OsStr {
    OsStr::new(name)
}

/// Escalating sleep between retries of a check whose effect is not confirmed synchronously.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
    remaining: u32,
}

impl Backoff {
    /// 1 ms doubling up to 256 ms, for at most 12 waits (about two seconds in total).
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(1),
            remaining: 12,
        }
    }

    /// Sleep before the next attempt. Returns `false` once the budget is spent.
    pub async fn wait(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay * 2).min(Duration::from_millis(256));
        true
    }
}
