//! Template reaper
//!
//! Detached templates (future or callback delivery) have no caller thread
//! to enforce their deadline. A background thread wakes every
//! `reaper_interval` and times them out. It holds only a weak reference so
//! dropping the engine stops it.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

use gridspace_core::{Result, SpaceError};

use crate::engine::EngineInner;

/// Start the reaper thread for `inner`
pub(crate) fn spawn(inner: &Arc<EngineInner>) -> Result<JoinHandle<()>> {
    let weak = Arc::downgrade(inner);
    let interval = inner.config.reaper_interval();
    thread::Builder::new()
        .name(format!("gridspace-reaper-{}", inner.config.name))
        .spawn(move || run(weak, interval))
        .map_err(|err| SpaceError::Internal(format!("cannot start template reaper: {err}")))
}

fn run(weak: Weak<EngineInner>, interval: std::time::Duration) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        {
            let mut stopped = inner.shutdown.lock();
            if *stopped {
                return;
            }
            inner.shutdown_signal.wait_for(&mut stopped, interval);
            if *stopped {
                return;
            }
        }
        inner.reap(Instant::now());
    }
}

impl EngineInner {
    /// Time out every detached template whose deadline passed
    pub(crate) fn reap(&self, now: Instant) -> usize {
        let expired = self.templates.expired(now);
        for pending in &expired {
            match self.expire(pending) {
                Err(SpaceError::Timeout { uid, waited_ms }) => {
                    warn!(template = %pending.handle, uid = ?uid, waited_ms, "pending template timed out");
                }
                _ => debug!(template = %pending.handle, "pending template expired"),
            }
        }
        expired.len()
    }
}
