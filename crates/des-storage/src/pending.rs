//! Pending-operation barrier.
//!
//! Every write against a store holds a [`PendingGuard`] for its duration.
//! [`PendingOps::wait_idle`] resolves once no guard is alive, which is what
//! lets a handle disconnect without racing its own background writers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct PendingOps {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one in-flight operation.
    pub fn enter(self: &Arc<Self>) -> PendingGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        PendingGuard {
            ops: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until every registered operation has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not missed.
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub struct PendingGuard {
    ops: Arc<PendingOps>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.ops.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.ops.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_idle_without_ops() {
        let ops = PendingOps::new();
        tokio::time::timeout(Duration::from_millis(100), ops.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_blocks_until_release() {
        let ops = PendingOps::new();
        let a = ops.enter();
        let b = ops.enter();
        assert_eq!(ops.in_flight(), 2);

        let waiter = {
            let ops = ops.clone();
            tokio::spawn(async move { ops.wait_idle().await })
        };

        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ops.in_flight(), 0);
    }
}
