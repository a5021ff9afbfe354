//! Offload wrapper for CPU-heavy work.
//!
//! The data-plane actors never block their own task; anything that grinds
//! through a cipher goes through [`offload`], which hands the closure to
//! the runtime's blocking pool. Completion is observed by awaiting the
//! handle on the originating task, which also gives the happens-before
//! edge between the work's writes and the caller's reads.

use anyhow::Context;
use tokio::task::JoinHandle;

/// Run `work` on the blocking pool.
pub fn offload<F, T>(work: F) -> WorkHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    WorkHandle {
        inner: tokio::task::spawn_blocking(work),
    }
}

/// Handle to one offloaded unit of work.
#[derive(Debug)]
pub struct WorkHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> WorkHandle<T> {
    /// Wait for the work to finish and take its result.
    ///
    /// Cancel-safe: may be polled from a select loop. Errors only if the
    /// work itself panicked.
    pub async fn finish(&mut self) -> anyhow::Result<T> {
        (&mut self.inner).await.context("offloaded work failed")
    }

    /// Abandon the work. If it has not started yet it never will; if it is
    /// already running it runs to completion and the result is dropped.
    pub fn discard(self) {
        self.inner.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offload_returns_the_work_result() {
        let mut handle = offload(|| 6 * 7);
        assert_eq!(handle.finish().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn discard_drops_the_result() {
        let handle = offload(|| vec![0u8; 1024]);
        handle.discard();
        // nothing to observe: the result must simply never be delivered
    }
}
