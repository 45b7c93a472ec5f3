//! Counted completion barrier.
//!
//! The session controller hands one [`Completion`] to every loop it starts and
//! then waits on the [`CompletionLatch`] until all of them have reported in.
//! A `Completion` signals exactly once: either through [`Completion::done`] or,
//! if the owning loop unwinds before reaching it, when it is dropped.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::watch;

#[derive(Debug)]
pub struct CompletionLatch {
    registered: AtomicUsize,
    remaining: Arc<watch::Sender<usize>>,
}

impl CompletionLatch {
    pub fn new() -> Self {
        let (remaining, _) = watch::channel(0);
        Self {
            registered: AtomicUsize::new(0),
            remaining: Arc::new(remaining),
        }
    }

    /// Registers one more participant. Register every participant before any
    /// of them can finish, otherwise [`wait`](Self::wait) may return early.
    pub fn participant(&self) -> Completion {
        self.registered.fetch_add(1, Ordering::Relaxed);
        self.remaining.send_modify(|remaining| *remaining += 1);
        Completion {
            latch: Some(Arc::clone(&self.remaining)),
        }
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Resolves once at least one registered participant has completed.
    pub async fn first_completion(&self) {
        let registered = self.registered.load(Ordering::Relaxed);
        self.wait_until(|remaining| remaining < registered).await;
    }

    /// Resolves once every registered participant has completed.
    pub async fn wait(&self) {
        self.wait_until(|remaining| remaining == 0).await;
    }

    async fn wait_until(&self, mut reached: impl FnMut(usize) -> bool) {
        let mut progress = self.remaining.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = progress.wait_for(|remaining| reached(*remaining)).await;
    }
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant's "I am done" notification.
#[derive(Debug)]
pub struct Completion {
    latch: Option<Arc<watch::Sender<usize>>>,
}

impl Completion {
    pub fn done(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(latch) = self.latch.take() {
            latch.send_modify(|remaining| *remaining = remaining.saturating_sub(1));
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.signal();
    }
}
