//! Single-threaded owning execution context.
//!
//! Each partition owns one of these; every log mutation and every entry
//! application runs on its thread. Components that must only be touched
//! from that thread call [`PartitionContext::check_thread`] at their entry
//! points and fail fast instead of corrupting concurrent readers.
//!
//! Jobs are executed strictly in submission order. Completion callbacks
//! for asynchronous work are re-submitted here so the single-writer
//! discipline survives I/O hand-offs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ContextError;

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

pub struct PartitionContext {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
    owner: ThreadId,
    closed: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionContext {
    /// Spawns the owning thread and returns a handle for submitting work.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!(context = %thread_name, "owning thread started");
                while let Some(job) = rx.blocking_recv() {
                    match job {
                        Job::Run(f) => f(),
                        Job::Shutdown => break,
                    }
                }
                debug!(context = %thread_name, "owning thread stopped");
            })?;

        let owner = handle.thread().id();
        Ok(Self {
            name,
            tx,
            owner,
            closed: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is the owning thread.
    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Fails fast when called off the owning thread.
    pub fn check_thread(&self) -> Result<(), ContextError> {
        if self.is_owner() {
            Ok(())
        } else {
            Err(ContextError::WrongThread {
                context: self.name.clone(),
            })
        }
    }

    /// Queues `f` to run on the owning thread, after all previously
    /// submitted jobs. Safe to call from any thread, including the owning
    /// thread itself (the job runs later in the loop, never inline).
    pub fn execute<F>(&self, f: F) -> Result<(), ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(ContextError::Closed(self.name.clone()));
        }
        self.tx
            .send(Job::Run(Box::new(f)))
            .map_err(|_| ContextError::Closed(self.name.clone()))
    }

    /// Stops the owning thread after draining already-queued jobs.
    /// Subsequent `execute` calls fail with `Closed`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Job::Shutdown);
        if self.is_owner() {
            // Joining from the owning thread would deadlock; the loop
            // exits once the shutdown job is reached.
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!(context = %self.name, "owning thread panicked during shutdown");
            }
        }
    }
}

impl Drop for PartitionContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PartitionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionContext")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn jobs_run_in_submission_order() {
        let ctx = PartitionContext::spawn("test-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            ctx.execute(move || seen.lock().push(i)).unwrap();
        }
        ctx.shutdown();

        let seen = seen.lock();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn check_thread_rejects_foreign_thread() {
        let ctx = Arc::new(PartitionContext::spawn("test-check").unwrap());
        assert!(matches!(
            ctx.check_thread(),
            Err(ContextError::WrongThread { .. })
        ));

        let (tx, rx) = std_mpsc::channel();
        let inner = ctx.clone();
        ctx.execute(move || {
            tx.send(inner.check_thread().is_ok()).unwrap();
        })
        .unwrap();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn execute_after_shutdown_fails() {
        let ctx = PartitionContext::spawn("test-closed").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        ctx.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        ctx.shutdown();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(
            ctx.execute(|| {}),
            Err(ContextError::Closed(_))
        ));
    }
}
