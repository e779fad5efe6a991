//! Thread-affinity capability handed to handlers
//!
//! Handlers run on the transport's inbound thread. State owned by another thread
//! (a simulation loop, a UI) must be touched from a task queued onto that thread;
//! the host decides how through a [`TaskScheduler`].

use thiserror::Error;
use tokio::sync::mpsc;

/// A unit of work to run on the owner thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Owner thread is no longer accepting tasks")]
    Closed,
}

/// Queues tasks onto a thread or executor owned by the host application
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, task: Task) -> Result<(), ScheduleError>;
}

/// Owner-thread task queue drained by the host's own loop (a game tick, a frame).
///
/// The queue is the receiving half; hand [`TaskQueue::scheduler`] to channels.
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    rx: mpsc::UnboundedReceiver<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn scheduler(&self) -> QueueScheduler {
        QueueScheduler {
            tx: self.tx.clone(),
        }
    }

    /// Run every task queued so far; returns how many ran
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait for the next task and run it
    pub async fn run_next(&mut self) {
        // the queue keeps a sender of its own, so recv only yields tasks
        if let Some(task) = self.rx.recv().await {
            task();
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending half of a [`TaskQueue`]
#[derive(Clone, Debug)]
pub struct QueueScheduler {
    tx: mpsc::UnboundedSender<Task>,
}

impl TaskScheduler for QueueScheduler {
    fn schedule(&self, task: Task) -> Result<(), ScheduleError> {
        self.tx.send(task).map_err(|_| ScheduleError::Closed)
    }
}

/// Runs tasks on a tokio runtime's blocking pool
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime the caller is running on
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule(&self, task: Task) -> Result<(), ScheduleError> {
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_queue_runs_on_drain() {
        let mut queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            scheduler
                .schedule(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_pending(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn test_closed_queue_rejects() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        drop(queue);
        assert_eq!(scheduler.schedule(Box::new(|| {})), Err(ScheduleError::Closed));
    }

    #[test]
    fn test_run_next_waits_for_task() {
        let mut queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let counter = Arc::new(AtomicUsize::new(0));

        let task_counter = counter.clone();
        std::thread::spawn(move || {
            scheduler
                .schedule(Box::new(move || {
                    task_counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        });

        tokio_test::block_on(queue.run_next());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tokio_scheduler() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        TokioScheduler::current()
            .schedule(Box::new(move || {
                let _ = tx.send(std::thread::current().name().map(str::to_string));
            }))
            .unwrap();
        assert!(rx.await.is_ok());
    }
}
