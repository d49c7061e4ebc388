//! Fixed worker pool for block encode/decode tasks.
//!
//! Tasks are run-to-completion closures producing no value to the pool;
//! side effects (publishing a result into the ordered queue) are the task's
//! responsibility, which is also how failures travel: a task pushes
//! `Err(..)` into its result slot rather than unwinding across the pool.
//!
//! With `num_threads == 0` there are no worker threads at all and
//! [`submit`](ThreadPool::submit) runs the task synchronously on the
//! caller's thread. That mode is deterministic and is what tests and
//! small inputs use.
//!
//! The internal work queue is a bounded channel of `num_threads *`
//! [`WORK_QUEUE_FACTOR`] slots. Producers additionally throttle on
//! [`depth`](ThreadPool::depth) before submitting, so the hard bound is
//! rarely hit.

use std::thread;

use crossbeam_channel::{bounded, Sender};

/// Work queue capacity per worker thread.
pub const WORK_QUEUE_FACTOR: usize = 4;

/// A unit of work for the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of worker threads with a bounded work queue.
#[derive(Debug)]
pub struct ThreadPool {
    sender: Option<Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
    num_threads: usize,
}

impl ThreadPool {
    /// Creates a pool with `num_threads` workers (zero runs tasks inline).
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        if num_threads == 0 {
            return Self {
                sender: None,
                workers: Vec::new(),
                num_threads: 0,
            };
        }

        let (sender, receiver) = bounded::<Task>(num_threads * WORK_QUEUE_FACTOR);
        let workers = (0..num_threads)
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("osmflow-worker-{i}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                    })
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
            num_threads,
        }
    }

    /// Number of worker threads (zero means inline mode).
    #[inline]
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Submits a task, returning the current work queue depth.
    ///
    /// In inline mode the task runs to completion before this returns and
    /// the depth is always zero. Otherwise the call blocks only when the
    /// bounded queue is completely full.
    pub fn submit(&self, task: Task) -> usize {
        match &self.sender {
            None => {
                task();
                0
            }
            Some(sender) => {
                sender.send(task).expect("worker pool channel closed");
                sender.len()
            }
        }
    }

    /// Current number of queued (not yet started) tasks.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Disconnect the channel; workers drain remaining tasks and exit.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn inline_mode_runs_on_caller() {
        let pool = ThreadPool::new(0);
        let caller = thread::current().id();
        let ran_on = Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&ran_on);
        let depth = pool.submit(Box::new(move || {
            *slot.lock().unwrap() = Some(thread::current().id());
        }));
        assert_eq!(depth, 0);
        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
    }

    #[test]
    fn all_tasks_complete_before_drop_returns() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(4);
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.submit(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn depth_reports_queued_work() {
        let pool = ThreadPool::new(1);
        let gate = Arc::new(std::sync::Barrier::new(2));
        let enter = Arc::clone(&gate);
        pool.submit(Box::new(move || {
            enter.wait();
        }));
        // With the single worker parked on the barrier, further tasks queue.
        let depth = pool.submit(Box::new(|| {}));
        assert!(depth >= 1);
        gate.wait();
    }
}
