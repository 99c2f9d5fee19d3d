//! A bounded pool of worker threads consuming a shared job queue.
//!
//! Each pipeline stage (article fetch/rewrite, redirect lookup, media
//! download, media optimization) owns one of these. The pool width is the
//! stage's concurrency bound; `drain` is the phase barrier the orchestrator
//! leans on between stages.

use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::Arc,
    thread::{self, JoinHandle},
};

/// Shared queue state, guarded by the pool mutex.
struct State<T> {
    /// Jobs accepted but not yet picked up by a worker.
    jobs: VecDeque<T>,
    /// Number of workers currently executing a job.
    active: usize,
    /// Set once to make workers exit after the queue empties.
    closing: bool,
}

/// Internals shared between the handle and the workers.
struct Shared<T> {
    state: Mutex<State<T>>,
    /// Signalled when a job arrives, a job finishes, or the pool closes.
    signal: Condvar,
}

/// A fixed-width pool of named worker threads over a shared FIFO queue.
///
/// Jobs pushed while the pool is draining are still executed; `drain` only
/// returns once the queue is empty *and* every worker is idle, so it is safe
/// for upstream stages to feed a queue right up to their own drain point.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Spawns `width` worker threads named `{name}-{index}` running `work`
    /// for every job.
    pub fn new<F>(name: &str, width: usize, work: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                active: 0,
                closing: false,
            }),
            signal: Condvar::new(),
        });

        let work = Arc::new(work);
        let workers = (0..width.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                let work = Arc::clone(&work);
                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || {
                        loop {
                            let job = {
                                let mut state = shared.state.lock();
                                loop {
                                    if let Some(job) = state.jobs.pop_front() {
                                        state.active += 1;
                                        break job;
                                    }
                                    if state.closing {
                                        return;
                                    }
                                    shared.signal.wait(&mut state);
                                }
                            };

                            work(job);

                            let mut state = shared.state.lock();
                            state.active -= 1;
                            // Wake both idle workers and any drain waiter.
                            shared.signal.notify_all();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a job.
    pub fn push(&self, job: T) {
        let mut state = self.shared.state.lock();
        state.jobs.push_back(job);
        self.shared.signal.notify_one();
    }

    /// The number of jobs waiting for a worker. In-flight jobs are not
    /// counted; this is the back-pressure signal, not a completion signal.
    pub fn len(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    /// Blocks until the queue is empty and every worker is idle.
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        while !state.jobs.is_empty() || state.active != 0 {
            self.shared.signal.wait(&mut state);
        }
    }

    /// Finishes the remaining jobs, then stops and joins every worker.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closing = true;
            self.shared.signal.notify_all();
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_all_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let queue = WorkQueue::new("test", 4, move |n: usize| {
            seen.fetch_add(n, Ordering::SeqCst);
        });
        for n in 1..=100 {
            queue.push(n);
        }
        queue.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 5050);
        queue.shutdown();
    }

    #[test]
    fn drain_waits_for_in_flight_work() {
        let done = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&done);
        let queue = WorkQueue::new("slow", 2, move |(): ()| {
            thread::sleep(Duration::from_millis(50));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        queue.push(());
        queue.push(());
        queue.push(());
        queue.drain();
        assert_eq!(done.load(Ordering::SeqCst), 3);
        queue.shutdown();
    }

    #[test]
    fn width_bounds_concurrency() {
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let (peak2, current2) = (Arc::clone(&peak), Arc::clone(&current));
        let queue = WorkQueue::new("bounded", 3, move |(): ()| {
            let now = current2.fetch_add(1, Ordering::SeqCst) + 1;
            peak2.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            current2.fetch_sub(1, Ordering::SeqCst);
        });
        for _ in 0..12 {
            queue.push(());
        }
        queue.drain();
        assert!(peak.load(Ordering::SeqCst) <= 3);
        queue.shutdown();
    }
}
