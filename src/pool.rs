//! A small worker pool with a priority lane, and a handle to a task's result.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads draining a FIFO, with a lane that jumps the queue.
///
/// Every submitted task runs at most once. Tasks still queued when the pool
/// stops without blocking are dropped unrun.
pub struct WorkQueue {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    state: Mutex<State>,
    work: Condvar,
    idle: Condvar,
}

struct State {
    running: bool,
    priority: VecDeque<Task>,
    normal: VecDeque<Task>,
    active: usize,
}

impl State {
    fn pending(&self) -> usize {
        self.priority.len() + self.normal.len()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        WorkQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    running: false,
                    priority: VecDeque::new(),
                    normal: VecDeque::new(),
                    active: 0,
                }),
                work: Condvar::new(),
                idle: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start `threads` workers, or one per core for 0.
    pub fn start(&self, threads: usize) {
        let mut handles = self.threads.lock();
        {
            let mut state = self.inner.state.lock();
            if state.running {
                warn!("Work queue already running");
                return;
            }
            state.running = true;
        }

        let count = if threads == 0 {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            threads
        };

        for i in 0..count {
            let inner = self.inner.clone();
            let spawned = thread::Builder::new()
                .name(format!("seclink-worker-{}", i))
                .spawn(move || worker(inner));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Failed to spawn worker {}: {}", i, e),
            }
        }
        debug!("Work queue started with {} threads", handles.len());
    }

    /// Stop the workers.
    ///
    /// With `block`, queued tasks are drained first and this returns once
    /// every worker has exited. Without, queued tasks are dropped and the
    /// workers exit after their current task.
    pub fn stop(&self, block: bool) {
        let mut handles = self.threads.lock();
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            if !block {
                let dropped = state.pending();
                state.priority.clear();
                state.normal.clear();
                if dropped > 0 {
                    debug!("Drop {} queued tasks", dropped);
                }
            }
        }
        self.inner.work.notify_all();

        let current = thread::current().id();
        for handle in handles.drain(..) {
            if !block || handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Worker panicked");
            }
        }
        debug!("Work queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Queue a task at the back.
    pub fn submit<T, F>(&self, task: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.enqueue(task, false)
    }

    /// Queue a task ahead of every normal one.
    pub fn submit_priority<T, F>(&self, task: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.enqueue(task, true)
    }

    fn enqueue<T, F>(&self, task: F, priority: bool) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let pending = Pending::new();
        let slot = pending.clone();
        let task: Task = Box::new(move || slot.set(task()));

        {
            let mut state = self.inner.state.lock();
            if !state.running {
                warn!("Task submitted to a stopped work queue, it will not run");
            }
            if priority {
                state.priority.push_back(task);
            } else {
                state.normal.push_back(task);
            }
        }
        self.inner.work.notify_one();

        pending
    }

    /// Wait until nothing is queued or running. False on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.pending() > 0 || state.active > 0 {
            if self.inner.idle.wait_until(&mut state, deadline).timed_out() {
                return state.pending() == 0 && state.active == 0;
            }
        }
        true
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn worker(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            let task = loop {
                if let Some(task) = state.priority.pop_front() {
                    break Some(task);
                }
                if let Some(task) = state.normal.pop_front() {
                    break Some(task);
                }
                if !state.running {
                    break None;
                }
                inner.work.wait(&mut state);
            };
            if task.is_some() {
                state.active += 1;
            }
            task
        };

        let Some(task) = task else {
            trace!("Worker exits");
            return;
        };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("Task panicked");
        }

        let mut state = inner.state.lock();
        state.active -= 1;
        if state.active == 0 && state.pending() == 0 {
            inner.idle.notify_all();
        }
    }
}

/// The eventual result of a task.
pub struct Pending<T> {
    slot: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Pending {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Pending<T> {
    fn new() -> Self {
        Pending {
            slot: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// A handle that already holds its value.
    pub fn ready(value: T) -> Self {
        let pending = Self::new();
        pending.set(value);
        pending
    }

    fn set(&self, value: T) {
        let (lock, cond) = &*self.slot;
        *lock.lock() = Some(value);
        cond.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        self.slot.0.lock().is_some()
    }

    /// Take the value if it is there.
    pub fn try_take(&self) -> Option<T> {
        self.slot.0.lock().take()
    }

    /// Block until the value is there and take it.
    ///
    /// Blocks forever if the task never runs.
    pub fn wait(self) -> T {
        let (lock, cond) = &*self.slot;
        let mut value = lock.lock();
        loop {
            if let Some(v) = value.take() {
                return v;
            }
            cond.wait(&mut value);
        }
    }

    /// Block until the value is there or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let (lock, cond) = &*self.slot;
        let mut value = lock.lock();
        loop {
            if let Some(v) = value.take() {
                return Some(v);
            }
            if cond.wait_until(&mut value, deadline).timed_out() {
                return value.take();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_tasks() {
        let pool = WorkQueue::new();
        pool.start(2);
        let results: Vec<_> = (0..10).map(|i| pool.submit(move || i * 2)).collect();
        let sum: i32 = results.into_iter().map(|p| p.wait()).sum();
        assert_eq!(sum, 90);
        pool.stop(true);
        assert!(!pool.is_running());
    }

    #[test]
    fn priority_jumps_queue() {
        let pool = WorkQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Queue before starting so that ordering is deterministic.
        for i in 0..3 {
            let order = order.clone();
            pool.submit(move || order.lock().push(i));
        }
        let o = order.clone();
        pool.submit_priority(move || o.lock().push(99));

        pool.start(1);
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(*order.lock(), vec![99, 0, 1, 2]);
        pool.stop(true);
    }

    #[test]
    fn at_most_once() {
        let pool = WorkQueue::new();
        pool.start(4);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = count.clone();
            pool.submit(move || count.fetch_add(1, Ordering::SeqCst));
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::SeqCst), 100);
        pool.stop(true);
    }

    #[test]
    fn stop_without_block_drops_queue() {
        let pool = WorkQueue::new();
        let pending = pool.submit(|| 1);
        pool.stop(false);
        assert!(!pending.is_ready());
        assert_eq!(pending.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn ready_handle() {
        let p = Pending::ready(7);
        assert!(p.is_ready());
        assert_eq!(p.try_take(), Some(7));
        assert_eq!(p.try_take(), None);
    }
}
