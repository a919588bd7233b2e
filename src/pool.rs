//! C1: fixed-size thread pool and the synchronization primitives the rest of
//! the engine is built on.
//!
//! Grounded on `examples/original_source/bamtools/src/api/internal/utils/BamThreadPool.h`
//! (the `BamThreadPool`/`Spinlock`/`SynchronizedQueue` trio) and
//! `openge/src/util/bgzf_input_stream.{h,cpp}`'s `SynchronizedFlag`/condition-variable
//! usage, translated onto `parking_lot::{Mutex, Condvar}` the way
//! `Dicklesworthstone-glibc_rust`'s membrane crate and
//! `chroma-core-chroma/rust/worker` depend on `parking_lot` for the same kind
//! of primitive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// Atomic test-and-set spinlock with a busy-wait read fallback, for the few
/// spots (allocator free lists, sort emit queue) where the source used one
/// explicitly instead of a blocking mutex.
#[derive(Default)]
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    pub fn new() -> Self {
        Self { locked: AtomicBool::new(false) }
    }

    pub fn lock(&self) -> SpinlockGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinlockGuard { lock: self }
    }
}

pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A spinlock that owns its protected data, for the spots spec.md calls out
/// as single-spinlock-guarded state (the allocator's dirty/clean lists, the
/// sort emit queue) rather than a blocking `parking_lot::Mutex`.
pub struct SpinMutex<T> {
    locked: AtomicBool,
    data: std::cell::UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through `lock()`, which
// holds the atomic `locked` flag for the guard's lifetime, same contract a
// `Mutex<T>` provides.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub fn new(data: T) -> Self {
        Self { locked: AtomicBool::new(false), data: std::cell::UnsafeCell::new(data) }
    }

    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinMutexGuard { lock: self }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct SpinMutexGuard<'a, T> {
    lock: &'a SpinMutex<T>,
}

impl<T> std::ops::Deref for SpinMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A one-shot flag: set/clear/isSet, usable across threads without a mutex.
#[derive(Default)]
pub struct Flag(AtomicBool);

impl Flag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Unbounded, lock-guarded FIFO queue.
pub struct UnboundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self { inner: Mutex::new(VecDeque::new()) }
    }
}

impl<T> UnboundedQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&self, item: T) {
        self.inner.lock().push_back(item);
    }
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Bounded blocking queue: `push` blocks while full, `pop` blocks while empty.
pub struct BoundedQueue<T> {
    cap: usize,
    state: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            state: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut q = self.state.lock();
        while q.len() >= self.cap {
            self.not_full.wait(&mut q);
        }
        q.push_back(item);
        self.not_empty.notify_one();
    }

    pub fn pop(&self) -> T {
        let mut q = self.state.lock();
        while q.is_empty() {
            self.not_empty.wait(&mut q);
        }
        let item = q.pop_front().expect("non-empty under lock");
        self.not_full.notify_one();
        item
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut q = self.state.lock();
        let item = q.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    queue_cv: Condvar,
    in_flight: AtomicUsize,
    in_flight_cap: usize,
    submit_cv: Condvar,
    submit_lock: Mutex<()>,
    shutting_down: AtomicBool,
    idle_cv: Condvar,
}

/// Fixed-size worker pool with a bounded in-flight job cap, matching
/// spec.md C1: `submit` blocks once `in_flight_cap` jobs are outstanding so a
/// fast producer cannot outrun a slow consumer.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

const DEFAULT_IN_FLIGHT_CAP: usize = 128;

impl ThreadPool {
    /// Creates a pool with `num_workers` threads (default: detected CPU count).
    pub fn new(num_workers: usize) -> Arc<Self> {
        Self::with_in_flight_cap(num_workers, DEFAULT_IN_FLIGHT_CAP)
    }

    pub fn with_in_flight_cap(num_workers: usize, in_flight_cap: usize) -> Arc<Self> {
        let num_workers = num_workers.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            in_flight_cap,
            submit_cv: Condvar::new(),
            submit_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            idle_cv: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for idx in 0..num_workers {
            let shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("bamforge-worker-{idx}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread"),
            );
        }

        Arc::new(Self { shared, workers: Mutex::new(workers) })
    }

    /// Returns the process-wide default pool, sized to the detected CPU count.
    pub fn shared() -> Arc<ThreadPool> {
        static SHARED: OnceLock<Arc<ThreadPool>> = OnceLock::new();
        SHARED.get_or_init(|| ThreadPool::new(num_cpus::get())).clone()
    }

    /// Submits a job, blocking the caller if the in-flight cap is reached.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.shared.submit_lock.lock();
        while self.shared.in_flight.load(Ordering::Acquire) >= self.shared.in_flight_cap {
            self.shared.submit_cv.wait(&mut guard);
        }
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        drop(guard);

        self.shared.queue.lock().push_back(Box::new(job));
        self.shared.queue_cv.notify_one();
    }

    /// Blocks until all submitted jobs have finished running.
    pub fn wait_all(&self) {
        let mut guard = self.shared.submit_lock.lock();
        while self.shared.in_flight.load(Ordering::Acquire) != 0 {
            self.shared.idle_cv.wait(&mut guard);
        }
    }

    /// Stops accepting new jobs, joins every worker. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wait_all();
        self.shared.queue_cv.notify_all();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.shutting_down.load(Ordering::Acquire) {
                    break None;
                }
                shared.queue_cv.wait(&mut queue);
            }
        };

        let Some(job) = job else { break };
        trace!("worker picked up a job");
        job();

        // Decrement and notify under submit_lock: wait_all checks in_flight
        // and parks on idle_cv while holding this same lock, so doing the
        // decrement+notify outside it could land in the gap between its
        // check and its wait, losing the wakeup and blocking wait_all
        // forever.
        let _guard = shared.submit_lock.lock();
        let remaining = shared.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        shared.submit_cv.notify_one();
        if remaining == 0 {
            shared.idle_cv.notify_all();
        }
    }
    debug!("worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[test]
    fn spinlock_serializes_increments() {
        let lock = Arc::new(Spinlock::new());
        let counter = Arc::new(Counter::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }

    #[test]
    fn flag_round_trips() {
        let flag = Flag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        flag.clear();
        assert!(!flag.is_set());
    }

    #[test]
    fn bounded_queue_blocks_until_pushed() {
        let queue = Arc::new(BoundedQueue::new(2));
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);
        let q2 = Arc::clone(&queue);
        let handle = std::thread::spawn(move || q2.pop());
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn thread_pool_runs_all_jobs() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(Counter::new(0));
        for _ in 0..500 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn thread_pool_respects_in_flight_cap() {
        let pool = ThreadPool::with_in_flight_cap(2, 2);
        let started = Arc::new(Counter::new(0));
        let release = Arc::new(Flag::new());
        for _ in 0..2 {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            pool.submit(move || {
                started.fetch_add(1, Ordering::SeqCst);
                while !release.is_set() {
                    std::thread::yield_now();
                }
            });
        }
        while started.load(Ordering::SeqCst) < 2 {
            std::thread::yield_now();
        }
        release.set();
        pool.wait_all();
    }
}
