//! C2: cached record allocator.
//!
//! Grounded on `examples/original_source/bamtools/src/api/internal/utils/BamThreadPool.h`'s
//! `Spinlock`-protected free lists translated to the engine's own `Spinlock`
//! ([`crate::pool::Spinlock`]), with the dirty/clean two-list design and the
//! atomic "cleaner running" guard from spec.md §4.2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::pool::{SpinMutex, ThreadPool};
use crate::record::Record;

/// Number of dirty records accumulated before a cleaner job is submitted.
const DIRTY_THRESHOLD: usize = 100;
/// Max records one cleaner job drains per pass.
const CLEANER_BATCH: usize = 100;

#[derive(Default)]
struct Lists {
    dirty: Vec<Record>,
    clean: Vec<Record>,
}

/// Hands out [`Record`]s from a clean free list, recycling records that
/// callers return via [`Self::deallocate`] on a background cleaner job
/// instead of paying allocation cost on every record.
pub struct RecordAllocator {
    lists: SpinMutex<Lists>,
    cleaner_running: AtomicBool,
    pool: Arc<ThreadPool>,
}

impl RecordAllocator {
    pub fn new(pool: Arc<ThreadPool>) -> Arc<Self> {
        Arc::new(Self {
            lists: SpinMutex::new(Lists::default()),
            cleaner_running: AtomicBool::new(false),
            pool,
        })
    }

    /// Returns a record with all scalar fields at allocator defaults and
    /// variable-length fields empty; the caller becomes the sole owner.
    pub fn allocate(self: &Arc<Self>) -> Record {
        self.lists.lock().clean.pop().unwrap_or_else(Record::new)
    }

    /// Returns a record to the allocator for eventual reuse. May trigger a
    /// background cleaner job if the dirty list has grown past threshold.
    pub fn deallocate(self: &Arc<Self>, record: Record) {
        let should_spawn_cleaner = {
            let mut lists = self.lists.lock();
            lists.dirty.push(record);
            lists.dirty.len() > DIRTY_THRESHOLD
        };

        if should_spawn_cleaner && !self.cleaner_running.swap(true, Ordering::AcqRel) {
            let allocator = Arc::clone(self);
            self.pool.submit(move || allocator.run_cleaner());
        }
    }

    fn run_cleaner(self: Arc<Self>) {
        loop {
            let mut batch = {
                let mut lists = self.lists.lock();
                if lists.dirty.is_empty() {
                    break;
                }
                let take = lists.dirty.len().min(CLEANER_BATCH);
                lists.dirty.split_off(lists.dirty.len() - take)
            };
            for record in &mut batch {
                record.reset();
            }
            self.lists.lock().clean.append(&mut batch);
        }
        self.cleaner_running.store(false, Ordering::Release);
    }

    /// Number of records currently awaiting cleanup; exposed for tests.
    pub fn dirty_count(&self) -> usize {
        self.lists.lock().dirty.len()
    }

    pub fn clean_count(&self) -> usize {
        self.lists.lock().clean.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_defaulted_record() {
        let pool = ThreadPool::new(1);
        let allocator = RecordAllocator::new(pool);
        let record = allocator.allocate();
        assert_eq!(record.ref_id, -1);
        assert_eq!(record.pos, -1);
        assert_eq!(record.mapq, 0);
        assert!(record.name().is_empty());
    }

    #[test]
    fn deallocate_triggers_cleaner_past_threshold() {
        let pool = ThreadPool::new(2);
        let allocator = RecordAllocator::new(pool);
        for _ in 0..DIRTY_THRESHOLD + 5 {
            let mut r = Record::new();
            r.pos = 42;
            allocator.deallocate(r);
        }
        // Give the cleaner job a chance to run.
        for _ in 0..200 {
            if allocator.clean_count() > 0 {
                break;
            }
            std::thread::yield_now();
        }
        assert!(allocator.clean_count() > 0);
        let recycled = allocator.allocate();
        assert_eq!(recycled.pos, -1, "cleaner must reset recycled records");
    }

    #[test]
    fn only_one_cleaner_runs_at_a_time() {
        let pool = ThreadPool::new(4);
        let allocator = RecordAllocator::new(pool);
        for _ in 0..DIRTY_THRESHOLD * 3 {
            allocator.deallocate(Record::new());
        }
        // If two cleaners ran concurrently and double-drained, this would
        // still hold since the spinlock serializes list access regardless;
        // the real invariant under test is that the flag resets to allow a
        // later cleaner to run once new dirty records accumulate.
        for _ in 0..500 {
            if allocator.dirty_count() == 0 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(allocator.dirty_count(), 0);
    }
}
