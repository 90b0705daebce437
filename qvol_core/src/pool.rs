//! Worker-local codec instances for the chunk fan-out.

use std::sync::{Mutex, PoisonError};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{QvolError, Result};

/// A rayon pool plus one lazily built codec slot per worker thread.
///
/// Each task checks out the slot of the thread it runs on, so a slot is only
/// ever touched by one thread and its lock is never contended. Codecs are
/// reused across every chunk their worker processes.
pub struct CodecPool<C> {
    threads: ThreadPool,
    slots: Vec<Mutex<Option<C>>>,
}

impl<C> CodecPool<C> {
    /// `workers == 0` uses all available hardware threads.
    pub fn new(workers: usize) -> Result<Self> {
        let threads = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("qvol-worker-{i}"))
            .build()
            .map_err(|e| QvolError::ThreadPool(e.to_string()))?;
        let slots = (0..threads.current_num_threads()).map(|_| Mutex::new(None)).collect();
        Ok(Self { threads, slots })
    }

    pub fn num_workers(&self) -> usize {
        self.slots.len()
    }

    /// Run `op` inside the pool.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.threads.install(op)
    }

    /// Run `f` with the current worker's codec, building it on first use.
    pub fn with_codec<R>(&self, factory: impl FnOnce() -> C, f: impl FnOnce(&mut C) -> R) -> R {
        let idx = rayon::current_thread_index().unwrap_or(0) % self.slots.len().max(1);
        let mut slot = self.slots[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let codec = slot.get_or_insert_with(factory);
        f(codec)
    }

    /// Number of codecs built so far.
    pub fn built(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.lock().map(|g| g.is_some()).unwrap_or(false))
            .count()
    }
}
