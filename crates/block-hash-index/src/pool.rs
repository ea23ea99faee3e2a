use std::sync::Arc;

use block_hash_common::{BlockHashError, BlockHashResult};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct PoolState {
    pending: Mutex<usize>,
    idle: Condvar,
    error: Mutex<Option<BlockHashError>>,
}

/// Fixed-size worker pool with a "wait for everything" barrier.
///
/// Tasks report failure by returning an error; the first one is kept and
/// handed to the next [`WorkerPool::wait_all`] caller.
pub(crate) struct WorkerPool {
    pool: rayon::ThreadPool,
    state: Arc<PoolState>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.pool.current_num_threads())
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(threads: usize) -> BlockHashResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("block-hash-{}", i))
            .build()
            .map_err(|e| BlockHashError::WorkerPool(e.to_string().into()))?;
        Ok(Self {
            pool,
            state: Arc::new(PoolState::default()),
        })
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() -> BlockHashResult<()> + Send + 'static,
    {
        *self.state.pending.lock() += 1;
        let state = self.state.clone();
        self.pool.spawn(move || {
            if let Err(e) = task() {
                tracing::warn!("range construction failed: {}", e);
                state.error.lock().get_or_insert(e);
            }
            let mut pending = state.pending.lock();
            *pending -= 1;
            if *pending == 0 {
                state.idle.notify_all();
            }
        });
    }

    fn join(&self) {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.idle.wait(&mut pending);
        }
    }

    /// Block until every submitted task finished.
    pub fn wait_all(&self) -> BlockHashResult<()> {
        self.join();
        match self.state.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn pending(&self) -> usize {
        *self.state.pending.lock()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}
