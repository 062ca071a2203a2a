use std::fmt;
use std::sync::Arc;

use factorflow_error::{DbError, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Fixed size pool of worker threads that stages execute on.
///
/// Cloning is cheap and clones share the same pool, so one executor can
/// serve any number of concurrent runs.
#[derive(Clone)]
pub struct NativeExecutor {
    pool: Arc<ThreadPool>,
}

impl fmt::Debug for NativeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeExecutor")
            .field("num_threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl NativeExecutor {
    /// Create an executor with one thread per CPU.
    pub fn try_new() -> Result<Self> {
        Self::try_new_with_num_threads(num_cpus::get())
    }

    pub fn single_threaded() -> Result<Self> {
        Self::try_new_with_num_threads(1)
    }

    pub fn multi_threaded(num_threads: usize) -> Result<Self> {
        Self::try_new_with_num_threads(num_threads)
    }

    pub fn try_new_with_num_threads(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(DbError::new("Executor needs at least one thread"));
        }
        let pool = ThreadPoolBuilder::new()
            .thread_name(|idx| format!("factorflow_compute_{idx}"))
            .num_threads(num_threads)
            .build()
            .map_err(|e| DbError::with_source("Failed to build thread pool", Box::new(e)))?;

        Ok(NativeExecutor {
            pool: Arc::new(pool),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}
