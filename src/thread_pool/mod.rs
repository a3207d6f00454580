//! Thread pools the master server runs connections on.
use crate::Result;

mod rayon_pool;
mod shared_queue;

pub use self::rayon_pool::RayonThreadPool;
pub use self::shared_queue::SharedQueueThreadPool;

/// A pool of threads that runs jobs handed to it
pub trait ThreadPool: Send + 'static {
    /// creates a pool with `threads` threads
    ///
    /// # Errors
    /// returns an error if the threads could not be started
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// runs `job` on one of the pool's threads
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}
