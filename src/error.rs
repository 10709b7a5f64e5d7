use std::io;

use thiserror::Error;

use crate::scheduler::MAX_THREADS;

/// Errors reported while constructing a [`Scheduler`](crate::scheduler::Scheduler).
///
/// Once a scheduler is running there is no recoverable error surface: misuse
/// panics and a panicking task aborts the process.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("thread count must be between 1 and {max}, got {0}", max = MAX_THREADS)]
    InvalidThreadCount(usize),

    #[error("frame block size must be non-zero")]
    InvalidFrameBlockSize,

    #[error("frame allocator must grow by at least one block per chunk")]
    InvalidFrameChunkSize,

    #[error("the calling thread already belongs to a running scheduler")]
    ThreadAlreadyBound,

    #[error("failed to spawn worker thread {index}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
}
