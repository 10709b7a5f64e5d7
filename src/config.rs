use std::thread;

use crate::{error::SchedulerError, scheduler::MAX_THREADS};

/// Construction-time settings for a [`Scheduler`](crate::scheduler::Scheduler).
///
/// The thread count includes the constructing thread, which becomes thread 0.
/// A scheduler with `thread_count == 1` spawns no workers and runs every
/// pushed task inline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Total number of threads, including the constructing thread.
    pub thread_count: usize,
    /// Prefix for worker thread names. Worker `i` is named `{prefix}-{i}`.
    pub thread_name: String,
    /// Size in bytes of one frame block. Larger frames go to the global heap.
    pub frame_block_size: usize,
    /// Number of blocks the frame allocator adds each time it grows.
    pub frame_blocks_per_chunk: usize,
    /// Upper bound on the number of pooled frame blocks, if any.
    pub max_frame_blocks: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let available = thread::available_parallelism()
            .map(|num_threads| num_threads.get())
            .unwrap_or(1);
        SchedulerConfig {
            thread_count: available.clamp(1, MAX_THREADS),
            thread_name: String::from("weft-worker"),
            frame_block_size: 256,
            frame_blocks_per_chunk: 64,
            max_frame_blocks: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    pub fn with_frame_block_size(mut self, frame_block_size: usize) -> Self {
        self.frame_block_size = frame_block_size;
        self
    }

    pub fn with_frame_blocks_per_chunk(mut self, frame_blocks_per_chunk: usize) -> Self {
        self.frame_blocks_per_chunk = frame_blocks_per_chunk;
        self
    }

    pub fn with_max_frame_blocks(mut self, max_frame_blocks: usize) -> Self {
        self.max_frame_blocks = Some(max_frame_blocks);
        self
    }

    /// Checks that the settings describe a scheduler that can be built.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.thread_count == 0 || self.thread_count > MAX_THREADS {
            return Err(SchedulerError::InvalidThreadCount(self.thread_count));
        }
        if self.frame_block_size == 0 {
            return Err(SchedulerError::InvalidFrameBlockSize);
        }
        if self.frame_blocks_per_chunk == 0 {
            return Err(SchedulerError::InvalidFrameChunkSize);
        }
        Ok(())
    }
}
