//! A fixed-pool cooperative task scheduler with mailbox handoff and
//! main-thread affinity.
//!
//! Weft runs many small async tasks across a fixed set of threads, one of
//! which is the thread that created the scheduler. It is aimed at frame-based
//! workloads (games, simulations) where work arrives in batches, each batch is
//! waited on, and some work must stay on the main thread.
//!
//! There are no work queues. Every pair of threads shares a single-slot
//! mailbox, and each thread pushes new work to the other threads in round
//! robin. If a push lands on a mailbox that is still occupied, the task that
//! was there is run right away by the pusher. Waiting threads busy-poll their
//! mailboxes instead of sleeping, and batch completion is counted per thread
//! so that finishing tasks rarely touch a shared cache line.
//!
//! Task state lives in frames handed out by a [`FrameAllocator`], by default
//! a [`FixedBlockAllocator`] that recycles fixed-size blocks.
//!
//! [`FrameAllocator`]: frame::FrameAllocator
//! [`FixedBlockAllocator`]: frame::FixedBlockAllocator

pub mod completion;
pub mod config;
pub mod error;
pub mod frame;
pub mod group;
pub mod mailbox;
pub mod scheduler;
pub mod task;

mod util;

pub mod prelude {
    pub use crate::{
        config::SchedulerConfig,
        error::SchedulerError,
        group::TaskGroup,
        scheduler::{current_thread_index, Handle, Scheduler},
        task::Task,
    };
}
