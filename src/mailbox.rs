//! This module defines the mailbox grid: a square of single-slot cells used to
//! hand tasks from one thread to another without a queue.
//!
//! Cell `[consumer][producer]` is written only by `producer` and emptied only
//! by `consumer` (or by `producer`, when it displaces a task it deposited
//! earlier). Every operation on a cell is a single atomic exchange, so the
//! grid is lock-free and a deposit always succeeds: if the cell was already
//! occupied, the displaced task is handed back to the depositor.

use std::{
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use async_task::Runnable;
use crossbeam_utils::CachePadded;

// -----------------------------------------------------------------------------
// Mailbox cell

/// A single-slot cell holding at most one runnable task.
///
/// The runnable is stored as the raw pointer produced by
/// `Runnable::into_raw`. A null pointer means the cell is empty.
pub struct MailboxCell<M> {
    task: AtomicPtr<()>,
    marker: PhantomData<Runnable<M>>,
}

impl<M> MailboxCell<M> {
    /// Creates an empty cell.
    pub const fn new() -> MailboxCell<M> {
        MailboxCell {
            task: AtomicPtr::new(ptr::null_mut()),
            marker: PhantomData,
        }
    }

    /// Stores a task in the cell, returning whatever task was there before.
    pub fn deposit(&self, runnable: Runnable<M>) -> Option<Runnable<M>> {
        let new_ptr = runnable.into_raw().as_ptr();
        // Use `AcqRel` so that everything written before the deposit is
        // visible to whichever thread takes the task, and so that a displaced
        // task is fully visible to the depositor.
        let old_ptr = self.task.swap(new_ptr, Ordering::AcqRel);
        // SAFETY: Every non-null pointer in the cell came from
        // `Runnable::into_raw`, and the swap guarantees no one else sees it.
        NonNull::new(old_ptr).map(|old_ptr| unsafe { Runnable::from_raw(old_ptr) })
    }

    /// Removes the task from the cell, if there is one.
    pub fn take(&self) -> Option<Runnable<M>> {
        // Check with an ordinary load first so that scanning empty cells only
        // needs shared access to the cache line.
        if self.task.load(Ordering::Relaxed).is_null() {
            return None;
        }
        let old_ptr = self.task.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: See `deposit`.
        NonNull::new(old_ptr).map(|old_ptr| unsafe { Runnable::from_raw(old_ptr) })
    }

    /// Returns true if the cell currently holds a task. Other threads may
    /// change this at any moment.
    pub fn is_occupied(&self) -> bool {
        !self.task.load(Ordering::Relaxed).is_null()
    }
}

impl<M> Default for MailboxCell<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Drop for MailboxCell<M> {
    fn drop(&mut self) {
        let old_ptr = *self.task.get_mut();
        if let Some(old_ptr) = NonNull::new(old_ptr) {
            // SAFETY: The pointer came from `Runnable::into_raw` and we are
            // dropping the cell, so it is not read again. Dropping the
            // runnable cancels the task and releases its frame.
            drop(unsafe { Runnable::<M>::from_raw(old_ptr) });
        }
    }
}

// SAFETY: A cell moves a `Runnable<M>` between threads, which is sound when
// `Runnable<M>` itself is `Send`.
unsafe impl<M: Send + Sync> Send for MailboxCell<M> {}

// SAFETY: All access to the stored runnable goes through atomic exchanges, so
// at most one thread ever owns it.
unsafe impl<M: Send + Sync> Sync for MailboxCell<M> {}

// -----------------------------------------------------------------------------
// Mailbox grid

/// A `thread_count × thread_count` matrix of mailbox cells.
pub struct MailboxGrid<M> {
    thread_count: usize,
    /// Row-major: row `consumer`, column `producer`.
    cells: Box<[CachePadded<MailboxCell<M>>]>,
}

impl<M> MailboxGrid<M> {
    /// Creates a grid of empty cells.
    pub fn new(thread_count: usize) -> MailboxGrid<M> {
        MailboxGrid {
            thread_count,
            cells: (0..thread_count * thread_count)
                .map(|_| CachePadded::new(MailboxCell::new()))
                .collect(),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Returns cell `[consumer][producer]`.
    #[inline]
    pub fn cell(&self, consumer: usize, producer: usize) -> &MailboxCell<M> {
        &self.cells[consumer * self.thread_count + producer]
    }

    /// Returns the row of cells drained by `consumer`.
    #[inline]
    pub fn row(&self, consumer: usize) -> &[CachePadded<MailboxCell<M>>] {
        let start = consumer * self.thread_count;
        &self.cells[start..start + self.thread_count]
    }

    /// Deposits a task for `consumer` from `producer`, returning any task the
    /// deposit displaced.
    #[inline]
    pub fn deposit(&self, consumer: usize, producer: usize, runnable: Runnable<M>) -> Option<Runnable<M>> {
        self.cell(consumer, producer).deposit(runnable)
    }

    /// Takes the first pending task for `consumer`, scanning producers from
    /// index 0.
    #[inline]
    pub fn take_next(&self, consumer: usize) -> Option<Runnable<M>> {
        self.row(consumer).iter().find_map(|cell| cell.take())
    }

    /// Takes every pending task out of the grid.
    pub fn take_all(&self) -> Vec<Runnable<M>> {
        self.cells.iter().filter_map(|cell| cell.take()).collect()
    }
}
