//! This module provides the completion tracking block, which lets a thread
//! detect "N tasks have finished" without every finishing task hammering one
//! shared atomic.
//!
//! A [`CompletionBlock`] holds one cache-padded entry per scheduler thread.
//! Each entry carries two counters:
//!
//! + `local` counts tasks finished by the block's *owning* thread. Only the
//!   owner ever reads or writes it, so it is updated with a plain load and
//!   store rather than a read-modify-write.
//! + `remote` counts tasks finished by the entry's thread on behalf of some
//!   other owner. Each worker only ever increments its own entry, so workers
//!   never fight over a cache line.
//!
//! The owner observes `local[owner] + sum(remote[t] for t != owner)`.
//!
//! The read side is expressed through the [`Probe`] trait, which is what the
//! scheduler's busy-polling wait loop spins on.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crossbeam_utils::CachePadded;

// -----------------------------------------------------------------------------
// Probes

/// This trait represents the "read-side" of a completion condition. It lets a
/// waiting thread check if the condition holds, and keep doing other work
/// while it does not.
pub trait Probe {
    /// Returns `true` once the condition holds, as observed by thread
    /// `observer`.
    fn probe(&self, observer: usize) -> bool;
}

// -----------------------------------------------------------------------------
// Completion block

/// The counters belonging to one scheduler thread.
#[derive(Default)]
struct CompletionEntry {
    /// Completions by the owning thread. Owner-only.
    local: AtomicUsize,
    /// Completions by this entry's thread for another owner.
    remote: AtomicUsize,
}

/// Per-thread, false-sharing-padded completion counters.
pub struct CompletionBlock {
    entries: Box<[CachePadded<CompletionEntry>]>,
}

impl CompletionBlock {
    /// Creates a block with one zeroed entry per thread.
    pub fn new(thread_count: usize) -> CompletionBlock {
        CompletionBlock {
            entries: (0..thread_count)
                .map(|_| CachePadded::new(CompletionEntry::default()))
                .collect(),
        }
    }

    /// The number of thread entries in the block.
    pub fn thread_count(&self) -> usize {
        self.entries.len()
    }

    /// Records one completion by thread `completer` on behalf of `owner`.
    pub fn record(&self, owner: usize, completer: usize) {
        if completer == owner {
            // Only the owner touches its local counter, so a load and a store
            // are enough.
            let local = &self.entries[owner].local;
            local.store(local.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
        } else {
            // Release pairs with the acquire in `completed` so that the task's
            // output is visible once the count is.
            self.entries[completer]
                .remote
                .fetch_add(1, Ordering::Release);
        }
    }

    /// Returns the number of completions visible to `observer`, which must be
    /// the owner of the tasks being counted.
    pub fn completed(&self, observer: usize) -> usize {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                if index == observer {
                    entry.local.load(Ordering::Relaxed)
                } else {
                    entry.remote.load(Ordering::Acquire)
                }
            })
            .sum()
    }
}

// -----------------------------------------------------------------------------
// Completion target

/// Where a finishing task reports its completion: a shared block plus the
/// thread that owns the tasks being counted.
#[derive(Clone)]
pub struct CompletionTarget {
    block: Arc<CompletionBlock>,
    owner: usize,
}

impl CompletionTarget {
    pub fn new(block: Arc<CompletionBlock>, owner: usize) -> CompletionTarget {
        CompletionTarget { block, owner }
    }

    /// The thread that owns the counted tasks.
    pub fn owner(&self) -> usize {
        self.owner
    }

    /// Records a completion by thread `completer`.
    pub fn signal(&self, completer: usize) {
        self.block.record(self.owner, completer);
    }
}

// -----------------------------------------------------------------------------
// Counting probe

/// A probe that holds once a block reports exactly `target` completions.
pub struct CountProbe<'a> {
    block: &'a CompletionBlock,
    target: usize,
}

impl<'a> CountProbe<'a> {
    pub fn new(block: &'a CompletionBlock, target: usize) -> CountProbe<'a> {
        CountProbe { block, target }
    }
}

impl Probe for CountProbe<'_> {
    #[inline]
    fn probe(&self, observer: usize) -> bool {
        let completed = self.block.completed(observer);
        debug_assert!(
            completed <= self.target,
            "observed {completed} completions for a target of {}",
            self.target
        );
        completed == self.target
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn local_and_remote_counts_add_up() {
        let block = CompletionBlock::new(4);
        block.record(0, 0);
        block.record(0, 0);
        block.record(0, 2);
        block.record(0, 3);
        assert_eq!(block.completed(0), 4);
    }

    #[test]
    fn remote_counts_land_on_the_completer() {
        let block = CompletionBlock::new(3);
        block.record(0, 1);
        block.record(0, 1);
        // The owner never reads its own remote counter and other observers
        // never read another thread's local counter.
        assert_eq!(block.completed(0), 2);
        assert_eq!(block.entries[1].remote.load(Ordering::Relaxed), 2);
        assert_eq!(block.entries[0].remote.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn concurrent_remote_completions() {
        let block = Arc::new(CompletionBlock::new(4));
        let completers: Vec<_> = (1..4)
            .map(|completer| {
                let target = CompletionTarget::new(Arc::clone(&block), 0);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        target.signal(completer);
                    }
                })
            })
            .collect();
        for completer in completers {
            completer.join().unwrap();
        }
        assert_eq!(block.completed(0), 3000);
        assert!(CountProbe::new(&block, 3000).probe(0));
        assert!(!CountProbe::new(&block, 3001).probe(0));
    }

    #[test]
    fn empty_target_holds_immediately() {
        let block = CompletionBlock::new(2);
        assert!(CountProbe::new(&block, 0).probe(0));
    }

    #[test]
    fn entries_do_not_share_cache_lines() {
        let block = CompletionBlock::new(2);
        let first = &*block.entries[0] as *const CompletionEntry as usize;
        let second = &*block.entries[1] as *const CompletionEntry as usize;
        assert!(second - first >= 64);
    }
}
