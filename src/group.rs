//! This module defines [`TaskGroup`], the scheduler's fan-out/fan-in list.

use std::{future::Future, marker::PhantomData, ops::Index, sync::Arc};

use crate::{
    completion::{CompletionBlock, CompletionTarget},
    scheduler::Handle,
    task::Task,
};

/// An ordered batch of tasks that share one completion block.
///
/// Every pushed task is scheduled immediately and reports its completion to
/// the group's block. [`wait_for_completion`](TaskGroup::wait_for_completion)
/// runs tasks on the current thread until every pushed task has finished;
/// results can then be read back in push order.
///
/// A group belongs to the thread that created it, which must be one of the
/// scheduler's threads, and it must be waited on from that same thread.
pub struct TaskGroup<T> {
    handle: Handle,
    block: Arc<CompletionBlock>,
    /// The thread whose local counter the group's own completions land in.
    owner: usize,
    tasks: Vec<Task<T>>,
    /// Keeps the group on its owning thread.
    marker: PhantomData<*const ()>,
}

impl<T> TaskGroup<T> {
    /// Creates an empty group owned by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not part of the scheduler behind
    /// `handle`.
    pub fn new(handle: &Handle) -> TaskGroup<T> {
        TaskGroup {
            handle: handle.clone(),
            block: Arc::new(CompletionBlock::new(handle.thread_count())),
            owner: handle.registry().current_index(),
            tasks: Vec::new(),
            marker: PhantomData,
        }
    }

    /// Adds a task to the group and schedules it against the group's
    /// completion block.
    ///
    /// # Panics
    ///
    /// Panics if the task was already scheduled.
    pub fn push(&mut self, mut task: Task<T>) {
        task.schedule_with_completion(CompletionTarget::new(Arc::clone(&self.block), self.owner));
        self.tasks.push(task);
    }

    /// Starts `future` as a task and pushes it into the group.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.handle.start(future);
        self.push(task);
    }

    /// Starts `future` as a main-thread-only task and pushes it into the
    /// group.
    pub fn spawn_on_main_thread<F>(&mut self, future: F)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.handle.start_on_main_thread(future);
        self.push(task);
    }

    /// Runs tasks on the current thread until every task pushed so far has
    /// finished, then moves their outputs into the group.
    pub fn wait_for_completion(&mut self) {
        self.handle.run_jobs(&self.block, self.tasks.len());
        for task in &mut self.tasks {
            let collected = task.collect_output();
            debug_assert!(collected, "a task signalled completion without an output");
        }
    }

    /// Returns the output of the `index`-th pushed task.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range, or if that task has not finished
    /// yet (the group was not waited on).
    pub fn at(&self, index: usize) -> &T {
        self.tasks[index]
            .collected_output()
            .expect("group result read before wait_for_completion")
    }

    /// The number of tasks pushed into the group.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Consumes the group, returning every task's output in push order.
    ///
    /// # Panics
    ///
    /// Panics if any task has not finished.
    pub fn into_results(self) -> Vec<T> {
        self.tasks
            .into_iter()
            .map(|mut task| {
                task.take_output()
                    .expect("group results taken before wait_for_completion")
            })
            .collect()
    }
}

impl<T> Index<usize> for TaskGroup<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.at(index)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use crate::prelude::*;

    fn scheduler(thread_count: usize) -> Scheduler {
        let scheduler = Scheduler::new(SchedulerConfig::default().with_thread_count(thread_count))
            .expect("failed to create scheduler");
        scheduler.prepare_to_run_jobs();
        scheduler
    }

    #[test]
    fn empty_group_returns_immediately() {
        let scheduler = scheduler(2);
        let mut group = scheduler.group::<()>();
        group.wait_for_completion();
        assert!(group.is_empty());
        scheduler.stop_running_jobs();
    }

    #[test]
    fn results_follow_push_order() {
        let scheduler = scheduler(3);
        let mut group = scheduler.group();
        for i in 0..20_usize {
            group.spawn(async move { i * i });
        }
        group.wait_for_completion();
        assert_eq!(group.len(), 20);
        for i in 0..20 {
            assert_eq!(group[i], i * i);
        }
        assert_eq!(group.into_results(), (0..20).map(|i| i * i).collect::<Vec<_>>());
        scheduler.stop_running_jobs();
    }

    #[test]
    fn pushed_tasks_run_exactly_once() {
        let scheduler = scheduler(4);
        let runs = Arc::new(AtomicUsize::new(0));
        let mut group = scheduler.group();
        for _ in 0..100 {
            let runs = Arc::clone(&runs);
            let task = scheduler.start(async move {
                runs.fetch_add(1, Ordering::Relaxed);
            });
            group.push(task);
        }
        group.wait_for_completion();
        assert_eq!(runs.load(Ordering::Relaxed), 100);
        scheduler.stop_running_jobs();
    }

    #[test]
    fn group_waits_can_be_repeated() {
        let scheduler = scheduler(2);
        let mut group = scheduler.group();
        group.spawn(async { 1 });
        group.wait_for_completion();
        group.spawn(async { 2 });
        group.spawn_on_main_thread(async { 3 });
        group.wait_for_completion();
        assert_eq!(group.into_results(), vec![1, 2, 3]);
        scheduler.stop_running_jobs();
    }

    #[test]
    #[should_panic(expected = "before wait_for_completion")]
    fn reading_before_waiting_panics() {
        let scheduler = scheduler(1);
        let mut group = scheduler.group::<u8>();
        let task = scheduler.start(async { 7 });
        // Build the group by hand without scheduling, so the task cannot
        // have finished.
        group.tasks.push(task);
        let _ = group.at(0);
    }
}
