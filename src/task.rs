//! This module defines the scheduler's unit of work: a [`Task`]. A task wraps
//! a future (the task body) whose state lives in a frame borrowed from the
//! scheduler's frame allocator. Each resume of a task polls the body once.
//!
//! Tasks are created unscheduled. They reach a worker in one of three ways:
//!
//! 1. Explicitly, through [`Task::schedule`] or [`Task::detach`].
//! 2. By being pushed into a [`TaskGroup`](crate::group::TaskGroup).
//! 3. By being awaited from inside another task. The awaiting task becomes
//!    the awaited task's continuation and suspends; when the awaited task
//!    finishes, the continuation is woken and scheduled again.
//!
//! Whichever thread resumes a task, the resume is followed by the scheduler's
//! resume-and-signal step: a task that finished during that resume reports to
//! its completion target (see `Registry::resume`).

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    task::{Context, Poll, Waker},
};

use async_task::Runnable;

use crate::{
    completion::CompletionTarget,
    frame::FrameBox,
    scheduler::{self, Handle},
};

/// The metadata attached to every runnable the scheduler handles.
pub(crate) type TaskMeta = TaskHeader;

/// A runnable task, as it travels through mailboxes and queues.
pub(crate) type TaskRunnable = Runnable<TaskMeta>;

// -----------------------------------------------------------------------------
// Task header

/// The type-erased state shared by a task, its handle and the scheduler. It
/// is stored inline in the task's allocation, next to the body.
pub(crate) struct TaskHeader {
    /// Restricts the task to thread 0.
    main_thread_only: AtomicBool,
    /// Where to report completion, if anywhere. Set at most once, before the
    /// task is scheduled.
    completion: OnceLock<CompletionTarget>,
    /// Set once the body has returned.
    finished: AtomicBool,
}

impl TaskHeader {
    fn new(main_thread_only: bool) -> TaskHeader {
        TaskHeader {
            main_thread_only: AtomicBool::new(main_thread_only),
            completion: OnceLock::new(),
            finished: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_main_thread_only(&self) -> bool {
        self.main_thread_only.load(Ordering::Acquire)
    }

    #[inline]
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Called by the body as it returns, on the thread that is resuming it.
    /// The completion target is handed to that resume and nowhere else.
    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        if let Some(target) = self.completion.get() {
            scheduler::note_finished(target.clone());
        }
    }
}

// -----------------------------------------------------------------------------
// Task handle

/// Where a task's output currently is.
enum Output<T> {
    /// Still inside the task allocation, or not produced yet.
    Pending,
    /// Moved into the handle.
    Ready(T),
    /// Handed out by value.
    Taken,
}

/// A handle to a task started on a scheduler.
///
/// Awaiting a `Task` from inside another task suspends the awaiting task
/// until this one finishes, then yields its output. Dropping an unscheduled
/// task releases its frame without ever running it; dropping the handle of a
/// scheduled task lets it finish on its own.
pub struct Task<T> {
    /// Present until the task is handed to the scheduler.
    runnable: Option<TaskRunnable>,
    /// Present for the whole life of the handle; only taken on drop.
    inner: Option<async_task::Task<T, TaskMeta>>,
    output: Output<T>,
    handle: Handle,
}

impl<T> Task<T>
where
    T: Send + 'static,
{
    /// Allocates a frame for `future` and wraps it into an unscheduled task.
    /// Nothing runs until the task is scheduled.
    pub(crate) fn start<F>(handle: &Handle, future: F, main_thread_only: bool) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let frame = FrameBox::new(future, Arc::clone(handle.registry().allocator()));

        // The schedule function routes the runnable by its main-thread flag
        // whenever the task is woken. It holds the registry weakly so that
        // pending tasks don't keep a dropped scheduler alive.
        let registry = Arc::downgrade(handle.registry());
        let schedule = move |runnable: TaskRunnable| {
            if let Some(registry) = registry.upgrade() {
                registry.reschedule(runnable);
            }
        };

        // SAFETY: The body borrows nothing but the task's own header, which
        // the task allocation drops only after the body. Everything else the
        // body holds is `Send + 'static`, the header is `Sync`, and the
        // schedule function is `Send + Sync + 'static`, so the runnable may
        // move freely between threads.
        let (runnable, inner) = unsafe {
            async_task::Builder::new()
                .metadata(TaskHeader::new(main_thread_only))
                .spawn_unchecked(
                    move |header| async move {
                        let mut frame = frame;
                        let value = (&mut frame).await;
                        // Give the frame back to the allocator on the resuming
                        // thread, before anyone can observe the task as
                        // finished.
                        drop(frame);
                        header.finish();
                        value
                    },
                    schedule,
                )
        };

        Task {
            runnable: Some(runnable),
            inner: Some(inner),
            output: Output::Pending,
            handle: handle.clone(),
        }
    }
}

impl<T> Task<T> {
    fn inner(&self) -> &async_task::Task<T, TaskMeta> {
        match &self.inner {
            Some(inner) => inner,
            None => unreachable!("task handle used while being dropped"),
        }
    }

    fn header(&self) -> &TaskHeader {
        self.inner().metadata()
    }

    /// Hands the task to the scheduler: the main-thread queue if the task is
    /// main-thread-only, otherwise the mailbox grid.
    ///
    /// # Panics
    ///
    /// Panics if the task was already scheduled.
    pub fn schedule(&mut self) {
        let runnable = self.runnable.take().expect("task was already scheduled");
        self.handle.registry().dispatch(runnable);
    }

    /// Marks the task main-thread-only, then schedules it.
    pub fn schedule_on_main_thread(&mut self) {
        self.header().main_thread_only.store(true, Ordering::Release);
        self.schedule();
    }

    /// Schedules the task so that its completion is reported to `target`.
    pub(crate) fn schedule_with_completion(&mut self, target: CompletionTarget) {
        let runnable = self.runnable.take().expect("task was already scheduled");
        if self.header().completion.set(target).is_err() {
            unreachable!("completion target set on an unscheduled task");
        }
        self.handle.registry().dispatch(runnable);
    }

    /// Schedules the task (if needed) and lets it run to completion without
    /// keeping a handle.
    pub fn detach(mut self) {
        if self.runnable.is_some() {
            self.schedule();
        }
    }

    /// Returns true once the task has been handed to the scheduler.
    pub fn is_scheduled(&self) -> bool {
        self.runnable.is_none()
    }

    /// Returns true once the task body has returned and its output has been
    /// stored.
    pub fn is_finished(&self) -> bool {
        // The body flag rules out a task that was cancelled at shutdown.
        self.header().is_finished() && self.inner().is_finished()
    }

    /// Returns true if the task may only run on thread 0.
    pub fn is_main_thread_only(&self) -> bool {
        self.header().is_main_thread_only()
    }

    /// Moves the output out of the task allocation into the handle, if the
    /// task has finished. Returns true if the handle now holds it.
    pub(crate) fn collect_output(&mut self) -> bool {
        if matches!(self.output, Output::Pending) && self.is_finished() {
            let mut cx = Context::from_waker(Waker::noop());
            if let Some(inner) = self.inner.as_mut() {
                if let Poll::Ready(value) = Pin::new(inner).poll(&mut cx) {
                    self.output = Output::Ready(value);
                }
            }
        }
        matches!(self.output, Output::Ready(_))
    }

    /// Returns the output if the handle already collected it.
    pub(crate) fn collected_output(&self) -> Option<&T> {
        match &self.output {
            Output::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the task's output, once it has finished and unless it was
    /// taken.
    pub fn output(&mut self) -> Option<&T> {
        self.collect_output();
        self.collected_output()
    }

    /// Moves the task's output out, once it has finished.
    pub fn take_output(&mut self) -> Option<T> {
        if !self.collect_output() {
            return None;
        }
        match std::mem::replace(&mut self.output, Output::Taken) {
            Output::Ready(value) => Some(value),
            _ => None,
        }
    }
}

// The output is never pinned in place, so the handle can be moved freely.
impl<T> Unpin for Task<T> {}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = &mut *self;
        match std::mem::replace(&mut this.output, Output::Taken) {
            Output::Ready(value) => return Poll::Ready(value),
            Output::Taken => panic!("task polled again after yielding its output"),
            Output::Pending => {}
        }

        // An unscheduled task is handed off first. If that runs it inline,
        // the poll below sees it finished right away.
        if let Some(runnable) = this.runnable.take() {
            this.handle.registry().dispatch(runnable);
        }

        match this.inner.as_mut() {
            // Registers `cx` as the continuation, woken when the task finishes.
            Some(inner) => match Pin::new(inner).poll(cx) {
                Poll::Ready(value) => Poll::Ready(value),
                Poll::Pending => {
                    this.output = Output::Pending;
                    Poll::Pending
                }
            },
            None => unreachable!("task handle used while being dropped"),
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        // Detach rather than cancel, so that a scheduled task runs to
        // completion. An unscheduled task is cancelled when its runnable is
        // dropped right after this.
        if let Some(inner) = self.inner.take() {
            inner.detach();
        }
    }
}
