use std::{
    cell::Cell,
    future::Future,
    hint,
    marker::PhantomData,
    mem,
    ops::Deref,
    panic::{self, AssertUnwindSafe},
    process,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::{
    completion::{CompletionBlock, CompletionTarget, CountProbe, Probe},
    config::SchedulerConfig,
    error::SchedulerError,
    frame::{FixedBlockAllocator, FrameAllocator},
    group::TaskGroup,
    mailbox::MailboxGrid,
    task::{Task, TaskMeta, TaskRunnable},
    util::{panic_message, Semaphore},
};

// -----------------------------------------------------------------------------
// Scheduler types

/// This crate puts a hard upper-bound on the number of threads a scheduler
/// may use. The mailbox grid grows with the square of the thread count, so
/// this is kept modest.
pub const MAX_THREADS: usize = 32;

/// The index of the thread that constructs the scheduler. Main-thread-only
/// tasks run here and nowhere else.
pub const MAIN_THREAD: usize = 0;

/// The `Scheduler` owns a fixed pool of threads and is the main entrypoint to
/// this crate.
///
/// # Threads
///
/// The thread that calls [`Scheduler::new`] becomes thread 0, the *main
/// thread*. The scheduler spawns `thread_count - 1` workers next to it. The
/// main thread only runs tasks while it waits, in
/// [`TaskGroup::wait_for_completion`] or [`Handle::block_on`]; workers run
/// tasks whenever the scheduler is running. Because it is tied to thread 0,
/// a `Scheduler` cannot be sent to other threads. Tasks reach the scheduler
/// through a [`Handle`] instead.
///
/// ```
/// # use weft::prelude::*;
/// let scheduler = Scheduler::new(SchedulerConfig::default().with_thread_count(4)).unwrap();
/// scheduler.prepare_to_run_jobs();
///
/// let mut group = scheduler.group();
/// for i in 0..8 {
///     group.spawn(async move { i * 2 });
/// }
/// group.wait_for_completion();
/// assert_eq!(group[3], 6);
///
/// scheduler.stop_running_jobs();
/// ```
///
/// # Lifecycle
///
/// A new scheduler is idle: its workers are parked. [`prepare_to_run_jobs`]
/// starts them and [`stop_running_jobs`] parks them again once they finish
/// their current step. This can be repeated any number of times. Dropping the
/// scheduler stops and joins every worker; tasks still waiting in mailboxes
/// are dropped without running.
///
/// [`prepare_to_run_jobs`]: Scheduler::prepare_to_run_jobs
/// [`stop_running_jobs`]: Scheduler::stop_running_jobs
pub struct Scheduler {
    handle: Handle,
    workers: Vec<JoinHandle<()>>,
    /// Keeps the scheduler on the thread that created it.
    marker: PhantomData<*const ()>,
}

/// A cloneable reference to a scheduler, used to start and schedule tasks
/// from any thread in its pool.
#[derive(Clone)]
pub struct Handle {
    registry: Arc<Registry>,
}

/// The state shared between the scheduler, its workers, and every task.
pub(crate) struct Registry {
    thread_count: usize,
    /// Single-slot handoff cells, `[consumer][producer]`.
    mailboxes: MailboxGrid<TaskMeta>,
    /// Tasks that may only run on the main thread.
    main_thread_jobs: Mutex<Vec<TaskRunnable>>,
    /// Infrequently written run state, kept on its own cache line.
    state: CachePadded<RegistryState>,
    /// Where task frames come from.
    allocator: Arc<dyn FrameAllocator>,
}

struct RegistryState {
    /// Workers drain their mailboxes only while this is set.
    running: AtomicBool,
    /// Set once, when the scheduler is dropped.
    quit: AtomicBool,
    /// Parked workers wait here for the scheduler to start running.
    wake_workers: Semaphore,
}

// -----------------------------------------------------------------------------
// Thread identity

/// Which scheduler a thread belongs to, its index there, and where its next
/// push goes.
#[derive(Clone, Copy)]
struct ThreadBinding {
    registry: usize,
    index: usize,
    next_target: usize,
}

thread_local! {
    static WORKER_THREAD_STATE: Cell<Option<ThreadBinding>> = const { Cell::new(None) };

    /// The completion target of a task whose body just returned on this
    /// thread, waiting for the resume that polled it.
    static FINISHED_TARGET: Cell<Option<CompletionTarget>> = const { Cell::new(None) };
}

/// Registers the current thread as thread `index` of `registry`.
fn bind_thread(registry: &Registry, index: usize) {
    WORKER_THREAD_STATE.with(|state| {
        assert!(state.get().is_none(), "thread is already bound to a scheduler");
        state.set(Some(ThreadBinding {
            registry: registry.id(),
            index,
            // The main thread starts its round robin at itself, workers at
            // their neighbour.
            next_target: if index == MAIN_THREAD {
                MAIN_THREAD
            } else {
                (index + 1) % registry.thread_count
            },
        }));
    });
}

/// Clears the current thread's binding if it belongs to `registry`.
fn unbind_thread(registry: &Registry) {
    WORKER_THREAD_STATE.with(|state| {
        if matches!(state.get(), Some(binding) if binding.registry == registry.id()) {
            state.set(None);
        }
    });
}

/// Hands a finished task's completion target to the resume that is polling
/// it on this thread.
pub(crate) fn note_finished(target: CompletionTarget) {
    FINISHED_TARGET.with(|finished| {
        let previous = finished.replace(Some(target));
        debug_assert!(previous.is_none(), "two tasks finished in one poll");
    });
}

/// Returns the index of the current thread within its scheduler, or `None` if
/// the thread does not belong to one.
pub fn current_thread_index() -> Option<usize> {
    WORKER_THREAD_STATE.with(Cell::get).map(|binding| binding.index)
}

// -----------------------------------------------------------------------------
// Scheduler creation and lifecycle

impl Scheduler {
    /// Creates a scheduler using a [`FixedBlockAllocator`] for task frames.
    /// The calling thread becomes thread 0.
    pub fn new(config: SchedulerConfig) -> Result<Scheduler, SchedulerError> {
        config.validate()?;
        let allocator = Arc::new(FixedBlockAllocator::from_config(&config));
        Scheduler::with_allocator(config, allocator)
    }

    /// Creates a scheduler that takes task frames from `allocator`. The frame
    /// settings in `config` are ignored.
    pub fn with_allocator(
        config: SchedulerConfig,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Scheduler, SchedulerError> {
        config.validate()?;
        if current_thread_index().is_some() {
            return Err(SchedulerError::ThreadAlreadyBound);
        }

        let registry = Arc::new(Registry::new(config.thread_count, allocator));
        bind_thread(&registry, MAIN_THREAD);

        // From here on, dropping the scheduler cleans up after a partial start.
        let mut scheduler = Scheduler {
            handle: Handle { registry },
            workers: Vec::with_capacity(config.thread_count - 1),
            marker: PhantomData,
        };

        for index in 1..config.thread_count {
            let registry = Arc::clone(&scheduler.handle.registry);
            let worker = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || main_loop(registry, index))
                .map_err(|source| SchedulerError::Spawn { index, source })?;
            scheduler.workers.push(worker);
        }

        info!(threads = config.thread_count, "scheduler started");
        Ok(scheduler)
    }

    /// Returns a handle that tasks can carry to reach this scheduler.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Sets the running flag and unparks every worker. Tasks may only be
    /// pushed while the scheduler is running. Does nothing if it already is.
    pub fn prepare_to_run_jobs(&self) {
        let state = &self.handle.registry.state;
        if !state.running.swap(true, Ordering::AcqRel) {
            state.wake_workers.release(self.workers.len());
            debug!("scheduler running");
        }
    }

    /// Clears the running flag. Workers finish the step they are on, then
    /// park. Tasks already in flight are not cancelled.
    pub fn stop_running_jobs(&self) {
        self.handle
            .registry
            .state
            .running
            .store(false, Ordering::Release);
        debug!("scheduler stopped");
    }
}

impl Deref for Scheduler {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let registry = &self.handle.registry;

        // Ask every worker to quit, and unpark the ones that are parked.
        registry.state.quit.store(true, Ordering::Release);
        registry.state.running.store(false, Ordering::Release);
        registry.state.wake_workers.release(self.workers.len());

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("scheduler worker exited by panicking");
            }
        }

        // Pending tasks can hold handles to the registry, so they are dropped
        // explicitly rather than with it.
        let abandoned = registry.abandon_pending();
        if abandoned > 0 {
            debug!(abandoned, "dropped tasks that never ran");
        }

        unbind_thread(registry);
        debug!("scheduler shut down");
    }
}

// -----------------------------------------------------------------------------
// Core API

impl Handle {
    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The number of threads in the pool, including the main thread.
    pub fn thread_count(&self) -> usize {
        self.registry.thread_count
    }

    /// Returns true between `prepare_to_run_jobs` and `stop_running_jobs`.
    pub fn is_running(&self) -> bool {
        self.registry.is_running()
    }

    /// Starts a task without scheduling it. The body does not run until the
    /// task is scheduled, pushed into a group, or awaited.
    pub fn start<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Task::start(self, future, false)
    }

    /// Like [`Handle::start`], but the task may only ever run on the main
    /// thread.
    pub fn start_on_main_thread<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Task::start(self, future, true)
    }

    /// Hands a task to the scheduler. See [`Task::schedule`].
    pub fn schedule<T>(&self, task: &mut Task<T>) {
        task.schedule();
    }

    /// Creates an empty task group owned by the current thread.
    pub fn group<T>(&self) -> TaskGroup<T> {
        TaskGroup::new(self)
    }

    /// Runs tasks on the current thread until `block` reports `target`
    /// completions to it.
    pub fn run_jobs(&self, block: &CompletionBlock, target: usize) {
        self.run_until(&CountProbe::new(block, target));
    }

    /// Runs tasks on the current thread until `probe` holds. This busy-polls:
    /// the thread never sleeps while waiting.
    ///
    /// Each pass drains one task from the thread's own mailbox row and, on
    /// the main thread, every pending main-thread task.
    pub fn run_until<P: Probe>(&self, probe: &P) {
        self.registry.run_until(probe);
    }

    /// Runs `future` as a task and waits for its output, running other tasks
    /// on the current thread in the meantime.
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut group = self.group();
        group.spawn(future);
        group.wait_for_completion();
        group
            .into_results()
            .pop()
            .expect("block_on task produced no output")
    }
}

// -----------------------------------------------------------------------------
// Registry

impl Registry {
    fn new(thread_count: usize, allocator: Arc<dyn FrameAllocator>) -> Registry {
        Registry {
            thread_count,
            mailboxes: MailboxGrid::new(thread_count),
            main_thread_jobs: Mutex::new(Vec::new()),
            state: CachePadded::new(RegistryState {
                running: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                wake_workers: Semaphore::new(0),
            }),
            allocator,
        }
    }

    /// Returns an opaque identifier for this registry.
    #[inline]
    fn id(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    pub(crate) fn allocator(&self) -> &Arc<dyn FrameAllocator> {
        &self.allocator
    }

    #[inline]
    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn should_quit(&self) -> bool {
        self.state.quit.load(Ordering::Acquire)
    }

    /// Returns the index of the calling thread in this scheduler.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread outside the pool.
    pub(crate) fn current_index(&self) -> usize {
        match WORKER_THREAD_STATE.with(Cell::get) {
            Some(binding) if binding.registry == self.id() => binding.index,
            _ => panic!("this thread does not belong to the scheduler"),
        }
    }

    /// Returns the calling thread's index and the target of its next push,
    /// advancing its round robin.
    fn claim_target(&self) -> (usize, usize) {
        WORKER_THREAD_STATE.with(|state| match state.get() {
            Some(mut binding) if binding.registry == self.id() => {
                let target = binding.next_target;
                binding.next_target = (target + 1) % self.thread_count;
                state.set(Some(binding));
                (binding.index, target)
            }
            _ => panic!("tasks can only be pushed from threads in the scheduler"),
        })
    }

    /// Routes a runnable task by its main-thread flag.
    pub(crate) fn dispatch(&self, runnable: TaskRunnable) {
        if runnable.metadata().is_main_thread_only() {
            self.push_main_thread_job(runnable);
        } else {
            self.push_job(runnable);
        }
    }

    /// Deposits a task into the mailbox of the next thread in the calling
    /// thread's round robin. If that displaces an earlier task, the displaced
    /// task is resumed right here before returning.
    ///
    /// With a single thread there are no mailboxes and the task is resumed
    /// inline.
    pub(crate) fn push_job(&self, runnable: TaskRunnable) {
        if self.thread_count == 1 {
            self.resume(runnable);
            return;
        }

        debug_assert!(self.is_running(), "pushed a job while the scheduler is not running");

        let (producer, target) = self.claim_target();
        if let Some(displaced) = self.mailboxes.deposit(target, producer, runnable) {
            trace!(producer, target, "mailbox full, resuming displaced task inline");
            self.resume(displaced);
        }
    }

    /// Queues a task for the main thread.
    pub(crate) fn push_main_thread_job(&self, runnable: TaskRunnable) {
        debug_assert!(self.is_running(), "pushed a job while the scheduler is not running");
        self.main_thread_jobs.lock().push(runnable);
    }

    /// Resumes the first task waiting in `consumer`'s mailbox row. Returns
    /// false if the row was empty.
    fn drain(&self, consumer: usize) -> bool {
        match self.mailboxes.take_next(consumer) {
            Some(runnable) => {
                self.resume(runnable);
                true
            }
            None => false,
        }
    }

    /// Resumes every queued main-thread task. Must only be called on the main
    /// thread. The queue is emptied under the lock and the tasks are resumed
    /// after it is released, so they can queue more main-thread work.
    fn drain_main_thread_jobs(&self) -> bool {
        let jobs = mem::take(&mut *self.main_thread_jobs.lock());
        let found = !jobs.is_empty();
        for runnable in jobs {
            self.resume(runnable);
        }
        found
    }

    /// Runs tasks on the current thread until the probe holds.
    fn run_until<P: Probe>(&self, probe: &P) {
        let index = self.current_index();
        loop {
            let mut found = self.drain(index);
            if index == MAIN_THREAD {
                found |= self.drain_main_thread_jobs();
            }
            if probe.probe(index) {
                return;
            }
            if !found {
                hint::spin_loop();
            }
        }
    }

    /// Resumes a task one step, then signals whatever its progress unblocks.
    ///
    /// 1. The task is polled once.
    /// 2. If it finished, its continuation (the task awaiting it) is woken,
    ///    which schedules it through `dispatch` rather than running it here.
    ///    This happens inside the poll.
    /// 3. If it finished during this poll, its completion target is
    ///    signalled: the local counter if this thread owns the target,
    ///    otherwise this thread's remote counter.
    ///
    /// The task's frame went back to the allocator as the body returned,
    /// during step 1. A panic escaping the task body aborts the process.
    ///
    /// Resumes nest: a poll can push work that displaces another task, or
    /// wake this very task, and either is resumed inline. Each resume only
    /// signals the completion its own poll produced.
    pub(crate) fn resume(&self, runnable: TaskRunnable) {
        let outer = FINISHED_TARGET.with(Cell::take);

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| runnable.run())) {
            error!(
                thread = ?current_thread_index(),
                "task panicked: {}",
                panic_message(payload.as_ref())
            );
            process::abort();
        }

        if let Some(target) = FINISHED_TARGET.with(|finished| finished.replace(outer)) {
            target.signal(self.current_index());
        }
    }

    /// Schedules a woken task again, or drops it once the scheduler is
    /// shutting down.
    pub(crate) fn reschedule(&self, runnable: TaskRunnable) {
        if self.should_quit() {
            // Dropping the runnable cancels the task, which in turn wakes
            // (and so cancels) whatever was awaiting it.
            trace!("dropping a task woken during shutdown");
            drop(runnable);
        } else {
            self.dispatch(runnable);
        }
    }

    /// Drops every task still waiting in a mailbox or the main-thread queue.
    /// Returns how many there were. Tasks suspended on one of them are
    /// dropped as well.
    fn abandon_pending(&self) -> usize {
        self.state.quit.store(true, Ordering::Release);
        let mut pending = self.mailboxes.take_all();
        pending.append(&mut self.main_thread_jobs.lock());
        let abandoned = pending.len();
        drop(pending);
        abandoned
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// This is the main loop for a worker thread. The worker parks on the
/// registry's semaphore until the scheduler runs, then drains its mailbox row
/// for as long as it keeps running. An empty row does not park the worker:
/// it spins and checks again, trading power for latency.
fn main_loop(registry: Arc<Registry>, index: usize) {
    bind_thread(&registry, index);
    trace!(index, "worker started");

    while !registry.should_quit() {
        registry.state.wake_workers.acquire();
        trace!(index, "worker unparked");

        while registry.is_running() && !registry.should_quit() {
            if !registry.drain(index) {
                hint::spin_loop();
            }
        }
    }

    unbind_thread(&registry);
    trace!(index, "worker exited");
}
