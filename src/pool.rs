// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The worker pool: configuration, submission with backpressure, demand-driven
//! scaling, and the graceful-shutdown protocol.

use crate::macros::{log_debug, log_error, log_warn};
use crate::task::{Task, TaskHandle};
use crate::worker::{PoolState, Shared, WorkerContext};
use crossbeam_utils::CachePadded;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_MAX_THREADS: usize = 16;
const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Scaling policy of a [`WorkerPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolMode {
    /// The thread count never changes after [`start()`](WorkerPool::start).
    Fixed,
    /// The pool spawns extra workers (up to the configured ceiling) when
    /// pending work exceeds idle capacity, and retires them back down to the
    /// initial count after the idle timeout.
    Cached,
}

/// Number of worker threads to spawn when starting a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Configuration shared by the pool and its workers.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolConfig {
    pub(crate) mode: PoolMode,
    pub(crate) queue_capacity: usize,
    pub(crate) max_threads: usize,
    pub(crate) submit_timeout: Duration,
    pub(crate) idle_timeout: Duration,
}

/// A builder for [`WorkerPool`].
///
/// ```
/// use std::time::Duration;
/// use workpool::{PoolBuilder, PoolMode};
///
/// let pool = PoolBuilder {
///     mode: PoolMode::Cached,
///     queue_capacity: 256,
///     max_threads: 8,
///     idle_timeout: Duration::from_secs(2),
///     ..PoolBuilder::default()
/// }
/// .build();
/// ```
#[derive(Clone, Debug)]
pub struct PoolBuilder {
    /// Scaling policy (default: [`PoolMode::Fixed`]).
    pub mode: PoolMode,
    /// Maximum number of enqueued tasks before submissions block and then get
    /// rejected (default: 1024).
    pub queue_capacity: usize,
    /// Thread-count ceiling for [`PoolMode::Cached`] growth (default: 16).
    pub max_threads: usize,
    /// How long a submission waits for queue space before being rejected
    /// (default: 1 second).
    pub submit_timeout: Duration,
    /// Minimum continuous idle time before a Cached-mode worker above the
    /// initial count retires (default: 5 seconds).
    pub idle_timeout: Duration,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            mode: PoolMode::Fixed,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_threads: DEFAULT_MAX_THREADS,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl PoolBuilder {
    /// Creates a pool with this configuration. The pool doesn't spawn any
    /// thread until [`start()`](WorkerPool::start) is called.
    pub fn build(&self) -> WorkerPool {
        WorkerPool::new(self)
    }
}

/// A bounded worker pool.
///
/// Workers consume tasks from a shared, capacity-limited FIFO queue; each
/// submission hands back a [`TaskHandle`] that yields exactly one result.
/// Dropping the pool drains every task already enqueued, then joins all
/// worker threads.
///
/// ```
/// use workpool::{PoolBuilder, Task, ThreadCount};
///
/// let pool = PoolBuilder::default().build();
/// pool.start(ThreadCount::try_from(2).unwrap());
///
/// let handle = pool.submit(Task::new(|| 6 * 7));
/// assert_eq!(handle.fetch::<i32>(), Ok(42));
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    /// Source of worker identities, owned by this pool instance.
    next_worker_id: CachePadded<AtomicU64>,
}

impl WorkerPool {
    fn new(builder: &PoolBuilder) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    config: PoolConfig {
                        mode: builder.mode,
                        queue_capacity: builder.queue_capacity,
                        max_threads: builder.max_threads,
                        submit_timeout: builder.submit_timeout,
                        idle_timeout: builder.idle_timeout,
                    },
                    queue: VecDeque::new(),
                    current_threads: 0,
                    idle_threads: 0,
                    initial_threads: 0,
                    running: false,
                    workers: HashMap::new(),
                    retired: Vec::new(),
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
            next_worker_id: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Marks the pool as running and spawns the given number of workers.
    ///
    /// The count becomes the floor that [`PoolMode::Cached`] never shrinks
    /// below. Calling `start` on a pool that is already running is ignored.
    /// A pool that was shut down may be started again.
    pub fn start(&self, num_threads: ThreadCount) {
        let mut state = self.shared.state.lock().unwrap();
        if state.running {
            log_warn!("[pool] start ignored: the pool is already running");
            return;
        }
        let count: usize = match num_threads {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed")
                .into(),
            ThreadCount::Count(count) => count.into(),
        };
        state.running = true;
        state.initial_threads = count;
        for _ in 0..count {
            self.spawn_worker(&mut state);
        }
        log_debug!("[pool] started with {count} worker thread(s)");
    }

    /// Submits a task for execution and returns its result handle.
    ///
    /// If the queue is at capacity, this blocks up to the configured submit
    /// timeout for a slot to free up; on timeout the task is discarded and
    /// the returned handle is invalid ([`is_valid()`](TaskHandle::is_valid)
    /// returns `false` and fetching reports
    /// [`TaskError::Rejected`](crate::TaskError::Rejected) without blocking).
    /// Submissions racing for the last slot are served in the order they
    /// acquire the pool's guard, which is unspecified.
    ///
    /// In [`PoolMode::Cached`], an accepted submission spawns one extra
    /// worker when the pending tasks outnumber the idle workers and the
    /// thread count is below the ceiling.
    pub fn submit(&self, mut task: Task) -> TaskHandle {
        let state = self.shared.state.lock().unwrap();
        if !state.running {
            log_warn!("[pool] submission rejected: the pool is not running");
            return TaskHandle::rejected();
        }
        let timeout = state.config.submit_timeout;
        let (mut state, wait_result) = self
            .shared
            .not_full
            .wait_timeout_while(state, timeout, |state| {
                state.queue.len() >= state.config.queue_capacity
            })
            .unwrap();
        if wait_result.timed_out() {
            log_warn!("[pool] submission rejected: the task queue stayed full");
            return TaskHandle::rejected();
        }
        if !state.running {
            // Shutdown was requested while we waited for queue space; an
            // enqueued task would never be picked up.
            log_warn!("[pool] submission rejected: the pool stopped while waiting");
            return TaskHandle::rejected();
        }

        let handle = task.bind_handle();
        state.queue.push_back(task);
        self.shared.not_empty.notify_one();

        let mut stale = Vec::new();
        if state.config.mode == PoolMode::Cached
            && state.queue.len() > state.idle_threads
            && state.current_threads < state.config.max_threads
        {
            self.spawn_worker(&mut state);
            // Reap workers that retired on idle timeout since the last spawn.
            let retired: Vec<u64> = state.retired.drain(..).collect();
            for id in retired {
                if let Some(worker) = state.workers.remove(&id) {
                    stale.push(worker);
                }
            }
        }
        drop(state);
        for worker in stale {
            let _ = worker.join();
        }
        handle
    }

    /// Stops accepting work, wakes all workers, and joins every worker thread
    /// once the queue is drained.
    ///
    /// Tasks already enqueued are still executed: a worker only retires after
    /// observing an empty queue. Idempotent; also invoked on drop.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.running && state.workers.is_empty() {
            return;
        }
        state.running = false;
        self.shared.not_empty.notify_all();
        let workers: Vec<_> = state.workers.drain().map(|(_, worker)| worker).collect();
        state.retired.clear();
        drop(state);
        log_debug!("[pool] joining {} worker thread(s)", workers.len());
        for worker in workers {
            if worker.join().is_err() {
                log_error!("[pool] a worker thread panicked");
            }
        }
        log_debug!("[pool] all workers joined");
    }

    /// Sets the scaling policy. Ignored while the pool is running.
    pub fn set_mode(&self, mode: PoolMode) {
        self.configure(|config| config.mode = mode);
    }

    /// Sets the task queue capacity. Ignored while the pool is running.
    pub fn set_queue_capacity(&self, queue_capacity: usize) {
        self.configure(|config| config.queue_capacity = queue_capacity);
    }

    /// Sets the thread-count ceiling. Ignored while the pool is running.
    pub fn set_max_threads(&self, max_threads: usize) {
        self.configure(|config| config.max_threads = max_threads);
    }

    /// Sets the Cached-mode idle timeout. Ignored while the pool is running.
    pub fn set_idle_timeout(&self, idle_timeout: Duration) {
        self.configure(|config| config.idle_timeout = idle_timeout);
    }

    /// Applies a configuration change, unless the pool is running.
    /// Reconfiguring a live pool would race with active scheduling, so it is
    /// a documented no-op rather than an error.
    fn configure(&self, f: impl FnOnce(&mut PoolConfig)) {
        let mut state = self.shared.state.lock().unwrap();
        if state.running {
            log_warn!("[pool] configuration change ignored: the pool is running");
            return;
        }
        f(&mut state.config);
    }

    /// Returns whether the pool was started and not yet shut down.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().running
    }

    /// Returns the scaling policy.
    pub fn mode(&self) -> PoolMode {
        self.shared.state.lock().unwrap().config.mode
    }

    /// Returns the task queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.shared.state.lock().unwrap().config.queue_capacity
    }

    /// Returns the thread-count ceiling.
    pub fn max_threads(&self) -> usize {
        self.shared.state.lock().unwrap().config.max_threads
    }

    /// Returns the number of live worker threads.
    pub fn current_threads(&self) -> usize {
        self.shared.state.lock().unwrap().current_threads
    }

    /// Returns the number of workers currently not executing a task.
    pub fn idle_threads(&self) -> usize {
        self.shared.state.lock().unwrap().idle_threads
    }

    /// Returns the number of enqueued tasks not yet picked up by a worker.
    pub fn pending_tasks(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Spawns one worker and registers its join handle. Must be called with
    /// the state guard held.
    fn spawn_worker(&self, state: &mut PoolState) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let context = WorkerContext {
            id,
            shared: Arc::clone(&self.shared),
            mode: state.config.mode,
            idle_timeout: state.config.idle_timeout,
        };
        log_debug!("[pool] spawning worker {id}");
        let worker = std::thread::spawn(move || context.run());
        state.workers.insert(id, worker);
        state.current_threads += 1;
        state.idle_threads += 1;
    }
}

impl Drop for WorkerPool {
    /// Drains the queue and joins all worker threads.
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::TaskError;
    use std::time::Instant;

    /// A gate that blocks tasks until the test opens it.
    struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(false),
                cv: Condvar::new(),
            })
        }

        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    fn sleep_ms(ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    #[test]
    fn test_builder_defaults() {
        let pool = PoolBuilder::default().build();
        assert!(!pool.is_running());
        assert_eq!(pool.mode(), PoolMode::Fixed);
        assert_eq!(pool.queue_capacity(), 1024);
        assert_eq!(pool.max_threads(), 16);
        assert_eq!(pool.current_threads(), 0);
        assert_eq!(pool.pending_tasks(), 0);
    }

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_submit_before_start_is_rejected() {
        let pool = PoolBuilder::default().build();
        let handle = pool.submit(Task::new(|| 1));
        assert!(!handle.is_valid());
        assert_eq!(handle.fetch::<i32>(), Err(TaskError::Rejected));
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::try_from(1).unwrap());
        pool.shutdown();
        let handle = pool.submit(Task::new(|| 1));
        assert_eq!(handle.fetch::<i32>(), Err(TaskError::Rejected));
    }

    #[test]
    fn test_configuration_ignored_while_running() {
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::try_from(1).unwrap());
        pool.set_queue_capacity(7);
        pool.set_mode(PoolMode::Cached);
        assert_eq!(pool.queue_capacity(), 1024);
        assert_eq!(pool.mode(), PoolMode::Fixed);
        pool.shutdown();
        pool.set_queue_capacity(7);
        pool.set_mode(PoolMode::Cached);
        assert_eq!(pool.queue_capacity(), 7);
        assert_eq!(pool.mode(), PoolMode::Cached);
    }

    #[test]
    fn test_start_twice_is_ignored() {
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::try_from(2).unwrap());
        pool.start(ThreadCount::try_from(4).unwrap());
        assert_eq!(pool.current_threads(), 2);
    }

    #[test]
    fn test_fixed_thread_count_is_constant() {
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::try_from(2).unwrap());
        let handles: Vec<_> = (0..50usize)
            .map(|i| pool.submit(Task::new(move || i)))
            .collect();
        assert_eq!(pool.current_threads(), 2);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.fetch::<usize>(), Ok(i));
        }
        assert_eq!(pool.current_threads(), 2);
        pool.shutdown();
        assert_eq!(pool.current_threads(), 0);
    }

    #[test]
    fn test_backpressure_rejects_when_full() {
        let pool = PoolBuilder {
            queue_capacity: 2,
            submit_timeout: Duration::from_millis(200),
            ..PoolBuilder::default()
        }
        .build();
        pool.start(ThreadCount::try_from(1).unwrap());

        let gate = Gate::new();
        let blocker = {
            let gate = gate.clone();
            pool.submit(Task::new(move || gate.wait()))
        };
        // Wait for the worker to pick up the blocking task.
        while pool.idle_threads() != 0 || pool.pending_tasks() != 0 {
            sleep_ms(1);
        }

        let first = pool.submit(Task::new(|| 1));
        let second = pool.submit(Task::new(|| 2));
        assert!(first.is_valid());
        assert!(second.is_valid());

        let started = Instant::now();
        let third = pool.submit(Task::new(|| 3));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!third.is_valid());
        assert_eq!(third.fetch::<i32>(), Err(TaskError::Rejected));

        gate.open();
        assert_eq!(blocker.fetch::<()>(), Ok(()));
        assert_eq!(first.fetch::<i32>(), Ok(1));
        assert_eq!(second.fetch::<i32>(), Ok(2));
    }

    #[test]
    fn test_cached_growth_is_capped() {
        let pool = PoolBuilder {
            mode: PoolMode::Cached,
            max_threads: 4,
            ..PoolBuilder::default()
        }
        .build();
        pool.start(ThreadCount::try_from(1).unwrap());

        let gate = Gate::new();
        let mut handles = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.current_threads() < 4 && Instant::now() < deadline {
            let gate = gate.clone();
            handles.push(pool.submit(Task::new(move || {
                gate.wait();
                0u32
            })));
            sleep_ms(5);
        }
        assert_eq!(pool.current_threads(), 4);

        // Further pressure never exceeds the ceiling.
        for _ in 0..4 {
            let gate = gate.clone();
            handles.push(pool.submit(Task::new(move || {
                gate.wait();
                0u32
            })));
        }
        assert_eq!(pool.current_threads(), 4);

        gate.open();
        for handle in &handles {
            assert_eq!(handle.fetch::<u32>(), Ok(0));
        }
    }

    #[test]
    fn test_cached_shrinks_to_initial() {
        let pool = PoolBuilder {
            mode: PoolMode::Cached,
            max_threads: 4,
            idle_timeout: Duration::from_secs(2),
            ..PoolBuilder::default()
        }
        .build();
        pool.start(ThreadCount::try_from(1).unwrap());

        let gate = Gate::new();
        let mut handles = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.current_threads() < 4 && Instant::now() < deadline {
            let gate = gate.clone();
            handles.push(pool.submit(Task::new(move || {
                gate.wait();
                0u32
            })));
            sleep_ms(5);
        }
        assert_eq!(pool.current_threads(), 4);

        gate.open();
        for handle in &handles {
            assert_eq!(handle.fetch::<u32>(), Ok(0));
        }

        // Load subsided: the extra workers retire on idle timeout.
        let deadline = Instant::now() + Duration::from_secs(20);
        while pool.current_threads() > 1 && Instant::now() < deadline {
            sleep_ms(50);
        }
        assert_eq!(pool.current_threads(), 1);

        // The initial thread count is a floor.
        sleep_ms(3_500);
        assert_eq!(pool.current_threads(), 1);
    }

    #[test]
    fn test_fifo_order() {
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::try_from(1).unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..20usize)
            .map(|i| {
                let order = order.clone();
                pool.submit(Task::new(move || {
                    order.lock().unwrap().push(i);
                    i
                }))
            })
            .collect();
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.fetch::<usize>(), Ok(i));
        }
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::try_from(1).unwrap());
        let handles: Vec<_> = (0..10usize)
            .map(|i| {
                pool.submit(Task::new(move || {
                    sleep_ms(10);
                    i
                }))
            })
            .collect();
        pool.shutdown();
        assert!(!pool.is_running());
        assert_eq!(pool.current_threads(), 0);
        assert_eq!(pool.pending_tasks(), 0);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.fetch::<usize>(), Ok(i));
        }
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = PoolBuilder::default().build();
        pool.start(ThreadCount::try_from(1).unwrap());
        let panicking = pool.submit(Task::new(|| -> i32 { panic!("boom") }));
        let normal = pool.submit(Task::new(|| 5));
        assert_eq!(panicking.fetch::<i32>(), Err(TaskError::Panicked));
        assert_eq!(normal.fetch::<i32>(), Ok(5));
        assert_eq!(pool.current_threads(), 1);
    }
}
