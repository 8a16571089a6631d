// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker threads and the shared queue state they coordinate on.

use crate::macros::log_debug;
use crate::pool::{PoolConfig, PoolMode};
use crate::task::Task;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often a Cached-mode worker wakes up from an empty queue to re-evaluate
/// its accumulated idle time.
pub(crate) const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// State protected by the pool's single guard.
///
/// Every read or write of the queue, the counters, or the worker registry
/// must happen while holding [`Shared::state`]. The pending task count is
/// `queue.len()`, so it can't drift out of sync with the queue itself.
pub(crate) struct PoolState {
    /// Live configuration; mutable only while the pool isn't running.
    pub(crate) config: PoolConfig,
    /// Enqueued tasks, served strictly first-in first-out.
    pub(crate) queue: VecDeque<Task>,
    /// Number of spawned workers that haven't retired.
    pub(crate) current_threads: usize,
    /// Number of workers currently not executing a task.
    pub(crate) idle_threads: usize,
    /// Thread count recorded at `start()`; the Cached-mode floor.
    pub(crate) initial_threads: usize,
    /// False before `start()` and after shutdown was requested.
    pub(crate) running: bool,
    /// Join handles of all spawned workers, owned by the pool.
    pub(crate) workers: HashMap<u64, JoinHandle<()>>,
    /// Ids of workers that retired on their own; their handles are joined by
    /// the pool, either opportunistically or at shutdown.
    pub(crate) retired: Vec<u64>,
}

/// The guard and the condition variables coordinating submitters and workers.
pub(crate) struct Shared {
    pub(crate) state: Mutex<PoolState>,
    /// Signaled when a task is enqueued, or when tasks remain after a dequeue,
    /// or when shutdown is requested.
    pub(crate) not_empty: Condvar,
    /// Signaled on every dequeue, for submitters blocked on a full queue.
    pub(crate) not_full: Condvar,
}

/// Context owned by one worker thread.
///
/// The id is assigned from a pool-owned counter and never reused: a retired
/// worker's replacement gets a fresh identity.
pub(crate) struct WorkerContext {
    pub(crate) id: u64,
    pub(crate) shared: Arc<Shared>,
    pub(crate) mode: PoolMode,
    pub(crate) idle_timeout: Duration,
}

impl WorkerContext {
    /// Main loop run by a worker thread: dequeue, execute, repeat, until the
    /// worker retires.
    pub(crate) fn run(self) {
        let mut idle_since = Instant::now();
        loop {
            let task = match self.next_task(&mut idle_since) {
                Some(task) => task,
                None => break,
            };
            // Execute outside the guard, so a long-running task never blocks
            // queue operations or other workers.
            task.execute();
            let mut state = self.shared.state.lock().unwrap();
            state.idle_threads += 1;
            drop(state);
            idle_since = Instant::now();
        }
        log_debug!("[worker {}] retired", self.id);
    }

    /// Blocks until a task is available and dequeues it, or returns [`None`]
    /// when this worker must retire.
    ///
    /// Retirement happens when the pool has stopped and the queue is already
    /// drained, or — Cached mode only — when no task arrived within the idle
    /// timeout and the pool is above its initial thread count. The stop check
    /// runs before the idle-timeout check on every iteration, so draining
    /// queued work always takes precedence over idle retirement.
    fn next_task(&self, idle_since: &mut Instant) -> Option<Task> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(task) = state.queue.pop_front() {
                state.idle_threads -= 1;
                if !state.queue.is_empty() {
                    self.shared.not_empty.notify_one();
                }
                self.shared.not_full.notify_all();
                return Some(task);
            }
            if !state.running {
                self.retire(&mut state);
                return None;
            }
            match self.mode {
                PoolMode::Fixed => {
                    state = self.shared.not_empty.wait(state).unwrap();
                }
                PoolMode::Cached => {
                    let (guard, timeout) = self
                        .shared
                        .not_empty
                        .wait_timeout(state, IDLE_POLL_INTERVAL)
                        .unwrap();
                    state = guard;
                    if timeout.timed_out()
                        && idle_since.elapsed() >= self.idle_timeout
                        && state.current_threads > state.initial_threads
                    {
                        log_debug!("[worker {}] idle timeout exceeded", self.id);
                        self.retire(&mut state);
                        return None;
                    }
                }
            }
        }
    }

    /// Updates the counters and records this worker's id for the pool to join
    /// its handle. The worker never touches the registry itself.
    fn retire(&self, state: &mut PoolState) {
        state.current_threads -= 1;
        state.idle_threads -= 1;
        state.retired.push(self.id);
    }
}
