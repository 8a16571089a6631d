// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Units of work, their type-erased outputs, and the one-shot handles used to
//! fetch results back from the pool.

use crate::macros::log_error;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;

/// Errors reported when fetching the result of a submitted task.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The submission was rejected: the queue stayed at capacity for the whole
    /// backpressure timeout, or the pool wasn't running. The task was never
    /// enqueued nor executed.
    #[error("the submission was rejected by the pool")]
    Rejected,
    /// The result was already moved out by a previous fetch on this handle.
    #[error("the result was already consumed")]
    AlreadyConsumed,
    /// The result was retrieved with a type other than the one the task
    /// produced.
    #[error("the result has a different type than requested")]
    WrongType,
    /// The task's operation panicked while executing.
    #[error("the task panicked during execution")]
    Panicked,
}

/// A type-erased value produced by a [`Task`].
///
/// A `TaskOutput` holds exactly one value of a caller-chosen type; retrieval
/// must name that same type. It is move-only: retrieving the value consumes
/// the wrapper, so a result cannot be accidentally duplicated.
pub struct TaskOutput {
    value: Box<dyn Any + Send>,
}

impl TaskOutput {
    /// Wraps the given value.
    pub fn new<T: Send + 'static>(value: T) -> Self {
        Self {
            value: Box::new(value),
        }
    }

    /// Moves the wrapped value out, typed as `T`.
    ///
    /// Fails with [`TaskError::WrongType`] if `T` isn't the type the output
    /// was constructed with.
    pub fn downcast<T: Send + 'static>(self) -> Result<T, TaskError> {
        self.value
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| TaskError::WrongType)
    }
}

impl fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskOutput(..)")
    }
}

/// State of the single result slot shared between a task and its handle.
enum Slot {
    /// No result was published yet.
    Empty,
    /// The result is available and wasn't fetched yet.
    Ready(TaskOutput),
    /// The task panicked instead of producing a result.
    Panicked,
    /// The result was moved out by a fetch.
    Taken,
}

/// Shared state between a [`Task`] (the publisher) and its [`TaskHandle`]
/// (the consumer). Exactly one publish ever pairs with one meaningful fetch.
pub(crate) struct HandleInner {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl HandleInner {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
            ready: Condvar::new(),
        }
    }

    fn publish(&self, slot: Slot) {
        let mut guard = self.slot.lock().unwrap();
        debug_assert!(matches!(*guard, Slot::Empty));
        *guard = slot;
        self.ready.notify_one();
    }
}

/// An opaque unit of work: a zero-argument operation producing one
/// [`TaskOutput`], paired with an optional back-reference to the handle it
/// must publish into when executed.
pub struct Task {
    op: Box<dyn FnOnce() -> TaskOutput + Send>,
    target: Option<Arc<HandleInner>>,
}

impl Task {
    /// Wraps a closure into a task, erasing its output type.
    pub fn new<T, F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Self {
            op: Box::new(move || TaskOutput::new(f())),
            target: None,
        }
    }

    /// Registers a fresh handle as this task's publish target and returns it.
    pub(crate) fn bind_handle(&mut self) -> TaskHandle {
        let inner = Arc::new(HandleInner::new());
        self.target = Some(inner.clone());
        TaskHandle { inner: Some(inner) }
    }

    /// Runs the wrapped operation and publishes its output into the
    /// registered handle, if any.
    ///
    /// A panicking operation is caught so that the worker thread survives and
    /// a blocked fetch still unblocks, observing [`TaskError::Panicked`].
    pub(crate) fn execute(self) {
        let Task { op, target } = self;
        match catch_unwind(AssertUnwindSafe(op)) {
            Ok(output) => {
                if let Some(target) = &target {
                    target.publish(Slot::Ready(output));
                }
            }
            Err(_) => {
                log_error!("A task panicked during execution");
                if let Some(target) = &target {
                    target.publish(Slot::Panicked);
                }
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("bound", &self.target.is_some())
            .finish()
    }
}

/// A single-use future for one submitted task.
///
/// A valid handle pairs exactly one publish (by the worker that executes the
/// task) with one fetch. A handle returned for a rejected submission is
/// permanently invalid and never blocks.
pub struct TaskHandle {
    inner: Option<Arc<HandleInner>>,
}

impl TaskHandle {
    /// Creates a handle for a submission that was never accepted.
    pub(crate) fn rejected() -> Self {
        Self { inner: None }
    }

    /// Returns whether the associated submission was accepted by the pool.
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Blocks until the task's output is published, then moves it out.
    ///
    /// Returns immediately with [`TaskError::Rejected`] on an invalid handle,
    /// [`TaskError::AlreadyConsumed`] if the output was fetched before, and
    /// [`TaskError::Panicked`] if the task's operation panicked.
    pub fn wait(&self) -> Result<TaskOutput, TaskError> {
        let inner = self.inner.as_ref().ok_or(TaskError::Rejected)?;
        let mut slot = inner.slot.lock().unwrap();
        while matches!(*slot, Slot::Empty) {
            slot = inner.ready.wait(slot).unwrap();
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(output) => Ok(output),
            Slot::Panicked => Err(TaskError::Panicked),
            Slot::Taken => Err(TaskError::AlreadyConsumed),
            Slot::Empty => unreachable!(),
        }
    }

    /// Blocks until the task's output is published and downcasts it to `T`.
    ///
    /// See [`wait()`](Self::wait) for the error conditions;
    /// [`TaskError::WrongType`] is added when `T` doesn't match the type the
    /// task produced.
    pub fn fetch<T: Send + 'static>(&self) -> Result<T, TaskError> {
        self.wait()?.downcast::<T>()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("valid", &self.is_valid())
            .finish()
    }
}
