//! Dispatchers deliver callbacks to external listeners.

use crate::executor::Executor;
use crate::operation::Operation;
use crate::ordered_executor::OrderedExecutor;
use crate::provider::Provider;
use crate::sequential_queue::SequentialQueue;
use crate::sync::ConditionVariable;
use crate::task::{call_and_ignore_panic, OperationType};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

/// Posts invocations, in order, onto a [`SequentialQueue`].
pub struct QueueDispatcher {
  executor: OrderedExecutor,
  wait_all: bool,
}

impl fmt::Debug for QueueDispatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueDispatcher")
      .field("executor", &self.executor)
      .field("wait_all", &self.wait_all)
      .finish()
  }
}

impl QueueDispatcher {
  /// `wait_all` makes posted invocations non-cancelable, so shutdown waits
  /// for them instead of discarding them.
  pub fn new(queue: Arc<SequentialQueue>, wait_all: bool) -> Self {
    Self {
      executor: OrderedExecutor::new(queue),
      wait_all,
    }
  }

  /// Creates a dispatcher over the queue of the process-wide dispatcher.
  pub fn shared(wait_all: bool) -> Self {
    Self::new(Provider::<Arc<QueueDispatcher>>::get().queue(), wait_all)
  }

  pub fn post<F>(&self, invocation: F) -> Operation
  where
    F: FnOnce() + Send + 'static,
  {
    let operation_type = if self.wait_all {
      OperationType::NonCancelable
    } else {
      OperationType::Cancelable
    };
    self.executor.execute(Box::new(invocation), operation_type)
  }

  /// Stops accepting invocations and waits for posted ones to be discarded
  /// or finished.
  pub fn shutdown(&self) {
    self.executor.shutdown();
  }

  pub fn queue(&self) -> Arc<SequentialQueue> {
    self.executor.queue()
  }
}

#[derive(Debug, Default)]
struct DispatchState {
  invocations: usize,
  dispatching_threads: HashMap<ThreadId, usize>,
}

/// Dispatcher running every posted invocation inline on the posting thread.
#[derive(Debug)]
pub struct SynchronousDispatcher {
  is_active: AtomicBool,
  state: ConditionVariable<DispatchState>,
}

impl Default for SynchronousDispatcher {
  fn default() -> Self {
    Self::new()
  }
}

impl SynchronousDispatcher {
  pub fn new() -> Self {
    Self {
      is_active: AtomicBool::new(true),
      state: ConditionVariable::new(DispatchState::default()),
    }
  }

  pub fn post<F>(&self, invocation: F) -> Operation
  where
    F: FnOnce(),
  {
    if !self.is_active.load(AtomicOrdering::SeqCst) {
      return Operation::default();
    }

    let current = thread::current().id();
    self.state.perform(|state| {
      state.invocations += 1;
      *state.dispatching_threads.entry(current).or_insert(0) += 1;
    });

    if let Some(message) = call_and_ignore_panic(invocation) {
      warn!("Dispatched invocation panicked: {}", message);
    }

    self.state.perform(|state| {
      state.invocations -= 1;
      if let Some(depth) = state.dispatching_threads.get_mut(&current) {
        *depth -= 1;
        if *depth == 0 {
          state.dispatching_threads.remove(&current);
        }
      }
    });

    Operation::default()
  }

  /// Stops dispatching and waits for in-flight invocations, unless called
  /// from inside one of them.
  pub fn shutdown(&self) {
    self.is_active.store(false, AtomicOrdering::SeqCst);

    let current = thread::current().id();
    let mut wait_for_idle = true;
    self.state.perform(|state| {
      wait_for_idle = !state.dispatching_threads.contains_key(&current);
    });

    if wait_for_idle {
      self.state.wait_until(|state| state.invocations == 0);
    } else {
      debug!("SynchronousDispatcher shut down from a dispatching thread; not waiting.");
    }
  }
}
