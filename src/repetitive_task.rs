use crate::executor::Executor;
use crate::operation::Operation;
use crate::task::OperationType;

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::trace;

/// Work that resubmits itself to its executor after every run.
///
/// Each run calls the invocable and then executes a fresh copy of the task
/// as `OperationType::Cancelable`. The chain ends once the executor rejects
/// the resubmission (after `shutdown`), once the executor has been dropped,
/// or when a run panics. Executors that run jobs inline recurse on every
/// run, and `wait_all` on the executor does not return while the chain is
/// alive.
pub struct RepetitiveTask<E: Executor + ?Sized + 'static> {
  executor: Weak<E>,
  invocable: Arc<dyn Fn() + Send + Sync>,
}

impl<E: Executor + ?Sized + 'static> Clone for RepetitiveTask<E> {
  fn clone(&self) -> Self {
    Self {
      executor: self.executor.clone(),
      invocable: self.invocable.clone(),
    }
  }
}

impl<E: Executor + ?Sized + 'static> fmt::Debug for RepetitiveTask<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RepetitiveTask")
      .field("executor_alive", &(self.executor.strong_count() > 0))
      .finish_non_exhaustive()
  }
}

impl<E: Executor + ?Sized + 'static> RepetitiveTask<E> {
  /// The task does not keep `executor` alive.
  pub fn new<F>(executor: &Arc<E>, invocable: F) -> Self
  where
    F: Fn() + Send + Sync + 'static,
  {
    Self {
      executor: Arc::downgrade(executor),
      invocable: Arc::new(invocable),
    }
  }

  /// Submits the first run. Returns the operation of that run only; an
  /// inert operation if the executor is gone or no longer accepts work.
  pub fn start(self) -> Operation {
    match self.executor.upgrade() {
      Some(executor) => executor.execute(Box::new(move || self.run()), OperationType::Cancelable),
      None => Operation::default(),
    }
  }

  fn run(self) {
    (self.invocable)();
    if self.start().is_inert() {
      trace!("Repetitive task stopped: executor no longer accepts work.");
    }
  }
}
