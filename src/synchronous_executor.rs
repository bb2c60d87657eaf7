use crate::executor::Executor;
use crate::operation::Operation;
use crate::pool::WorkerPool;
use crate::sync::ConditionVariable;
use crate::task::{call_and_ignore_panic, Job, OperationType};
use crate::unordered_executor::{ShutdownPolicy, UnorderedExecutor};

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

#[derive(Debug)]
struct InlineState {
  is_active: bool,
  invocations: usize,
}

/// Executor running `execute` inline on the calling thread.
///
/// Delayed work still needs pool ticks, so `schedule` is delegated to an
/// internal [`UnorderedExecutor`].
pub struct SynchronousExecutor {
  inline_state: ConditionVariable<InlineState>,
  delayed: UnorderedExecutor,
}

impl SynchronousExecutor {
  pub fn new(pool: Arc<WorkerPool>) -> Self {
    Self {
      inline_state: ConditionVariable::new(InlineState {
        is_active: true,
        invocations: 0,
      }),
      delayed: UnorderedExecutor::new(pool, ShutdownPolicy::CancelAll),
    }
  }

  pub fn with_global_pool() -> Self {
    Self {
      inline_state: ConditionVariable::new(InlineState {
        is_active: true,
        invocations: 0,
      }),
      delayed: UnorderedExecutor::with_global_pool(ShutdownPolicy::CancelAll),
    }
  }
}

impl Executor for SynchronousExecutor {
  /// Runs the job before returning and hands back the inert operation.
  fn execute(&self, job: Job, _operation_type: OperationType) -> Operation {
    let mut perform = false;
    self.inline_state.perform(|state| {
      perform = state.is_active;
      if perform {
        state.invocations += 1;
      }
    });

    if perform {
      if let Some(message) = call_and_ignore_panic(job) {
        warn!("Inline job panicked: {}", message);
      }
      self.inline_state.perform(|state| state.invocations -= 1);
    }

    Operation::default()
  }

  fn schedule(&self, time_point: Instant, job: Job, operation_type: OperationType) {
    self.delayed.schedule(time_point, job, operation_type);
  }

  fn wait_all(&self) {
    self.inline_state.wait_until(|state| state.invocations == 0);
  }

  fn cancel_all(&self) {
    self.wait_all();
  }

  fn shutdown(&self) {
    self.inline_state.perform(|state| state.is_active = false);
    self.delayed.shutdown();
    self.wait_all();
  }
}
