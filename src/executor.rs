use crate::operation::Operation;
use crate::task::{Job, OperationType};

use std::time::Instant;

/// Submits work for execution and manages it in bulk.
pub trait Executor: Send + Sync {
  /// Requests execution of `job`.
  ///
  /// After `shutdown` the job is dropped and an inert operation is returned.
  fn execute(&self, job: Job, operation_type: OperationType) -> Operation;

  /// Runs `job` through `execute` once `time_point` has passed. Due work is
  /// picked up on the backing pool's ticks, so it never runs early but may
  /// run up to about one tick interval late.
  fn schedule(&self, time_point: Instant, job: Job, operation_type: OperationType);

  /// Blocks until every submitted job has run, including jobs submitted
  /// while waiting.
  fn wait_all(&self);

  /// Discards cancelable jobs that have not started and waits for the rest,
  /// including jobs submitted while cancelling.
  fn cancel_all(&self);

  /// Stops accepting work and settles what was submitted.
  fn shutdown(&self);

  fn spawn<F>(&self, function: F) -> Operation
  where
    F: FnOnce() + Send + 'static,
    Self: Sized,
  {
    self.execute(Box::new(function), OperationType::Cancelable)
  }
}
