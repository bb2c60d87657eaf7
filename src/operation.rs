use crate::error::RuntimeError;

use std::fmt;
use std::sync::Arc;

use tracing::debug;

/// Control surface of submitted work, implemented by each executor.
pub trait OperationControl: Send + Sync {
  /// Blocks until the work has run or has been discarded.
  fn wait(&self);

  fn is_cancelable(&self) -> bool;

  /// Prevents the work from starting if it has not started yet; otherwise
  /// waits for it to finish.
  fn cancel(&self);
}

/// Caller-facing handle to work submitted to an [`Executor`](crate::Executor).
///
/// An operation never keeps the executor, queue or pool that produced it
/// alive. Once those are gone, `wait` and `cancel` do nothing. The default
/// value is the inert operation returned for work that was not accepted.
#[derive(Clone, Default)]
pub struct Operation {
  control: Option<Arc<dyn OperationControl>>,
}

impl fmt::Debug for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Operation")
      .field("is_inert", &self.is_inert())
      .field("is_cancelable", &self.is_cancelable())
      .finish()
  }
}

impl Operation {
  pub fn new(control: Arc<dyn OperationControl>) -> Self {
    Self { control: Some(control) }
  }

  pub fn is_inert(&self) -> bool {
    self.control.is_none()
  }

  pub fn wait(&self) {
    if let Some(control) = &self.control {
      control.wait();
    }
  }

  /// Inert operations report `true`.
  pub fn is_cancelable(&self) -> bool {
    self.control.as_ref().map_or(true, |control| control.is_cancelable())
  }

  /// Requests that the work is dropped before it starts, or waits for it if
  /// it is already running.
  ///
  /// # Errors
  /// Returns `RuntimeError::NotCancelable` for work submitted as
  /// `OperationType::NonCancelable`; nothing is forwarded in that case.
  pub fn cancel(&self) -> Result<(), RuntimeError> {
    if !self.is_cancelable() {
      return Err(RuntimeError::NotCancelable);
    }
    if let Some(control) = &self.control {
      control.cancel();
    }
    Ok(())
  }
}

/// Groups several operations behind one handle.
#[derive(Debug, Clone, Default)]
pub struct CompositeOperation {
  operations: Vec<Operation>,
}

impl CompositeOperation {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, operation: Operation) {
    self.operations.push(operation);
  }

  pub fn len(&self) -> usize {
    self.operations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.operations.is_empty()
  }
}

impl OperationControl for CompositeOperation {
  fn wait(&self) {
    for operation in &self.operations {
      operation.wait();
    }
  }

  fn is_cancelable(&self) -> bool {
    self.operations.iter().all(Operation::is_cancelable)
  }

  fn cancel(&self) {
    for operation in &self.operations {
      if let Err(e) = operation.cancel() {
        debug!("CompositeOperation: skipping member: {}", e);
      }
    }
  }
}

impl From<CompositeOperation> for Operation {
  fn from(composite: CompositeOperation) -> Self {
    Operation::new(Arc::new(composite))
  }
}
