use thiserror::Error;

/// Errors surfaced by the `bridge_runtime` primitives.
///
/// Failures raised by submitted work are never reported through this type by
/// the executors; they are caught and logged at the point of invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
  #[error("This operation is not cancelable")]
  NotCancelable,

  #[error("Task result unavailable (the pool was closing at submission, or the result was already taken)")]
  ResultUnavailable,

  #[error("Submitted task panicked")]
  TaskPanicked,

  #[error("Task was dropped before it ran (pool closed without finishing queued tasks)")]
  TaskAbandoned,
}
