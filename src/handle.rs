use crate::error::RuntimeError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::FutureExt;
use tracing::debug;

/// Result handle of a job submitted with [`WorkerPool::add_task`](crate::WorkerPool::add_task).
///
/// The handle is *unset* when the pool was already closing at submission
/// time; waiting on it then yields `RuntimeError::ResultUnavailable`.
/// It can be waited on from a plain thread with [`wait`](TaskFuture::wait)
/// or awaited from async code.
pub struct TaskFuture<R> {
  pub(crate) task_id: u64,
  pub(crate) result_receiver: Option<oneshot::Receiver<Result<R, RuntimeError>>>,
}

impl<R> fmt::Debug for TaskFuture<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskFuture")
      .field("task_id", &self.task_id)
      .field("is_valid", &self.is_valid())
      .finish()
  }
}

impl<R> TaskFuture<R> {
  pub(crate) fn unset() -> Self {
    Self {
      task_id: 0,
      result_receiver: None,
    }
  }

  /// Returns the pool-wide ID of the job, `0` for an unset handle.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Whether this handle is bound to a job that was accepted by the pool.
  pub fn is_valid(&self) -> bool {
    self.result_receiver.is_some()
  }

  /// Blocks the calling thread until the job has run, or has been dropped
  /// by a closing pool.
  ///
  /// # Errors
  /// Returns `RuntimeError::ResultUnavailable` for an unset handle.
  /// Returns `RuntimeError::TaskPanicked` if the job panicked.
  /// Returns `RuntimeError::TaskAbandoned` if the pool dropped the job without running it.
  pub fn wait(mut self) -> Result<R, RuntimeError> {
    match self.result_receiver.take() {
      Some(rx) => Self::resolve(self.task_id, futures::executor::block_on(rx)),
      None => Err(RuntimeError::ResultUnavailable),
    }
  }

  fn resolve(
    task_id: u64,
    received: Result<Result<R, RuntimeError>, oneshot::Canceled>,
  ) -> Result<R, RuntimeError> {
    match received {
      Ok(task_outcome) => task_outcome,
      Err(oneshot::Canceled) => {
        debug!(%task_id, "Result sender dropped before a value was sent; task never ran.");
        Err(RuntimeError::TaskAbandoned)
      }
    }
  }
}

impl<R> Future for TaskFuture<R> {
  type Output = Result<R, RuntimeError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let task_id = self.task_id;
    match self.result_receiver.as_mut() {
      Some(rx) => match rx.poll_unpin(cx) {
        Poll::Ready(received) => {
          self.result_receiver = None;
          Poll::Ready(Self::resolve(task_id, received))
        }
        Poll::Pending => Poll::Pending,
      },
      None => Poll::Ready(Err(RuntimeError::ResultUnavailable)),
    }
  }
}
