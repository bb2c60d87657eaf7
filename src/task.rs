use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// A unit of work accepted by the pool, the queues and the executors.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Whether bulk cancellation (and shutdown) may drop a submission before it
/// starts running, or has to wait for it instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperationType {
  #[default]
  Cancelable,
  NonCancelable,
}

impl OperationType {
  pub fn is_cancelable(self) -> bool {
    self == OperationType::Cancelable
  }
}

/// Runs `job`, catching a panic instead of letting it unwind into the caller.
///
/// Returns the panic message when the job panicked so the call site can log it.
pub(crate) fn call_and_ignore_panic<F: FnOnce()>(job: F) -> Option<String> {
  match panic::catch_unwind(AssertUnwindSafe(job)) {
    Ok(()) => None,
    Err(payload) => Some(panic_message(payload.as_ref())),
  }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
