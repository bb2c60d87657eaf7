//! Small blocking primitives shared by the queue and the executors.

use parking_lot::{Condvar, Mutex};

/// One-shot, multi-waiter completion latch.
///
/// Once completed it stays completed; every current and future `wait()`
/// returns immediately.
#[derive(Debug, Default)]
pub(crate) struct Completion {
  done: Mutex<bool>,
  condition: Condvar,
}

impl Completion {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn complete(&self) {
    let mut done = self.done.lock();
    *done = true;
    self.condition.notify_all();
  }

  #[cfg(test)]
  pub(crate) fn is_complete(&self) -> bool {
    *self.done.lock()
  }

  pub(crate) fn wait(&self) {
    let mut done = self.done.lock();
    while !*done {
      self.condition.wait(&mut done);
    }
  }
}

/// A value guarded by a mutex, paired with a condition that is notified on
/// every mutation.
#[derive(Debug, Default)]
pub(crate) struct ConditionVariable<T> {
  value: Mutex<T>,
  condition: Condvar,
}

impl<T> ConditionVariable<T> {
  pub(crate) fn new(value: T) -> Self {
    Self {
      value: Mutex::new(value),
      condition: Condvar::new(),
    }
  }

  pub(crate) fn perform(&self, operation: impl FnOnce(&mut T)) {
    let mut value = self.value.lock();
    operation(&mut value);
    self.condition.notify_all();
  }

  pub(crate) fn wait_until(&self, mut matcher: impl FnMut(&T) -> bool) {
    let mut value = self.value.lock();
    while !matcher(&value) {
      self.condition.wait(&mut value);
    }
  }
}

#[cfg(test)]
impl<T: Clone> ConditionVariable<T> {
  pub(crate) fn get(&self) -> T {
    self.value.lock().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;
  use std::time::Duration;

  #[test]
  fn completion_releases_every_waiter() {
    let completion = Arc::new(Completion::new());
    let waiters: Vec<_> = (0..3)
      .map(|_| {
        let completion = completion.clone();
        thread::spawn(move || completion.wait())
      })
      .collect();

    thread::sleep(Duration::from_millis(20));
    assert!(!completion.is_complete());
    completion.complete();

    for waiter in waiters {
      waiter.join().unwrap();
    }
    assert!(completion.is_complete());
    completion.wait();
  }

  #[test]
  fn condition_variable_wakes_on_matching_value() {
    let counter = Arc::new(ConditionVariable::new(2usize));
    let waiter = {
      let counter = counter.clone();
      thread::spawn(move || counter.wait_until(|v| *v == 0))
    };

    counter.perform(|v| *v -= 1);
    assert_eq!(counter.get(), 1);
    counter.perform(|v| *v -= 1);

    waiter.join().unwrap();
    assert_eq!(counter.get(), 0);
  }
}
