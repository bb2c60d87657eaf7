use crate::task::call_and_ignore_panic;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{error, trace};

type TickHandler = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct HandlerSlots {
  next_id: u64,
  handlers: Vec<(u64, TickHandler)>,
}

/// Synchronous broadcaster used for pool ticks.
///
/// Handlers run on the emitting thread, in connection order. A snapshot of
/// the handler list is taken before dispatch, so a handler may connect or
/// disconnect handlers (including itself) while it runs.
pub struct TickSignal {
  slots: Arc<RwLock<HandlerSlots>>,
  owner_name: Arc<String>,
}

impl fmt::Debug for TickSignal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.slots.try_read().map_or(0, |guard| guard.handlers.len());
    f.debug_struct("TickSignal")
      .field("owner_name", &self.owner_name)
      .field("handler_count", &handler_count)
      .finish()
  }
}

impl TickSignal {
  pub(crate) fn new(owner_name: Arc<String>) -> Self {
    Self {
      slots: Arc::new(RwLock::new(HandlerSlots::default())),
      owner_name,
    }
  }

  pub fn connect(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
    let mut slots = self.slots.write();
    let id = slots.next_id;
    slots.next_id += 1;
    slots.handlers.push((id, Arc::new(handler)));
    trace!(owner = %*self.owner_name, handler_id = id, "Tick handler connected. Total handlers: {}", slots.handlers.len());

    Subscription {
      slot: Some((id, Arc::downgrade(&self.slots))),
    }
  }

  pub fn handler_count(&self) -> usize {
    self.slots.read().handlers.len()
  }

  pub fn emit(&self) {
    let snapshot: Vec<TickHandler> = {
      let slots = self.slots.read();
      if slots.handlers.is_empty() {
        return;
      }
      slots.handlers.iter().map(|(_, handler)| handler.clone()).collect()
    };

    for handler in snapshot {
      if let Some(message) = call_and_ignore_panic(|| handler()) {
        error!(owner = %*self.owner_name, "A tick handler panicked: {}", message);
      }
    }
  }
}

/// Connection of a handler to a [`TickSignal`].
///
/// The handler stays connected until the subscription is dropped or
/// [`unsubscribe`](Subscription::unsubscribe) is called. The default value is
/// an empty subscription.
#[derive(Default)]
pub struct Subscription {
  slot: Option<(u64, Weak<RwLock<HandlerSlots>>)>,
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("handler_id", &self.slot.as_ref().map(|(id, _)| *id))
      .finish()
  }
}

impl Subscription {
  pub fn is_connected(&self) -> bool {
    match &self.slot {
      Some((id, weak_slots)) => weak_slots
        .upgrade()
        .is_some_and(|slots| slots.read().handlers.iter().any(|(handler_id, _)| handler_id == id)),
      None => false,
    }
  }

  pub fn unsubscribe(&mut self) {
    if let Some((id, weak_slots)) = self.slot.take() {
      if let Some(slots) = weak_slots.upgrade() {
        // The removed handler is dropped after the lock is released.
        let removed = {
          let mut slots = slots.write();
          slots
            .handlers
            .iter()
            .position(|(handler_id, _)| *handler_id == id)
            .map(|index| slots.handlers.remove(index))
        };
        drop(removed);
      }
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn signal() -> TickSignal {
    TickSignal::new(Arc::new("test".to_string()))
  }

  #[test]
  fn handlers_run_until_unsubscribed() {
    let signal = signal();
    let hits = Arc::new(AtomicUsize::new(0));

    let mut subscription = {
      let hits = hits.clone();
      signal.connect(move || {
        hits.fetch_add(1, Ordering::SeqCst);
      })
    };
    assert!(subscription.is_connected());

    signal.emit();
    signal.emit();
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    subscription.unsubscribe();
    assert!(!subscription.is_connected());
    signal.emit();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(signal.handler_count(), 0);
  }

  #[test]
  fn dropping_subscription_disconnects() {
    let signal = signal();
    let hits = Arc::new(AtomicUsize::new(0));
    {
      let hits = hits.clone();
      let _subscription = signal.connect(move || {
        hits.fetch_add(1, Ordering::SeqCst);
      });
      signal.emit();
    }
    signal.emit();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn panicking_handler_does_not_stop_others() {
    let signal = signal();
    let hits = Arc::new(AtomicUsize::new(0));
    let _bad = signal.connect(|| panic!("handler failure"));
    let _good = {
      let hits = hits.clone();
      signal.connect(move || {
        hits.fetch_add(1, Ordering::SeqCst);
      })
    };

    signal.emit();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn subscription_outliving_signal_is_inert() {
    let subscription = {
      let signal = signal();
      signal.connect(|| {})
    };
    assert!(!subscription.is_connected());
    assert!(!Subscription::default().is_connected());
  }
}
