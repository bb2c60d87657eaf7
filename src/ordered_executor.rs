use crate::executor::Executor;
use crate::operation::{Operation, OperationControl};
use crate::provider::Provider;
use crate::schedule::DelayTable;
use crate::sequential_queue::{SequentialQueue, TicketHandle};
use crate::signal::Subscription;
use crate::task::{call_and_ignore_panic, Job, OperationType};

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy)]
struct TrackedTicket {
  ticket: TicketHandle,
  wait_on_cleanup: bool,
}

struct OrderedState {
  tickets: Vec<TrackedTicket>,
  delay_table: DelayTable,
  closing: bool,
  tick_subscription: Option<Subscription>,
}

struct OrderedInner {
  queue: Arc<SequentialQueue>,
  sync: Mutex<OrderedState>,
}

struct QueueOperation {
  queue: Weak<SequentialQueue>,
  ticket: TicketHandle,
  operation_type: OperationType,
}

impl OperationControl for QueueOperation {
  fn wait(&self) {
    if let Some(queue) = self.queue.upgrade() {
      queue.wait_ticket(self.ticket);
    }
  }

  fn is_cancelable(&self) -> bool {
    self.operation_type.is_cancelable()
  }

  fn cancel(&self) {
    if let Some(queue) = self.queue.upgrade() {
      queue.discard_ticket(self.ticket);
    }
  }
}

impl OrderedInner {
  fn execute(self: &Arc<Self>, job: Job, operation_type: OperationType) -> Operation {
    if self.sync.lock().closing {
      trace!(queue_name = self.queue.name(), "execute: executor is shut down; dropping job.");
      return Operation::default();
    }

    // The ticket body untracks itself once it has run; it learns its own
    // handle through this slot.
    let this_ticket: Arc<OnceLock<TicketHandle>> = Arc::new(OnceLock::new());
    let weak_inner = Arc::downgrade(self);
    let ticket_slot = this_ticket.clone();
    let queue_name = self.queue.name().to_string();
    let created = self.queue.create_ticket(move || {
      if let Some(message) = call_and_ignore_panic(job) {
        warn!(queue_name = %queue_name, "Job panicked: {}", message);
      }
      if let (Some(inner), Some(ticket)) = (weak_inner.upgrade(), ticket_slot.get()) {
        inner.sync.lock().tickets.retain(|tracked| tracked.ticket != *ticket);
      }
    });
    let Some(ticket) = created else {
      return Operation::default();
    };
    let _ = this_ticket.set(ticket);

    let posted = {
      let mut state = self.sync.lock();
      if state.closing {
        false
      } else {
        // Tickets cancelled one at a time are only forgotten here.
        let queue = &self.queue;
        state.tickets.retain(|tracked| queue.has_ticket(tracked.ticket));
        state.tickets.push(TrackedTicket {
          ticket,
          wait_on_cleanup: !operation_type.is_cancelable(),
        });
        self.queue.schedule_ticket(ticket);
        true
      }
    };

    if !posted {
      self.queue.discard_ticket(ticket);
    }

    Operation::new(Arc::new(QueueOperation {
      queue: Arc::downgrade(&self.queue),
      ticket,
      operation_type,
    }))
  }

  fn schedule(self: &Arc<Self>, time_point: Instant, job: Job, operation_type: OperationType) {
    let mut state = self.sync.lock();
    if state.closing {
      trace!(queue_name = self.queue.name(), "schedule: executor is shut down; dropping job.");
      return;
    }
    state.delay_table.add_task(time_point, job, operation_type);

    if state.tick_subscription.is_none() {
      let weak_inner = Arc::downgrade(self);
      state.tick_subscription = Some(self.queue.thread_pool().subscribe_for_tick(move || {
        if let Some(inner) = weak_inner.upgrade() {
          inner.execute_due_tasks();
        }
      }));
      debug!(queue_name = self.queue.name(), "Subscribed to pool ticks for delayed tasks.");
    }
  }

  fn execute_due_tasks(self: &Arc<Self>) {
    let due = self.sync.lock().delay_table.filter_and_erase_tasks(Instant::now());
    if !due.is_empty() {
      trace!(queue_name = self.queue.name(), count = due.len(), "Promoting due delayed tasks.");
    }
    for (job, operation_type) in due {
      self.execute(job, operation_type);
    }
  }

  /// Settles every tracked ticket, looping until no new tickets show up.
  ///
  /// Called from a ticket of the same queue, waiting for that ticket (or an
  /// ancestor suspended below it) is a no-op; `closed` keeps such tickets
  /// from being visited again.
  fn clear(&self, policy: OperationType) {
    let mut closed: HashSet<TicketHandle> = HashSet::new();

    loop {
      let mut tickets: Vec<TrackedTicket> = {
        let mut state = self.sync.lock();
        state.tickets.retain(|tracked| self.queue.has_ticket(tracked.ticket));
        state.tickets.clone()
      };
      tickets.retain(|tracked| !closed.contains(&tracked.ticket));
      if tickets.is_empty() {
        break;
      }

      // Reverse order, so that a ticket is not started just because its
      // predecessors were discarded.
      for tracked in tickets.iter().rev() {
        if !tracked.wait_on_cleanup && policy.is_cancelable() {
          self.queue.discard_ticket(tracked.ticket);
          closed.insert(tracked.ticket);
        }
      }

      for tracked in &tickets {
        if tracked.wait_on_cleanup || !policy.is_cancelable() {
          self.queue.wait_ticket(tracked.ticket);
          closed.insert(tracked.ticket);
        }
      }
    }
  }
}

/// Executor preserving submission order: every job becomes a ticket of one
/// [`SequentialQueue`].
///
/// Several executors may share a queue; each one only manages (waits for,
/// cancels) its own submissions.
pub struct OrderedExecutor {
  inner: Arc<OrderedInner>,
}

impl fmt::Debug for OrderedExecutor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OrderedExecutor")
      .field("queue", &self.inner.queue)
      .field("tracked_count", &self.tracked_count())
      .finish()
  }
}

impl OrderedExecutor {
  pub fn new(queue: Arc<SequentialQueue>) -> Self {
    Self {
      inner: Arc::new(OrderedInner {
        queue,
        sync: Mutex::new(OrderedState {
          tickets: Vec::new(),
          delay_table: DelayTable::new(),
          closing: false,
          tick_subscription: None,
        }),
      }),
    }
  }

  /// Creates an executor over the queue of the process-wide ordered executor.
  pub fn shared() -> Self {
    Self::new(Provider::<Arc<OrderedExecutor>>::get().queue())
  }

  pub fn queue(&self) -> Arc<SequentialQueue> {
    self.inner.queue.clone()
  }

  /// Number of submissions that have not completed yet.
  pub fn tracked_count(&self) -> usize {
    let mut state = self.inner.sync.lock();
    let queue = &self.inner.queue;
    state.tickets.retain(|tracked| queue.has_ticket(tracked.ticket));
    state.tickets.len()
  }

  /// Number of delayed jobs that are not due yet.
  pub fn scheduled_count(&self) -> usize {
    self.inner.sync.lock().delay_table.len()
  }
}

impl Executor for OrderedExecutor {
  fn execute(&self, job: Job, operation_type: OperationType) -> Operation {
    self.inner.execute(job, operation_type)
  }

  fn schedule(&self, time_point: Instant, job: Job, operation_type: OperationType) {
    self.inner.schedule(time_point, job, operation_type);
  }

  fn wait_all(&self) {
    self.inner.clear(OperationType::NonCancelable);
  }

  fn cancel_all(&self) {
    self.inner.clear(OperationType::Cancelable);
  }

  /// Stops accepting work and delayed-task promotion, discards cancelable
  /// jobs that have not started and waits for the others.
  fn shutdown(&self) {
    let subscription = {
      let mut state = self.inner.sync.lock();
      if !state.closing {
        info!(queue_name = self.inner.queue.name(), "Shutting down ordered executor.");
      }
      state.closing = true;
      state.tick_subscription.take()
    };
    drop(subscription);

    self.inner.clear(OperationType::Cancelable);
  }
}

impl Drop for OrderedExecutor {
  fn drop(&mut self) {
    self.shutdown();
  }
}
