use crate::pool::WorkerPool;
use crate::provider::Provider;
use crate::sync::Completion;
use crate::task::{call_and_ignore_panic, Job};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

const EXTERNAL_CONDITION_POLL: Duration = Duration::from_millis(5);

lazy_static::lazy_static! {
  static ref NEXT_TICKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
}

/// Opaque identity of a ticket created by a [`SequentialQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketHandle(u64);

impl TicketHandle {
  pub fn id(&self) -> u64 {
    self.0
  }
}

struct TicketEntry {
  job: Option<Job>,
  completion: Arc<Completion>,
  was_scheduled: bool,
}

struct Tickets {
  // created tickets that have neither completed nor been discarded
  registry: HashMap<TicketHandle, TicketEntry>,
  pending: VecDeque<TicketHandle>,
  // the running ticket on top, suspended (waiting) tickets below it
  current_ticket_stack: Vec<TicketHandle>,
  processing_thread: Option<ThreadId>,
  drain_scheduled: bool,
  stop_requested: bool,
}

/// When a (possibly nested) drain loop returns.
enum DrainUntil<'a> {
  Idle,
  TicketGone(TicketHandle),
  Condition(&'a dyn Fn() -> bool),
}

impl DrainUntil<'_> {
  fn reached(&self, tickets: &Tickets) -> bool {
    match self {
      DrainUntil::Idle => tickets.pending.is_empty(),
      DrainUntil::TicketGone(ticket) => !tickets.registry.contains_key(ticket),
      DrainUntil::Condition(_) => false,
    }
  }

  // Caller-supplied conditions may take queue locks themselves, so they are
  // only ever evaluated with the ticket lock released.
  fn reached_unlocked(&self) -> bool {
    match self {
      DrainUntil::Condition(condition) => condition(),
      _ => false,
    }
  }

  fn is_external(&self) -> bool {
    matches!(self, DrainUntil::Condition(_))
  }
}

struct QueueState {
  queue_name: Arc<String>,
  tickets: Mutex<Tickets>,
  work_available: Condvar,
  idle: Condvar,
  pool: Arc<WorkerPool>,
}

/// Owns a scheduled drain loop until a worker picks it up. If the pool drops
/// the job without running it, the queue is marked idle again.
struct PendingDrainLoop {
  state: Option<Arc<QueueState>>,
}

impl PendingDrainLoop {
  fn run(mut self) {
    if let Some(state) = self.state.take() {
      state.run_drain_loop();
    }
  }
}

impl Drop for PendingDrainLoop {
  fn drop(&mut self) {
    if let Some(state) = self.state.take() {
      warn!(queue_name = %*state.queue_name, "Drain loop was rejected or dropped by the worker pool; queue goes idle.");
      let mut tickets = state.tickets.lock();
      tickets.drain_scheduled = false;
      state.idle.notify_all();
    }
  }
}

impl QueueState {
  fn schedule_drain_loop(self: &Arc<Self>) {
    let pending = PendingDrainLoop {
      state: Some(self.clone()),
    };
    if let Err(rejected) = self.pool.push_job(Box::new(move || pending.run())) {
      drop(rejected);
    }
  }

  fn run_drain_loop(&self) {
    self.tickets.lock().processing_thread = Some(thread::current().id());
    trace!(queue_name = %*self.queue_name, "Drain loop started.");

    loop {
      self.process_tickets(DrainUntil::Idle);

      let mut tickets = self.tickets.lock();
      tickets.drain_scheduled = !(tickets.pending.is_empty() || tickets.stop_requested);
      if !tickets.drain_scheduled {
        tickets.processing_thread = None;
        self.idle.notify_all();
        break;
      }
    }

    trace!(queue_name = %*self.queue_name, "Drain loop went idle.");
  }

  fn process_tickets(&self, until: DrainUntil<'_>) {
    loop {
      if until.reached_unlocked() {
        return;
      }

      let next = {
        let mut tickets = self.tickets.lock();
        loop {
          if tickets.stop_requested || until.reached(&tickets) {
            return;
          }
          if !tickets.pending.is_empty() {
            break;
          }
          if until.is_external() {
            // Re-check the caller's condition now and then: it may flip
            // without any ticket activity.
            self.work_available.wait_for(&mut tickets, EXTERNAL_CONDITION_POLL);
            break;
          }
          self.work_available.wait(&mut tickets);
        }
        Self::start_next_ticket(&mut tickets)
      };

      let Some((ticket, job, completion)) = next else {
        continue;
      };

      if let Some(job) = job {
        if let Some(message) = call_and_ignore_panic(job) {
          warn!(queue_name = %*self.queue_name, ticket = ticket.id(), "Ticket panicked: {}", message);
        }
      }
      self.pool.process_tick();

      {
        let mut tickets = self.tickets.lock();
        tickets.current_ticket_stack.pop();
        tickets.registry.remove(&ticket);
      }
      completion.complete();
    }
  }

  fn start_next_ticket(tickets: &mut Tickets) -> Option<(TicketHandle, Option<Job>, Arc<Completion>)> {
    let ticket = tickets.pending.pop_front()?;
    let entry = tickets.registry.get_mut(&ticket)?;
    let job = entry.job.take();
    let completion = entry.completion.clone();
    tickets.current_ticket_stack.push(ticket);
    Some((ticket, job, completion))
  }

  fn is_processing_thread(tickets: &Tickets) -> bool {
    tickets.processing_thread == Some(thread::current().id())
  }
}

/// Sequential queue of tickets borrowed from a [`WorkerPool`].
///
/// Tickets run in the order they are scheduled and at most one ticket body
/// runs at a time. A ticket that waits for another ticket of the same queue
/// (with [`wait_ticket`](Self::wait_ticket)) is suspended on the stack: the
/// processing thread keeps draining scheduled tickets until the awaited one
/// has completed, then the waiting ticket continues. For tickets A, B, C, D
/// where A waits for C:
///
/// ```text
/// |---A-* |---B---| |---C---| *-A---| |---D---|
/// ```
///
/// The drain loop only occupies a pool worker while tickets are pending.
/// Nested waits grow the processing thread's stack, one drain frame per
/// suspended ticket.
pub struct SequentialQueue {
  state: Arc<QueueState>,
}

impl fmt::Debug for SequentialQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SequentialQueue")
      .field("queue_name", &self.state.queue_name)
      .field("ticket_count", &self.ticket_count())
      .finish_non_exhaustive()
  }
}

impl SequentialQueue {
  pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
    let queue_name = format!("{}-queue", pool.name());
    Self::with_name(pool, &queue_name)
  }

  /// Creates a queue borrowing threads from the process-wide pool.
  pub fn with_global_pool() -> Arc<Self> {
    Self::new(Provider::<Arc<WorkerPool>>::get())
  }

  pub fn with_name(pool: Arc<WorkerPool>, queue_name: &str) -> Arc<Self> {
    debug!(queue_name, pool_name = pool.name(), "Sequential queue created.");
    Arc::new(Self {
      state: Arc::new(QueueState {
        queue_name: Arc::new(queue_name.to_string()),
        tickets: Mutex::new(Tickets {
          registry: HashMap::new(),
          pending: VecDeque::new(),
          current_ticket_stack: Vec::new(),
          processing_thread: None,
          drain_scheduled: false,
          stop_requested: false,
        }),
        work_available: Condvar::new(),
        idle: Condvar::new(),
        pool,
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.state.queue_name
  }

  /// Returns the pool this queue borrows its processing thread from.
  pub fn thread_pool(&self) -> Arc<WorkerPool> {
    self.state.pool.clone()
  }

  /// Registers an unscheduled ticket. Returns `None` once shutdown has been
  /// requested.
  pub fn create_ticket<F>(&self, invocable: F) -> Option<TicketHandle>
  where
    F: FnOnce() + Send + 'static,
  {
    let ticket = TicketHandle(NEXT_TICKET_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed));
    let entry = TicketEntry {
      job: Some(Box::new(invocable)),
      completion: Arc::new(Completion::new()),
      was_scheduled: false,
    };

    let mut tickets = self.state.tickets.lock();
    if tickets.stop_requested {
      drop(tickets);
      trace!(queue_name = %*self.state.queue_name, "create_ticket: queue is stopping.");
      return None;
    }
    tickets.registry.insert(ticket, entry);
    Some(ticket)
  }

  /// Appends the ticket to the run queue, after every previously scheduled
  /// ticket. Unknown, already scheduled or post-shutdown tickets are ignored.
  pub fn schedule_ticket(&self, ticket: TicketHandle) {
    let start_drain_loop = {
      let mut guard = self.state.tickets.lock();
      let tickets = &mut *guard;
      if tickets.stop_requested {
        return;
      }
      let Some(entry) = tickets.registry.get_mut(&ticket) else {
        return;
      };
      if entry.was_scheduled {
        return;
      }
      entry.was_scheduled = true;
      tickets.pending.push_back(ticket);
      self.state.work_available.notify_all();

      let start = !tickets.drain_scheduled;
      tickets.drain_scheduled = true;
      start
    };

    if start_drain_loop {
      trace!(queue_name = %*self.state.queue_name, "Scheduling drain loop on the pool.");
      self.state.schedule_drain_loop();
    }
  }

  /// Removes a ticket that has not started running; its body never runs and
  /// its waiters are released. Discarding a running (or suspended) ticket
  /// waits for it instead.
  pub fn discard_ticket(&self, ticket: TicketHandle) {
    enum Discard {
      Unknown,
      Running,
      Removed(TicketEntry),
    }

    let outcome = {
      let mut guard = self.state.tickets.lock();
      let tickets = &mut *guard;
      if !tickets.registry.contains_key(&ticket) {
        Discard::Unknown
      } else if tickets.current_ticket_stack.contains(&ticket) {
        Discard::Running
      } else {
        tickets.pending.retain(|pending| *pending != ticket);
        let removed = tickets.registry.remove(&ticket);
        self.state.work_available.notify_all();
        removed.map_or(Discard::Unknown, Discard::Removed)
      }
    };

    match outcome {
      Discard::Removed(entry) => {
        trace!(queue_name = %*self.state.queue_name, ticket = ticket.id(), "Ticket discarded before running.");
        entry.completion.complete();
      }
      Discard::Running => self.wait_ticket(ticket),
      Discard::Unknown => {}
    }
  }

  /// Waits until the ticket has completed or has been discarded.
  ///
  /// From any thread but the processing thread this blocks. From the
  /// processing thread (a ticket waiting for another ticket of this queue)
  /// the drain loop is re-entered instead, until the awaited ticket is gone.
  /// A ticket waiting for itself, or for a ticket suspended below it, returns
  /// immediately.
  pub fn wait_ticket(&self, ticket: TicketHandle) {
    let (completion, recursive_wait, in_current_stack) = {
      let tickets = self.state.tickets.lock();
      let Some(entry) = tickets.registry.get(&ticket) else {
        return;
      };
      (
        entry.completion.clone(),
        QueueState::is_processing_thread(&tickets),
        tickets.current_ticket_stack.contains(&ticket),
      )
    };

    if !recursive_wait {
      completion.wait();
    } else if !in_current_stack {
      trace!(queue_name = %*self.state.queue_name, ticket = ticket.id(), "Recursive wait; re-entering drain loop.");
      self.state.process_tickets(DrainUntil::TicketGone(ticket));
    } else {
      debug!(queue_name = %*self.state.queue_name, ticket = ticket.id(), "Ticket waits for a ticket on its own stack; ignored.");
    }
  }

  /// Whether the ticket was created by this queue and has neither completed
  /// nor been discarded.
  pub fn has_ticket(&self, ticket: TicketHandle) -> bool {
    self.state.tickets.lock().registry.contains_key(&ticket)
  }

  /// Number of created tickets that have neither completed nor been discarded.
  pub fn ticket_count(&self) -> usize {
    self.state.tickets.lock().registry.len()
  }

  /// When called from the processing thread, drains scheduled tickets until
  /// `break_condition` returns `true` and returns `true`. Does nothing and
  /// returns `false` on any other thread.
  pub fn run_recursive_process_tickets_loop(&self, break_condition: impl Fn() -> bool) -> bool {
    if !self.this_thread_is_processing_thread() {
      return false;
    }
    self.state.process_tickets(DrainUntil::Condition(&break_condition));
    true
  }

  pub fn this_thread_is_processing_thread(&self) -> bool {
    QueueState::is_processing_thread(&self.state.tickets.lock())
  }

  /// Stops the queue: no ticket starts after this call, a running ticket
  /// finishes normally. Blocks until the drain loop is idle (unless called
  /// from the processing thread), then discards the tickets that never ran.
  pub fn shutdown(&self) {
    let discarded: Vec<TicketEntry> = {
      let mut guard = self.state.tickets.lock();
      if !guard.stop_requested {
        info!(
          queue_name = %*self.state.queue_name,
          tickets = guard.registry.len(),
          "Stopping sequential queue."
        );
      }
      guard.stop_requested = true;
      self.state.work_available.notify_all();

      if QueueState::is_processing_thread(&guard) {
        debug!(queue_name = %*self.state.queue_name, "Shutdown called from the processing thread; not waiting for idle.");
      } else {
        while guard.drain_scheduled {
          self.state.idle.wait(&mut guard);
        }
      }

      let tickets = &mut *guard;
      tickets.pending.clear();
      let never_started: Vec<TicketHandle> = tickets
        .registry
        .keys()
        .filter(|ticket| !tickets.current_ticket_stack.contains(ticket))
        .copied()
        .collect();
      never_started
        .iter()
        .filter_map(|ticket| tickets.registry.remove(ticket))
        .collect()
    };

    if !discarded.is_empty() {
      debug!(queue_name = %*self.state.queue_name, count = discarded.len(), "Discarded tickets that never started.");
    }
    for entry in discarded {
      entry.completion.complete();
    }
  }
}

impl Drop for SequentialQueue {
  fn drop(&mut self) {
    self.shutdown();
  }
}
