use crate::executor::Executor;
use crate::operation::{Operation, OperationControl};
use crate::pool::WorkerPool;
use crate::provider::Provider;
use crate::schedule::DelayTable;
use crate::signal::Subscription;
use crate::sync::{Completion, ConditionVariable};
use crate::task::{call_and_ignore_panic, Job, OperationType};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_OPERATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
}

/// What an [`UnorderedExecutor`] does with outstanding work when it shuts
/// down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
  /// Discards cancelable work that has not started and waits for the rest.
  #[default]
  CancelAll,
  /// Waits for all submitted work, including work submitted while waiting.
  WaitAll,
  /// Returns immediately; submitted work keeps running on the pool.
  KeepRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkState {
  Idle,
  Running(ThreadId),
  Canceled,
}

struct TrackedOperation {
  id: u64,
  operation_type: OperationType,
  state: Mutex<WorkState>,
  completion: Completion,
}

impl OperationControl for TrackedOperation {
  fn wait(&self) {
    if *self.state.lock() == WorkState::Running(thread::current().id()) {
      debug!(operation_id = self.id, "Operation waits for itself; ignored.");
      return;
    }
    self.completion.wait();
  }

  fn is_cancelable(&self) -> bool {
    self.operation_type.is_cancelable()
  }

  fn cancel(&self) {
    if !self.cancel_if_idle() {
      self.wait();
    }
  }
}

impl TrackedOperation {
  /// Moves a cancelable operation from Idle to Canceled. Returns `false` if a
  /// worker already claimed it.
  fn cancel_if_idle(&self) -> bool {
    if !self.is_cancelable() {
      return false;
    }

    let canceled = {
      let mut state = self.state.lock();
      if *state == WorkState::Idle {
        *state = WorkState::Canceled;
        true
      } else {
        false
      }
    };

    if canceled {
      trace!(operation_id = self.id, "Operation canceled before it started.");
      self.completion.complete();
    }
    canceled
  }
}

/// A submitted job as it travels through the pool queue. Dropping it, run
/// or not, releases the waiters of its operation.
struct TrackedRun {
  operation: Arc<TrackedOperation>,
  inner: Weak<UnorderedInner>,
  job: Option<Job>,
}

impl TrackedRun {
  fn run(mut self) {
    let claimed = {
      let mut state = self.operation.state.lock();
      if *state == WorkState::Canceled {
        false
      } else {
        *state = WorkState::Running(thread::current().id());
        true
      }
    };

    if !claimed {
      return;
    }
    if let Some(job) = self.job.take() {
      if let Some(message) = call_and_ignore_panic(job) {
        warn!(operation_id = self.operation.id, "Job panicked: {}", message);
      }
    }
  }
}

impl Drop for TrackedRun {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      inner.operations.remove(&self.operation.id);
    }
    self.operation.completion.complete();
  }
}

struct UnorderedState {
  delay_table: DelayTable,
  is_shutdown: bool,
  tick_subscription: Option<Subscription>,
}

struct UnorderedInner {
  pool: Arc<WorkerPool>,
  operations: DashMap<u64, Arc<TrackedOperation>>,
  sync: Mutex<UnorderedState>,
  waiting: ConditionVariable<usize>,
}

impl UnorderedInner {
  fn execute(self: &Arc<Self>, job: Job, operation_type: OperationType) -> Operation {
    let state = self.sync.lock();
    if state.is_shutdown {
      trace!(pool_name = self.pool.name(), "execute: executor is shut down; dropping job.");
      return Operation::default();
    }

    let operation = Arc::new(TrackedOperation {
      id: NEXT_OPERATION_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
      operation_type,
      state: Mutex::new(WorkState::Idle),
      completion: Completion::new(),
    });
    self.operations.insert(operation.id, operation.clone());

    let run = TrackedRun {
      operation: operation.clone(),
      inner: Arc::downgrade(self),
      job: Some(job),
    };
    match self.pool.push_job(Box::new(move || run.run())) {
      Ok(()) => Operation::new(operation),
      Err(rejected) => {
        drop(state);
        debug!(pool_name = self.pool.name(), operation_id = operation.id, "execute: pool is closed; job dropped.");
        drop(rejected);
        Operation::default()
      }
    }
  }

  fn schedule(self: &Arc<Self>, time_point: Instant, job: Job, operation_type: OperationType) {
    let mut state = self.sync.lock();
    if state.is_shutdown {
      trace!(pool_name = self.pool.name(), "schedule: executor is shut down; dropping job.");
      return;
    }
    state.delay_table.add_task(time_point, job, operation_type);

    if state.tick_subscription.is_none() {
      let weak_inner = Arc::downgrade(self);
      state.tick_subscription = Some(self.pool.subscribe_for_tick(move || {
        if let Some(inner) = weak_inner.upgrade() {
          inner.execute_due_tasks();
        }
      }));
      debug!(pool_name = self.pool.name(), "Subscribed to pool ticks for delayed tasks.");
    }
  }

  fn execute_due_tasks(self: &Arc<Self>) {
    let due = self.sync.lock().delay_table.filter_and_erase_tasks(Instant::now());
    if !due.is_empty() {
      trace!(pool_name = self.pool.name(), count = due.len(), "Promoting due delayed tasks.");
    }
    for (job, operation_type) in due {
      self.execute(job, operation_type);
    }
  }

  /// Removes every tracked operation, oldest first.
  fn take_operations(&self) -> Vec<Arc<TrackedOperation>> {
    let ids: Vec<u64> = self.operations.iter().map(|entry| *entry.key()).collect();
    let mut operations: Vec<Arc<TrackedOperation>> = ids
      .into_iter()
      .filter_map(|id| self.operations.remove(&id).map(|(_, operation)| operation))
      .collect();
    operations.sort_by_key(|operation| operation.id);
    operations
  }

  fn settle_all(&self, cancel: bool) {
    self.waiting.perform(|waiters| *waiters += 1);

    let mut operations = self.take_operations();
    while !operations.is_empty() {
      // Every idle operation is canceled before waiting on any of them.
      if cancel {
        for operation in &operations {
          operation.cancel_if_idle();
        }
      }
      for operation in &operations {
        operation.wait();
      }
      // Settled work may have submitted more work.
      operations = self.take_operations();
    }

    self.waiting.perform(|waiters| *waiters -= 1);
    self.waiting.wait_until(|waiters| *waiters == 0);
  }
}

/// Executor submitting every job straight to a [`WorkerPool`], without any
/// ordering between submissions.
///
/// Each submission carries an *Idle → Running → done* / *Idle → Canceled*
/// state. Cancelling succeeds only while the job is still idle; once a
/// worker has claimed it, cancelling waits for it to finish.
pub struct UnorderedExecutor {
  inner: Arc<UnorderedInner>,
  shutdown_policy: ShutdownPolicy,
}

impl fmt::Debug for UnorderedExecutor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UnorderedExecutor")
      .field("pool", &self.inner.pool)
      .field("tracked_count", &self.tracked_count())
      .field("shutdown_policy", &self.shutdown_policy)
      .finish()
  }
}

impl UnorderedExecutor {
  pub fn new(pool: Arc<WorkerPool>, shutdown_policy: ShutdownPolicy) -> Self {
    Self {
      inner: Arc::new(UnorderedInner {
        pool,
        operations: DashMap::new(),
        sync: Mutex::new(UnorderedState {
          delay_table: DelayTable::new(),
          is_shutdown: false,
          tick_subscription: None,
        }),
        waiting: ConditionVariable::new(0),
      }),
      shutdown_policy,
    }
  }

  /// Creates an executor over the process-wide pool.
  pub fn with_global_pool(shutdown_policy: ShutdownPolicy) -> Self {
    Self::new(Provider::<Arc<WorkerPool>>::get(), shutdown_policy)
  }

  pub fn thread_pool(&self) -> Arc<WorkerPool> {
    self.inner.pool.clone()
  }

  pub fn shutdown_policy(&self) -> ShutdownPolicy {
    self.shutdown_policy
  }

  /// Number of submissions that have not been settled yet.
  pub fn tracked_count(&self) -> usize {
    self.inner.operations.len()
  }

  /// Number of delayed jobs that are not due yet.
  pub fn scheduled_count(&self) -> usize {
    self.inner.sync.lock().delay_table.len()
  }

  /// Stops accepting work and delayed-task promotion, then applies `policy`.
  /// Work submitted while `WaitAll` is waiting is rejected like any other
  /// post-shutdown submission.
  pub fn shutdown_with(&self, policy: ShutdownPolicy) {
    let subscription = {
      let mut state = self.inner.sync.lock();
      if !state.is_shutdown {
        info!(pool_name = self.inner.pool.name(), ?policy, "Shutting down unordered executor.");
      }
      state.is_shutdown = true;
      state.tick_subscription.take()
    };
    drop(subscription);

    match policy {
      ShutdownPolicy::CancelAll => self.inner.settle_all(true),
      ShutdownPolicy::WaitAll => self.inner.settle_all(false),
      ShutdownPolicy::KeepRunning => {
        trace!(pool_name = self.inner.pool.name(), "KeepRunning: leaving submitted work to the pool.");
      }
    }
  }
}

impl Executor for UnorderedExecutor {
  fn execute(&self, job: Job, operation_type: OperationType) -> Operation {
    self.inner.execute(job, operation_type)
  }

  fn schedule(&self, time_point: Instant, job: Job, operation_type: OperationType) {
    self.inner.schedule(time_point, job, operation_type);
  }

  fn wait_all(&self) {
    self.inner.settle_all(false);
  }

  fn cancel_all(&self) {
    self.inner.settle_all(true);
  }

  /// Shuts down with the policy given at construction.
  fn shutdown(&self) {
    self.shutdown_with(self.shutdown_policy);
  }
}

impl Drop for UnorderedExecutor {
  fn drop(&mut self) {
    self.shutdown_with(self.shutdown_policy);
  }
}
