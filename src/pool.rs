use crate::error::RuntimeError;
use crate::handle::TaskFuture;
use crate::signal::{Subscription, TickSignal};
use crate::sync::Completion;
use crate::task::{call_and_ignore_panic, panic_message, Job};

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, info_span, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
}

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const MIN_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Construction parameters of a [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
  /// Number of worker threads, clamped to at least 1.
  pub workers: usize,
  /// When set, workers keep draining queued jobs after `shutdown()` until the
  /// queue is empty. Otherwise queued jobs are abandoned.
  pub finish_tasks_on_close: bool,
  /// Pool name, also the prefix of the worker thread names.
  pub name: String,
  /// Minimum time between two tick broadcasts.
  pub tick_interval: Duration,
}

impl Default for WorkerPoolConfig {
  fn default() -> Self {
    Self {
      workers: 4,
      finish_tasks_on_close: false,
      name: "global-tp".to_string(),
      tick_interval: DEFAULT_TICK_INTERVAL,
    }
  }
}

impl WorkerPoolConfig {
  pub fn new(workers: usize, name: &str) -> Self {
    Self {
      workers,
      name: name.to_string(),
      ..Self::default()
    }
  }

  pub fn finish_tasks_on_close(mut self, finish: bool) -> Self {
    self.finish_tasks_on_close = finish;
    self
  }

  pub fn tick_interval(mut self, interval: Duration) -> Self {
    self.tick_interval = interval;
    self
  }
}

struct PoolState {
  jobs: VecDeque<Job>,
  closing: bool,
}

struct PoolShared {
  pool_name: Arc<String>,
  state: Mutex<PoolState>,
  jobs_available: Condvar,
  finish_tasks_on_close: bool,
  tick_interval_nanos: AtomicU64,
  last_tick: Mutex<Instant>,
  tick_signal: TickSignal,
}

impl PoolShared {
  fn tick_interval(&self) -> Duration {
    Duration::from_nanos(self.tick_interval_nanos.load(AtomicOrdering::Relaxed))
  }

  fn process_tick(&self) {
    let tick_once = {
      let mut last_tick = self.last_tick.lock();
      let now = Instant::now();
      let due = last_tick.checked_add(self.tick_interval());
      if due.is_some_and(|due| due < now) {
        *last_tick = now;
        true
      } else {
        false
      }
    };

    if tick_once {
      trace!(pool_name = %*self.pool_name, "Emitting tick.");
      self.tick_signal.emit();
    }
  }

  fn should_stop(&self, state: &PoolState) -> bool {
    state.closing && (state.jobs.is_empty() || !self.finish_tasks_on_close)
  }
}

/// Fixed set of worker threads draining one shared FIFO of jobs.
///
/// Every other primitive of the crate borrows its threads from a pool. After
/// each job (and whenever an idle worker wakes up, at least once per tick
/// interval) a worker calls `process_tick`, which broadcasts a tick to the
/// subscribers at most once per interval.
pub struct WorkerPool {
  shared: Arc<PoolShared>,
  workers: Mutex<Vec<JoinHandle<()>>>,
  worker_ids: Vec<ThreadId>,
  worker_count: usize,
  join_started: AtomicBool,
  workers_joined: Completion,
}

impl fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("pool_name", &self.shared.pool_name)
      .field("worker_count", &self.worker_count)
      .field("queued_task_count", &self.queued_task_count())
      .field("is_closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl WorkerPool {
  pub fn new(workers: usize, finish_tasks_on_close: bool, pool_name: &str) -> Arc<Self> {
    Self::with_config(WorkerPoolConfig::new(workers, pool_name).finish_tasks_on_close(finish_tasks_on_close))
  }

  pub fn with_config(config: WorkerPoolConfig) -> Arc<Self> {
    let pool_name = Arc::new(config.name);
    let shared = Arc::new(PoolShared {
      pool_name: pool_name.clone(),
      state: Mutex::new(PoolState {
        jobs: VecDeque::new(),
        closing: false,
      }),
      jobs_available: Condvar::new(),
      finish_tasks_on_close: config.finish_tasks_on_close,
      tick_interval_nanos: AtomicU64::new(duration_to_nanos(config.tick_interval)),
      last_tick: Mutex::new(Instant::now()),
      tick_signal: TickSignal::new(pool_name.clone()),
    });

    let requested = config.workers.max(1);
    let mut handles = Vec::with_capacity(requested);
    for index in 1..=requested {
      let mut builder = thread::Builder::new();
      if !pool_name.is_empty() {
        builder = builder.name(format!("{}-{}", pool_name, index));
      }
      let worker_shared = shared.clone();
      match builder.spawn(move || Self::run_worker_loop(worker_shared, index)) {
        Ok(handle) => handles.push(handle),
        Err(spawn_error) => {
          error!(pool_name = %*pool_name, index, "Failed to spawn worker thread: {}", spawn_error);
        }
      }
    }

    info!(
      pool_name = %*pool_name,
      workers = handles.len(),
      finish_tasks_on_close = config.finish_tasks_on_close,
      "Worker pool started."
    );

    Arc::new(Self {
      shared,
      worker_ids: handles.iter().map(|handle| handle.thread().id()).collect(),
      worker_count: handles.len(),
      workers: Mutex::new(handles),
      join_started: AtomicBool::new(false),
      workers_joined: Completion::new(),
    })
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  pub fn worker_count(&self) -> usize {
    self.worker_count
  }

  /// Returns the number of jobs waiting for a worker.
  pub fn queued_task_count(&self) -> usize {
    self.shared.state.lock().jobs.len()
  }

  pub fn is_closed(&self) -> bool {
    self.shared.state.lock().closing
  }

  pub fn tick_interval(&self) -> Duration {
    self.shared.tick_interval()
  }

  pub fn set_tick_interval(&self, interval: Duration) {
    self.shared.tick_interval_nanos.store(duration_to_nanos(interval), AtomicOrdering::Relaxed);
    // Idle workers re-arm their wait with the new interval.
    self.shared.jobs_available.notify_all();
  }

  /// Connects `handler` to the tick broadcast of this pool. The handler runs
  /// on a worker thread (or on a queue's processing thread).
  pub fn subscribe_for_tick(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
    self.shared.tick_signal.connect(handler)
  }

  /// Submits `function` and returns a handle to its result.
  ///
  /// Returns an unset handle when the pool is closing; the function is
  /// dropped without running.
  pub fn add_task<F, R>(&self, function: F) -> TaskFuture<R>
  where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
  {
    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let (result_tx, result_rx) = oneshot::channel::<Result<R, RuntimeError>>();
    let pool_name = self.shared.pool_name.clone();

    let job: Job = Box::new(move || {
      let outcome = match panic::catch_unwind(AssertUnwindSafe(function)) {
        Ok(value) => Ok(value),
        Err(payload) => {
          warn!(pool_name = %*pool_name, %task_id, "Task panicked during execution: {}", panic_message(payload.as_ref()));
          Err(RuntimeError::TaskPanicked)
        }
      };
      if result_tx.send(outcome).is_err() {
        trace!(pool_name = %*pool_name, %task_id, "Result receiver for task was dropped.");
      }
    });

    match self.push_job(job) {
      Ok(()) => {
        trace!(pool_name = %*self.shared.pool_name, %task_id, "Task queued.");
        TaskFuture {
          task_id,
          result_receiver: Some(result_rx),
        }
      }
      Err(rejected) => {
        drop(rejected);
        warn!(pool_name = %*self.shared.pool_name, %task_id, "add_task: pool is closing, task rejected.");
        TaskFuture::unset()
      }
    }
  }

  /// Appends a job to the shared FIFO. The job is handed back when the pool
  /// is closing.
  pub(crate) fn push_job(&self, job: Job) -> Result<(), Job> {
    let mut state = self.shared.state.lock();
    if state.closing {
      return Err(job);
    }
    state.jobs.push_back(job);
    self.shared.jobs_available.notify_one();
    Ok(())
  }

  pub(crate) fn process_tick(&self) {
    self.shared.process_tick();
  }

  /// Closes the pool and joins every worker.
  ///
  /// Without the finish-on-close policy, jobs still queued are dropped
  /// unexecuted (their result handles resolve to `TaskAbandoned`). A worker
  /// calling `shutdown` on its own pool is not joined. Concurrent callers
  /// return once the first one has joined the workers; callers running on a
  /// worker of this pool never wait.
  pub fn shutdown(&self) {
    {
      let mut state = self.shared.state.lock();
      if !state.closing {
        info!(
          pool_name = %*self.shared.pool_name,
          queued = state.jobs.len(),
          "Initiating worker pool shutdown (finish_tasks_on_close: {}).",
          self.shared.finish_tasks_on_close
        );
      }
      state.closing = true;
      self.shared.jobs_available.notify_all();
    }

    let current_thread = thread::current().id();
    if self.join_started.swap(true, AtomicOrdering::SeqCst) {
      if !self.worker_ids.contains(&current_thread) {
        self.workers_joined.wait();
      }
    } else {
      let handles = mem::take(&mut *self.workers.lock());
      for handle in handles {
        if handle.thread().id() == current_thread {
          debug!(pool_name = %*self.shared.pool_name, "Shutdown called from a worker of this pool; not joining it.");
          continue;
        }
        if handle.join().is_err() {
          error!(pool_name = %*self.shared.pool_name, "Error joining worker thread during shutdown.");
        }
      }
      self.workers_joined.complete();
    }

    if !self.shared.finish_tasks_on_close {
      let abandoned = mem::take(&mut self.shared.state.lock().jobs);
      if !abandoned.is_empty() {
        debug!(pool_name = %*self.shared.pool_name, count = abandoned.len(), "Dropping queued tasks abandoned by shutdown.");
      }
      drop(abandoned);
    }
  }

  fn run_worker_loop(shared: Arc<PoolShared>, index: usize) {
    let _span = info_span!("worker_pool_thread", pool_name = %*shared.pool_name, index).entered();
    debug!("Worker started.");

    let mut state = shared.state.lock();
    loop {
      if shared.should_stop(&state) {
        break;
      }

      if state.jobs.is_empty() && !state.closing {
        let idle_wait = shared.tick_interval().max(MIN_IDLE_WAIT);
        shared.jobs_available.wait_for(&mut state, idle_wait);
        if shared.should_stop(&state) {
          break;
        }
      }

      let job = state.jobs.pop_front();
      MutexGuard::unlocked(&mut state, || {
        if let Some(job) = job {
          if let Some(message) = call_and_ignore_panic(job) {
            warn!(pool_name = %*shared.pool_name, "Job panicked; worker continues: {}", message);
          }
        }
        shared.process_tick();
      });
    }
    drop(state);

    debug!("Worker stopped.");
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    trace!(pool_name = %*self.shared.pool_name, "WorkerPool dropped; shutting down.");
    self.shutdown();
  }
}

fn duration_to_nanos(duration: Duration) -> u64 {
  u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
