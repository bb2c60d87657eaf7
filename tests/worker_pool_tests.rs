use bridge_runtime::{RuntimeError, WorkerPool, WorkerPoolConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

// Helper to initialize tracing for tests; Once makes repeated calls harmless.
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bridge_runtime=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[test]
fn test_add_task_returns_result() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, false, "test_pool_add_task");

  let handles: Vec<_> = (0..8u64).map(|i| pool.add_task(move || i * i)).collect();
  for (i, handle) in handles.into_iter().enumerate() {
    assert!(handle.is_valid());
    assert_eq!(handle.wait(), Ok((i * i) as u64));
  }

  assert_eq!(pool.name(), "test_pool_add_task");
  assert_eq!(pool.worker_count(), 2);
  pool.shutdown();
  assert!(pool.is_closed());
}

#[test]
fn test_worker_threads_are_named_after_the_pool() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, false, "named");

  let thread_name = pool.add_task(|| thread::current().name().map(str::to_string)).wait();
  assert_eq!(thread_name, Ok(Some("named-1".to_string())));
}

#[test]
fn test_panicking_task_keeps_worker_alive() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, false, "test_pool_panic");

  let failing = pool.add_task(|| -> u32 { panic!("intentional task failure") });
  assert_eq!(failing.wait(), Err(RuntimeError::TaskPanicked));

  // The single worker survived and still serves jobs.
  let healthy = pool.add_task(|| "still alive");
  assert_eq!(healthy.wait(), Ok("still alive"));
}

#[test]
fn test_add_task_after_shutdown_returns_unset_handle() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, false, "test_pool_closed");
  pool.shutdown();
  // A second shutdown is a no-op.
  pool.shutdown();

  let handle = pool.add_task(|| 1);
  assert!(!handle.is_valid());
  assert_eq!(handle.id(), 0);
  assert_eq!(handle.wait(), Err(RuntimeError::ResultUnavailable));
}

#[test]
fn test_shutdown_without_finish_policy_abandons_queued_tasks() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, false, "test_pool_abandon");
  let (started_tx, started_rx) = mpsc::channel();

  let running = pool.add_task(move || {
    started_tx.send(()).unwrap();
    thread::sleep(Duration::from_millis(100));
    "finished"
  });
  let queued = pool.add_task(|| "never runs");

  started_rx.recv().unwrap();
  pool.shutdown();

  assert_eq!(running.wait(), Ok("finished"));
  assert_eq!(queued.wait(), Err(RuntimeError::TaskAbandoned));
}

#[test]
fn test_shutdown_with_finish_policy_drains_queue() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, true, "test_pool_finish");
  let executed = Arc::new(AtomicUsize::new(0));

  let handles: Vec<_> = (0..5)
    .map(|_| {
      let executed = executed.clone();
      pool.add_task(move || {
        thread::sleep(Duration::from_millis(10));
        executed.fetch_add(1, Ordering::SeqCst);
      })
    })
    .collect();

  pool.shutdown();
  assert_eq!(executed.load(Ordering::SeqCst), 5);
  assert_eq!(pool.queued_task_count(), 0);
  for handle in handles {
    assert_eq!(handle.wait(), Ok(()));
  }
}

#[test]
fn test_ticks_fire_at_most_once_per_interval() {
  setup_tracing_for_test();
  let interval = Duration::from_millis(50);
  let pool = WorkerPool::with_config(WorkerPoolConfig::new(3, "test_pool_ticks").tick_interval(interval));
  assert_eq!(pool.tick_interval(), interval);

  let ticks = Arc::new(AtomicUsize::new(0));
  let subscription = {
    let ticks = ticks.clone();
    pool.subscribe_for_tick(move || {
      ticks.fetch_add(1, Ordering::SeqCst);
    })
  };

  // Plenty of jobs finishing in the window: still rate-limited.
  for _ in 0..200 {
    pool.add_task(|| thread::sleep(Duration::from_millis(1)));
  }
  thread::sleep(Duration::from_millis(320));

  let observed = ticks.load(Ordering::SeqCst);
  assert!(observed >= 2, "expected ticks while running, got {}", observed);
  assert!(observed <= 7, "ticks were not rate-limited: {}", observed);

  drop(subscription);
  let after_unsubscribe = ticks.load(Ordering::SeqCst);
  thread::sleep(Duration::from_millis(120));
  // An emission that snapshotted the handler before the drop may still land.
  assert!(ticks.load(Ordering::SeqCst) <= after_unsubscribe + 1);
}

#[test]
fn test_idle_pool_still_ticks() {
  setup_tracing_for_test();
  let pool = WorkerPool::with_config(WorkerPoolConfig::new(1, "test_pool_idle_ticks").tick_interval(Duration::from_millis(10)));

  let ticks = Arc::new(AtomicUsize::new(0));
  let _subscription = {
    let ticks = ticks.clone();
    pool.subscribe_for_tick(move || {
      ticks.fetch_add(1, Ordering::SeqCst);
    })
  };

  thread::sleep(Duration::from_millis(150));
  assert!(ticks.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_shutdown_from_inside_a_task_does_not_deadlock() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, false, "test_pool_self_shutdown");

  let inner_pool = pool.clone();
  let handle = pool.add_task(move || {
    inner_pool.shutdown();
    inner_pool.is_closed()
  });

  assert_eq!(handle.wait(), Ok(true));
  pool.shutdown();
}

#[test]
fn test_concurrent_shutdown_callers_all_wait_for_workers() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, false, "test_pool_concurrent_shutdown");
  let (started_tx, started_rx) = mpsc::channel();
  let finished = Arc::new(AtomicUsize::new(0));

  {
    let finished = finished.clone();
    pool.add_task(move || {
      started_tx.send(()).unwrap();
      thread::sleep(Duration::from_millis(100));
      finished.fetch_add(1, Ordering::SeqCst);
    });
  }
  started_rx.recv().unwrap();

  let first_caller = {
    let pool = pool.clone();
    let finished = finished.clone();
    thread::spawn(move || {
      pool.shutdown();
      finished.load(Ordering::SeqCst)
    })
  };
  thread::sleep(Duration::from_millis(20));

  pool.shutdown();
  assert_eq!(finished.load(Ordering::SeqCst), 1);
  assert_eq!(first_caller.join().unwrap(), 1);
}

#[tokio::test]
async fn test_task_future_can_be_awaited() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, false, "test_pool_async");

  let answer = pool.add_task(|| 21 * 2).await;
  assert_eq!(answer, Ok(42));

  pool.shutdown();
  let unset = pool.add_task(|| 0).await;
  assert_eq!(unset, Err(RuntimeError::ResultUnavailable));
}
