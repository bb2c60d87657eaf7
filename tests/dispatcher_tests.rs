use bridge_runtime::{
  reset_globals, Executor, GlobalOrderedExecutor, GlobalQueueDispatcher, GlobalWorkerPool, OrderedExecutor,
  QueueDispatcher, ScopedProvider, SequentialQueue, SynchronousDispatcher, WorkerPool,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

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

fn dispatcher_queue(name: &str) -> Arc<SequentialQueue> {
  SequentialQueue::new(WorkerPool::new(1, true, name))
}

#[test]
fn test_queue_dispatcher_delivers_in_order_and_waits_on_shutdown() {
  setup_tracing_for_test();
  let dispatcher = QueueDispatcher::new(dispatcher_queue("test_dispatch_order"), true);
  let log = Arc::new(Mutex::new(Vec::new()));

  for i in 0..10 {
    let log = log.clone();
    let operation = dispatcher.post(move || {
      thread::sleep(Duration::from_millis(2));
      log.lock().unwrap().push(i);
    });
    assert!(!operation.is_cancelable());
  }

  dispatcher.shutdown();
  assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());

  let late = Arc::new(AtomicBool::new(false));
  let operation = {
    let late = late.clone();
    dispatcher.post(move || late.store(true, Ordering::SeqCst))
  };
  assert!(operation.is_inert());
  thread::sleep(Duration::from_millis(20));
  assert!(!late.load(Ordering::SeqCst));
}

#[test]
fn test_queue_dispatcher_without_wait_all_discards_pending_callbacks() {
  setup_tracing_for_test();
  let dispatcher = QueueDispatcher::new(dispatcher_queue("test_dispatch_discard"), false);
  let (started_tx, started_rx) = mpsc::channel();
  let running_done = Arc::new(AtomicBool::new(false));
  let pending_ran = Arc::new(AtomicBool::new(false));

  {
    let running_done = running_done.clone();
    dispatcher.post(move || {
      started_tx.send(()).unwrap();
      thread::sleep(Duration::from_millis(50));
      running_done.store(true, Ordering::SeqCst);
    });
  }
  {
    let pending_ran = pending_ran.clone();
    let operation = dispatcher.post(move || pending_ran.store(true, Ordering::SeqCst));
    assert!(operation.is_cancelable());
  }

  started_rx.recv().unwrap();
  dispatcher.shutdown();
  assert!(running_done.load(Ordering::SeqCst));
  assert!(!pending_ran.load(Ordering::SeqCst));
}

#[test]
fn test_callback_can_wait_for_a_callback_it_posted() {
  setup_tracing_for_test();
  let dispatcher = Arc::new(QueueDispatcher::new(dispatcher_queue("test_dispatch_nested"), true));
  let log = Arc::new(Mutex::new(Vec::new()));

  let outer = {
    let log = log.clone();
    let weak_dispatcher = Arc::downgrade(&dispatcher);
    dispatcher.post(move || {
      log.lock().unwrap().push("outer start");
      if let Some(dispatcher) = weak_dispatcher.upgrade() {
        let inner_log = log.clone();
        let inner = dispatcher.post(move || inner_log.lock().unwrap().push("inner"));
        inner.wait();
      }
      log.lock().unwrap().push("outer end");
    })
  };

  outer.wait();
  assert_eq!(*log.lock().unwrap(), vec!["outer start", "inner", "outer end"]);
}

#[test]
fn test_synchronous_dispatcher_runs_inline_until_shut_down() {
  setup_tracing_for_test();
  let dispatcher = SynchronousDispatcher::new();
  let caller = thread::current().id();
  let ran_on = Arc::new(Mutex::new(None));

  {
    let ran_on = ran_on.clone();
    let operation = dispatcher.post(move || *ran_on.lock().unwrap() = Some(thread::current().id()));
    assert!(operation.is_inert());
  }
  assert_eq!(*ran_on.lock().unwrap(), Some(caller));

  // Failures stay inside the dispatcher.
  dispatcher.post(|| panic!("callback failure"));

  // Shutting down from inside a callback must not wait for itself.
  dispatcher.post(|| dispatcher.shutdown());

  let ran = Arc::new(AtomicBool::new(false));
  {
    let ran = ran.clone();
    dispatcher.post(move || ran.store(true, Ordering::SeqCst));
  }
  assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_synchronous_dispatcher_shutdown_waits_for_in_flight_callbacks() {
  setup_tracing_for_test();
  let dispatcher = Arc::new(SynchronousDispatcher::default());
  let (started_tx, started_rx) = mpsc::channel();
  let finished = Arc::new(AtomicBool::new(false));

  let poster = {
    let dispatcher = dispatcher.clone();
    let finished = finished.clone();
    thread::spawn(move || {
      dispatcher.post(move || {
        started_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(80));
        finished.store(true, Ordering::SeqCst);
      });
    })
  };

  started_rx.recv().unwrap();
  dispatcher.shutdown();
  assert!(finished.load(Ordering::SeqCst));
  poster.join().unwrap();
}

// The process-wide slots are shared by every test of this binary, so all
// assertions about them live in this one test.
#[test]
fn test_global_defaults_are_lazy_replaceable_and_resettable() {
  setup_tracing_for_test();

  let pool = GlobalWorkerPool::get();
  assert_eq!(pool.name(), "global-tp");
  assert_eq!(pool.worker_count(), 4);
  assert!(Arc::ptr_eq(&pool, &GlobalWorkerPool::get()));

  let custom = WorkerPool::new(1, false, "custom-global");
  {
    let _scope = ScopedProvider::new(custom.clone());
    let queue = SequentialQueue::with_global_pool();
    assert_eq!(queue.thread_pool().name(), "custom-global");
  }
  assert!(Arc::ptr_eq(&pool, &GlobalWorkerPool::get()));

  let global_dispatcher = GlobalQueueDispatcher::get();
  assert_eq!(global_dispatcher.queue().name(), "dispatcher-queue");
  assert_eq!(global_dispatcher.queue().thread_pool().name(), "dispatcher");
  assert_eq!(global_dispatcher.queue().thread_pool().worker_count(), 1);

  let shared_dispatcher = QueueDispatcher::shared(true);
  assert!(Arc::ptr_eq(&shared_dispatcher.queue(), &global_dispatcher.queue()));
  let (delivered_tx, delivered_rx) = mpsc::channel();
  shared_dispatcher.post(move || delivered_tx.send(thread::current().name().map(str::to_string)).unwrap());
  assert_eq!(
    delivered_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
    Some("dispatcher-1".to_string())
  );

  let global_executor = GlobalOrderedExecutor::get();
  let shared_executor = OrderedExecutor::shared();
  assert!(Arc::ptr_eq(&shared_executor.queue(), &global_executor.queue()));
  assert!(Arc::ptr_eq(&global_executor.queue().thread_pool(), &pool));
  let (done_tx, done_rx) = mpsc::channel();
  shared_executor.spawn(move || done_tx.send(()).unwrap()).wait();
  assert!(done_rx.try_recv().is_ok());

  drop(shared_executor);
  drop(shared_dispatcher);
  drop(global_executor);
  drop(global_dispatcher);

  reset_globals();
  let fresh_pool = GlobalWorkerPool::get();
  assert!(!Arc::ptr_eq(&pool, &fresh_pool));
  assert_eq!(fresh_pool.name(), "global-tp");
  reset_globals();
}
