use bridge_runtime::{Executor, OrderedExecutor, QueueDispatcher, SequentialQueue, WorkerPool};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Ordered Dispatch Example ---");

  // One worker is enough: a callback waiting for a later callback re-enters
  // the drain loop instead of blocking the thread.
  let pool = WorkerPool::new(1, true, "demo_pool");
  let queue = SequentialQueue::new(pool.clone());
  let dispatcher = Arc::new(QueueDispatcher::new(queue.clone(), true));

  let weak_dispatcher = Arc::downgrade(&dispatcher);
  let first = dispatcher.post(move || {
    info!("Callback A: started, posting C and waiting for it.");
    if let Some(dispatcher) = weak_dispatcher.upgrade() {
      let c = dispatcher.post(|| info!("Callback C: running inside A's wait."));
      c.wait();
    }
    info!("Callback A: resumed after C.");
  });
  dispatcher.post(|| info!("Callback B: runs before C, it was posted first."));

  first.wait();

  info!("--- Delayed work on an ordered executor ---");
  let executor = OrderedExecutor::new(queue);
  let submitted_at = Instant::now();
  executor.schedule(
    submitted_at + Duration::from_millis(300),
    Box::new(move || info!("Delayed job ran after {:?}.", submitted_at.elapsed())),
    Default::default(),
  );
  // The pool ticks once per second by default.
  thread::sleep(Duration::from_millis(1500));

  executor.shutdown();
  dispatcher.shutdown();
  info!("Ordered dispatch example finished.");
}
