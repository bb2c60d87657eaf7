use bridge_runtime::{Executor, ShutdownPolicy, UnorderedExecutor, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

fn run_with_policy(pool: &Arc<WorkerPool>, policy: ShutdownPolicy) {
  let executor = UnorderedExecutor::new(pool.clone(), policy);
  let completed = Arc::new(AtomicUsize::new(0));

  for i in 0..6u64 {
    let completed = completed.clone();
    executor.spawn(move || {
      thread::sleep(Duration::from_millis(100 + i * 20));
      completed.fetch_add(1, Ordering::SeqCst);
    });
  }
  // Let the workers claim the first jobs.
  thread::sleep(Duration::from_millis(20));

  let started = Instant::now();
  executor.shutdown();
  info!(
    ?policy,
    "shutdown() returned after {:?} with {} of 6 jobs completed.",
    started.elapsed(),
    completed.load(Ordering::SeqCst)
  );

  thread::sleep(Duration::from_millis(400));
  info!(?policy, "{} of 6 jobs completed in the end.", completed.load(Ordering::SeqCst));
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Shutdown Policies Example ---");
  let pool = WorkerPool::new(2, false, "policy_pool");

  for policy in [ShutdownPolicy::CancelAll, ShutdownPolicy::WaitAll, ShutdownPolicy::KeepRunning] {
    run_with_policy(&pool, policy);
  }

  pool.shutdown();
  info!("Shutdown policies example finished.");
}
