//! A thread-pool based task runtime: a fixed worker pool, sequential queues
//! with reentrant waits, ordered and unordered executors with delayed
//! scheduling and cooperative cancellation, and callback dispatchers.

mod dispatcher;
mod error;
mod executor;
mod handle;
mod operation;
mod ordered_executor;
mod pool;
mod provider;
mod repetitive_task;
mod schedule;
mod sequential_queue;
mod signal;
mod sync;
mod synchronous_executor;
mod task;
mod unordered_executor;

pub use dispatcher::{QueueDispatcher, SynchronousDispatcher};
pub use error::RuntimeError;
pub use executor::Executor;
pub use handle::TaskFuture;
pub use operation::{CompositeOperation, Operation, OperationControl};
pub use ordered_executor::OrderedExecutor;
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use provider::{
  reset_globals, GlobalOrderedExecutor, GlobalQueueDispatcher, GlobalWorkerPool, Provided, Provider, ScopedProvider,
};
pub use repetitive_task::RepetitiveTask;
pub use schedule::DelayTable;
pub use sequential_queue::{SequentialQueue, TicketHandle};
pub use signal::{Subscription, TickSignal};
pub use synchronous_executor::SynchronousExecutor;
pub use task::{Job, OperationType};
pub use unordered_executor::{ShutdownPolicy, UnorderedExecutor};
