//! Process-wide typed registry of default runtime instances.
//!
//! `Provider::<T>::get()` lazily constructs the default `T` on first access.
//! The host library resets the slots explicitly on init/deinit with
//! `Provider::<T>::set(..)` (or [`reset_globals`]) instead of relying on
//! teardown order.

use crate::dispatcher::QueueDispatcher;
use crate::ordered_executor::OrderedExecutor;
use crate::pool::{WorkerPool, WorkerPoolConfig};
use crate::sequential_queue::SequentialQueue;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

lazy_static::lazy_static! {
  static ref REGISTRY: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>> = Mutex::new(HashMap::new());
}

/// A value that can be held by a [`Provider`].
pub trait Provided: Clone + Send + Sync + 'static {
  /// Builds the value handed out when the slot is empty.
  fn default_object() -> Self;
}

/// Typed access to one slot of the process-wide registry.
pub struct Provider<T>(PhantomData<T>);

impl<T: Provided> Provider<T> {
  /// Returns the current value, constructing the default one first if the
  /// slot is empty.
  pub fn get() -> T {
    if let Some(current) = Self::current() {
      return current;
    }

    // Constructed outside the registry lock: defaults may depend on other
    // provided values.
    let created = T::default_object();
    let (value, unused) = {
      let mut registry = REGISTRY.lock();
      match registry.get(&TypeId::of::<T>()).and_then(|slot| slot.downcast_ref::<T>()) {
        Some(existing) => (existing.clone(), Some(created)),
        None => {
          registry.insert(TypeId::of::<T>(), Box::new(created.clone()));
          (created, None)
        }
      }
    };
    drop(unused);

    debug!(provided = std::any::type_name::<T>(), "Provider: default object constructed.");
    value
  }

  /// Returns the current value without constructing a default.
  pub fn current() -> Option<T> {
    REGISTRY
      .lock()
      .get(&TypeId::of::<T>())
      .and_then(|slot| slot.downcast_ref::<T>())
      .cloned()
  }

  /// Installs `value`, or empties the slot with `None` so the next `get`
  /// constructs a fresh default. The replaced value is dropped after the
  /// registry lock is released.
  pub fn set(value: Option<T>) {
    let replaced = {
      let mut registry = REGISTRY.lock();
      match value {
        Some(value) => registry.insert(TypeId::of::<T>(), Box::new(value)),
        None => registry.remove(&TypeId::of::<T>()),
      }
    };
    drop(replaced);
  }
}

/// Installs a value for its own lifetime and restores the previous slot
/// content when dropped.
pub struct ScopedProvider<T: Provided> {
  previous: Option<T>,
}

impl<T: Provided> ScopedProvider<T> {
  pub fn new(value: T) -> Self {
    let previous = Provider::<T>::current();
    Provider::<T>::set(Some(value));
    Self { previous }
  }
}

impl<T: Provided> Drop for ScopedProvider<T> {
  fn drop(&mut self) {
    Provider::<T>::set(self.previous.take());
  }
}

pub type GlobalWorkerPool = Provider<Arc<WorkerPool>>;
pub type GlobalOrderedExecutor = Provider<Arc<OrderedExecutor>>;
pub type GlobalQueueDispatcher = Provider<Arc<QueueDispatcher>>;

impl Provided for Arc<WorkerPool> {
  fn default_object() -> Self {
    WorkerPool::with_config(WorkerPoolConfig::default())
  }
}

impl Provided for Arc<OrderedExecutor> {
  fn default_object() -> Self {
    Arc::new(OrderedExecutor::new(SequentialQueue::with_global_pool()))
  }
}

impl Provided for Arc<QueueDispatcher> {
  fn default_object() -> Self {
    let pool = WorkerPool::new(1, true, "dispatcher");
    Arc::new(QueueDispatcher::new(SequentialQueue::with_name(pool, "dispatcher-queue"), true))
  }
}

/// Empties the default dispatcher, ordered executor and pool slots, in that
/// order. Instances still referenced elsewhere stay alive until released.
pub fn reset_globals() {
  GlobalQueueDispatcher::set(None);
  GlobalOrderedExecutor::set(None);
  GlobalWorkerPool::set(None);
}
