use crate::task::{Job, OperationType};

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::time::{Duration, Instant};

/// Time-keyed store of delayed work that is not due yet.
///
/// Entries sharing a time point keep their insertion order.
#[derive(Default)]
pub struct DelayTable {
  tasks: BTreeMap<Instant, Vec<(Job, OperationType)>>,
}

impl fmt::Debug for DelayTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DelayTable")
      .field("len", &self.len())
      .field("next_due", &self.next_due())
      .finish()
  }
}

impl DelayTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_task(&mut self, time_point: Instant, job: Job, operation_type: OperationType) {
    self.tasks.entry(time_point).or_default().push((job, operation_type));
  }

  /// Removes and returns every entry due at or before `now`, earliest first.
  pub fn filter_and_erase_tasks(&mut self, now: Instant) -> Vec<(Job, OperationType)> {
    let not_due = match now.checked_add(Duration::from_nanos(1)) {
      Some(bound) => self.tasks.split_off(&bound),
      None => BTreeMap::new(),
    };
    let due = mem::replace(&mut self.tasks, not_due);
    due.into_values().flatten().collect()
  }

  pub fn next_due(&self) -> Option<Instant> {
    self.tasks.keys().next().copied()
  }

  pub fn len(&self) -> usize {
    self.tasks.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};

  fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Job {
    let log = log.clone();
    Box::new(move || log.lock().unwrap().push(name))
  }

  #[test]
  fn returns_only_due_entries_in_time_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let base = Instant::now();
    let mut table = DelayTable::new();

    table.add_task(base + Duration::from_millis(30), recorder(&log, "late"), OperationType::Cancelable);
    table.add_task(base + Duration::from_millis(10), recorder(&log, "early"), OperationType::NonCancelable);
    table.add_task(base + Duration::from_millis(20), recorder(&log, "middle"), OperationType::Cancelable);
    assert_eq!(table.len(), 3);
    assert_eq!(table.next_due(), Some(base + Duration::from_millis(10)));

    let due = table.filter_and_erase_tasks(base + Duration::from_millis(20));
    assert_eq!(due.len(), 2);
    assert_eq!(due[0].1, OperationType::NonCancelable);
    for (job, _) in due {
      job();
    }
    assert_eq!(*log.lock().unwrap(), vec!["early", "middle"]);
    assert_eq!(table.len(), 1);

    assert!(table.filter_and_erase_tasks(base + Duration::from_millis(29)).is_empty());
    assert_eq!(table.filter_and_erase_tasks(base + Duration::from_millis(31)).len(), 1);
    assert!(table.is_empty());
  }

  #[test]
  fn entries_at_the_same_instant_keep_insertion_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let at = Instant::now();
    let mut table = DelayTable::new();
    table.add_task(at, recorder(&log, "first"), OperationType::Cancelable);
    table.add_task(at, recorder(&log, "second"), OperationType::Cancelable);

    for (job, _) in table.filter_and_erase_tasks(at) {
      job();
    }
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
  }
}
