use crate::unit::QueuedUnit;

use std::collections::VecDeque;

/// FIFO of submitted-but-not-started work units.
///
/// The capacity only expresses when the queue counts as full; pushing past it
/// is allowed so the scheduler can overflow instead of deadlocking a submitter
/// that occupies a worker slot. Callers decide whether to wait on `is_full`.
pub(crate) struct PendingQueue<E: Send + 'static> {
  units: VecDeque<QueuedUnit<E>>,
  capacity: Option<usize>,
}

impl<E: Send + 'static> PendingQueue<E> {
  /// Creates a queue. `None` means unbounded.
  pub(crate) fn new(capacity: Option<usize>) -> Self {
    Self {
      units: VecDeque::new(),
      capacity,
    }
  }

  pub(crate) fn push_back(&mut self, unit: QueuedUnit<E>) {
    self.units.push_back(unit);
  }

  /// Removes the oldest pending unit.
  pub(crate) fn pop_front(&mut self) -> Option<QueuedUnit<E>> {
    self.units.pop_front()
  }

  /// Empties the queue, returning the units in submission order.
  pub(crate) fn drain_all(&mut self) -> Vec<QueuedUnit<E>> {
    self.units.drain(..).collect()
  }

  pub(crate) fn len(&self) -> usize {
    self.units.len()
  }

  /// Returns `true` once the queue has reached its bounded capacity.
  /// An unbounded queue is never full.
  pub(crate) fn is_full(&self) -> bool {
    match self.capacity {
      Some(cap) => self.units.len() >= cap,
      None => false,
    }
  }
}
