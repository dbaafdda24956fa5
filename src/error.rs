use crate::unit::UnitId;

use thiserror::Error;

/// Errors produced by a [`Scheduler`](crate::Scheduler).
///
/// `E` is the failure type of the submitted work units. Only the first unit
/// failure of a run is ever surfaced, through [`Scheduler::wait`](crate::Scheduler::wait).
#[derive(Error, Debug, PartialEq)]
pub enum SchedulerError<E> {
  #[error("{0}")]
  Unit(E),

  #[error("Work unit {0} panicked")]
  UnitPanicked(UnitId),

  #[error("Concurrency limit must be at least 1, got {0}")]
  InvalidConcurrency(usize),

  #[error("Bounded queue capacity must be at least 1")]
  InvalidQueueCapacity,

  #[error("Scheduler has already drained, cannot accept new work units")]
  Drained,

  #[error("Scheduler was already waited on")]
  AlreadyWaited,

  #[error("Scheduler cannot be waited on from inside one of its own work units")]
  WaitFromUnit,
}

impl<E> SchedulerError<E> {
  /// Returns the unit failure if this error carries one.
  pub fn into_unit_error(self) -> Option<E> {
    match self {
      SchedulerError::Unit(e) => Some(e),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unit_error_displays_inner_failure() {
    let err: SchedulerError<String> = SchedulerError::Unit("Failed to change permissions: a.jpg".to_string());
    assert_eq!(err.to_string(), "Failed to change permissions: a.jpg");
    assert_eq!(err.into_unit_error(), Some("Failed to change permissions: a.jpg".to_string()));
  }

  #[test]
  fn test_internal_errors_carry_no_unit_error() {
    let err: SchedulerError<String> = SchedulerError::InvalidConcurrency(0);
    assert_eq!(err.to_string(), "Concurrency limit must be at least 1, got 0");
    assert_eq!(SchedulerError::<String>::UnitPanicked(7).to_string(), "Work unit 7 panicked");
    assert_eq!(err.into_unit_error(), None);
  }
}
