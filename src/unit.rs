use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

/// Identifier of a submitted work unit, unique within one scheduler.
pub type UnitId = u64;

/// The future a work unit resolves to once it has been started.
pub(crate) type UnitFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'static>>;

/// A deferred, context-aware piece of work. The closure is only invoked when
/// the unit is actually started on a worker slot.
pub(crate) type WorkUnit<E> = Box<dyn FnOnce(CancellationToken) -> UnitFuture<E> + Send + 'static>;

/// Result of a call to [`Scheduler::submit`](crate::Scheduler::submit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// A worker slot was free and the unit started right away.
  Started(UnitId),
  /// All slots were busy; the unit waits in the pending queue.
  Queued(UnitId),
  /// The scheduler is shutting down or cancelled; the unit was dropped unrun.
  Rejected,
}

impl SubmitOutcome {
  pub fn unit_id(&self) -> Option<UnitId> {
    match self {
      SubmitOutcome::Started(id) | SubmitOutcome::Queued(id) => Some(*id),
      SubmitOutcome::Rejected => None,
    }
  }

  pub fn is_rejected(&self) -> bool {
    matches!(self, SubmitOutcome::Rejected)
  }
}

/// A unit sitting in the pending queue.
pub(crate) struct QueuedUnit<E: Send + 'static> {
  pub(crate) unit_id: UnitId,
  pub(crate) work: WorkUnit<E>,
}

pub(crate) fn boxed_unit<E, F, Fut>(unit: F) -> WorkUnit<E>
where
  E: Send + 'static,
  F: FnOnce(CancellationToken) -> Fut + Send + 'static,
  Fut: Future<Output = Result<(), E>> + Send + 'static,
{
  Box::new(move |token| Box::pin(unit(token)) as UnitFuture<E>)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_submit_outcome_helpers() {
    assert_eq!(SubmitOutcome::Started(3).unit_id(), Some(3));
    assert_eq!(SubmitOutcome::Queued(4).unit_id(), Some(4));
    assert_eq!(SubmitOutcome::Rejected.unit_id(), None);
    assert!(SubmitOutcome::Rejected.is_rejected());
    assert!(!SubmitOutcome::Queued(4).is_rejected());
  }

  #[tokio::test]
  async fn test_boxed_unit_defers_body_until_invoked() {
    let token = CancellationToken::new();
    let unit: WorkUnit<String> = boxed_unit(|ctx: CancellationToken| async move {
      if ctx.is_cancelled() {
        Err("cancelled".to_string())
      } else {
        Ok(())
      }
    });
    token.cancel();
    assert_eq!(unit(token).await, Err("cancelled".to_string()));
  }
}
