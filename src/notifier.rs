use crate::unit::UnitId;

use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, Instrument};

// --- Public Event Structs for Handlers ---

/// How a work unit finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitCompletionStatus {
  Succeeded,
  Failed,
  Panicked,
  /// The unit was queued but never started because the scheduler was cancelled.
  Skipped,
}

#[derive(Debug, Clone)]
pub struct UnitCompletionInfo {
  pub unit_id: UnitId,
  pub scheduler_name: Arc<String>,
  pub status: UnitCompletionStatus,
  pub completion_time: SystemTime,
}

pub(crate) type CompletionHandler = Arc<dyn Fn(UnitCompletionInfo) + Send + Sync + 'static>;

#[derive(Debug)]
pub(crate) struct InternalCompletionMessage {
  pub(crate) unit_id: UnitId,
  pub(crate) status: UnitCompletionStatus,
  pub(crate) completion_time: SystemTime,
}

// --- CompletionNotifier Struct ---

struct NotifierInternalState {
  internal_rx_for_init: Option<UnboundedReceiver<InternalCompletionMessage>>,
  worker_join_handle: Option<JoinHandle<()>>,
}

/// Fans unit completions out to user handlers.
///
/// Completions are queued on an unbounded channel and delivered by a single
/// worker that is started lazily with the first handler. Until then nothing is
/// queued, so a scheduler without handlers holds no completion backlog.
/// Handlers run on that worker in registration order, so one completion is
/// fully dispatched before the next begins.
pub(crate) struct CompletionNotifier {
  scheduler_name: Arc<String>,
  tokio_handle: TokioHandle,
  tx: Mutex<Option<UnboundedSender<InternalCompletionMessage>>>,
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  init_once: Once,
  internal_state: Mutex<NotifierInternalState>,
}

impl CompletionNotifier {
  pub(crate) fn new(tokio_handle: TokioHandle, scheduler_name: Arc<String>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      scheduler_name,
      tokio_handle,
      tx: Mutex::new(Some(tx)),
      handlers: Arc::new(RwLock::new(Vec::new())),
      init_once: Once::new(),
      internal_state: Mutex::new(NotifierInternalState {
        internal_rx_for_init: Some(rx),
        worker_join_handle: None,
      }),
    }
  }

  fn ensure_worker_initialized(&self) {
    self.init_once.call_once(|| {
      let mut state = self.internal_state.lock();
      if let Some(rx) = state.internal_rx_for_init.take() {
        info!(scheduler = %*self.scheduler_name, "First completion handler added. Starting notification worker.");
        let worker = Self::run_notification_worker_loop(rx, self.handlers.clone(), self.scheduler_name.clone())
          .instrument(info_span!("notification_worker_loop", scheduler = %*self.scheduler_name));
        state.worker_join_handle = Some(self.tokio_handle.spawn(worker));
      }
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(UnitCompletionInfo) + Send + Sync + 'static) {
    let total = {
      let mut handlers = self.handlers.write();
      handlers.push(Arc::new(handler));
      handlers.len()
    };
    info!(scheduler = %*self.scheduler_name, "Added completion handler. Total handlers: {}", total);
    self.ensure_worker_initialized();
  }

  /// Queues a completion for delivery. Never blocks, so it may be called
  /// while the scheduler state lock is held. Completions that finish before
  /// the first handler is registered are not delivered.
  pub(crate) fn notify(&self, unit_id: UnitId, status: UnitCompletionStatus) {
    if !self.init_once.is_completed() {
      return;
    }
    let message = InternalCompletionMessage {
      unit_id,
      status,
      completion_time: SystemTime::now(),
    };
    let sent = match self.tx.lock().as_ref() {
      Some(tx) => tx.send(message).is_ok(),
      None => false,
    };
    if !sent {
      trace!(scheduler = %*self.scheduler_name, %unit_id, "Completion channel closed, dropping notification.");
    }
  }

  async fn run_notification_worker_loop(
    mut queue_rx: UnboundedReceiver<InternalCompletionMessage>,
    handlers: Arc<RwLock<Vec<CompletionHandler>>>,
    scheduler_name: Arc<String>,
  ) {
    debug!("Notification worker started.");
    loop {
      match queue_rx.recv().await {
        Some(message) => {
          // Snapshot so a handler may register further handlers.
          let snapshot: Vec<CompletionHandler> = handlers.read().clone();
          let info = UnitCompletionInfo {
            unit_id: message.unit_id,
            scheduler_name: scheduler_name.clone(),
            status: message.status,
            completion_time: message.completion_time,
          };
          trace!(unit_id = %info.unit_id, status = ?info.status, "Dispatching notification to {} handlers.", snapshot.len());
          for handler in snapshot {
            let info_for_handler = info.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(info_for_handler))).is_err() {
              error!(unit_id = %info.unit_id, "A completion handler panicked.");
            }
          }
        }
        None => {
          debug!("Completion queue closed and empty. Notification worker stopping.");
          break;
        }
      }
    }
  }

  /// Closes the completion queue and waits until every queued completion has
  /// been handed to the handlers.
  pub(crate) async fn close_and_flush(&self) {
    // Dropping the only sender lets the worker drain and stop.
    self.tx.lock().take();

    let handle = {
      let mut state = self.internal_state.lock();
      // Never initialized: nobody is listening.
      state.internal_rx_for_init.take();
      state.worker_join_handle.take()
    };

    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        error!(scheduler = %*self.scheduler_name, "Error joining notification worker: {:?}", e);
      } else {
        debug!(scheduler = %*self.scheduler_name, "Notification worker joined.");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::mpsc::error::TryRecvError;

  #[tokio::test]
  async fn test_completions_without_handlers_are_not_buffered() {
    let notifier = CompletionNotifier::new(TokioHandle::current(), Arc::new("no_handlers".to_string()));
    for unit_id in 0..10_000 {
      notifier.notify(unit_id, UnitCompletionStatus::Succeeded);
    }

    let mut state = notifier.internal_state.lock();
    let rx = state.internal_rx_for_init.as_mut().expect("receiver is kept until a handler is added");
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
  }

  #[tokio::test]
  async fn test_completions_after_first_handler_are_delivered() {
    let notifier = CompletionNotifier::new(TokioHandle::current(), Arc::new("late_handler".to_string()));
    notifier.notify(0, UnitCompletionStatus::Succeeded);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    notifier.add_handler(move |info: UnitCompletionInfo| seen_clone.lock().push(info.unit_id));
    notifier.notify(1, UnitCompletionStatus::Failed);
    notifier.notify(2, UnitCompletionStatus::Skipped);

    notifier.close_and_flush().await;
    assert_eq!(*seen.lock(), vec![1, 2]);
  }
}
