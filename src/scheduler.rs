use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::notifier::{CompletionNotifier, UnitCompletionInfo, UnitCompletionStatus};
use crate::queue::PendingQueue;
use crate::unit::{boxed_unit, QueuedUnit, SubmitOutcome, UnitId};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, trace, warn, Instrument};

tokio::task_local! {
  /// Identity of the scheduler whose work unit is running on the current task.
  static CURRENT_SCHEDULER: usize;
}

/// Lifecycle phase of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
  /// Accepting submissions and draining the queue.
  Running,
  /// Shut down or cancelled: new submissions are rejected while in-flight
  /// work finishes.
  Cancelling,
  /// All work finished and `wait` returned. Terminal.
  Drained,
}

/// How [`Scheduler::shutdown`] treats work that has not finished yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop accepting new units. Queued and running units still run and the
  /// shared context stays live. This is what a producer calls once it has
  /// submitted its last unit.
  Drain,
  /// Stop accepting new units, cancel the shared context and skip every unit
  /// still in the queue. Running units are expected to observe the token.
  Cancel,
}

/// Counters describing a scheduler run so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
  /// Submissions that were started or queued.
  pub submitted: usize,
  /// Submissions dropped because the scheduler was no longer accepting work.
  pub rejected: usize,
  /// Units whose body was invoked.
  pub started: usize,
  pub succeeded: usize,
  pub failed: usize,
  pub panicked: usize,
  /// Units dropped unrun by cancellation.
  pub skipped: usize,
  /// Highest number of units executing at once.
  pub peak_active: usize,
}

struct SchedulerStateInner<E: Send + 'static> {
  active: usize,
  pending: PendingQueue<E>,
  /// Active + pending + submit calls still in progress.
  outstanding: usize,
  first_error: Option<SchedulerError<E>>,
  cancelled: bool,
  /// No further submissions are accepted. Implied by `cancelled`.
  closed: bool,
  waited: bool,
  drained: bool,
  /// In-unit submitters currently suspended on a full queue.
  blocked_in_unit: usize,
  next_unit_id: UnitId,
  stats: SchedulerStats,
}

impl<E: Send + 'static> SchedulerStateInner<E> {
  fn allocate_unit_id(&mut self) -> UnitId {
    let unit_id = self.next_unit_id;
    self.next_unit_id += 1;
    self.stats.submitted += 1;
    unit_id
  }
}

struct SchedulerInner<E: Send + 'static> {
  name: Arc<String>,
  concurrency_limit: usize,
  tokio_handle: TokioHandle,
  token: CancellationToken,
  state: Mutex<SchedulerStateInner<E>>,
  /// Signalled whenever `outstanding` drops to zero.
  drained: Notify,
  /// Signalled whenever queue space may have freed up or the scheduler closed.
  space_available: Notify,
  workers: TaskTracker,
  notifier: CompletionNotifier,
}

impl<E: Send + 'static> SchedulerInner<E> {
  fn key(self: &Arc<Self>) -> usize {
    Arc::as_ptr(self) as *const () as usize
  }

  /// Enters the cancelling phase: closes submissions, cancels the shared
  /// context and skips every queued unit. Returns the skipped units so the
  /// caller can drop them after releasing the lock.
  fn cancel_locked(&self, state: &mut SchedulerStateInner<E>, reason: &'static str) -> Vec<QueuedUnit<E>> {
    if state.cancelled {
      return Vec::new();
    }
    state.cancelled = true;
    state.closed = true;
    self.token.cancel();

    let skipped = state.pending.drain_all();
    for unit in &skipped {
      self.notifier.notify(unit.unit_id, UnitCompletionStatus::Skipped);
    }
    state.outstanding -= skipped.len();
    state.stats.skipped += skipped.len();
    info!(scheduler = %*self.name, reason, skipped = skipped.len(), "Scheduler cancelling. Rejecting new work units.");
    skipped
  }

  /// Picks up cancellation of the parent context that nobody has reacted to yet.
  fn observe_external_cancellation(&self, state: &mut SchedulerStateInner<E>) -> Vec<QueuedUnit<E>> {
    if self.token.is_cancelled() && !state.cancelled {
      self.cancel_locked(state, "context cancelled")
    } else {
      Vec::new()
    }
  }

  fn wake(&self, idle: bool) {
    self.space_available.notify_waiters();
    if idle {
      self.drained.notify_waiters();
    }
  }
}

impl<E: Send + 'static> Drop for SchedulerInner<E> {
  fn drop(&mut self) {
    if !self.state.get_mut().drained {
      debug!(scheduler = %*self.name, "Scheduler dropped without wait. Cancelling shared context.");
      self.token.cancel();
    }
  }
}

/// Holds a submitter's share of `outstanding` until the unit is handed to
/// the scheduler. Dropping it releases the share, which covers both rejected
/// submissions and a submit future dropped while suspended.
struct SubmitReservation<'a, E: Send + 'static> {
  inner: &'a SchedulerInner<E>,
  armed: bool,
  blocked_in_unit: bool,
}

impl<E: Send + 'static> Drop for SubmitReservation<'_, E> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let idle = {
      let mut state = self.inner.state.lock();
      if self.blocked_in_unit {
        state.blocked_in_unit -= 1;
      }
      state.outstanding -= 1;
      state.outstanding == 0
    };
    self.inner.wake(idle);
  }
}

/// Holds the single `wait` slot. Dropping it before the run's result has been
/// taken hands the slot back, so an abandoned `wait` (for example one wrapped
/// in a timeout) can be retried.
struct WaitReservation<'a, E: Send + 'static> {
  inner: &'a SchedulerInner<E>,
  armed: bool,
}

impl<E: Send + 'static> Drop for WaitReservation<'_, E> {
  fn drop(&mut self) {
    if self.armed {
      debug!(scheduler = %*self.inner.name, "Wait: Abandoned before completion. Releasing wait slot.");
      self.inner.state.lock().waited = false;
    }
  }
}

enum Admission<E: Send + 'static> {
  Start(QueuedUnit<E>),
  Queued(UnitId),
  Rejected(Vec<QueuedUnit<E>>),
}

/// A bounded-concurrency scheduler for a dynamically growing set of work
/// units with first-failure-wins cancellation.
///
/// Cloning is cheap and every clone drives the same scheduler, so work units
/// can capture a clone and submit further units while they run.
///
/// ```no_run
/// use fanout_pool::{Scheduler, SchedulerConfig, ShutdownMode};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), fanout_pool::SchedulerError<String>> {
/// let scheduler = Scheduler::<String>::new(
///   SchedulerConfig::new(4).with_name("listing"),
///   CancellationToken::new(),
///   tokio::runtime::Handle::current(),
/// )?;
///
/// let producer = scheduler.clone();
/// scheduler
///   .submit(move |_ctx| async move {
///     for page in 0..3 {
///       for item in 0..10 {
///         let submitted = producer
///           .submit(move |_ctx| async move {
///             tracing::info!(page, item, "processing");
///             Ok(())
///           })
///           .await;
///         if let Err(e) = submitted {
///           return Err(e.to_string());
///         }
///       }
///     }
///     producer.shutdown(ShutdownMode::Drain);
///     Ok(())
///   })
///   .await?;
///
/// scheduler.wait().await
/// # }
/// ```
pub struct Scheduler<E: Send + 'static> {
  inner: Arc<SchedulerInner<E>>,
}

impl<E: Send + 'static> Clone for Scheduler<E> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<E: Send + 'static> fmt::Debug for Scheduler<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("Scheduler")
      .field("name", &self.inner.name)
      .field("concurrency_limit", &self.inner.concurrency_limit)
      .field("active", &state.active)
      .field("pending", &state.pending.len())
      .field("outstanding", &state.outstanding)
      .field("cancelled", &state.cancelled)
      .finish_non_exhaustive()
  }
}

impl<E: Send + 'static> Scheduler<E> {
  /// Creates a scheduler whose shared context is a child of `parent_token`.
  /// Cancelling the parent cancels every unit's context and stops new work.
  pub fn new(
    config: SchedulerConfig,
    parent_token: CancellationToken,
    tokio_handle: TokioHandle,
  ) -> Result<Self, SchedulerError<E>> {
    if config.concurrency_limit == 0 {
      return Err(SchedulerError::InvalidConcurrency(config.concurrency_limit));
    }
    if config.queue_capacity == Some(0) {
      return Err(SchedulerError::InvalidQueueCapacity);
    }

    let name = Arc::new(config.name);
    let notifier = CompletionNotifier::new(tokio_handle.clone(), name.clone());

    info!(
      scheduler = %*name,
      concurrency_limit = config.concurrency_limit,
      queue_capacity = ?config.queue_capacity,
      "Scheduler created."
    );

    Ok(Self {
      inner: Arc::new(SchedulerInner {
        name,
        concurrency_limit: config.concurrency_limit,
        tokio_handle,
        token: parent_token.child_token(),
        state: Mutex::new(SchedulerStateInner {
          active: 0,
          pending: PendingQueue::new(config.queue_capacity),
          outstanding: 0,
          first_error: None,
          cancelled: false,
          closed: false,
          waited: false,
          drained: false,
          blocked_in_unit: 0,
          next_unit_id: 0,
          stats: SchedulerStats::default(),
        }),
        drained: Notify::new(),
        space_available: Notify::new(),
        workers: TaskTracker::new(),
        notifier,
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn concurrency_limit(&self) -> usize {
    self.inner.concurrency_limit
  }

  /// The shared context handed to every work unit.
  pub fn token(&self) -> CancellationToken {
    self.inner.token.clone()
  }

  pub fn active_unit_count(&self) -> usize {
    self.inner.state.lock().active
  }

  /// Returns the current number of units in the pending queue.
  pub fn queued_unit_count(&self) -> usize {
    self.inner.state.lock().pending.len()
  }

  pub fn outstanding_count(&self) -> usize {
    self.inner.state.lock().outstanding
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.state.lock().cancelled || self.inner.token.is_cancelled()
  }

  pub fn state(&self) -> SchedulerState {
    let state = self.inner.state.lock();
    if state.drained {
      SchedulerState::Drained
    } else if state.closed || self.inner.token.is_cancelled() {
      SchedulerState::Cancelling
    } else {
      SchedulerState::Running
    }
  }

  pub fn stats(&self) -> SchedulerStats {
    self.inner.state.lock().stats
  }

  /// Registers a handler invoked once for every unit that finishes, including
  /// units skipped by cancellation. All invocations have happened by the time
  /// [`wait`](Self::wait) returns.
  pub fn add_completion_handler(&self, handler: impl Fn(UnitCompletionInfo) + Send + Sync + 'static) {
    self.inner.notifier.add_handler(handler);
  }

  fn in_own_unit(&self) -> bool {
    let key = self.inner.key();
    CURRENT_SCHEDULER.try_with(|current| *current == key).unwrap_or(false)
  }

  /// Submits a work unit.
  ///
  /// The unit is counted as outstanding before this future first yields, so
  /// a producer that awaits `submit` can never let [`wait`](Self::wait) see
  /// a transient zero. With a bounded queue this suspends while the queue is
  /// full, except when called from one of this scheduler's own units whose
  /// siblings are all suspended too; then the unit is queued past capacity.
  ///
  /// Submitting to a scheduler that is shut down or cancelled is not an
  /// error: the unit is dropped unrun and [`SubmitOutcome::Rejected`] is
  /// returned.
  ///
  /// # Errors
  /// Returns `SchedulerError::Drained` if [`wait`](Self::wait) already returned.
  pub async fn submit<F, Fut>(&self, unit: F) -> Result<SubmitOutcome, SchedulerError<E>>
  where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
  {
    let inner = &*self.inner;
    let in_unit = self.in_own_unit();

    {
      let mut state = inner.state.lock();
      if state.drained {
        warn!(scheduler = %*inner.name, "Submit: Attempted to submit a work unit to a drained scheduler.");
        return Err(SchedulerError::Drained);
      }
      state.outstanding += 1;
    }
    let mut reservation = SubmitReservation {
      inner,
      armed: true,
      blocked_in_unit: false,
    };
    let work = boxed_unit(unit);

    let admission = loop {
      let space_freed = inner.space_available.notified();
      tokio::pin!(space_freed);
      space_freed.as_mut().enable();

      {
        let mut state = inner.state.lock();
        if reservation.blocked_in_unit {
          state.blocked_in_unit -= 1;
          reservation.blocked_in_unit = false;
        }

        let skipped = inner.observe_external_cancellation(&mut state);
        if state.closed {
          state.stats.rejected += 1;
          break Admission::Rejected(skipped);
        }

        if state.active < inner.concurrency_limit {
          let unit_id = state.allocate_unit_id();
          state.active += 1;
          state.stats.peak_active = state.stats.peak_active.max(state.active);
          reservation.armed = false;
          break Admission::Start(QueuedUnit { unit_id, work });
        }

        let would_stall_every_slot = in_unit && state.blocked_in_unit + 1 >= state.active;
        if !state.pending.is_full() || would_stall_every_slot {
          let unit_id = state.allocate_unit_id();
          if would_stall_every_slot && state.pending.is_full() {
            debug!(scheduler = %*inner.name, %unit_id, "Submit: Queue full but every slot is a blocked submitter. Queueing past capacity.");
          }
          state.pending.push_back(QueuedUnit { unit_id, work });
          reservation.armed = false;
          break Admission::Queued(unit_id);
        }

        if in_unit {
          state.blocked_in_unit += 1;
          reservation.blocked_in_unit = true;
        }
      }

      trace!(scheduler = %*inner.name, in_unit, "Submit: Queue full. Waiting for space.");
      tokio::select! {
        _ = &mut space_freed => {}
        _ = inner.token.cancelled() => {}
      }
    };

    match admission {
      Admission::Start(queued) => {
        let unit_id = queued.unit_id;
        debug!(scheduler = %*inner.name, %unit_id, "Submit: Slot free. Starting work unit.");
        self.spawn_worker(queued);
        Ok(SubmitOutcome::Started(unit_id))
      }
      Admission::Queued(unit_id) => {
        debug!(scheduler = %*inner.name, %unit_id, "Submit: All slots busy. Work unit queued.");
        Ok(SubmitOutcome::Queued(unit_id))
      }
      Admission::Rejected(skipped) => {
        debug!(scheduler = %*inner.name, "Submit: Scheduler is shutting down or cancelled. Work unit rejected.");
        drop(skipped);
        // Releases this submission's share of `outstanding`.
        drop(reservation);
        Ok(SubmitOutcome::Rejected)
      }
    }
  }

  /// Stops accepting new work units. Idempotent; never overrides an already
  /// recorded failure. `Cancel` after `Drain` upgrades to a cancellation.
  pub fn shutdown(&self, mode: ShutdownMode) {
    let inner = &*self.inner;
    let (skipped, idle) = {
      let mut state = inner.state.lock();
      let skipped = match mode {
        ShutdownMode::Drain => {
          if !state.closed {
            info!(scheduler = %*inner.name, "Shutdown (drain): No longer accepting work units. Queued units will still run.");
            state.closed = true;
          } else {
            trace!(scheduler = %*inner.name, "Shutdown (drain): Already closed.");
          }
          Vec::new()
        }
        ShutdownMode::Cancel => inner.cancel_locked(&mut state, "explicit shutdown"),
      };
      (skipped, state.outstanding == 0)
    };
    drop(skipped);
    inner.wake(idle);
  }

  /// Waits until every submitted unit, including units submitted by other
  /// units, has finished or been skipped, and all worker tasks have exited.
  /// Returns the first failure recorded during the run.
  ///
  /// # Errors
  /// - The first unit failure (`Unit`) or panic (`UnitPanicked`).
  /// - `AlreadyWaited` on a second call.
  /// - `WaitFromUnit` when called from inside one of this scheduler's units,
  ///   which could never observe quiescence.
  pub async fn wait(&self) -> Result<(), SchedulerError<E>> {
    let inner = &*self.inner;
    if self.in_own_unit() {
      warn!(scheduler = %*inner.name, "Wait: Called from inside a work unit of the same scheduler.");
      return Err(SchedulerError::WaitFromUnit);
    }

    {
      let mut state = inner.state.lock();
      if state.waited {
        return Err(SchedulerError::AlreadyWaited);
      }
      state.waited = true;
    }
    let mut reservation = WaitReservation { inner, armed: true };

    loop {
      let quiescent = inner.drained.notified();
      tokio::pin!(quiescent);
      quiescent.as_mut().enable();

      {
        let mut state = inner.state.lock();
        if state.outstanding == 0 {
          state.drained = true;
          state.closed = true;
          break;
        }
        trace!(scheduler = %*inner.name, outstanding = state.outstanding, "Wait: Work still outstanding.");
      }

      quiescent.await;
    }

    inner.workers.close();
    inner.workers.wait().await;
    inner.notifier.close_and_flush().await;

    let (first_error, stats) = {
      let mut state = inner.state.lock();
      reservation.armed = false;
      (state.first_error.take(), state.stats)
    };
    info!(
      scheduler = %*inner.name,
      succeeded = stats.succeeded,
      failed = stats.failed,
      panicked = stats.panicked,
      skipped = stats.skipped,
      rejected = stats.rejected,
      "Scheduler drained."
    );

    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn spawn_worker(&self, first: QueuedUnit<E>) {
    let inner = self.inner.clone();
    let span = info_span!("scheduler_worker", scheduler = %*inner.name);
    let tokio_handle = inner.tokio_handle.clone();
    let workers = inner.workers.clone();
    workers.spawn_on(Self::run_worker(inner, first).instrument(span), &tokio_handle);
  }

  /// Body of one worker slot: runs units back to back until the queue is
  /// empty or the scheduler is cancelled, then releases the slot.
  async fn run_worker(inner: Arc<SchedulerInner<E>>, first: QueuedUnit<E>) {
    let key = inner.key();
    let mut next = Some(first);

    while let Some(QueuedUnit { unit_id, work }) = next.take() {
      // A unit admitted as started may still be waiting for its first poll
      // when a sibling fails; it is skipped like a queued one.
      let (cancelled, skipped) = {
        let mut state = inner.state.lock();
        let skipped = inner.observe_external_cancellation(&mut state);
        if !state.cancelled {
          state.stats.started += 1;
        }
        (state.cancelled, skipped)
      };
      drop(skipped);

      let (status, failure) = if cancelled {
        debug!(%unit_id, "Scheduler cancelled before the work unit began. Skipping.");
        drop(work);
        (UnitCompletionStatus::Skipped, None)
      } else {
        trace!(%unit_id, "Work unit starting.");
        let token = inner.token.clone();
        let outcome = CURRENT_SCHEDULER
          .scope(key, AssertUnwindSafe(async move { work(token).await }).catch_unwind())
          .await;

        match outcome {
          Ok(Ok(())) => (UnitCompletionStatus::Succeeded, None),
          Ok(Err(e)) => (UnitCompletionStatus::Failed, Some(SchedulerError::Unit(e))),
          Err(_panic_payload) => {
            warn!(%unit_id, "Work unit panicked.");
            (UnitCompletionStatus::Panicked, Some(SchedulerError::UnitPanicked(unit_id)))
          }
        }
      };

      let (skipped, idle) = {
        let mut state = inner.state.lock();
        match status {
          UnitCompletionStatus::Succeeded => state.stats.succeeded += 1,
          UnitCompletionStatus::Failed => state.stats.failed += 1,
          UnitCompletionStatus::Panicked => state.stats.panicked += 1,
          UnitCompletionStatus::Skipped => state.stats.skipped += 1,
        }

        let mut skipped = match failure {
          Some(err) if state.first_error.is_none() => {
            warn!(%unit_id, "Work unit failed. Recording first error and cancelling.");
            state.first_error = Some(err);
            inner.cancel_locked(&mut state, "work unit failed")
          }
          Some(_) => {
            debug!(%unit_id, "Work unit failed after the first error. Discarding.");
            inner.cancel_locked(&mut state, "work unit failed")
          }
          None => Vec::new(),
        };
        skipped.extend(inner.observe_external_cancellation(&mut state));

        inner.notifier.notify(unit_id, status);
        state.outstanding -= 1;

        next = if state.cancelled { None } else { state.pending.pop_front() };
        if next.is_none() {
          state.active -= 1;
        }
        (skipped, state.outstanding == 0)
      };
      drop(skipped);
      inner.wake(idle);
    }

    trace!("Worker slot released.");
  }
}
