/// Construction-time settings for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
  /// Name used in log fields and completion notifications.
  pub name: String,
  /// Maximum number of work units executing at once. Must be at least 1.
  pub concurrency_limit: usize,
  /// `None` keeps an unbounded pending queue and `submit` never suspends.
  /// `Some(n)` makes `submit` suspend while `n` units are already queued.
  pub queue_capacity: Option<usize>,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      name: "scheduler".to_string(),
      concurrency_limit: num_cpus::get(),
      queue_capacity: None,
    }
  }
}

impl SchedulerConfig {
  pub fn new(concurrency_limit: usize) -> Self {
    Self {
      concurrency_limit,
      ..Default::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_concurrency_limit(mut self, concurrency_limit: usize) -> Self {
    self.concurrency_limit = concurrency_limit;
    self
  }

  pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = Some(capacity);
    self
  }

  pub fn unbounded_queue(mut self) -> Self {
    self.queue_capacity = None;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_uses_available_cpus_and_unbounded_queue() {
    let config = SchedulerConfig::default();
    assert_eq!(config.concurrency_limit, num_cpus::get());
    assert!(config.concurrency_limit >= 1);
    assert_eq!(config.queue_capacity, None);
    assert_eq!(config.name, "scheduler");
  }

  #[test]
  fn test_builder_methods() {
    let config = SchedulerConfig::new(4).with_name("acl").with_queue_capacity(16);
    assert_eq!(config.concurrency_limit, 4);
    assert_eq!(config.name, "acl");
    assert_eq!(config.queue_capacity, Some(16));
    assert_eq!(config.unbounded_queue().queue_capacity, None);
  }
}
