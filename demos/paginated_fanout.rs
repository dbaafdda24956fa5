//! Walks a paginated object listing and applies a canned permission value to
//! every object, one work unit per object, with a single producer unit
//! driving the pagination.

use fanout_pool::{Scheduler, SchedulerConfig, ShutdownMode, UnitCompletionInfo, UnitCompletionStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Error, Debug)]
enum ItemError {
  #[error("Failed to list objects under {prefix:?}: {reason}")]
  Listing { prefix: String, reason: String },
  #[error("Failed to get permissions: {key}")]
  GetPermissions { key: String },
  #[error("Failed to change permissions: {key}")]
  PutPermissions { key: String },
  #[error("Cancelled while processing {key}")]
  Cancelled { key: String },
  #[error("Failed to schedule {key}: {reason}")]
  Scheduling { key: String, reason: String },
}

/// In-memory stand-in for a bucket: object keys mapped to permission values.
struct ObjectStore {
  objects: parking_lot::Mutex<HashMap<String, String>>,
  page_size: usize,
}

impl ObjectStore {
  fn with_objects(count: usize, page_size: usize) -> Self {
    let objects = (0..count)
      .map(|i| (format!("photos/2024/img_{:04}.jpg", i), "private".to_string()))
      .collect();
    Self {
      objects: parking_lot::Mutex::new(objects),
      page_size,
    }
  }

  /// Returns one page of keys under `prefix` and whether more pages follow.
  async fn list_page(&self, prefix: &str, page: usize) -> Result<(Vec<String>, bool), ItemError> {
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut keys: Vec<String> = self
      .objects
      .lock()
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    keys.sort();
    let start = page * self.page_size;
    if start > keys.len() {
      return Err(ItemError::Listing {
        prefix: prefix.to_string(),
        reason: format!("page {} out of range", page),
      });
    }
    let end = (start + self.page_size).min(keys.len());
    Ok((keys[start..end].to_vec(), end < keys.len()))
  }

  async fn get_permissions(&self, key: &str, ctx: &CancellationToken) -> Result<String, ItemError> {
    tokio::select! {
      _ = ctx.cancelled() => Err(ItemError::Cancelled { key: key.to_string() }),
      _ = tokio::time::sleep(Duration::from_millis(5)) => self
        .objects
        .lock()
        .get(key)
        .cloned()
        .ok_or_else(|| ItemError::GetPermissions { key: key.to_string() }),
    }
  }

  async fn put_permissions(&self, key: &str, acl: &str, ctx: &CancellationToken) -> Result<(), ItemError> {
    tokio::select! {
      _ = ctx.cancelled() => Err(ItemError::Cancelled { key: key.to_string() }),
      _ = tokio::time::sleep(Duration::from_millis(5)) => {
        match self.objects.lock().get_mut(key) {
          Some(current) => {
            *current = acl.to_string();
            Ok(())
          }
          None => Err(ItemError::PutPermissions { key: key.to_string() }),
        }
      }
    }
  }
}

struct DemoOptions {
  prefix: String,
  acl: String,
  dry_run: bool,
  concurrency: usize,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  let options = DemoOptions {
    prefix: "photos/".to_string(),
    acl: "public-read".to_string(),
    dry_run: std::env::var("DRYRUN").map(|v| v != "0").unwrap_or(true),
    concurrency: num_cpus::get(),
  };
  let store = Arc::new(ObjectStore::with_objects(57, 10));

  let scheduler: Scheduler<ItemError> = Scheduler::new(
    SchedulerConfig::new(options.concurrency).with_name("acl_updater"),
    CancellationToken::new(),
    Handle::current(),
  )
  .expect("invalid scheduler configuration");

  let processed = Arc::new(AtomicUsize::new(0));
  let processed_by_handler = processed.clone();
  // Every unit that was started counts, whether it succeeded or not.
  scheduler.add_completion_handler(move |completion: UnitCompletionInfo| {
    if completion.status != UnitCompletionStatus::Skipped {
      processed_by_handler.fetch_add(1, Ordering::SeqCst);
    }
  });

  let producer = scheduler.clone();
  let producer_store = store.clone();
  let prefix = options.prefix.clone();
  let acl = Arc::new(options.acl.clone());
  let dry_run = options.dry_run;
  scheduler
    .submit(move |_ctx| async move {
      let mut page = 0;
      loop {
        let listed = producer_store.list_page(&prefix, page).await;
        let (keys, more) = match listed {
          Ok(listed) => listed,
          Err(e) => {
            producer.shutdown(ShutdownMode::Drain);
            return Err(e);
          }
        };

        for key in keys {
          let store = producer_store.clone();
          let acl = acl.clone();
          let unit_key = key.clone();
          let submitted = producer
            .submit(move |ctx| async move {
              let key = unit_key;
              if dry_run {
                info!("[DRYRUN] Updating {:?}", key);
                store.get_permissions(&key, &ctx).await.map(|_| ())
              } else {
                info!("Updating {:?}", key);
                store.put_permissions(&key, &acl, &ctx).await
              }
            })
            .await;
          match submitted {
            Ok(outcome) if outcome.is_rejected() => {
              info!("Scheduler stopped accepting work, ending listing.");
              return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
              return Err(ItemError::Scheduling {
                key,
                reason: e.to_string(),
              });
            }
          }
        }

        info!("Listed page {}", page);
        if !more {
          break;
        }
        page += 1;
      }
      producer.shutdown(ShutdownMode::Drain);
      Ok(())
    })
    .await
    .expect("scheduler rejected the producer");

  if let Err(e) = scheduler.wait().await {
    tracing::error!("{}", e);
    std::process::exit(1);
  }

  // The producer unit itself is counted too.
  let updated = processed.load(Ordering::SeqCst).saturating_sub(1);
  info!("Updated permissions on {} objects", updated);
}
