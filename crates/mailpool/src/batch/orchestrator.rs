//! Bounded-concurrency execution of per-account operations

use anyhow::{Context, anyhow};
use chrono::Utc;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::BatchSettings;
use crate::error::{Error, Result};
use crate::models::{BatchProgress, BatchState, ItemRecord, ItemStatus};
use crate::storage::BatchStore;

/// One unit of work in a batch
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    /// Shown in progress listings (usually the account email)
    pub label: String,
    pub payload: T,
}

impl<T> BatchItem<T> {
    pub fn new(label: impl Into<String>, payload: T) -> Self {
        Self {
            label: label.into(),
            payload,
        }
    }
}

/// Runs batches on a worker pool sized to the requested concurrency
pub struct BatchOrchestrator {
    store: Arc<dyn BatchStore>,
    settings: BatchSettings,
}

impl BatchOrchestrator {
    pub fn new(store: Arc<dyn BatchStore>, settings: BatchSettings) -> Self {
        Self { store, settings }
    }

    /// Worker count for a requested concurrency, clamped to `[1, max_concurrency]`
    pub fn clamp_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.settings.default_concurrency)
            .clamp(1, self.settings.max_concurrency.max(1))
    }

    /// Start a batch in the background
    ///
    /// Items are registered as pending before this returns, so the batch
    /// can be queried immediately.
    pub fn submit<T, F, E>(
        &self,
        label: &str,
        items: Vec<BatchItem<T>>,
        concurrency: Option<usize>,
        work: F,
    ) -> Result<BatchHandle>
    where
        T: Send + 'static,
        F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Display,
    {
        let concurrency = self.clamp_concurrency(concurrency);
        let batch_id = self.register(label, &items)?;
        let cancel = Arc::new(AtomicBool::new(false));

        let store = Arc::clone(&self.store);
        let thread_id = batch_id.clone();
        let thread_cancel = Arc::clone(&cancel);
        let spawned = thread::Builder::new()
            .name(format!("mailpool-batch-{}", &batch_id[..8]))
            .spawn(move || {
                execute(
                    store.as_ref(),
                    &thread_id,
                    items,
                    concurrency,
                    &thread_cancel,
                    &work,
                )
            });

        match spawned {
            Ok(join) => Ok(BatchHandle {
                id: batch_id,
                store: Arc::clone(&self.store),
                cancel,
                join: Mutex::new(Some(join)),
            }),
            Err(e) => {
                let _ = self
                    .store
                    .finish_batch(&batch_id, BatchState::Cancelled, Utc::now());
                Err(Error::Storage(
                    anyhow::Error::new(e).context("Failed to spawn batch thread"),
                ))
            }
        }
    }

    /// Run a batch to completion on the calling thread's behalf
    pub fn run<T, F, E>(
        &self,
        label: &str,
        items: Vec<BatchItem<T>>,
        concurrency: Option<usize>,
        work: F,
    ) -> Result<BatchProgress>
    where
        T: Send,
        F: Fn(T) -> std::result::Result<(), E> + Send + Sync,
        E: Display,
    {
        let concurrency = self.clamp_concurrency(concurrency);
        let batch_id = self.register(label, &items)?;
        execute(
            self.store.as_ref(),
            &batch_id,
            items,
            concurrency,
            &AtomicBool::new(false),
            &work,
        )
    }

    /// Progress of any batch still in the store
    pub fn progress(&self, batch_id: &str) -> Result<Option<BatchProgress>> {
        Ok(self.store.load_progress(batch_id)?)
    }

    /// Item rows of a batch, optionally only those with `status`
    pub fn items(&self, batch_id: &str, status: Option<ItemStatus>) -> Result<Vec<ItemRecord>> {
        Ok(self.store.load_items(batch_id, status)?)
    }

    /// Most recently started batches
    pub fn recent(&self, limit: usize) -> Result<Vec<BatchProgress>> {
        Ok(self.store.list_batches(limit)?)
    }

    /// Delete batches that finished more than `max_age` ago
    pub fn purge_finished(&self, max_age: Duration) -> Result<usize> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let purged = self.store.purge_batches(cutoff)?;
        if purged > 0 {
            info!(
                "[BATCH] Purged {} batch(es) finished more than {:?} ago",
                purged, max_age
            );
        }
        Ok(purged)
    }

    fn register<T>(&self, label: &str, items: &[BatchItem<T>]) -> Result<String> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let labels: Vec<String> = items.iter().map(|i| i.label.clone()).collect();
        self.store
            .create_batch(&batch_id, label, &labels, Utc::now())
            .with_context(|| format!("Failed to register batch {}", label))?;
        info!(
            "[BATCH] Started {} '{}' with {} item(s)",
            batch_id,
            label,
            labels.len()
        );
        Ok(batch_id)
    }
}

/// Run every item on a pool of exactly `concurrency` workers
fn execute<T, F, E>(
    store: &dyn BatchStore,
    batch_id: &str,
    items: Vec<BatchItem<T>>,
    concurrency: usize,
    cancel: &AtomicBool,
    work: &F,
) -> Result<BatchProgress>
where
    T: Send,
    F: Fn(T) -> std::result::Result<(), E> + Send + Sync,
    E: Display,
{
    let workers = rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency)
        .thread_name(|i| format!("mailpool-worker-{}", i))
        .build()
        .context("Failed to start batch workers");

    let workers = match workers {
        Ok(workers) => workers,
        Err(e) => {
            let _ = store.finish_batch(batch_id, BatchState::Cancelled, Utc::now());
            return Err(e.into());
        }
    };

    workers.install(|| {
        items
            .into_par_iter()
            .enumerate()
            .for_each(|(index, item)| {
                if cancel.load(Ordering::Acquire) {
                    return;
                }

                let label = item.label;
                let payload = item.payload;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(payload)));
                let (status, error) = match outcome {
                    Ok(Ok(())) => (ItemStatus::Success, None),
                    Ok(Err(e)) => (ItemStatus::Failed, Some(e.to_string())),
                    Err(panic) => (
                        ItemStatus::Failed,
                        Some(format!("panicked: {}", panic_message(panic.as_ref()))),
                    ),
                };

                match &error {
                    Some(reason) => warn!("[BATCH] {} item {} failed: {}", batch_id, label, reason),
                    None => debug!("[BATCH] {} item {} succeeded", batch_id, label),
                }

                if let Err(e) =
                    store.record_outcome(batch_id, index, status, error.as_deref(), Utc::now())
                {
                    warn!(
                        "[BATCH] Could not record outcome of {} item {}: {:#}",
                        batch_id, index, e
                    );
                }
            });
    });

    let progress = store
        .load_progress(batch_id)?
        .ok_or_else(|| anyhow!("batch {} vanished from the store", batch_id))?;

    let state = if cancel.load(Ordering::Acquire) && progress.pending() > 0 {
        BatchState::Cancelled
    } else {
        BatchState::Completed
    };
    store.finish_batch(batch_id, state, Utc::now())?;

    let progress = store
        .load_progress(batch_id)?
        .ok_or_else(|| anyhow!("batch {} vanished from the store", batch_id))?;
    info!(
        "[BATCH] {} {}: {} succeeded, {} failed, {} not run",
        batch_id,
        state.as_str(),
        progress.succeeded,
        progress.failed,
        progress.pending()
    );
    Ok(progress)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a batch running in the background
pub struct BatchHandle {
    id: String,
    store: Arc<dyn BatchStore>,
    cancel: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<Result<BatchProgress>>>>,
}

impl BatchHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current progress, read from the batch store
    pub fn progress(&self) -> Result<BatchProgress> {
        self.store
            .load_progress(&self.id)?
            .ok_or_else(|| Error::Storage(anyhow!("unknown batch {}", self.id)))
    }

    /// Stop starting new items; running items finish normally
    pub fn cancel(&self) {
        debug!("[BATCH] Cancelling {}", self.id);
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Whether the batch reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|join| join.is_finished())
    }

    /// Block until the batch is terminal and return its final progress
    pub fn wait(&self) -> Result<BatchProgress> {
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match join {
            Some(join) => join
                .join()
                .map_err(|_| Error::Storage(anyhow!("batch thread for {} panicked", self.id)))?,
            // Already waited on
            None => self.progress(),
        }
    }
}
