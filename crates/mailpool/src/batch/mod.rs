//! Bulk per-account operations at capped concurrency
//!
//! A batch is a list of independent items. Each item runs once on one
//! worker; its outcome is written to the [`BatchStore`](crate::storage::BatchStore)
//! as soon as it resolves, so progress can be polled while the batch runs
//! and loaded by id afterwards.

mod orchestrator;

pub use orchestrator::{BatchHandle, BatchItem, BatchOrchestrator};
