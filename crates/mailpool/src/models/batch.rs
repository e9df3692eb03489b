//! Batch bookkeeping types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one batch item
///
/// Moves from `Pending` to exactly one of the terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Success,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "success" => Some(ItemStatus::Success),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ItemStatus::Pending)
    }
}

/// Lifecycle of a whole batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Running,
    /// Every item resolved
    Completed,
    /// Stopped early; unstarted items stay pending
    Cancelled,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(BatchState::Running),
            "completed" => Some(BatchState::Completed),
            "cancelled" => Some(BatchState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchState::Running)
    }
}

/// Persisted record of one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Position in the submitted list
    pub index: usize,
    /// Human-readable label (account email for per-account batches)
    pub label: String,
    pub status: ItemStatus,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Aggregate view of a batch, derived from its items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub label: String,
    pub state: BatchState,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchProgress {
    /// Items that reached a terminal status
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Items not yet started or still running
    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.processed())
    }

    /// Fraction of items processed, 1.0 for an empty batch
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.processed() as f64 / self.total as f64
        }
    }
}
