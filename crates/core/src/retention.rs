//! Retention policy definitions and pass reporting.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What happens to base data past its age thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    /// Drop whole partitions once they pass `max_age`.
    #[default]
    Delete,
    /// First replace raw rows with hourly summaries at `downsample_age`,
    /// then drop the (by then downsampled) partitions at `max_age`.
    DownsampleThenDelete,
}

/// Retention policy for one base stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age_hours: u64,
    #[serde(default)]
    pub action: RetentionAction,
    /// Required for `DownsampleThenDelete`; must precede `max_age`.
    #[serde(default)]
    pub downsample_after_hours: Option<u64>,
}

impl RetentionPolicy {
    /// Delete-only policy.
    pub fn delete_after(max_age_hours: u64) -> Self {
        Self {
            max_age_hours,
            action: RetentionAction::Delete,
            downsample_after_hours: None,
        }
    }

    /// Downsample-then-delete policy.
    pub fn downsample_then_delete(downsample_after_hours: u64, max_age_hours: u64) -> Self {
        Self {
            max_age_hours,
            action: RetentionAction::DownsampleThenDelete,
            downsample_after_hours: Some(downsample_after_hours),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_age_hours == 0 {
            return Err(Error::validation("retention max_age must be positive"));
        }
        match self.action {
            RetentionAction::Delete => Ok(()),
            RetentionAction::DownsampleThenDelete => match self.downsample_after_hours {
                None => Err(Error::validation(
                    "downsample_then_delete requires downsample_after_hours",
                )),
                Some(age) if age == 0 => {
                    Err(Error::validation("downsample age must be positive"))
                }
                Some(age) if age >= self.max_age_hours => Err(Error::validation(
                    "downsample age must precede max_age",
                )),
                Some(_) => Ok(()),
            },
        }
    }

    pub fn downsamples(&self) -> bool {
        self.action == RetentionAction::DownsampleThenDelete
    }
}

/// Counts from one retention pass, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub partitions_dropped: u64,
    pub partitions_downsampled: u64,
    /// Partitions skipped because a live recompute snapshot pinned them.
    pub partitions_deferred: u64,
    pub rows_deleted: u64,
    pub summary_rows_written: u64,
    pub aggregate_rows_pruned: u64,
}

impl RetentionReport {
    /// Folds another report into this one.
    pub fn absorb(&mut self, other: &RetentionReport) {
        self.partitions_dropped += other.partitions_dropped;
        self.partitions_downsampled += other.partitions_downsampled;
        self.partitions_deferred += other.partitions_deferred;
        self.rows_deleted += other.rows_deleted;
        self.summary_rows_written += other.summary_rows_written;
        self.aggregate_rows_pruned += other.aggregate_rows_pruned;
    }

    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}
