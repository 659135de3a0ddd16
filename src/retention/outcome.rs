use std::time::Duration;

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while configuring or running a cleanup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CleanupError {
    /// Invalid policy or run limits. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The database or blob store could not be reached. Fails the run.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Some blob deletes in a batch failed; their records were kept.
    #[error("{failed} of {attempted} blob deletes failed for class '{retention_class}'")]
    PartialPurgeFailure {
        retention_class: String,
        failed: usize,
        attempted: usize,
    },

    /// The time budget ran out with stale records remaining.
    #[error("Deadline exceeded with stale records remaining")]
    DeadlineExceeded,
}

impl CleanupError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CleanupError::Configuration(_) => "configuration",
            CleanupError::StorageUnavailable(_) => "storage_unavailable",
            CleanupError::PartialPurgeFailure { .. } => "partial_purge_failure",
            CleanupError::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    DeadlineExceeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::DeadlineExceeded => "deadline_exceeded",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::DeadlineExceeded | RunState::Failed
        )
    }
}

/// Terse status reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failure,
}

/// Aggregate result of one run. Built fresh per invocation and never
/// persisted.
#[derive(Debug, Clone)]
pub struct CleanupOutcome {
    pub state: RunState,
    /// Records of every configured class present when its pass started.
    pub records_examined: u64,
    /// Stale records located, whether or not they were deleted.
    pub records_eligible: u64,
    pub blobs_deleted: u64,
    pub blob_failures: u64,
    pub records_deleted: u64,
    /// Stale records kept because one of their blobs could not be deleted.
    pub records_retained: u64,
    /// Batch-level errors plus the error that failed the run, if any.
    pub errors: Vec<CleanupError>,
    pub dry_run: bool,
    pub duration: Duration,
}

impl Default for CleanupOutcome {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            records_examined: 0,
            records_eligible: 0,
            blobs_deleted: 0,
            blob_failures: 0,
            records_deleted: 0,
            records_retained: 0,
            errors: Vec::new(),
            dry_run: false,
            duration: Duration::ZERO,
        }
    }
}

impl CleanupOutcome {
    /// Start a run.
    pub fn running(dry_run: bool) -> Self {
        Self {
            state: RunState::Running,
            dry_run,
            ..Default::default()
        }
    }

    /// Move to a terminal state from the result of the batch loop.
    pub fn finish(&mut self, result: Result<(), CleanupError>, duration: Duration) {
        self.duration = duration;
        self.state = match result {
            Ok(()) => RunState::Completed,
            Err(CleanupError::DeadlineExceeded) => RunState::DeadlineExceeded,
            Err(err) => {
                self.errors.push(err);
                RunState::Failed
            }
        };
    }

    pub fn status(&self) -> RunStatus {
        match self.state {
            RunState::Completed if self.errors.is_empty() => RunStatus::Success,
            RunState::Completed | RunState::DeadlineExceeded => RunStatus::Partial,
            RunState::Idle | RunState::Running | RunState::Failed => RunStatus::Failure,
        }
    }

    /// Whether the caller should treat the run as failed.
    pub fn is_failure(&self) -> bool {
        match self.state {
            RunState::Completed => false,
            RunState::DeadlineExceeded => !self.errors.is_empty(),
            RunState::Idle | RunState::Running | RunState::Failed => true,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        if self.is_failure() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    /// Response body with counts only.
    pub fn summary(&self) -> CleanupSummary {
        CleanupSummary {
            status: self.status(),
            state: self.state,
            records_examined: self.records_examined,
            records_eligible: self.records_eligible,
            blobs_deleted: self.blobs_deleted,
            blob_failures: self.blob_failures,
            records_deleted: self.records_deleted,
            records_retained: self.records_retained,
            errors: self.errors.len(),
            dry_run: self.dry_run,
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Serialized form of a [`CleanupOutcome`].
#[derive(Debug, Clone, Serialize)]
pub struct CleanupSummary {
    pub status: RunStatus,
    pub state: RunState,
    pub records_examined: u64,
    pub records_eligible: u64,
    pub blobs_deleted: u64,
    pub blob_failures: u64,
    pub records_deleted: u64,
    pub records_retained: u64,
    pub errors: usize,
    pub dry_run: bool,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn partial() -> CleanupError {
        CleanupError::PartialPurgeFailure {
            retention_class: "exposure".into(),
            failed: 1,
            attempted: 2,
        }
    }

    fn finished(result: Result<(), CleanupError>, batch_errors: usize) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::running(false);
        outcome.errors.extend(std::iter::repeat_n(partial(), batch_errors));
        outcome.finish(result, Duration::from_millis(42));
        outcome
    }

    #[rstest]
    #[case::clean(Ok(()), 0, RunState::Completed, RunStatus::Success, StatusCode::OK)]
    #[case::completed_with_errors(Ok(()), 1, RunState::Completed, RunStatus::Partial, StatusCode::OK)]
    #[case::clean_deadline(
        Err(CleanupError::DeadlineExceeded),
        0,
        RunState::DeadlineExceeded,
        RunStatus::Partial,
        StatusCode::OK
    )]
    #[case::deadline_with_errors(
        Err(CleanupError::DeadlineExceeded),
        2,
        RunState::DeadlineExceeded,
        RunStatus::Partial,
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    #[case::failed(
        Err(CleanupError::StorageUnavailable("db down".into())),
        0,
        RunState::Failed,
        RunStatus::Failure,
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    fn test_terminal_mapping(
        #[case] result: Result<(), CleanupError>,
        #[case] batch_errors: usize,
        #[case] state: RunState,
        #[case] status: RunStatus,
        #[case] http_status: StatusCode,
    ) {
        let outcome = finished(result, batch_errors);
        assert_eq!(outcome.state, state);
        assert_eq!(outcome.status(), status);
        assert_eq!(outcome.http_status(), http_status);
    }

    #[test]
    fn test_failure_is_recorded_in_errors() {
        let outcome = finished(Err(CleanupError::StorageUnavailable("db".into())), 1);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[1].kind(), "storage_unavailable");
    }

    #[test]
    fn test_deadline_is_not_counted_as_error() {
        let outcome = finished(Err(CleanupError::DeadlineExceeded), 0);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn test_summary_json() {
        let mut outcome = CleanupOutcome::running(false);
        outcome.records_examined = 3;
        outcome.records_deleted = 2;
        outcome.blobs_deleted = 2;
        outcome.finish(Ok(()), Duration::from_millis(1500));

        let json = serde_json::to_value(outcome.summary()).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["state"], "completed");
        assert_eq!(json["records_examined"], 3);
        assert_eq!(json["records_deleted"], 2);
        assert_eq!(json["errors"], 0);
        assert_eq!(json["duration_ms"], 1500);
    }

    #[test]
    fn test_unfinished_run_is_failure() {
        let outcome = CleanupOutcome::running(false);
        assert!(!outcome.state.is_terminal());
        assert!(outcome.is_failure());
    }
}
