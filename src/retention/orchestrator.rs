use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    BlobPurger, CleanupError, CleanupOutcome, RecordLocator, RecordPurger, RepoRecordStore,
    RetentionPolicy,
};
use crate::{
    config::RetentionConfig,
    db::{Cursor, ExposureRepo, truncate_to_millis},
    models::{BlobReference, ExposureRecord},
    observability::metrics,
    services::BlobStore,
};

/// Runs one cleanup to completion or until the deadline.
#[async_trait]
pub trait CleanupOrchestrator: Send + Sync {
    /// Always returns a terminal outcome; failures are reported in it.
    async fn run(&self, deadline: Instant) -> CleanupOutcome;
}

/// Per-run limits.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub batch_size: u32,
    pub dry_run: bool,
}

impl From<&RetentionConfig> for RunLimits {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            dry_run: config.dry_run,
        }
    }
}

/// Production orchestrator: locate, purge blobs, then purge the records whose
/// blobs are confirmed gone, batch by batch and class by class.
pub struct RetentionOrchestrator<L, P> {
    policy: RetentionPolicy,
    locator: L,
    purger: P,
    blobs: BlobPurger,
    limits: RunLimits,
}

impl RetentionOrchestrator<RepoRecordStore, RepoRecordStore> {
    /// Wire the orchestrator to the exposure repository and blob store.
    pub fn from_config(
        config: &RetentionConfig,
        repo: Arc<dyn ExposureRepo>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Result<Self, CleanupError> {
        let policy = RetentionPolicy::from_days(&config.windows)?;
        let store = RepoRecordStore::new(repo);
        Ok(Self::new(
            policy,
            store.clone(),
            store,
            BlobPurger::new(blob_store, config.blob_concurrency),
            RunLimits::from(config),
        ))
    }
}

impl<L, P> RetentionOrchestrator<L, P>
where
    L: RecordLocator,
    P: RecordPurger,
{
    pub fn new(
        policy: RetentionPolicy,
        locator: L,
        purger: P,
        blobs: BlobPurger,
        limits: RunLimits,
    ) -> Self {
        Self {
            policy,
            locator,
            purger,
            blobs,
            limits,
        }
    }

    async fn run_classes(
        &self,
        now: DateTime<Utc>,
        deadline: Instant,
        outcome: &mut CleanupOutcome,
    ) -> Result<(), CleanupError> {
        for class in self.policy.classes() {
            let Some(cutoff) = self.policy.cutoff_for(class, now) else {
                continue;
            };
            if Instant::now() >= deadline {
                return Err(CleanupError::DeadlineExceeded);
            }

            outcome.records_examined += self.locator.count_class(class).await?;
            tracing::debug!(retention_class = class, cutoff = %cutoff, "Starting class pass");

            let mut after: Option<Cursor> = None;
            loop {
                let batch = self
                    .locator
                    .next_batch(class, cutoff, after.as_ref(), self.limits.batch_size)
                    .await?;
                if let Some(last) = batch.records.last() {
                    after = Some(Cursor::after(last));
                }

                self.process_batch(class, &batch.records, outcome).await?;

                if !batch.has_more {
                    break;
                }
                // A batch in flight always finishes; the budget is only
                // checked between batches.
                if Instant::now() >= deadline {
                    return Err(CleanupError::DeadlineExceeded);
                }
            }
        }
        Ok(())
    }

    async fn process_batch(
        &self,
        class: &str,
        records: &[ExposureRecord],
        outcome: &mut CleanupOutcome,
    ) -> Result<(), CleanupError> {
        if records.is_empty() {
            return Ok(());
        }
        outcome.records_eligible += records.len() as u64;

        if self.limits.dry_run {
            tracing::info!(
                retention_class = class,
                records = records.len(),
                "DRY RUN: Would delete stale records"
            );
            return Ok(());
        }

        let refs: Vec<BlobReference> = records
            .iter()
            .flat_map(|r| r.blobs.iter().cloned())
            .collect();
        let report = self.blobs.delete_blobs(&refs).await?;
        outcome.blobs_deleted += report.deleted;
        outcome.blob_failures += report.failed.len() as u64;

        let failed: HashSet<&BlobReference> = report.failed.iter().collect();
        let (purgeable, retained): (Vec<&ExposureRecord>, Vec<&ExposureRecord>) = records
            .iter()
            .partition(|r| r.blobs.iter().all(|b| !failed.contains(b)));

        if !retained.is_empty() {
            tracing::warn!(
                retention_class = class,
                retained = retained.len(),
                failed_blobs = report.failed.len(),
                "Keeping records whose blobs could not be deleted"
            );
            outcome.records_retained += retained.len() as u64;
            outcome.errors.push(CleanupError::PartialPurgeFailure {
                retention_class: class.to_string(),
                failed: report.failed.len(),
                attempted: report.attempted(),
            });
        }

        let ids: Vec<Uuid> = purgeable.iter().map(|r| r.id).collect();
        if !ids.is_empty() {
            let deleted = self.purger.delete_records(&ids).await?;
            outcome.records_deleted += deleted;
            tracing::debug!(
                retention_class = class,
                deleted,
                blobs_deleted = report.deleted,
                "Purged batch"
            );
        }

        Ok(())
    }
}

#[async_trait]
impl<L, P> CleanupOrchestrator for RetentionOrchestrator<L, P>
where
    L: RecordLocator,
    P: RecordPurger,
{
    async fn run(&self, deadline: Instant) -> CleanupOutcome {
        let started = std::time::Instant::now();
        let now = truncate_to_millis(Utc::now());
        let mut outcome = CleanupOutcome::running(self.limits.dry_run);

        tracing::info!(
            classes = ?self.policy.classes().collect::<Vec<_>>(),
            batch_size = self.limits.batch_size,
            dry_run = self.limits.dry_run,
            "Starting cleanup run"
        );

        let result = self.run_classes(now, deadline, &mut outcome).await;
        outcome.finish(result, started.elapsed());

        if outcome.is_failure() {
            tracing::error!(
                state = outcome.state.as_str(),
                errors = outcome.errors.len(),
                last_error = ?outcome.errors.last().map(ToString::to_string),
                records_deleted = outcome.records_deleted,
                "Cleanup run failed"
            );
        } else {
            tracing::info!(
                state = outcome.state.as_str(),
                records_examined = outcome.records_examined,
                records_deleted = outcome.records_deleted,
                records_retained = outcome.records_retained,
                blobs_deleted = outcome.blobs_deleted,
                blob_failures = outcome.blob_failures,
                duration_ms = outcome.duration.as_millis() as u64,
                "Cleanup run finished"
            );
        }
        metrics::record_cleanup_run(&outcome);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        models::StaleBatch,
        retention::outcome::{RunState, RunStatus},
        services::MemoryBlobStore,
    };

    #[derive(Default)]
    struct MemoryState {
        records: Mutex<Vec<ExposureRecord>>,
        located: Mutex<Vec<DateTime<Utc>>>,
        purge_calls: Mutex<usize>,
        unavailable: AtomicBool,
    }

    /// In-memory record store standing in for the database.
    #[derive(Clone, Default)]
    struct MemoryRecordStore {
        inner: Arc<MemoryState>,
    }

    impl MemoryRecordStore {
        fn insert(&self, class: &str, age: chrono::Duration, blobs: usize) -> ExposureRecord {
            let id = Uuid::new_v4();
            let record = ExposureRecord {
                id,
                created_at: truncate_to_millis(Utc::now() - age),
                retention_class: class.to_string(),
                blobs: (0..blobs)
                    .map(|i| BlobReference::new("exports", format!("{id}/{i}.zip")))
                    .collect(),
            };
            self.inner.records.lock().unwrap().push(record.clone());
            record
        }

        fn contains(&self, id: Uuid) -> bool {
            self.inner.records.lock().unwrap().iter().any(|r| r.id == id)
        }

        fn len(&self) -> usize {
            self.inner.records.lock().unwrap().len()
        }

        fn located(&self) -> Vec<DateTime<Utc>> {
            self.inner.located.lock().unwrap().clone()
        }

        fn purge_calls(&self) -> usize {
            *self.inner.purge_calls.lock().unwrap()
        }

        fn set_unavailable(&self, unavailable: bool) {
            self.inner.unavailable.store(unavailable, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), CleanupError> {
            if self.inner.unavailable.load(Ordering::SeqCst) {
                return Err(CleanupError::StorageUnavailable("memory store offline".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RecordLocator for MemoryRecordStore {
        async fn count_class(&self, retention_class: &str) -> Result<u64, CleanupError> {
            self.check()?;
            let records = self.inner.records.lock().unwrap();
            Ok(records
                .iter()
                .filter(|r| r.retention_class == retention_class)
                .count() as u64)
        }

        async fn next_batch(
            &self,
            retention_class: &str,
            cutoff: DateTime<Utc>,
            after: Option<&Cursor>,
            max_batch_size: u32,
        ) -> Result<StaleBatch, CleanupError> {
            self.check()?;
            let mut stale: Vec<ExposureRecord> = self
                .inner
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.retention_class == retention_class && r.created_at < cutoff)
                .filter(|r| after.is_none_or(|c| (r.created_at, r.id) > (c.created_at, c.id)))
                .cloned()
                .collect();
            stale.sort_by_key(|r| (r.created_at, r.id));

            let has_more = stale.len() > max_batch_size as usize;
            stale.truncate(max_batch_size as usize);
            self.inner
                .located
                .lock()
                .unwrap()
                .extend(stale.iter().map(|r| r.created_at));
            Ok(StaleBatch {
                records: stale,
                has_more,
            })
        }
    }

    #[async_trait]
    impl RecordPurger for MemoryRecordStore {
        async fn delete_records(&self, ids: &[Uuid]) -> Result<u64, CleanupError> {
            self.check()?;
            *self.inner.purge_calls.lock().unwrap() += 1;
            let mut records = self.inner.records.lock().unwrap();
            let before = records.len();
            records.retain(|r| !ids.contains(&r.id));
            Ok((before - records.len()) as u64)
        }
    }

    struct Fixture {
        records: MemoryRecordStore,
        blobs: Arc<MemoryBlobStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                records: MemoryRecordStore::default(),
                blobs: Arc::new(MemoryBlobStore::new()),
            }
        }

        /// Insert a record whose blobs exist in the blob store.
        fn seed(&self, class: &str, days_ago: i64, blobs: usize) -> ExposureRecord {
            let record = self
                .records
                .insert(class, chrono::Duration::days(days_ago), blobs);
            for blob in &record.blobs {
                self.blobs.put(blob.clone());
            }
            record
        }

        fn orchestrator(
            &self,
            windows: &[(&str, i64)],
            batch_size: u32,
            dry_run: bool,
        ) -> RetentionOrchestrator<MemoryRecordStore, MemoryRecordStore> {
            let windows: BTreeMap<String, i64> =
                windows.iter().map(|(k, v)| (k.to_string(), *v)).collect();
            RetentionOrchestrator::new(
                RetentionPolicy::from_days(&windows).unwrap(),
                self.records.clone(),
                self.records.clone(),
                BlobPurger::new(self.blobs.clone(), 4),
                RunLimits {
                    batch_size,
                    dry_run,
                },
            )
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_deletes_only_records_past_window() {
        let fx = Fixture::new();
        let old = fx.seed("exposure", 100, 1);
        let older_than_window = fx.seed("exposure", 40, 1);
        let fresh = fx.seed("exposure", 5, 1);

        let outcome = fx
            .orchestrator(&[("exposure", 30)], 100, false)
            .run(far_deadline())
            .await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.status(), RunStatus::Success);
        assert_eq!(outcome.records_examined, 3);
        assert_eq!(outcome.records_deleted, 2);
        assert_eq!(outcome.blobs_deleted, 2);
        assert!(!fx.records.contains(old.id));
        assert!(!fx.records.contains(older_than_window.id));
        assert!(fx.records.contains(fresh.id));
        assert!(!fx.blobs.contains(&old.blobs[0]));
        assert!(fx.blobs.contains(&fresh.blobs[0]));
    }

    #[tokio::test]
    async fn test_blob_failure_retains_record_until_rerun() {
        let fx = Fixture::new();
        let ok = fx.seed("exposure", 60, 1);
        let stuck = fx.seed("exposure", 50, 1);
        fx.blobs.fail_on(stuck.blobs[0].clone());
        let orchestrator = fx.orchestrator(&[("exposure", 30)], 100, false);

        let first = orchestrator.run(far_deadline()).await;
        assert_eq!(first.state, RunState::Completed);
        assert_eq!(first.status(), RunStatus::Partial);
        assert_eq!(first.http_status(), http::StatusCode::OK);
        assert_eq!(first.blob_failures, 1);
        assert_eq!(first.records_deleted, 1);
        assert_eq!(first.records_retained, 1);
        assert!(matches!(
            first.errors.as_slice(),
            [CleanupError::PartialPurgeFailure { failed: 1, .. }]
        ));
        assert!(!fx.records.contains(ok.id));
        assert!(fx.records.contains(stuck.id));

        fx.blobs.heal();
        let second = orchestrator.run(far_deadline()).await;
        assert_eq!(second.status(), RunStatus::Success);
        assert_eq!(second.records_deleted, 1);
        assert_eq!(second.blobs_deleted, 1);
        assert_eq!(fx.records.len(), 0);
        assert_eq!(fx.blobs.len(), 0);
    }

    #[tokio::test]
    async fn test_record_kept_when_any_of_its_blobs_fails() {
        let fx = Fixture::new();
        let record = fx.seed("exposure", 90, 3);
        fx.blobs.fail_on(record.blobs[1].clone());

        let outcome = fx
            .orchestrator(&[("exposure", 30)], 100, false)
            .run(far_deadline())
            .await;

        assert_eq!(outcome.records_deleted, 0);
        assert_eq!(outcome.blobs_deleted, 2);
        assert!(fx.records.contains(record.id));
        assert!(fx.blobs.contains(&record.blobs[1]));
        assert_eq!(fx.records.purge_calls(), 0);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let fx = Fixture::new();
        for days in [90, 80, 70, 3] {
            fx.seed("exposure", days, 2);
        }
        let orchestrator = fx.orchestrator(&[("exposure", 30)], 2, false);

        let first = orchestrator.run(far_deadline()).await;
        assert_eq!(first.records_deleted, 3);
        let calls_after_first = fx.blobs.delete_calls();

        let second = orchestrator.run(far_deadline()).await;
        assert_eq!(second.state, RunState::Completed);
        assert_eq!(second.records_deleted, 0);
        assert_eq!(second.blobs_deleted, 0);
        assert_eq!(second.records_examined, 1);
        assert_eq!(fx.blobs.delete_calls(), calls_after_first);
    }

    #[tokio::test]
    async fn test_records_near_cutoff() {
        let fx = Fixture::new();
        let inside = fx
            .records
            .insert("exposure", chrono::Duration::days(30) - chrono::Duration::minutes(1), 0);
        let outside = fx
            .records
            .insert("exposure", chrono::Duration::days(30) + chrono::Duration::minutes(1), 0);

        let outcome = fx
            .orchestrator(&[("exposure", 30)], 100, false)
            .run(far_deadline())
            .await;

        assert_eq!(outcome.records_deleted, 1);
        assert!(fx.records.contains(inside.id));
        assert!(!fx.records.contains(outside.id));
    }

    #[tokio::test]
    async fn test_batches_visit_oldest_first() {
        let fx = Fixture::new();
        for days in [45, 200, 31, 120, 60, 365, 90] {
            fx.seed("exposure", days, 1);
        }

        let outcome = fx
            .orchestrator(&[("exposure", 30)], 2, false)
            .run(far_deadline())
            .await;

        assert_eq!(outcome.records_deleted, 7);
        assert_eq!(fx.records.purge_calls(), 4);
        let located = fx.records.located();
        assert_eq!(located.len(), 7);
        assert!(located.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_deadline_stops_between_batches_and_rerun_finishes() {
        let fx = Fixture::new();
        for days in [50, 49, 48, 47, 46] {
            fx.seed("exposure", days, 1);
        }
        fx.blobs.set_delete_latency(Duration::from_millis(30));
        let orchestrator = fx.orchestrator(&[("exposure", 30)], 1, false);

        let first = orchestrator
            .run(Instant::now() + Duration::from_millis(50))
            .await;
        assert_eq!(first.state, RunState::DeadlineExceeded);
        assert_eq!(first.http_status(), http::StatusCode::OK);
        assert!(first.records_deleted >= 1);
        assert!(first.records_deleted < 5);

        let second = orchestrator.run(far_deadline()).await;
        assert_eq!(second.state, RunState::Completed);
        assert_eq!(first.records_deleted + second.records_deleted, 5);
        assert_eq!(fx.records.len(), 0);
    }

    #[tokio::test]
    async fn test_expired_deadline_does_no_work() {
        let fx = Fixture::new();
        fx.seed("exposure", 90, 1);

        let outcome = fx
            .orchestrator(&[("exposure", 30)], 10, false)
            .run(Instant::now())
            .await;

        assert_eq!(outcome.state, RunState::DeadlineExceeded);
        assert_eq!(outcome.records_deleted, 0);
        assert_eq!(fx.blobs.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_database_unavailable_fails_run() {
        let fx = Fixture::new();
        fx.seed("exposure", 90, 1);
        fx.records.set_unavailable(true);

        let outcome = fx
            .orchestrator(&[("exposure", 30)], 10, false)
            .run(far_deadline())
            .await;

        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.status(), RunStatus::Failure);
        assert_eq!(
            outcome.http_status(),
            http::StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_blob_store_unavailable_keeps_records() {
        let fx = Fixture::new();
        let record = fx.seed("exposure", 90, 2);
        fx.blobs.set_unavailable(true);

        let outcome = fx
            .orchestrator(&[("exposure", 30)], 10, false)
            .run(far_deadline())
            .await;

        assert_eq!(outcome.state, RunState::Failed);
        assert!(matches!(
            outcome.errors.as_slice(),
            [CleanupError::StorageUnavailable(_)]
        ));
        assert!(fx.records.contains(record.id));
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let fx = Fixture::new();
        fx.seed("exposure", 90, 1);
        fx.seed("exposure", 60, 1);
        fx.seed("exposure", 1, 1);

        let outcome = fx
            .orchestrator(&[("exposure", 30)], 1, true)
            .run(far_deadline())
            .await;

        assert_eq!(outcome.state, RunState::Completed);
        assert!(outcome.dry_run);
        assert_eq!(outcome.records_eligible, 2);
        assert_eq!(outcome.records_deleted, 0);
        assert_eq!(fx.blobs.delete_calls(), 0);
        assert_eq!(fx.records.len(), 3);
    }

    #[tokio::test]
    async fn test_records_without_blobs_are_deleted() {
        let fx = Fixture::new();
        fx.seed("exposure", 90, 0);

        let outcome = fx
            .orchestrator(&[("exposure", 30)], 10, false)
            .run(far_deadline())
            .await;

        assert_eq!(outcome.records_deleted, 1);
        assert_eq!(fx.blobs.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_each_class_uses_its_own_window() {
        let fx = Fixture::new();
        let export_fresh = fx.seed("export", 60, 1);
        let export_stale = fx.seed("export", 100, 1);
        let exposure_stale = fx.seed("exposure", 20, 1);
        let unmanaged = fx.seed("legacy", 1000, 1);

        let outcome = fx
            .orchestrator(&[("export", 90), ("exposure", 14)], 10, false)
            .run(far_deadline())
            .await;

        assert_eq!(outcome.records_examined, 3);
        assert_eq!(outcome.records_deleted, 2);
        assert!(fx.records.contains(export_fresh.id));
        assert!(!fx.records.contains(export_stale.id));
        assert!(!fx.records.contains(exposure_stale.id));
        assert!(fx.records.contains(unmanaged.id));
    }

    #[cfg(feature = "database-sqlite")]
    #[tokio::test]
    async fn test_sqlite_backed_run() {
        use crate::{
            db::{
                sqlite::SqliteExposureRepo,
                tests::harness::{create_sqlite_pool, run_sqlite_migrations},
            },
            models::CreateExposure,
        };

        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        let repo: Arc<dyn ExposureRepo> = Arc::new(SqliteExposureRepo::new(pool));
        let blobs = Arc::new(MemoryBlobStore::new());

        let now = truncate_to_millis(Utc::now());
        let mut fresh_id = None;
        for days in [100, 40, 5] {
            let input = CreateExposure::new("exposure", now - chrono::Duration::days(days))
                .with_blob("exports", format!("{days}.zip"));
            blobs.put(input.blobs[0].clone());
            let record = repo.create(input).await.unwrap();
            if days == 5 {
                fresh_id = Some(record.id);
            }
        }

        let config = RetentionConfig {
            windows: [("exposure".to_string(), 30)].into_iter().collect(),
            ..Default::default()
        };
        let orchestrator =
            RetentionOrchestrator::from_config(&config, repo.clone(), blobs.clone()).unwrap();

        let outcome = orchestrator.run(far_deadline()).await;
        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.records_examined, 3);
        assert_eq!(outcome.records_deleted, 2);
        assert_eq!(outcome.blobs_deleted, 2);
        assert_eq!(repo.count_by_class("exposure").await.unwrap(), 1);
        assert_eq!(repo.count_blobs().await.unwrap(), 1);
        assert!(repo.get_by_id(fresh_id.unwrap()).await.unwrap().is_some());
        assert!(blobs.contains(&BlobReference::new("exports", "5.zip")));

        let again = orchestrator.run(far_deadline()).await;
        assert_eq!(again.records_deleted, 0);
    }
}
