//! Retention cleanup engine.
//!
//! A run walks every configured retention class oldest first, in bounded
//! batches:
//! 1. Locate the next batch of records created before the class cutoff
//! 2. Delete their blobs, concurrently up to `blob_concurrency`
//! 3. Delete, in one transaction, only the records whose blobs are all gone
//!
//! A record's row is never removed while one of its blobs may still exist, so
//! a failed or interrupted run leaves at worst a record pointing at a missing
//! blob, which the next run cleans up. Runs stop between batches once the
//! deadline passes and are safe to overlap.

mod locator;
mod orchestrator;
mod outcome;
mod policy;
mod purger;
mod worker;

pub use locator::{RecordLocator, RepoRecordStore};
pub use orchestrator::{CleanupOrchestrator, RetentionOrchestrator};
pub use outcome::{CleanupError, CleanupOutcome};
pub use policy::RetentionPolicy;
pub use purger::{BlobPurger, RecordPurger};
pub use worker::start_cleanup_worker;
