//! Contract between the post queue and the execution engine.

use async_trait::async_trait;
use uuid::Uuid;

use crate::{PostRecord, Result};

/// The engine that performs the network work for a post record.
///
/// The engine runs one record at a time across all submissions. It owns the
/// record's `state` and website attempts once a run has been handed to it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PostManager: Send + Sync {
    /// True while any run is in flight.
    async fn is_posting(&self) -> bool;

    /// Begins or resumes `record`. Returns once the run has been handed off;
    /// it does not wait for posting to finish.
    async fn start_post(&self, record: PostRecord) -> Result<()>;

    /// Stops the in-flight run if it belongs to `submission_id`. Returns
    /// whether a run was cancelled.
    async fn cancel_if_running(&self, submission_id: Uuid) -> bool;
}
