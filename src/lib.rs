use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod config;
pub mod db;
pub mod error;
pub mod manager;
pub mod post_record;
pub mod promoter;
pub mod queue;
pub mod scheduler;
pub mod settings;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};

/// One submission waiting for, or undergoing, posting.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: Uuid,
    pub submission_id: Uuid,
    /// Absent until posting has actually started.
    pub post_record_id: Option<Uuid>,
    /// FIFO ordering key.
    pub created_at: DateTime<Utc>,
}

/// One posting attempt for a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub state: PostState,
    pub resume_mode: ResumeMode,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// One entry per target website account, in creation order.
    pub children: Vec<WebsitePostRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostState {
    Pending,
    Running,
    Done,
    Failed,
}

/// Tells the execution engine how to treat partial progress of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResumeMode {
    Continue,
    ContinueRetry,
    New,
}

/// Attempt against a single website account.
#[derive(Debug, Clone, PartialEq)]
pub struct WebsitePostRecord {
    pub id: Uuid,
    pub post_record_id: Uuid,
    pub account_id: Uuid,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionType {
    File,
    Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    #[default]
    None,
    Single,
    Recurring,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScheduleInfo {
    pub scheduled_for: Option<DateTime<Utc>>,
    pub schedule_type: ScheduleType,
    pub cron: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionFile {
    pub id: Uuid,
    pub file_name: String,
    pub mime_type: String,
}

/// A website account the submission is targeted at.
#[derive(Debug, Clone, PartialEq)]
pub struct WebsiteOption {
    pub id: Uuid,
    pub account_id: Uuid,
    pub website: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub id: Uuid,
    pub submission_type: SubmissionType,
    pub title: String,
    pub is_scheduled: bool,
    pub schedule: ScheduleInfo,
    pub files: Vec<SubmissionFile>,
    pub website_options: Vec<WebsiteOption>,
}

/// The queue head as handed to the execution engine: the entry, its active
/// record (with website attempts) and the submission with files and options.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSubmission {
    pub entry: QueueEntry,
    pub record: Option<PostRecord>,
    /// `None` when the submission no longer exists.
    pub submission: Option<Submission>,
}

#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub submission_type: SubmissionType,
    pub title: String,
    pub is_scheduled: bool,
    pub schedule: ScheduleInfo,
    /// `(file_name, mime_type)` pairs.
    pub files: Vec<(String, String)>,
    /// `(account_id, website)` pairs.
    pub websites: Vec<(Uuid, String)>,
}
