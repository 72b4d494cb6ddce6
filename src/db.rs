use crate::{
    Error, PostRecord, PostState, QueueEntry, QueuedSubmission, Result, ScheduleInfo, Submission,
    SubmissionFile, SubmissionRequest, WebsiteOption, WebsitePostRecord,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Executor, FromRow, Row};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Handle over the SQLite store holding submissions, queue entries, post
/// records and settings. Cheap to clone.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<SqlitePool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip(url))]
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database, so
        // the pool must hold exactly one connection and never recycle it.
        let pool_options = if url.contains(":memory:") || url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections)
        };
        let pool = pool_options.connect_with(options).await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:", 1).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // Submissions

    #[instrument(name = "db.create_submission", skip_all, fields(title = %request.title))]
    pub async fn create_submission(&self, request: &SubmissionRequest) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO submission \
            (id, submission_type, title, is_scheduled, scheduled_for, schedule_type, cron, created_at) \
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(request.submission_type)
        .bind(&request.title)
        .bind(request.is_scheduled)
        .bind(request.schedule.scheduled_for.map(to_millis))
        .bind(request.schedule.schedule_type)
        .bind(&request.schedule.cron)
        .bind(to_millis(Utc::now()))
        .execute(&mut *tx)
        .await?;

        for (order, (file_name, mime_type)) in request.files.iter().enumerate() {
            sqlx::query(
                "INSERT INTO submission_file (id, submission_id, file_name, mime_type, sort_order) \
                VALUES (?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(file_name)
            .bind(mime_type)
            .bind(order as i64)
            .execute(&mut *tx)
            .await?;
        }

        for (order, (account_id, website)) in request.websites.iter().enumerate() {
            sqlx::query(
                "INSERT INTO website_option (id, submission_id, account_id, website, sort_order) \
                VALUES (?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(account_id)
            .bind(website)
            .bind(order as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(submission_id = %id, "Created submission");
        Ok(id)
    }

    pub async fn delete_submission(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM submission WHERE id = ?")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>> {
        let mut conn = self.pool.acquire().await?;
        fetch_submission(&mut conn, id).await
    }

    /// Scheduled submissions without their files and website options.
    #[instrument(name = "db.list_scheduled_submissions", skip_all)]
    pub async fn list_scheduled_submissions(&self) -> Result<Vec<Submission>> {
        Ok(sqlx::query_as::<_, Submission>(
            "SELECT * FROM submission WHERE is_scheduled = 1 ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&*self.pool)
        .await?)
    }

    pub async fn update_schedule(
        &self,
        id: Uuid,
        scheduled_for: Option<DateTime<Utc>>,
        is_scheduled: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE submission SET scheduled_for = ?, is_scheduled = ? WHERE id = ?")
            .bind(scheduled_for.map(to_millis))
            .bind(is_scheduled)
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    // Queue entries

    /// Returns `false` when the submission is already queued.
    #[instrument(name = "db.insert_queue_entry", skip_all, fields(submission_id = %submission_id))]
    pub async fn insert_queue_entry(
        &self,
        submission_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO queue_entry (id, submission_id, created_at) VALUES (?, ?, ?) \
            ON CONFLICT (submission_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(submission_id)
        .bind(to_millis(created_at))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "db.delete_queue_entry", skip_all, fields(submission_id = %submission_id))]
    pub async fn delete_queue_entry(&self, submission_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_entry WHERE submission_id = ?")
            .bind(submission_id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_queue_entries(&self) -> Result<Vec<QueueEntry>> {
        Ok(sqlx::query_as::<_, QueueEntry>(
            "SELECT * FROM queue_entry ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&*self.pool)
        .await?)
    }

    /// Loads the queue head together with everything the execution engine
    /// needs, in a single read transaction.
    #[instrument(name = "db.peek", skip_all)]
    pub async fn peek(&self) -> Result<Option<QueuedSubmission>> {
        let mut tx = self.pool.begin().await?;

        let entry = sqlx::query_as::<_, QueueEntry>(
            "SELECT * FROM queue_entry ORDER BY created_at ASC, rowid ASC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(entry) = entry else {
            return Ok(None);
        };

        let record = match entry.post_record_id {
            Some(record_id) => fetch_post_record(&mut tx, record_id).await?,
            None => None,
        };
        let submission = fetch_submission(&mut tx, entry.submission_id).await?;

        tx.commit().await?;

        Ok(Some(QueuedSubmission {
            entry,
            record,
            submission,
        }))
    }

    /// Persists `record` and links it to the entry. Returns `false`, without
    /// persisting anything, if the entry is gone or already has a record.
    #[instrument(name = "db.attach_post_record", skip_all, fields(entry_id = %entry_id, post_record_id = %record.id))]
    pub async fn attach_post_record(&self, entry_id: Uuid, record: &PostRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO post_record (id, submission_id, state, resume_mode, created_at, completed_at) \
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(record.submission_id)
        .bind(record.state)
        .bind(record.resume_mode)
        .bind(to_millis(record.created_at))
        .bind(record.completed_at.map(to_millis))
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE queue_entry SET post_record_id = ? WHERE id = ? AND post_record_id IS NULL",
        )
        .bind(record.id)
        .bind(entry_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    // Post records, written by the execution engine

    pub async fn get_post_record(&self, id: Uuid) -> Result<Option<PostRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_post_record(&mut conn, id).await
    }

    #[instrument(name = "db.begin_post", skip_all, fields(post_record_id = %id))]
    pub async fn begin_post(&self, id: Uuid) -> Result<PostRecord> {
        self.transition_post(id, PostState::Running).await
    }

    #[instrument(name = "db.complete_post", skip_all, fields(post_record_id = %id))]
    pub async fn complete_post(&self, id: Uuid) -> Result<PostRecord> {
        self.transition_post(id, PostState::Done).await
    }

    #[instrument(name = "db.fail_post", skip_all, fields(post_record_id = %id))]
    pub async fn fail_post(&self, id: Uuid) -> Result<PostRecord> {
        self.transition_post(id, PostState::Failed).await
    }

    async fn transition_post(&self, id: Uuid, to: PostState) -> Result<PostRecord> {
        let mut tx = self.pool.begin().await?;

        let mut record = fetch_post_record(&mut tx, id)
            .await?
            .ok_or_else(|| Error::not_found("PostRecord", id))?;
        record.transition(to)?;

        sqlx::query("UPDATE post_record SET state = ?, completed_at = ? WHERE id = ?")
            .bind(record.state)
            .bind(record.completed_at.map(to_millis))
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(record)
    }

    pub async fn add_website_post(
        &self,
        post_record_id: Uuid,
        account_id: Uuid,
        error: Option<String>,
    ) -> Result<WebsitePostRecord> {
        let now = Utc::now();
        let child = WebsitePostRecord {
            id: Uuid::new_v4(),
            post_record_id,
            account_id,
            completed_at: Some(now),
            error,
        };

        sqlx::query(
            "INSERT INTO website_post_record (id, post_record_id, account_id, completed_at, error, created_at) \
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(child.id)
        .bind(child.post_record_id)
        .bind(child.account_id)
        .bind(child.completed_at.map(to_millis))
        .bind(&child.error)
        .bind(to_millis(now))
        .execute(&*self.pool)
        .await?;

        Ok(child)
    }

    // Settings

    pub async fn queue_paused(&self) -> Result<bool> {
        let paused = sqlx::query_scalar::<_, bool>("SELECT queue_paused FROM settings WHERE id = 1")
            .fetch_optional(&*self.pool)
            .await?;
        Ok(paused.unwrap_or(false))
    }

    pub async fn store_queue_paused(&self, paused: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (id, queue_paused) VALUES (1, ?) \
            ON CONFLICT (id) DO UPDATE SET queue_paused = excluded.queue_paused",
        )
        .bind(paused)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}

async fn fetch_post_record(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<PostRecord>> {
    let record = sqlx::query_as::<_, PostRecord>("SELECT * FROM post_record WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(mut record) = record else {
        return Ok(None);
    };

    record.children = sqlx::query_as::<_, WebsitePostRecord>(
        "SELECT * FROM website_post_record WHERE post_record_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(record))
}

async fn fetch_submission(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Submission>> {
    let submission = sqlx::query_as::<_, Submission>("SELECT * FROM submission WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(mut submission) = submission else {
        return Ok(None);
    };

    submission.files = sqlx::query_as::<_, SubmissionFile>(
        "SELECT * FROM submission_file WHERE submission_id = ? ORDER BY sort_order ASC",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    submission.website_options = sqlx::query_as::<_, WebsiteOption>(
        "SELECT * FROM website_option WHERE submission_id = ? ORDER BY sort_order ASC",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(submission))
}

// Timestamps are stored as Unix milliseconds so that SQL ordering is numeric.

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

impl<'r> FromRow<'r, SqliteRow> for QueueEntry {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(QueueEntry {
            id: row.try_get("id")?,
            submission_id: row.try_get("submission_id")?,
            post_record_id: row.try_get("post_record_id")?,
            created_at: from_millis(row.try_get("created_at")?),
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for PostRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(PostRecord {
            id: row.try_get("id")?,
            submission_id: row.try_get("submission_id")?,
            state: row.try_get("state")?,
            resume_mode: row.try_get("resume_mode")?,
            created_at: from_millis(row.try_get("created_at")?),
            completed_at: opt_from_millis(row.try_get("completed_at")?),
            children: Vec::new(),
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for WebsitePostRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(WebsitePostRecord {
            id: row.try_get("id")?,
            post_record_id: row.try_get("post_record_id")?,
            account_id: row.try_get("account_id")?,
            completed_at: opt_from_millis(row.try_get("completed_at")?),
            error: row.try_get("error")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Submission {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Submission {
            id: row.try_get("id")?,
            submission_type: row.try_get("submission_type")?,
            title: row.try_get("title")?,
            is_scheduled: row.try_get("is_scheduled")?,
            schedule: ScheduleInfo {
                scheduled_for: opt_from_millis(row.try_get("scheduled_for")?),
                schedule_type: row.try_get("schedule_type")?,
                cron: row.try_get("cron")?,
            },
            files: Vec::new(),
            website_options: Vec::new(),
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for SubmissionFile {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(SubmissionFile {
            id: row.try_get("id")?,
            file_name: row.try_get("file_name")?,
            mime_type: row.try_get("mime_type")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for WebsiteOption {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(WebsiteOption {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            website: row.try_get("website")?,
        })
    }
}
