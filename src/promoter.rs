//! Moves due scheduled submissions into the post queue.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::db::DbHandle;
use crate::queue::PostQueueService;
use crate::scheduler::TickHandler;
use crate::{Error, Result};

/// Next time `expression` fires strictly after `after`.
///
/// Five-field expressions (minute granularity) are accepted and get a zero
/// seconds field prepended.
pub fn next_occurrence(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };

    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })?;

    schedule.after(&after).next().ok_or_else(|| Error::InvalidCron {
        expression: expression.to_string(),
        message: "schedule has no upcoming occurrence".to_string(),
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PromotionReport {
    /// Due submissions in the order they were enqueued.
    pub promoted: Vec<Uuid>,
    /// Recurring submissions and their next occurrence.
    pub rescheduled: Vec<(Uuid, DateTime<Utc>)>,
}

pub struct ScheduledSubmissionPromoter {
    db: DbHandle,
    queue: Arc<PostQueueService>,
}

impl ScheduledSubmissionPromoter {
    pub fn new(db: DbHandle, queue: Arc<PostQueueService>) -> Self {
        ScheduledSubmissionPromoter { db, queue }
    }

    pub async fn promote(&self) -> Result<PromotionReport> {
        self.promote_due(Utc::now()).await
    }

    /// Enqueues every scheduled submission due at `now`, earliest first, then
    /// moves recurring ones to their next occurrence and clears one-off ones.
    #[instrument(name = "promoter.promote_due", skip(self))]
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<PromotionReport> {
        let mut due: Vec<_> = self
            .db
            .list_scheduled_submissions()
            .await?
            .into_iter()
            .filter(|s| s.schedule.scheduled_for.is_some_and(|at| at <= now))
            .collect();

        if due.is_empty() {
            debug!("No scheduled submissions due");
            return Ok(PromotionReport::default());
        }

        due.sort_by_key(|s| s.schedule.scheduled_for);
        let promoted: Vec<Uuid> = due.iter().map(|s| s.id).collect();
        self.queue.enqueue(&promoted).await?;
        info!(submissions = ?promoted, "Promoted scheduled submissions");

        let mut rescheduled = Vec::new();
        for submission in &due {
            let Some(expression) = submission.schedule.cron.as_deref() else {
                self.db
                    .update_schedule(submission.id, submission.schedule.scheduled_for, false)
                    .await?;
                continue;
            };

            match next_occurrence(expression, now) {
                Ok(next) => {
                    debug!(submission_id = %submission.id, next = %next, "Rescheduled recurring submission");
                    self.db.update_schedule(submission.id, Some(next), true).await?;
                    rescheduled.push((submission.id, next));
                }
                Err(err) => {
                    warn!(
                        submission_id = %submission.id,
                        error = %err,
                        "Unusable cron expression, unscheduling submission"
                    );
                    self.db
                        .update_schedule(submission.id, submission.schedule.scheduled_for, false)
                        .await?;
                }
            }
        }

        Ok(PromotionReport {
            promoted,
            rescheduled,
        })
    }
}

#[async_trait]
impl TickHandler for ScheduledSubmissionPromoter {
    async fn tick(&self) {
        if let Err(err) = self.promote().await {
            error!(message = "Scheduled submission promotion failed", error = %err);
        }
    }
}
