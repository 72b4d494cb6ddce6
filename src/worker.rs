//! A reference execution engine that simulates posting.
//!
//! Runs are handed to a single worker task over a channel. The manager marks
//! itself busy as soon as a record is accepted, so the queue never sees an
//! idle engine between hand-off and pick-up.

use crate::db::DbHandle;
use crate::manager::PostManager;
use crate::{Error, PostRecord, PostState, Result};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

struct ActiveRun {
    submission_id: Uuid,
    cancel_token: CancellationToken,
}

#[derive(Clone)]
pub struct SimulatedPostManager {
    send_to_worker: Sender<PostRecord>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl SimulatedPostManager {
    /// Starts the worker task. `post_delay` is the simulated time spent on
    /// each website.
    pub fn spawn(
        db: DbHandle,
        post_delay: Duration,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (send_to_worker, recv_from_manager) = async_channel::bounded(1);
        let active = Arc::new(Mutex::new(None));

        let worker = Worker {
            db,
            post_delay,
            active: active.clone(),
        };
        let handle = tokio::spawn(
            worker
                .start(cancel_token, recv_from_manager)
                .instrument(info_span!("worker")),
        );

        (
            SimulatedPostManager {
                send_to_worker,
                active,
            },
            handle,
        )
    }
}

#[async_trait]
impl PostManager for SimulatedPostManager {
    async fn is_posting(&self) -> bool {
        self.active.lock().await.is_some()
    }

    async fn start_post(&self, record: PostRecord) -> Result<()> {
        {
            let mut active = self.active.lock().await;
            if let Some(run) = active.as_ref() {
                return Err(Error::PostManager(format!(
                    "already posting submission {}",
                    run.submission_id
                )));
            }
            *active = Some(ActiveRun {
                submission_id: record.submission_id,
                cancel_token: CancellationToken::new(),
            });
        }

        if let Err(err) = self.send_to_worker.send(record).await {
            *self.active.lock().await = None;
            return Err(Error::PostManager(format!("worker unavailable: {err}")));
        }
        Ok(())
    }

    async fn cancel_if_running(&self, submission_id: Uuid) -> bool {
        match self.active.lock().await.as_ref() {
            Some(run) if run.submission_id == submission_id => {
                run.cancel_token.cancel();
                true
            }
            _ => false,
        }
    }
}

struct Worker {
    db: DbHandle,
    post_delay: Duration,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl Worker {
    async fn start(self, cancel_token: CancellationToken, recv_from_manager: Receiver<PostRecord>) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker Cancelled");
                    break;
                },
                record = recv_from_manager.recv() => {
                    match record {
                        Err(err) => {
                            error!(message = "Error receiving post by worker, exiting", error = ?err);
                            break;
                        },
                        Ok(record) => {
                            let run_token = match self.active.lock().await.as_ref() {
                                Some(run) => run.cancel_token.clone(),
                                None => CancellationToken::new(),
                            };
                            let record_id = record.id;
                            tokio::select! {
                                // The record keeps its state and is resumed by the queue on restart.
                                _ = cancel_token.cancelled() => {
                                    info!(post_record_id = %record_id, "Worker cancelled mid-run");
                                    break;
                                },
                                result = self.process(record, run_token) => {
                                    if let Err(err) = result {
                                        error!(message = "Post run failed", post_record_id = %record_id, error = %err);
                                    }
                                }
                            }
                            *self.active.lock().await = None;
                        }
                    }
                }
            }
        }
        info!("Worker stopped.");
    }

    #[instrument(skip_all, fields(post_record_id = %record.id, submission_id = %record.submission_id))]
    async fn process(&self, record: PostRecord, run_token: CancellationToken) -> Result<()> {
        if record.state == PostState::Pending {
            self.db.begin_post(record.id).await?;
        }

        let submission = self
            .db
            .get_submission(record.submission_id)
            .await?
            .ok_or_else(|| Error::not_found("Submission", record.submission_id))?;

        let mut failed = false;
        for option in &submission.website_options {
            // Resuming skips websites already attempted.
            if record.children.iter().any(|c| c.account_id == option.account_id) {
                continue;
            }

            tokio::select! {
                _ = run_token.cancelled() => {
                    info!("Post cancelled");
                    self.db
                        .add_website_post(record.id, option.account_id, Some("cancelled".to_string()))
                        .await?;
                    self.db.fail_post(record.id).await?;
                    return Ok(());
                },
                _ = sleep(self.post_delay) => {}
            }

            let error = (option.id.as_u128() % 12 == 0)
                .then(|| format!("Simulated failure posting to {}", option.website));
            failed |= error.is_some();
            debug!(website = %option.website, error = ?error, "Posted to website");
            self.db
                .add_website_post(record.id, option.account_id, error)
                .await?;
        }

        failed |= record.children.iter().any(|c| c.error.is_some());
        if failed {
            self.db.fail_post(record.id).await?;
        } else {
            self.db.complete_post(record.id).await?;
        }
        Ok(())
    }
}
