//! The post queue controller.
//!
//! Submissions are posted one at a time in FIFO order. Two locks guard the
//! queue and are never merged:
//!
//! - the *mutation* lock serialises structural changes (enqueue, dequeue,
//!   attaching a new post record to the head) and is held across the hand-off
//!   to the engine, so a dequeue either wins outright or finds the run
//!   registered and cancels it;
//! - the *execution* lock keeps at most one tick body running. A tick that
//!   finds it held returns at once instead of waiting.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::db::DbHandle;
use crate::manager::PostManager;
use crate::scheduler::TickHandler;
use crate::settings::SettingsStore;
use crate::{Error, PostRecord, QueuedSubmission, Result, ResumeMode, SubmissionType};

const EVENT_CAPACITY: usize = 64;

/// Change notifications for subscribers such as an API layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued(Vec<Uuid>),
    Dequeued(Vec<Uuid>),
    PostStarted {
        submission_id: Uuid,
        post_record_id: Uuid,
    },
    PostResumed {
        submission_id: Uuid,
        post_record_id: Uuid,
    },
    PauseChanged(bool),
}

/// What a single execution tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still running.
    Skipped,
    Empty,
    /// The head has no record and the queue is paused.
    Paused,
    /// The head has no record but the engine reports a run in flight.
    EngineBusy,
    /// The head's record is active in the engine.
    InProgress,
    /// The head was removed or replaced before the hand-off.
    HeadChanged,
    Started(Uuid),
    Resumed(Uuid),
    Dequeued(Uuid),
    Failed,
}

pub struct PostQueueService {
    db: DbHandle,
    manager: Arc<dyn PostManager>,
    settings: Arc<dyn SettingsStore>,
    mutation: Mutex<()>,
    execution: Mutex<()>,
    events: broadcast::Sender<QueueEvent>,
}

impl PostQueueService {
    pub fn new(
        db: DbHandle,
        manager: Arc<dyn PostManager>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        PostQueueService {
            db,
            manager,
            settings,
            mutation: Mutex::new(()),
            execution: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Queues every submission not already queued, in the given order.
    ///
    /// Returns the ids that were newly queued. A storage failure stops the
    /// batch; entries committed before it stay queued.
    #[instrument(name = "queue.enqueue", skip_all, fields(count = submission_ids.len()))]
    pub async fn enqueue(&self, submission_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let _guard = self.mutation.lock().await;

        let mut added = Vec::with_capacity(submission_ids.len());
        let mut failure = None;
        for &submission_id in submission_ids {
            match self.db.insert_queue_entry(submission_id, Utc::now()).await {
                Ok(true) => added.push(submission_id),
                Ok(false) => trace!(submission_id = %submission_id, "Already queued"),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if !added.is_empty() {
            info!(submissions = ?added, "Enqueued submissions");
            self.notify(QueueEvent::Enqueued(added.clone()));
        }

        match failure {
            Some(err) => Err(Error::mutation("enqueue", err)),
            None => Ok(added),
        }
    }

    /// Removes submissions from the queue, asking the engine to stop each one
    /// first. Removal goes ahead whether or not anything was cancelled.
    #[instrument(name = "queue.dequeue", skip_all, fields(count = submission_ids.len()))]
    pub async fn dequeue(&self, submission_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let _guard = self.mutation.lock().await;

        let mut removed = Vec::with_capacity(submission_ids.len());
        let mut failure = None;
        for &submission_id in submission_ids {
            if self.manager.cancel_if_running(submission_id).await {
                info!(submission_id = %submission_id, "Cancelled running post");
            }

            match self.db.delete_queue_entry(submission_id).await {
                Ok(true) => removed.push(submission_id),
                Ok(false) => trace!(submission_id = %submission_id, "Not queued"),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if !removed.is_empty() {
            info!(submissions = ?removed, "Dequeued submissions");
            self.notify(QueueEvent::Dequeued(removed.clone()));
        }

        match failure {
            Some(err) => Err(Error::mutation("dequeue", err)),
            None => Ok(removed),
        }
    }

    /// The oldest queue entry with its record and submission.
    pub async fn peek(&self) -> Result<Option<QueuedSubmission>> {
        self.db.peek().await
    }

    pub async fn pause(&self) -> Result<()> {
        self.settings.set_queue_paused(true).await?;
        info!("Queue paused");
        self.notify(QueueEvent::PauseChanged(true));
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.settings.set_queue_paused(false).await?;
        info!("Queue resumed");
        self.notify(QueueEvent::PauseChanged(false));
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        self.settings.get_queue_paused().await
    }

    /// True if the engine is posting and the queue head is of the given type.
    pub async fn is_posting(&self, submission_type: SubmissionType) -> Result<bool> {
        if !self.manager.is_posting().await {
            return Ok(false);
        }

        Ok(self
            .peek()
            .await?
            .and_then(|head| head.submission)
            .is_some_and(|submission| submission.submission_type == submission_type))
    }

    /// One decision tick over the queue head. Never returns an error; failures
    /// are logged and reported as [`TickOutcome::Failed`].
    #[instrument(name = "queue.execute", skip_all)]
    pub async fn execute(&self) -> TickOutcome {
        let Ok(_guard) = self.execution.try_lock() else {
            trace!("Previous tick still running, skipping");
            return TickOutcome::Skipped;
        };

        match self.run_tick().await {
            Ok(outcome) => {
                trace!(outcome = ?outcome, "Tick finished");
                outcome
            }
            Err(err) => {
                error!(message = "Queue tick failed", error = %err);
                TickOutcome::Failed
            }
        }
    }

    async fn run_tick(&self) -> Result<TickOutcome> {
        let Some(head) = self.peek().await? else {
            return Ok(TickOutcome::Empty);
        };
        let submission_id = head.entry.submission_id;

        if head.submission.is_none() {
            warn!(submission_id = %submission_id, "Queued submission no longer exists, dequeuing");
            self.dequeue(&[submission_id]).await?;
            return Ok(TickOutcome::Dequeued(submission_id));
        }

        match head.record {
            None => self.start_new(head.entry.id, submission_id).await,
            Some(record) if record.is_terminal() => {
                debug!(
                    submission_id = %submission_id,
                    post_record_id = %record.id,
                    state = ?record.state,
                    "Post finished, dequeuing"
                );
                self.dequeue(&[submission_id]).await?;
                Ok(TickOutcome::Dequeued(submission_id))
            }
            Some(record) => {
                if self.manager.is_posting().await {
                    return Ok(TickOutcome::InProgress);
                }

                // The record was handed off before but the engine is idle, so
                // the run was interrupted. Resuming is not gated by pause.
                self.resume_interrupted(head.entry.id, record).await
            }
        }
    }

    async fn resume_interrupted(&self, entry_id: Uuid, record: PostRecord) -> Result<TickOutcome> {
        let submission_id = record.submission_id;
        let post_record_id = record.id;

        let _guard = self.mutation.lock().await;
        let unchanged = self.db.peek().await?.is_some_and(|head| {
            head.entry.id == entry_id && head.entry.post_record_id == Some(post_record_id)
        });
        if !unchanged {
            debug!(submission_id = %submission_id, "Queue head changed before resume, skipping");
            return Ok(TickOutcome::HeadChanged);
        }

        info!(
            submission_id = %submission_id,
            post_record_id = %post_record_id,
            state = ?record.state,
            "Resuming interrupted post"
        );
        self.manager.start_post(record).await?;
        self.notify(QueueEvent::PostResumed {
            submission_id,
            post_record_id,
        });
        Ok(TickOutcome::Resumed(post_record_id))
    }

    async fn start_new(&self, entry_id: Uuid, submission_id: Uuid) -> Result<TickOutcome> {
        if self.manager.is_posting().await {
            // The head has no record, so whatever the engine runs is not ours.
            warn!(
                submission_id = %submission_id,
                "Post manager is busy while the queue head has no post record"
            );
            return Ok(TickOutcome::EngineBusy);
        }

        if self.is_paused().await? {
            trace!("Queue is paused, not starting new posts");
            return Ok(TickOutcome::Paused);
        }

        let record = PostRecord::new(submission_id, ResumeMode::Continue);
        let _guard = self.mutation.lock().await;
        if !self.db.attach_post_record(entry_id, &record).await? {
            debug!(submission_id = %submission_id, "Queue head changed before start, skipping");
            return Ok(TickOutcome::HeadChanged);
        }

        let post_record_id = record.id;
        info!(
            submission_id = %submission_id,
            post_record_id = %post_record_id,
            "Starting post"
        );
        self.manager.start_post(record).await?;
        self.notify(QueueEvent::PostStarted {
            submission_id,
            post_record_id,
        });
        Ok(TickOutcome::Started(post_record_id))
    }
}

#[async_trait]
impl TickHandler for PostQueueService {
    async fn tick(&self) {
        self.execute().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::submission_request;
    use crate::manager::MockPostManager;
    use crate::settings::MockSettingsStore;
    use crate::PostState;
    use rstest::rstest;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn idle_manager() -> MockPostManager {
        let mut manager = MockPostManager::new();
        manager.expect_is_posting().returning(|| false);
        manager.expect_cancel_if_running().returning(|_| false);
        manager
    }

    fn service(db: &DbHandle, manager: MockPostManager) -> PostQueueService {
        PostQueueService::new(db.clone(), Arc::new(manager), Arc::new(db.clone()))
    }

    async fn create(db: &DbHandle, title: &str) -> Uuid {
        db.create_submission(&submission_request(title)).await.unwrap()
    }

    /// Queues a submission and attaches a record in `state` to it.
    async fn queued_with_record(db: &DbHandle, state: PostState) -> (Uuid, Uuid) {
        let submission_id = create(db, "With record").await;
        db.insert_queue_entry(submission_id, Utc::now()).await.unwrap();
        let head = db.peek().await.unwrap().unwrap();
        let record = PostRecord::new(submission_id, ResumeMode::Continue);
        db.attach_post_record(head.entry.id, &record).await.unwrap();
        match state {
            PostState::Pending => {}
            PostState::Running => {
                db.begin_post(record.id).await.unwrap();
            }
            PostState::Done => {
                db.complete_post(record.id).await.unwrap();
            }
            PostState::Failed => {
                db.fail_post(record.id).await.unwrap();
            }
        }
        (submission_id, record.id)
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let db = DbHandle::in_memory().await.unwrap();
        let queue = service(&db, idle_manager());
        let id = create(&db, "Once").await;

        assert_eq!(queue.enqueue(&[id]).await.unwrap(), vec![id]);
        assert!(queue.enqueue(&[id]).await.unwrap().is_empty());
        assert!(queue.enqueue(&[id, id]).await.unwrap().is_empty());

        assert_eq!(db.list_queue_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_peek_is_fifo() {
        let db = DbHandle::in_memory().await.unwrap();
        let queue = service(&db, idle_manager());
        let a = create(&db, "A").await;
        let b = create(&db, "B").await;
        let c = create(&db, "C").await;
        queue.enqueue(&[a]).await.unwrap();
        queue.enqueue(&[b]).await.unwrap();
        queue.enqueue(&[c]).await.unwrap();

        for expected in [a, b, c] {
            let head = queue.peek().await.unwrap().unwrap();
            assert_eq!(head.entry.submission_id, expected);
            // Peeking does not consume.
            let again = queue.peek().await.unwrap().unwrap();
            assert_eq!(again.entry.submission_id, expected);
            queue.dequeue(&[expected]).await.unwrap();
        }
        assert!(queue.peek().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execute_on_empty_queue() {
        let db = DbHandle::in_memory().await.unwrap();
        let queue = service(&db, MockPostManager::new());
        assert_eq!(queue.execute().await, TickOutcome::Empty);
    }

    #[tokio::test]
    async fn test_execute_starts_new_post() {
        let db = DbHandle::in_memory().await.unwrap();
        let started = Arc::new(StdMutex::new(Vec::new()));
        let mut manager = idle_manager();
        let sink = started.clone();
        manager.expect_start_post().times(1).returning(move |record| {
            sink.lock().unwrap().push(record);
            Ok(())
        });
        let queue = service(&db, manager);
        let mut events = queue.subscribe();
        let id = create(&db, "New").await;
        queue.enqueue(&[id]).await.unwrap();

        let outcome = queue.execute().await;

        let started = started.lock().unwrap().clone();
        assert_eq!(started.len(), 1);
        let record = &started[0];
        assert_eq!(outcome, TickOutcome::Started(record.id));
        assert_eq!(record.submission_id, id);
        assert_eq!(record.state, PostState::Pending);
        assert_eq!(record.resume_mode, ResumeMode::Continue);

        let head = queue.peek().await.unwrap().unwrap();
        assert_eq!(head.entry.post_record_id, Some(record.id));
        assert_eq!(head.record.unwrap().state, PostState::Pending);

        assert_eq!(events.recv().await.unwrap(), QueueEvent::Enqueued(vec![id]));
        assert_eq!(
            events.recv().await.unwrap(),
            QueueEvent::PostStarted {
                submission_id: id,
                post_record_id: record.id
            }
        );
    }

    #[tokio::test]
    async fn test_execute_never_starts_while_engine_busy() {
        let db = DbHandle::in_memory().await.unwrap();
        let mut manager = MockPostManager::new();
        manager.expect_is_posting().returning(|| true);
        manager.expect_start_post().never();
        let queue = service(&db, manager);
        let id = create(&db, "Busy").await;
        queue.enqueue(&[id]).await.unwrap();

        assert_eq!(queue.execute().await, TickOutcome::EngineBusy);
        let head = queue.peek().await.unwrap().unwrap();
        assert!(head.record.is_none());
    }

    #[tokio::test]
    async fn test_execute_waits_for_running_post() {
        let db = DbHandle::in_memory().await.unwrap();
        let mut manager = MockPostManager::new();
        manager.expect_is_posting().returning(|| true);
        manager.expect_start_post().never();
        let queue = service(&db, manager);
        queued_with_record(&db, PostState::Running).await;

        assert_eq!(queue.execute().await, TickOutcome::InProgress);
    }

    #[rstest]
    #[case(PostState::Done)]
    #[case(PostState::Failed)]
    #[tokio::test]
    async fn test_execute_dequeues_terminal_records(#[case] state: PostState) {
        let db = DbHandle::in_memory().await.unwrap();
        let mut manager = idle_manager();
        manager.expect_start_post().never();
        let queue = service(&db, manager);
        let (submission_id, record_id) = queued_with_record(&db, state).await;

        assert_eq!(queue.execute().await, TickOutcome::Dequeued(submission_id));
        assert!(queue.peek().await.unwrap().is_none());
        // History stays behind.
        let record = db.get_post_record(record_id).await.unwrap().unwrap();
        assert_eq!(record.state, state);
    }

    #[rstest]
    #[case(PostState::Pending)]
    #[case(PostState::Running)]
    #[tokio::test]
    async fn test_execute_resumes_interrupted_record(#[case] state: PostState) {
        let db = DbHandle::in_memory().await.unwrap();
        let (submission_id, record_id) = queued_with_record(&db, state).await;
        let mut manager = idle_manager();
        manager
            .expect_start_post()
            .withf(move |record| record.id == record_id && record.state == state)
            .times(1)
            .returning(|_| Ok(()));
        let queue = service(&db, manager);

        assert_eq!(queue.execute().await, TickOutcome::Resumed(record_id));
        let head = queue.peek().await.unwrap().unwrap();
        assert_eq!(head.entry.submission_id, submission_id);
        assert_eq!(head.entry.post_record_id, Some(record_id));
    }

    #[tokio::test]
    async fn test_pause_blocks_new_work_only() {
        let db = DbHandle::in_memory().await.unwrap();
        let mut manager = idle_manager();
        manager.expect_start_post().never();
        let queue = service(&db, manager);
        queue.pause().await.unwrap();
        let id = create(&db, "Paused").await;
        queue.enqueue(&[id]).await.unwrap();

        assert_eq!(queue.execute().await, TickOutcome::Paused);
        let head = queue.peek().await.unwrap().unwrap();
        assert_eq!(head.entry.submission_id, id);
        assert!(head.record.is_none());
    }

    #[tokio::test]
    async fn test_pause_does_not_block_resume() {
        let db = DbHandle::in_memory().await.unwrap();
        let (_, record_id) = queued_with_record(&db, PostState::Running).await;
        let mut manager = idle_manager();
        manager.expect_start_post().times(1).returning(|_| Ok(()));
        let queue = service(&db, manager);
        queue.pause().await.unwrap();

        assert_eq!(queue.execute().await, TickOutcome::Resumed(record_id));
    }

    #[tokio::test]
    async fn test_pause_flag_is_read_every_tick() {
        let db = DbHandle::in_memory().await.unwrap();
        let mut manager = idle_manager();
        manager.expect_start_post().times(1).returning(|_| Ok(()));
        let queue = service(&db, manager);
        let id = create(&db, "Toggle").await;
        queue.enqueue(&[id]).await.unwrap();

        db.store_queue_paused(true).await.unwrap();
        assert_eq!(queue.execute().await, TickOutcome::Paused);
        assert!(queue.is_paused().await.unwrap());

        db.store_queue_paused(false).await.unwrap();
        assert!(matches!(queue.execute().await, TickOutcome::Started(_)));
    }

    #[tokio::test]
    async fn test_pause_and_resume_use_settings_store() {
        let db = DbHandle::in_memory().await.unwrap();
        let mut settings = MockSettingsStore::new();
        let mut seq = mockall::Sequence::new();
        settings
            .expect_set_queue_paused()
            .with(mockall::predicate::eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        settings
            .expect_set_queue_paused()
            .with(mockall::predicate::eq(false))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let queue = PostQueueService::new(
            db.clone(),
            Arc::new(MockPostManager::new()),
            Arc::new(settings),
        );
        let mut events = queue.subscribe();

        queue.pause().await.unwrap();
        queue.resume().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), QueueEvent::PauseChanged(true));
        assert_eq!(events.recv().await.unwrap(), QueueEvent::PauseChanged(false));
    }

    #[tokio::test]
    async fn test_execute_skips_when_tick_in_progress() {
        let db = DbHandle::in_memory().await.unwrap();
        let queue = service(&db, MockPostManager::new());

        let _held = queue.execution.try_lock().unwrap();
        assert_eq!(queue.execute().await, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_execute_dequeues_missing_submission() {
        let db = DbHandle::in_memory().await.unwrap();
        let mut manager = idle_manager();
        manager.expect_start_post().never();
        let queue = service(&db, manager);
        let ghost = Uuid::new_v4();
        queue.enqueue(&[ghost]).await.unwrap();

        assert_eq!(queue.execute().await, TickOutcome::Dequeued(ghost));
        assert!(queue.peek().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execute_reports_start_failure() {
        let db = DbHandle::in_memory().await.unwrap();
        let mut manager = idle_manager();
        manager
            .expect_start_post()
            .returning(|_| Err(Error::PostManager("engine offline".to_string())));
        let queue = service(&db, manager);
        let id = create(&db, "Offline").await;
        queue.enqueue(&[id]).await.unwrap();

        assert_eq!(queue.execute().await, TickOutcome::Failed);
        // The record stays attached and is resumed on a later tick.
        let head = queue.peek().await.unwrap().unwrap();
        assert_eq!(head.record.unwrap().state, PostState::Pending);
    }

    #[tokio::test]
    async fn test_dequeue_cancels_before_removal() {
        /// Records whether the entry was still stored when cancel arrived.
        struct ObservingManager {
            db: DbHandle,
            seen: StdMutex<Vec<(Uuid, bool)>>,
        }

        #[async_trait]
        impl PostManager for ObservingManager {
            async fn is_posting(&self) -> bool {
                false
            }

            async fn start_post(&self, _record: PostRecord) -> Result<()> {
                Ok(())
            }

            async fn cancel_if_running(&self, submission_id: Uuid) -> bool {
                let queued = self
                    .db
                    .list_queue_entries()
                    .await
                    .unwrap()
                    .iter()
                    .any(|e| e.submission_id == submission_id);
                self.seen.lock().unwrap().push((submission_id, queued));
                true
            }
        }

        let db = DbHandle::in_memory().await.unwrap();
        let manager = Arc::new(ObservingManager {
            db: db.clone(),
            seen: StdMutex::new(Vec::new()),
        });
        let queue = PostQueueService::new(db.clone(), manager.clone(), Arc::new(db.clone()));
        let id = create(&db, "Cancel").await;
        queue.enqueue(&[id]).await.unwrap();

        assert_eq!(queue.dequeue(&[id]).await.unwrap(), vec![id]);

        assert_eq!(*manager.seen.lock().unwrap(), vec![(id, true)]);
        assert!(db.list_queue_entries().await.unwrap().is_empty());
    }

    /// Holds every hand-off until released, then registers the run.
    #[derive(Default)]
    struct GatedManager {
        entered: Notify,
        release: Notify,
        running: StdMutex<Option<Uuid>>,
        cancelled: StdMutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl PostManager for GatedManager {
        async fn is_posting(&self) -> bool {
            self.running.lock().unwrap().is_some()
        }

        async fn start_post(&self, record: PostRecord) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            *self.running.lock().unwrap() = Some(record.submission_id);
            Ok(())
        }

        async fn cancel_if_running(&self, submission_id: Uuid) -> bool {
            let mut running = self.running.lock().unwrap();
            if *running != Some(submission_id) {
                return false;
            }
            *running = None;
            self.cancelled.lock().unwrap().push(submission_id);
            true
        }
    }

    #[rstest]
    #[case::new_post(None)]
    #[case::interrupted_post(Some(PostState::Running))]
    #[tokio::test]
    async fn test_dequeue_during_hand_off_cancels_the_run(#[case] state: Option<PostState>) {
        let db = DbHandle::in_memory().await.unwrap();
        let manager = Arc::new(GatedManager::default());
        let queue = Arc::new(PostQueueService::new(
            db.clone(),
            manager.clone(),
            Arc::new(db.clone()),
        ));
        let id = match state {
            Some(state) => queued_with_record(&db, state).await.0,
            None => {
                let id = create(&db, "Gated").await;
                queue.enqueue(&[id]).await.unwrap();
                id
            }
        };

        let tick = tokio::spawn({
            let queue = queue.clone();
            async move { queue.execute().await }
        });
        manager.entered.notified().await;

        let mut dequeue = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue(&[id]).await }
        });
        // Blocked behind the hand-off.
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut dequeue)
            .await
            .is_err());
        assert_eq!(db.list_queue_entries().await.unwrap().len(), 1);

        manager.release.notify_one();
        assert!(matches!(
            tick.await.unwrap(),
            TickOutcome::Started(_) | TickOutcome::Resumed(_)
        ));
        assert_eq!(dequeue.await.unwrap().unwrap(), vec![id]);

        assert_eq!(*manager.cancelled.lock().unwrap(), vec![id]);
        assert!(!manager.is_posting().await);
        assert!(db.list_queue_entries().await.unwrap().is_empty());
    }

    #[rstest]
    #[case::new_post(None)]
    #[case::interrupted_post(Some(PostState::Pending))]
    #[tokio::test]
    async fn test_execute_reports_head_changed(#[case] state: Option<PostState>) {
        /// Reports an idle engine, but the head is removed while it is asked.
        struct VanishingHead {
            db: DbHandle,
            submission_id: StdMutex<Option<Uuid>>,
        }

        #[async_trait]
        impl PostManager for VanishingHead {
            async fn is_posting(&self) -> bool {
                let submission_id = self.submission_id.lock().unwrap().take();
                if let Some(submission_id) = submission_id {
                    self.db.delete_queue_entry(submission_id).await.unwrap();
                }
                false
            }

            async fn start_post(&self, record: PostRecord) -> Result<()> {
                panic!("handed off {} after its entry was removed", record.submission_id);
            }

            async fn cancel_if_running(&self, _submission_id: Uuid) -> bool {
                false
            }
        }

        let db = DbHandle::in_memory().await.unwrap();
        let id = match state {
            Some(state) => queued_with_record(&db, state).await.0,
            None => {
                let id = create(&db, "Vanishing").await;
                db.insert_queue_entry(id, Utc::now()).await.unwrap();
                id
            }
        };
        let manager = Arc::new(VanishingHead {
            db: db.clone(),
            submission_id: StdMutex::new(Some(id)),
        });
        let queue = PostQueueService::new(db.clone(), manager, Arc::new(db.clone()));

        assert_eq!(queue.execute().await, TickOutcome::HeadChanged);
        assert!(queue.peek().await.unwrap().is_none());
        // The lock was released.
        assert!(queue.mutation.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_dequeue_unknown_submission_still_asks_to_cancel() {
        let db = DbHandle::in_memory().await.unwrap();
        let id = Uuid::new_v4();
        let mut manager = MockPostManager::new();
        manager
            .expect_cancel_if_running()
            .with(mockall::predicate::eq(id))
            .times(1)
            .returning(|_| false);
        let queue = service(&db, manager);

        assert!(queue.dequeue(&[id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_failure_is_wrapped() {
        let db = DbHandle::in_memory().await.unwrap();
        let queue = service(&db, idle_manager());
        db.close().await;

        let err = queue.enqueue(&[Uuid::new_v4()]).await.unwrap_err();
        assert!(matches!(err, Error::Mutation { action: "enqueue", .. }));

        let err = queue.dequeue(&[Uuid::new_v4()]).await.unwrap_err();
        assert!(matches!(err, Error::Mutation { action: "dequeue", .. }));

        // The lock was released despite the failures.
        assert!(queue.mutation.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_is_posting_by_submission_type() {
        let db = DbHandle::in_memory().await.unwrap();
        let mut manager = MockPostManager::new();
        manager.expect_is_posting().returning(|| true);
        let queue = service(&db, manager);
        assert!(!queue.is_posting(SubmissionType::File).await.unwrap());

        let id = create(&db, "Typed").await;
        queue.enqueue(&[id]).await.unwrap();

        assert!(queue.is_posting(SubmissionType::File).await.unwrap());
        assert!(!queue.is_posting(SubmissionType::Message).await.unwrap());
    }
}
