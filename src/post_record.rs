//! Posting attempt state machine.
//!
//! A record moves forward along `PENDING -> RUNNING -> {DONE | FAILED}` and
//! never leaves a terminal state. Only the execution engine drives it; the
//! queue reads the state to decide what to do with the queue head.

use chrono::Utc;
use uuid::Uuid;

use crate::{Error, PostRecord, PostState, Result, ResumeMode};

impl PostState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PostState::Done | PostState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            PostState::Pending => 0,
            PostState::Running => 1,
            PostState::Done | PostState::Failed => 2,
        }
    }

    /// Forward moves only. Re-entering the same non-terminal state is allowed
    /// so that an engine resuming a `RUNNING` record can mark it running again.
    pub fn can_transition_to(self, to: PostState) -> bool {
        !self.is_terminal() && to.rank() >= self.rank()
    }
}

impl PostRecord {
    /// A fresh record with no website attempts yet.
    pub fn new(submission_id: Uuid, resume_mode: ResumeMode) -> Self {
        PostRecord {
            id: Uuid::new_v4(),
            submission_id,
            state: PostState::Pending,
            resume_mode,
            created_at: Utc::now(),
            completed_at: None,
            children: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves the record to `to`, stamping `completed_at` on terminal states.
    pub fn transition(&mut self, to: PostState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state,
                to,
            });
        }

        self.state = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}
