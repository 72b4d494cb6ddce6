//! Crate-wide error types.

use thiserror::Error;

use crate::PostState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid state transition: cannot transition from {from:?} to {to:?}")]
    InvalidStateTransition { from: PostState, to: PostState },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    /// A structural queue change (enqueue, dequeue) did not complete.
    #[error("Queue {action} failed: {source}")]
    Mutation {
        action: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("Post manager error: {0}")]
    PostManager(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub(crate) fn mutation(action: &'static str, source: Error) -> Self {
        Self::Mutation {
            action,
            source: Box::new(source),
        }
    }
}
