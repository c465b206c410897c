//! Failure taxonomy for the sync engine.
//!
//! Every variant is terminal at some stage boundary: the orchestrator logs it
//! with account/operation context and moves on to the next stage.
use crate::model::EntityType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A single request failed; callers retry these.
    #[error("request failed: {0:#}")]
    TransientNetwork(#[source] anyhow::Error),

    #[error("token refresh for account {account} failed after {attempts} attempts")]
    AuthRefreshExhausted {
        account: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{entity} sweep aborted after {attempts} failed search attempts")]
    SweepExhausted {
        entity: EntityType,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// More pages remain past the cursor ceiling but the date window cannot
    /// move forward, so the rest of the entity cannot be reached this run.
    #[error("{entity} sweep stalled at cursor {after}: date window cannot advance")]
    WindowStalled { entity: EntityType, after: String },

    #[error("attendee lookup for meeting {meeting_id} failed")]
    EnrichmentFailure {
        meeting_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("bulk insert of {count} actions failed")]
    SinkWriteFailure {
        count: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("action queue worker is no longer running")]
    QueueClosed,

    #[error("account store error: {0:#}")]
    Store(#[source] anyhow::Error),
}
