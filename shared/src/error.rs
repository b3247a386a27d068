//! Error taxonomy for sequencers and their collaborators

use thiserror::Error;

use crate::CorrelationId;

/// Errors surfaced to callers of a sequencer or bounded request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SequencerError {
    #[error("Submission rejected for {target}: {reason}")]
    RejectedSubmission { target: String, reason: String },

    #[error("Resource {0} is not available")]
    ResourceUnavailable(String),

    #[error("Dispatch of command {id} failed: {source}")]
    DispatchFailure {
        id: CorrelationId,
        #[source]
        source: DispatchError,
    },

    #[error("Resource {0} connection lost")]
    ResourceLost(String),

    #[error("Unknown command {0}")]
    UnknownCommand(CorrelationId),

    #[error("Command {0} already dispatched")]
    AlreadyDispatched(CorrelationId),

    #[error("No response within {0}ms")]
    Timeout(u64),

    #[error("A request is already in flight")]
    RequestInFlight,

    #[error("Responder dropped the request")]
    ResponderGone,

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),
}

impl SequencerError {
    /// Build a rejection for the given target
    pub fn rejected(target: impl ToString, reason: impl Into<String>) -> Self {
        Self::RejectedSubmission {
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors a collaborator reports when the remote call itself fails
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Remote service not bound")]
    NotBound,

    #[error("Remote call failed: {0}")]
    Remote(String),
}
