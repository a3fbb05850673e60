//! Error types for nexus-chat

use thiserror::Error;

use crate::message::MessageStatus;

/// Result type alias using nexus-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during chat operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire layer
    #[error(transparent)]
    Api(#[from] nexus_api::Error),

    /// No message with this id in the session
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// No session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Approve/reject on a message that is not paused
    #[error("Message is not awaiting approval (status: {status})")]
    NotPendingApproval { status: MessageStatus },

    /// The operation needs a bound data source
    #[error("No data source bound to this session")]
    NoDataSource,

    /// A generic chat error
    #[error("{0}")]
    Other(String),
}
