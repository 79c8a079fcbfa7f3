use thiserror::Error;

/// Unified error type for tabula operations.
#[derive(Debug, Error)]
pub enum TabulaError {
    /// Payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Incoming mergeable content failed structural validation.
    #[error("invalid mergeable content: {0}")]
    InvalidContent(String),

    /// A synchronizer request received no reply within its deadline.
    ///
    /// This is an ignorable error: the enclosing pull/push cycle completes
    /// without applying a change and a later retry can succeed.
    #[error("request '{request_id}' to '{to}' timed out")]
    RequestTimeout {
        /// Peer the request was addressed to.
        to: String,
        /// Correlation id of the request that went unanswered.
        request_id: String,
    },

    /// A peer answered a request with a response of the wrong kind.
    #[error("unexpected response for request '{0}'")]
    UnexpectedResponse(String),

    /// The underlying message channel is closed or rejected a send.
    #[error("sync channel closed")]
    ChannelClosed,
}

/// Result type alias for tabula operations.
pub type Result<T> = std::result::Result<T, TabulaError>;
