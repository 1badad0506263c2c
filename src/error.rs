use thiserror::Error;

/// Pose registration error types
///
/// Everything here is fatal for the running loop: a wiring or version
/// mismatch that cannot be worked around safely. Transient data loss and
/// numerical trouble are reported through events and correction statuses
/// instead.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Unexpected frame size on channel '{channel}': saw {actual}, wanted {expected}")]
    FrameSize {
        channel: String,
        expected: usize,
        actual: usize,
    },

    #[error("Malformed marker batch on channel '{channel}': header says {declared}, body has {actual}")]
    MalformedBatch {
        channel: String,
        declared: usize,
        actual: usize,
    },

    #[error("Invalid parameters: {0}")]
    InvalidParameter(String),

    #[error("Channel '{0}' closed")]
    ChannelClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for registration operations
pub type RegResult<T> = Result<T, RegistrationError>;

impl RegistrationError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        RegistrationError::InvalidParameter(msg.into())
    }
}
