//! Error types for stream endpoints and transform pipelines

use thiserror::Error;

/// Result type for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Error type for stream operations
///
/// Errors are cloneable because a single terminal reason is stored by an
/// endpoint and handed out to every later caller. A stored reason is never
/// re-wrapped, so the value observed on the writable side compares equal to
/// the one observed on the readable side.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// A transform, flush or start callback failed
    #[error("Transform failed: {0}")]
    TransformFailure(String),

    /// An item was enqueued after the readable side stopped accepting items
    #[error("Readable side no longer accepts items{}", reason_suffix(.reason))]
    OutputClosed {
        /// Terminal reason stored by the readable side, if it errored
        reason: Option<Box<StreamError>>,
    },

    /// The transformer terminated the pipeline early
    #[error("Stream terminated")]
    Terminated,

    /// Caller-supplied abort reason
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Caller-supplied cancel reason
    #[error("Canceled: {0}")]
    Canceled(String),

    /// The stream already has an active reader or writer
    #[error("Stream is locked")]
    Locked,

    /// The operation is not valid in the current stream state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A queuing strategy size function returned an unusable value
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(f64),

    /// A queuing strategy was configured with an unusable high-water mark
    #[error("Invalid high-water mark: {0}")]
    InvalidHighWaterMark(f64),

    /// The stream was closed
    #[error("Stream closed")]
    Closed,
}

impl StreamError {
    /// Create a transform failure from anything displayable
    pub fn transform(message: impl std::fmt::Display) -> Self {
        Self::TransformFailure(message.to_string())
    }

    /// Create an abort reason
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }

    /// Create a cancel reason
    pub fn canceled(reason: impl Into<String>) -> Self {
        Self::Canceled(reason.into())
    }

    /// Create an output-closed error carrying the readable side's stored error
    pub fn output_closed(reason: Option<StreamError>) -> Self {
        Self::OutputClosed {
            reason: reason.map(Box::new),
        }
    }

    /// Whether this error was raised by an early terminate
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

fn reason_suffix(reason: &Option<Box<StreamError>>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_closed_display() {
        let bare = StreamError::output_closed(None);
        assert_eq!(bare.to_string(), "Readable side no longer accepts items");

        let with_reason = StreamError::output_closed(Some(StreamError::aborted("disk full")));
        assert_eq!(
            with_reason.to_string(),
            "Readable side no longer accepts items: Aborted: disk full"
        );
    }

    #[test]
    fn test_cloned_reason_compares_equal() {
        let reason = StreamError::transform("bad row");
        assert_eq!(reason.clone(), reason);
        assert!(!reason.is_terminated());
        assert!(StreamError::Terminated.is_terminated());
    }
}
