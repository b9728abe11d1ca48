//! Error taxonomy of the output stage.

use crate::codec::CodecError;

/// Errors surfaced by the output stage.
///
/// "No packet available" and "flush complete" are not errors; they are
/// [`ReceiveOutcome`](crate::codec::ReceiveOutcome) values of the drain loop.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// Unsupported codec/format combination or invalid stream selection.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Container, encoder or hardware device allocation failed.
    #[error("Resource error: {0}")]
    Resource(String),
    /// The encoder of an output stream faulted.
    #[error("Encode error on stream {stream}: {source}")]
    Encode {
        stream: usize,
        #[source]
        source: CodecError,
    },
    /// A frame does not match what the filter declares for its stream.
    #[error("Filter mismatch on stream {stream}: {message}")]
    FilterMismatch { stream: usize, message: String },
    /// The container could not take a packet. Recoverable by retry or abort.
    #[error("Write error on stream {stream}: {source}")]
    Write {
        stream: usize,
        #[source]
        source: CodecError,
    },
    /// The output context was already closed.
    #[error("Output context is closed")]
    Closed,
}

impl OutputError {
    pub fn configuration(message: impl Into<String>) -> Self {
        OutputError::Configuration(message.into())
    }

    pub fn resource(message: impl Into<String>) -> Self {
        OutputError::Resource(message.into())
    }

    /// Map a backend failure raised while allocating resources.
    pub(crate) fn from_open(err: CodecError) -> Self {
        match err {
            CodecError::Unsupported(msg) => OutputError::Configuration(msg),
            other => OutputError::Resource(other.to_string()),
        }
    }

    /// True for failures the caller may recover from by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, OutputError::Write { .. })
    }
}

impl From<serde_json::Error> for OutputError {
    fn from(err: serde_json::Error) -> Self {
        OutputError::Configuration(format!("invalid output configuration: {}", err))
    }
}

/// Result type alias for output stage operations.
pub type Result<T> = std::result::Result<T, OutputError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping() {
        let err = OutputError::from_open(CodecError::Unsupported("codec vp7".into()));
        assert!(matches!(err, OutputError::Configuration(_)));

        let err = OutputError::from_open(CodecError::Allocation("no cuda device".into()));
        assert!(matches!(err, OutputError::Resource(_)));
        assert!(err.to_string().contains("no cuda device"));
    }

    #[test]
    fn test_only_write_errors_are_transient() {
        let write = OutputError::Write {
            stream: 0,
            source: CodecError::Io("disk full".into()),
        };
        assert!(write.is_transient());
        assert!(!OutputError::Closed.is_transient());
        assert!(!OutputError::resource("x").is_transient());
    }

    #[test]
    fn test_json_error_is_configuration() {
        let err: OutputError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, OutputError::Configuration(_)));
    }
}
