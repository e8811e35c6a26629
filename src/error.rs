use thiserror::Error;

/// Pipeline error types
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Result type for pipeline operations
pub type PResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Errors that only drop the offending message; the pipeline keeps running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Decode(_)
                | PipelineError::Transport(_)
                | PipelineError::InvalidParameters(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_is_recoverable() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = PipelineError::from(err);
        assert!(err.is_recoverable());
        assert!(err.to_string().starts_with("Malformed payload"));
    }

    #[test]
    fn test_export_error_is_not_recoverable() {
        let err = PipelineError::Export("disk full".to_string());
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "Export failed: disk full");
    }
}
