//! Pipeline error taxonomy
//!
//! "Not ready yet" outcomes are modelled as values (`Option`, enums) by the
//! pipeline stages; these variants are what surfaces when a caller needs a
//! reason.

/// Errors produced by the detection and trading pipeline
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("insufficient data for {symbol}: have {have} candles, need {need}")]
    InsufficientData {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("invalid pattern: {reason}")]
    InvalidPattern { reason: String },

    #[error("breakout not yet actionable: {reason}")]
    ValidationNotMet { reason: String },

    #[error("{operation} failed after {attempts} attempt(s): {reason}")]
    UpstreamFailure {
        operation: String,
        attempts: u32,
        reason: String,
    },

    #[error("invariant violated: {reason}")]
    InvariantViolation { reason: String },

    #[error("malformed input: {reason}")]
    MalformedInput { reason: String },

    #[error("unknown position {id}")]
    UnknownPosition { id: String },

    #[error("position {id} is already closed")]
    PositionClosed { id: String },
}

impl PipelineError {
    /// Store write that did not go through
    pub fn persistence(operation: &str, err: &anyhow::Error) -> Self {
        PipelineError::UpstreamFailure {
            operation: operation.to_string(),
            attempts: 1,
            reason: format!("{:#}", err),
        }
    }

    /// Whether the condition clears on its own given more time or data
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::InsufficientData { .. }
                | PipelineError::ValidationNotMet { .. }
                | PipelineError::UpstreamFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = PipelineError::InsufficientData {
            symbol: "AAPL".into(),
            have: 3,
            need: 4,
        };
        assert_eq!(
            err.to_string(),
            "insufficient data for AAPL: have 3 candles, need 4"
        );
        assert!(err.is_transient());

        let err = PipelineError::MalformedInput {
            reason: "high < low".into(),
        };
        assert!(!err.is_transient());
    }
}
