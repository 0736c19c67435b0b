//! Error types for the match-state engine
//!
//! Application code uses the anyhow-based `Result` alias; the typed errors
//! below are converted with `.into()` and recovered with `downcast_ref` where
//! a caller needs to tell them apart (the HTTP layer, the workers).

use crate::types::MatchId;

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Engine-level failures surfaced to callers
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Optimistic transaction kept losing to concurrent writers
    #[error("Move on match {mid} not applied: conflicting writers after {attempts} attempts")]
    Conflict { mid: MatchId, attempts: u32 },

    #[error("Match not found: {mid}")]
    MatchNotFound { mid: MatchId },

    #[error("Invalid move: {reason}")]
    InvalidMove { reason: String },

    /// Corrupt payload on the wire or in the store
    #[error("Failed to decode {what}: {message}")]
    Decode { what: String, message: String },

    #[error("Internal engine error: {message}")]
    InternalError { message: String },
}

impl EngineError {
    /// True for failures that should halt a worker rather than be retried in place
    pub fn is_fatal_for_worker(&self) -> bool {
        matches!(self, EngineError::Decode { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_match() {
        let err = EngineError::Conflict {
            mid: "m1".to_string(),
            attempts: 2,
        };
        assert!(err.to_string().contains("m1"));
        assert!(err.to_string().contains("2 attempts"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = EngineError::MatchNotFound {
            mid: "missing".to_string(),
        }
        .into();

        match err.downcast_ref::<EngineError>() {
            Some(EngineError::MatchNotFound { mid }) => assert_eq!(mid, "missing"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_only_decode_is_fatal() {
        assert!(EngineError::Decode {
            what: "update".to_string(),
            message: "bad json".to_string()
        }
        .is_fatal_for_worker());
        assert!(!EngineError::InvalidMove {
            reason: "row".to_string()
        }
        .is_fatal_for_worker());
    }
}
