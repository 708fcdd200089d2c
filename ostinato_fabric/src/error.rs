// Fabrication errors.
//
// One enum covers everything that can stop a segment from being crafted.
// The scheduler decides what to do with a failure; the core never retries.
// `is_recoverable` marks the one kind a caller may shrug off and carry on
// from: a choice refused because its memes would break the taxonomy.
//
// See also: `ostinato_content::ContentError`, which converts into
// `FabricationError::Content`.

use crate::enums::SegmentState;
use crate::segment::SegmentId;
use ostinato_content::ContentError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FabricationError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("illegal segment state transition from {from} to {to}")]
    IllegalStateTransition { from: SegmentState, to: SegmentState },

    #[error("invalid configuration for {subject}: {reason}")]
    Configuration { subject: String, reason: String },

    #[error("meme taxonomy violation: [{memes}]")]
    TaxonomyViolation { memes: String },

    #[error("segment {segment_id} is {state} and cannot be written")]
    SegmentNotWritable { segment_id: SegmentId, state: SegmentState },

    #[error("chain mismatch: {reason}")]
    ChainMismatch { reason: String },

    #[error("no candidates for {what}")]
    NoCandidates { what: String },

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("segment JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FabricationError {
    pub fn not_found(what: impl Into<String>) -> Self {
        FabricationError::NotFound { what: what.into() }
    }

    pub fn no_candidates(what: impl Into<String>) -> Self {
        FabricationError::NoCandidates { what: what.into() }
    }

    /// True only for a refused meme addition. Everything else is fatal to
    /// the segment being crafted.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FabricationError::TaxonomyViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_taxonomy_violations_are_recoverable() {
        let violation = FabricationError::TaxonomyViolation {
            memes: "WINTER, SUMMER".to_string(),
        };
        assert!(violation.is_recoverable());
        assert!(!FabricationError::not_found("voice of event").is_recoverable());
        assert!(
            !FabricationError::IllegalStateTransition {
                from: SegmentState::Crafted,
                to: SegmentState::Planned,
            }
            .is_recoverable()
        );
    }

    #[test]
    fn content_errors_convert() {
        let err: FabricationError = ContentError::not_found("InstrumentAudio", "abc").into();
        assert!(matches!(err, FabricationError::Content(_)));
        assert_eq!(err.to_string(), "InstrumentAudio not found: abc");
    }

    #[test]
    fn transition_message_names_both_states() {
        let err = FabricationError::IllegalStateTransition {
            from: SegmentState::Crafted,
            to: SegmentState::Planned,
        };
        assert_eq!(err.to_string(), "illegal segment state transition from Crafted to Planned");
    }
}
