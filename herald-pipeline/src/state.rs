//! Per-record processing state machine of the consumer pipeline.
//!
//! ```text
//! Fetched -> Decoding -> DecodeFailed -> DeadLettered -> Committed
//!                     -> Decoded -> Handling -> HandleSucceeded -> Committed
//!                                            -> HandleFailed -> Retrying -> Handling
//!                                                            -> DeadLettered
//!                                                            -> Skipped -> Committed
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    Fetched,
    Decoding,
    DecodeFailed,
    Decoded,
    Handling,
    HandleFailed,
    Retrying,
    HandleSucceeded,
    DeadLettered,
    /// Handler failed under the skip policy.
    Skipped,
    Committed,
}

impl RecordState {
    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition_to(self, next: RecordState) -> bool {
        use RecordState::*;
        matches!(
            (self, next),
            (Fetched, Decoding)
                | (Decoding, DecodeFailed)
                | (Decoding, Decoded)
                | (DecodeFailed, DeadLettered)
                | (Decoded, Handling)
                | (Handling, HandleSucceeded)
                | (Handling, HandleFailed)
                | (HandleFailed, Retrying)
                | (HandleFailed, DeadLettered)
                | (HandleFailed, Skipped)
                | (Retrying, Handling)
                | (HandleSucceeded, Committed)
                | (DeadLettered, Committed)
                | (Skipped, Committed)
        )
    }

    /// States after which the record's offset may be committed.
    pub fn is_committable(self) -> bool {
        matches!(
            self,
            Self::HandleSucceeded | Self::DeadLettered | Self::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Decoding => "decoding",
            Self::DecodeFailed => "decode_failed",
            Self::Decoded => "decoded",
            Self::Handling => "handling",
            Self::HandleFailed => "handle_failed",
            Self::Retrying => "retrying",
            Self::HandleSucceeded => "handle_succeeded",
            Self::DeadLettered => "dead_lettered",
            Self::Skipped => "skipped",
            Self::Committed => "committed",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one record through the state machine.
#[derive(Debug)]
pub(crate) struct RecordProgress {
    state: RecordState,
}

impl RecordProgress {
    pub(crate) fn new() -> Self {
        Self {
            state: RecordState::Fetched,
        }
    }

    pub(crate) fn state(&self) -> RecordState {
        self.state
    }

    /// Move to `next`. Illegal steps are a pipeline bug.
    pub(crate) fn advance(&mut self, next: RecordState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal record transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!(from = %self.state, to = %next, "Record state");
        self.state = next;
    }
}
