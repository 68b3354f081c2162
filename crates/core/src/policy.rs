//! Failure policy for calls into extension code.

use serde::{Deserialize, Serialize};

/// What to do when one decision provider or event consumer fails during a round.
///
/// The same policy governs consensus rounds and event dispatch so an operator
/// configures extension isolation in exactly one place.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and continue with the remaining extensions.
    ///
    /// A failing decision provider is treated as having no opinion; a failing
    /// event consumer is reported but does not stop delivery to the others.
    #[default]
    Isolate,
    /// Stop the round at the first failure and surface it to the caller.
    Abort,
}

impl FailurePolicy {
    pub fn is_abort(self) -> bool {
        matches!(self, FailurePolicy::Abort)
    }
}
