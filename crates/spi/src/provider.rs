use thiserror::Error;

use caseflow_core::{DomainError, EngineContext};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider could not be initialized from the engine context.
    #[error("provider '{provider}' failed to initialize: {reason}")]
    Initialization { provider: String, reason: String },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("provider failed: {0}")]
    Failed(String),
}

impl ProviderError {
    pub fn initialization(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Initialization {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

/// An externally supplied contributor to one kind of decision.
///
/// Providers are initialized exactly once, in registration order, before the
/// first decision is requested. Between calls to `decide` they are treated as
/// stateless; `decide` must not rely on side effects.
pub trait DecisionProvider<I, D>: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    fn initialize(&mut self, _ctx: &EngineContext) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Release resources acquired in `initialize`.
    fn teardown(&mut self) {}

    /// Return `Ok(None)` for "no opinion".
    fn decide(&self, input: &I) -> Result<Option<D>, ProviderError>;
}
