use thiserror::Error;

use caseflow_core::DomainError;

use crate::event::Event;

/// Failure reported by an event consumer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("consumer failed: {0}")]
    Failed(String),
}

/// Receives events of one kind and all of its descendants.
///
/// A consumer declares its subject once; the broker keys the registration by
/// that kind, not by whatever kind is later published.
pub trait EventConsumer<E: Event>: Send + Sync {
    /// Name used in logs and dispatch reports.
    fn name(&self) -> &str;

    /// The most general kind this consumer wants to see.
    fn subject(&self) -> E::Kind;

    fn consume(&self, event: &E) -> Result<(), ConsumerError>;
}
