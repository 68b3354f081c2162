//! Extension points of the case engine and the consensus rule that governs them.
//!
//! External providers (routing, priority) are loaded once at startup, handed
//! to a [`ProviderRegistry`], and consulted through a [`DecisionEngine`] that
//! only accepts a value when every provider that voiced an opinion agrees.

pub mod consensus;
pub mod priority;
pub mod provider;
pub mod registry;
pub mod routing;
pub mod task;

pub use consensus::{DecisionEngine, DecisionError, DecisionKind};
pub use priority::{ClassificationPriority, PriorityManager, PriorityProvider};
pub use provider::{DecisionProvider, ProviderError};
pub use registry::ProviderRegistry;
pub use routing::{ClassificationRouting, RoutingManager, RoutingProvider};
pub use task::TaskSnapshot;
