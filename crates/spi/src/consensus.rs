//! Unanimity rule for decisions contributed by external providers.
//!
//! ```text
//! providers:   p1     p2     p3
//! opinions:    Some(5) None  Some(5)   → distinct {5}    → Some(5)
//!              Some(5) None  Some(7)   → distinct {5, 7} → None (disagreement, error log)
//!              None    None  None      → distinct {}     → None (nobody decided, info log)
//! ```
//!
//! Providers are consulted sequentially in registration order. Disagreement is
//! never resolved by ordering or priority.

use core::fmt::Debug;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use caseflow_core::FailurePolicy;

use crate::provider::ProviderError;
use crate::registry::ProviderRegistry;

/// The decision a provider set contributes to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Routing,
    Priority,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Routing => "routing",
            DecisionKind::Priority => "priority",
        }
    }
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecisionError {
    /// A provider failed and the engine runs with `FailurePolicy::Abort`.
    #[error("{kind} provider '{provider}' failed: {source}")]
    Provider {
        kind: DecisionKind,
        provider: String,
        #[source]
        source: ProviderError,
    },
}

/// Consults every provider of one decision kind and applies the unanimity rule.
#[derive(Debug)]
pub struct DecisionEngine<I, D> {
    kind: DecisionKind,
    providers: ProviderRegistry<I, D>,
    policy: FailurePolicy,
}

impl<I, D> DecisionEngine<I, D>
where
    D: Clone + Eq + Debug,
{
    pub fn new(kind: DecisionKind, providers: ProviderRegistry<I, D>) -> Self {
        Self {
            kind,
            providers,
            policy: FailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn kind(&self) -> DecisionKind {
        self.kind
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Whether any provider is registered.
    pub fn is_enabled(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Ask every provider and return the value iff all opinions agree.
    pub fn decide(&self, input: &I) -> Result<Option<D>, DecisionError> {
        let mut distinct: Vec<D> = Vec::new();

        for provider in self.providers.iter() {
            let opinion = match provider.decide(input) {
                Ok(opinion) => opinion,
                Err(err) if self.policy.is_abort() => {
                    error!(
                        decision = %self.kind,
                        provider = provider.name(),
                        error = %err,
                        "provider failed, aborting decision"
                    );
                    return Err(DecisionError::Provider {
                        kind: self.kind,
                        provider: provider.name().to_string(),
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(
                        decision = %self.kind,
                        provider = provider.name(),
                        error = %err,
                        "provider failed, treating as no opinion"
                    );
                    None
                }
            };

            if let Some(value) = opinion {
                debug!(decision = %self.kind, provider = provider.name(), value = ?value, "provider opinion");
                if !distinct.contains(&value) {
                    distinct.push(value);
                }
            }
        }

        match distinct.len() {
            0 => {
                info!(decision = %self.kind, providers = self.providers.len(), "no provider decided");
                Ok(None)
            }
            1 => Ok(distinct.pop()),
            _ => {
                error!(decision = %self.kind, opinions = ?distinct, "providers disagree, no decision");
                Ok(None)
            }
        }
    }

    /// Like [`decide`](Self::decide), but returns `authoritative` without
    /// consulting any provider when the caller already has a value.
    pub fn decide_unless(
        &self,
        authoritative: Option<D>,
        input: &I,
    ) -> Result<Option<D>, DecisionError> {
        match authoritative {
            Some(value) => Ok(Some(value)),
            None => self.decide(input),
        }
    }
}
