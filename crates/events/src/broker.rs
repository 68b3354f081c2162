//! Type-hierarchy-aware event fan-out.
//!
//! The broker distributes a published event to every consumer interested in
//! the event's kind or in any of that kind's ancestors.
//!
//! ## Registration
//!
//! A consumer is registered under the kind it declares as its subject:
//!
//! ```text
//! subscribe(audit)     → registrations[Task]          = [audit]
//! subscribe(metrics)   → registrations[TaskCompleted] = [metrics]
//! ```
//!
//! ## Dispatch
//!
//! `forward(event)` walks from the event's most specific kind up through its
//! ancestors (the implicit root is never visited), collects the consumers
//! registered at each level, and invokes each collected consumer once:
//!
//! ```text
//! forward(TaskCompleted) → TaskCompleted → TaskEnded → Task
//!                        → metrics.consume(e), audit.consume(e)
//! forward(TaskCreated)   → TaskCreated → Task
//!                        → audit.consume(e)
//! ```
//!
//! Unlike the decision engine there is no agreement requirement: every
//! interested consumer is notified.
//!
//! ## Enabled / disabled
//!
//! The broker is enabled iff at least one consumer is registered. Only
//! `subscribe` and `unsubscribe` change that state.
//!
//! ## Failures
//!
//! The broker's [`FailurePolicy`] decides whether a failing consumer stops
//! the remaining deliveries (`Abort`) or is reported and skipped (`Isolate`).
//!
//! ## Thread Safety
//!
//! Registrations live behind an `RwLock`. Consumers are invoked after the lock
//! is released, so a consumer may itself subscribe or unsubscribe.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use caseflow_core::FailurePolicy;

use crate::consumer::{ConsumerError, EventConsumer};
use crate::event::{Event, EventKind};

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Registration state is unavailable due to internal lock poisoning.
    #[error("broker registrations poisoned")]
    Poisoned,

    /// A consumer failed and the broker runs with `FailurePolicy::Abort`.
    #[error("consumer '{consumer}' failed: {source}")]
    Consumer {
        consumer: String,
        #[source]
        source: ConsumerError,
    },
}

/// A consumer failure that was isolated during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerFailure {
    pub consumer: String,
    pub error: ConsumerError,
}

/// Outcome of one `forward` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Names of consumers that consumed the event successfully, in call order.
    pub delivered: Vec<String>,
    /// Consumers that failed (only populated under `FailurePolicy::Isolate`).
    pub failed: Vec<ConsumerFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Registration<E: Event> {
    id: SubscriptionId,
    consumer: Arc<dyn EventConsumer<E>>,
}

/// Publish/subscribe broker keyed by event kind.
pub struct EventBroker<E: Event> {
    registrations: RwLock<HashMap<E::Kind, Vec<Registration<E>>>>,
    policy: FailurePolicy,
}

impl<E: Event> EventBroker<E> {
    pub fn new() -> Self {
        Self::with_policy(FailurePolicy::default())
    }

    pub fn with_policy(policy: FailurePolicy) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Build a broker with an initial set of consumers (e.g. sourced once at
    /// startup by a provider loader).
    pub fn with_consumers(
        policy: FailurePolicy,
        consumers: impl IntoIterator<Item = Arc<dyn EventConsumer<E>>>,
    ) -> Result<(Self, Vec<SubscriptionId>), BrokerError> {
        let broker = Self::with_policy(policy);
        let ids = consumers
            .into_iter()
            .map(|c| broker.subscribe(c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((broker, ids))
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Register `consumer` under the kind it declares as its subject.
    pub fn subscribe(
        &self,
        consumer: Arc<dyn EventConsumer<E>>,
    ) -> Result<SubscriptionId, BrokerError> {
        let subject = consumer.subject();
        let id = SubscriptionId::new();
        let mut regs = self.registrations.write().map_err(|_| BrokerError::Poisoned)?;

        debug!(
            consumer = consumer.name(),
            subject = subject.name(),
            subscription = %id,
            "consumer subscribed"
        );
        regs.entry(subject)
            .or_default()
            .push(Registration { id, consumer });

        Ok(id)
    }

    /// Remove a registration. Returns `false` if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, BrokerError> {
        let mut regs = self.registrations.write().map_err(|_| BrokerError::Poisoned)?;

        let mut removed = false;
        regs.retain(|_, list| {
            let before = list.len();
            list.retain(|r| r.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });

        if removed {
            debug!(subscription = %id, remaining_kinds = regs.len(), "consumer unsubscribed");
        }
        Ok(removed)
    }

    /// Whether any consumer is registered.
    pub fn is_enabled(&self) -> bool {
        self.registrations
            .read()
            .map(|regs| !regs.is_empty())
            .unwrap_or(false)
    }

    /// Number of registrations across all kinds.
    pub fn consumer_count(&self) -> usize {
        self.registrations
            .read()
            .map(|regs| regs.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Deliver `event` to every consumer registered at its kind or an ancestor.
    pub fn forward(&self, event: &E) -> Result<DispatchReport, BrokerError> {
        let kind = event.kind();
        let targets = self.collect_consumers(kind)?;

        if targets.is_empty() {
            trace!(event_kind = kind.name(), "no consumers for event");
            return Ok(DispatchReport::default());
        }

        let mut report = DispatchReport::default();
        for consumer in targets {
            match consumer.consume(event) {
                Ok(()) => report.delivered.push(consumer.name().to_string()),
                Err(err) if self.policy.is_abort() => {
                    error!(
                        consumer = consumer.name(),
                        event_kind = kind.name(),
                        error = %err,
                        "consumer failed, aborting dispatch"
                    );
                    return Err(BrokerError::Consumer {
                        consumer: consumer.name().to_string(),
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(
                        consumer = consumer.name(),
                        event_kind = kind.name(),
                        error = %err,
                        "consumer failed, continuing dispatch"
                    );
                    report.failed.push(ConsumerFailure {
                        consumer: consumer.name().to_string(),
                        error: err,
                    });
                }
            }
        }

        debug!(
            event_kind = kind.name(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "event forwarded"
        );
        Ok(report)
    }

    /// Consumers reachable from `kind`, most specific level first, each once.
    fn collect_consumers(
        &self,
        kind: E::Kind,
    ) -> Result<Vec<Arc<dyn EventConsumer<E>>>, BrokerError> {
        let regs = self.registrations.read().map_err(|_| BrokerError::Poisoned)?;

        let mut seen: HashSet<*const ()> = HashSet::new();
        let mut targets = Vec::new();
        for level in kind.lineage() {
            let Some(list) = regs.get(&level) else {
                continue;
            };
            for reg in list {
                // The same consumer instance may be registered more than once.
                if seen.insert(Arc::as_ptr(&reg.consumer) as *const ()) {
                    targets.push(Arc::clone(&reg.consumer));
                }
            }
        }
        Ok(targets)
    }
}

impl<E: Event> Default for EventBroker<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> std::fmt::Debug for EventBroker<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroker")
            .field("policy", &self.policy)
            .field("consumers", &self.consumer_count())
            .finish()
    }
}
