//! Case events and the type-hierarchy-aware event broker.

pub mod broker;
pub mod case_event;
pub mod consumer;
pub mod event;

pub use broker::{BrokerError, ConsumerFailure, DispatchReport, EventBroker, SubscriptionId};
pub use case_event::{CaseEvent, CaseEventKind};
pub use consumer::{ConsumerError, EventConsumer};
pub use event::{Event, EventKind, Lineage};
