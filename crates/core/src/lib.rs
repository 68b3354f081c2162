//! `caseflow-core`: shared building blocks for the caseflow kernel.
//!
//! This crate holds the vocabulary every other crate speaks: domain errors,
//! strongly-typed identifiers, the engine context handed to extensions, the
//! failure policy for extension calls, and the clock abstraction.

pub mod clock;
pub mod context;
pub mod error;
pub mod id;
pub mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::EngineContext;
pub use error::{DomainError, DomainResult};
pub use id::{TaskId, WorkbasketId};
pub use policy::FailurePolicy;
