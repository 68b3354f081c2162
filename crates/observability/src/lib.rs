//! Process-wide tracing setup shared by runner hosts and tests.

pub mod subscriber;

pub use subscriber::{init, init_test};
