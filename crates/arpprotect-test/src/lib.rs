//! Test infrastructure for the ebtables anti-spoofing reconciler
//!
//! Provides:
//! - [`FakeEbtables`]: an in-memory rule engine behind the `CommandRunner` seam
//! - Fixtures for vifs, MAC sets and literal listings
//! - Verification helpers over the fake engine's tables and command history

pub mod fake_engine;
pub mod fixtures;
mod verification;

pub use fake_engine::{FakeEbtables, RecordedCommand};
pub use fixtures::*;
pub use verification::*;
