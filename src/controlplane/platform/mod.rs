//! Platform Adapters
//!
//! In-memory implementations of the cloud and node directory ports, used by
//! standalone mode and by the test suites.

pub mod memory;

pub use memory::*;
