//! Common test utilities for PixlKey integration tests.
//!
//! `TestHarness` owns a temporary processed directory, an in-memory
//! database and a scriptable [`MemoryToolkit`]; `builders` produces
//! submissions and uploads.

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
