//! Testing utilities and mock implementations
//!
//! Mocks for the LLM provider and the progress broadcaster, so the pipeline
//! can be tested without network access.

pub mod mocks;

pub use mocks::*;
