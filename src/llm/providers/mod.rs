//! Concrete [`LlmProvider`](crate::llm::provider::LlmProvider) backends

pub mod anthropic;
pub mod openai;

pub use anthropic::*;
pub use openai::*;
