//! Takeoff Agents - Rust Implementation
//!
//! A multi-agent pipeline that turns construction documents and a natural
//! language query into a priced quantity takeoff.
//!
//! # Overview
//!
//! A task carries a [`state::SharedState`] through up to seven agents, in a
//! fixed order:
//!
//! 1. FileReader extracts text from the uploaded documents
//! 2. TradeMapper assigns construction trades and CSI divisions
//! 3. Scope breaks each trade into scope items
//! 4. Takeoff measures quantities for every scope item
//! 5. Estimator prices the quantities
//! 6. QAValidator checks the estimate and scores confidence
//! 7. Exporter renders the result
//!
//! Callers may run any ordered subset, seeding the fields the skipped stages
//! would have produced. Progress is fanned out per task, and final results
//! are kept in a task store that can be polled.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use takeoff_agents::config::PipelineConfig;
//! use takeoff_agents::pipeline::{Orchestrator, SubmitRequest};
//! use takeoff_agents::progress::NoOpProgress;
//! use takeoff_agents::state::{InputFile, RunStatus};
//! use takeoff_agents::store::InMemoryTaskStore;
//! use takeoff_agents::testing::MockLlmProvider;
//!
//! tokio_test::block_on(async {
//!     let orchestrator = Orchestrator::new(
//!         &PipelineConfig::test_config(),
//!         Arc::new(MockLlmProvider::with_construction_defaults()),
//!         Arc::new(InMemoryTaskStore::new()),
//!         Arc::new(NoOpProgress),
//!     )
//!     .unwrap();
//!
//!     let request = SubmitRequest::new("Drywall takeoff for level 2")
//!         .with_file(InputFile::text("A-101.txt", "Partition type P1: 5/8 type X"));
//!     let (_task_id, state) = orchestrator.execute(request).await.unwrap();
//!
//!     assert_eq!(state.status(), RunStatus::Completed);
//!     assert_eq!(state.agent_trace().len(), 7);
//! });
//! ```

pub mod agents;
pub mod config;
pub mod error;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod server;
pub mod service;
pub mod state;
pub mod store;
pub mod testing;

pub use agents::{Agent, Stage};
pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError, StageError};
pub use pipeline::{Orchestrator, StagePlan, SubmitRequest};
pub use progress::{ChannelBroadcaster, ProgressBroadcaster, ProgressEvent};
pub use service::TaskService;
pub use state::{RunStatus, SharedState, TaskId, TaskResult};
pub use store::{InMemoryTaskStore, TaskSnapshot, TaskStore};
