//! Stage planning and orchestration

pub mod orchestrator;
pub mod plan;

pub use orchestrator::Orchestrator;
pub use plan::{parse_stages, StagePlan};

use crate::agents::Stage;
use crate::state::{InputFile, SeedData};

/// A caller's request for one task
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub query: Option<String>,
    pub files: Vec<InputFile>,
    /// `None` runs the configured default stages
    pub stages: Option<Vec<Stage>>,
    pub seed: SeedData,
}

impl SubmitRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, file: InputFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn with_seed(mut self, seed: SeedData) -> Self {
        self.seed = seed;
        self
    }
}
