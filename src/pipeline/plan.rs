//! Validated stage subsets

use crate::agents::Stage;
use crate::error::PipelineError;
use crate::state::{SharedState, StateField};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

pub const PRESET_FULL: &str = "full";
pub const PRESET_QUICK_ESTIMATE: &str = "quick_estimate";
pub const PRESET_FILE_ANALYSIS: &str = "file_analysis";

/// Ordered list of stages one run will execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    pub fn full() -> Self {
        Self {
            stages: Stage::ALL.to_vec(),
        }
    }

    /// Takeoff and Estimator over seeded scope items
    pub fn quick_estimate() -> Self {
        Self {
            stages: vec![Stage::Takeoff, Stage::Estimator],
        }
    }

    pub fn file_analysis() -> Self {
        Self {
            stages: vec![Stage::FileReader, Stage::TradeMapper],
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            PRESET_FULL => Some(Self::full()),
            PRESET_QUICK_ESTIMATE => Some(Self::quick_estimate()),
            PRESET_FILE_ANALYSIS => Some(Self::file_analysis()),
            _ => None,
        }
    }

    /// Check `stages` against the state it will run on. Any problem is a
    /// configuration error raised before an agent runs.
    pub fn validate(stages: &[Stage], state: &SharedState) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::configuration("No stages requested"));
        }

        let mut seen = HashSet::new();
        for stage in stages {
            if !seen.insert(*stage) {
                return Err(PipelineError::configuration(format!(
                    "Stage {stage} requested more than once"
                )));
            }
        }

        for pair in stages.windows(2) {
            if pair[0] > pair[1] {
                return Err(PipelineError::configuration(format!(
                    "Stage {} must run before {}",
                    pair[1], pair[0]
                )));
            }
        }

        let plan = Self {
            stages: stages.to_vec(),
        };
        plan.check(state)?;
        Ok(plan)
    }

    /// Every required field must be produced earlier in the plan or seeded,
    /// and no stage may target a field that is already populated
    pub fn check(&self, state: &SharedState) -> Result<(), PipelineError> {
        let mut available: HashSet<StateField> = Stage::ALL
            .iter()
            .map(|stage| stage.produces())
            .filter(|field| state.has(*field))
            .collect();

        for stage in &self.stages {
            for field in stage.requires() {
                if !available.contains(field) {
                    return Err(PipelineError::configuration(format!(
                        "Stage {stage} requires {field}, which no earlier requested stage produces and the request does not seed"
                    )));
                }
            }

            let produced = stage.produces();
            if state.has(produced) {
                return Err(PipelineError::configuration(format!(
                    "Stage {stage} would overwrite seeded {produced}"
                )));
            }
            available.insert(produced);
        }
        Ok(())
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Display for StagePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.write_str(&names.join(" -> "))
    }
}

/// Parse a preset name or a comma/space separated stage list
pub fn parse_stages(spec: &str) -> Result<Vec<Stage>, PipelineError> {
    if let Some(plan) = StagePlan::preset(spec) {
        return Ok(plan.stages);
    }

    let stages = spec
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<Stage>()
                .map_err(|e| PipelineError::configuration(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if stages.is_empty() {
        return Err(PipelineError::configuration("No stages requested"));
    }
    Ok(stages)
}
