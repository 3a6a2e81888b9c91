//! The stage graph and its sequential runner.
//!
//! Stages execute one at a time on a single task; the only internal
//! parallelism is the bounded section fan-out inside the retrieval stage.
//! The graph is a fixed chain with one conditional cycle after validation;
//! the cycle is bounded by the revision ceiling, so every run terminates
//! after a fixed maximum number of stage executions.

pub mod sections;
pub mod stages;

use std::sync::Arc;

use crate::config::Config;
use crate::llm::{Generator, RetryPolicy};
use crate::progress::ProgressBus;
use crate::search::SearchProvider;
use crate::state::{MAX_REVISIONS, PipelineState, StageId, ValidationStatus};

/// Everything a stage needs, injected once at run start. No stage reaches
/// for globals: the context owns the external capabilities, the progress
/// bus and the runtime configuration for exactly one run.
#[derive(Clone)]
pub struct PipelineContext {
    pub generator: Arc<dyn Generator>,
    pub search: Arc<dyn SearchProvider>,
    pub bus: ProgressBus,
    pub config: Config,
}

impl PipelineContext {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.llm.retry_policy()
    }
}

/// Which stage runs after `last`, given the current state.
///
/// `None` for `last` means the run is starting; `None` as the result means
/// the run is over. The conditional edge after validation routes to the
/// revise stage only while the report needs revision and the ceiling has
/// not been reached; every other outcome falls through to final-report
/// generation so the run always terminates with an artifact (or an error
/// recorded on the state).
pub fn next_stage(last: Option<StageId>, state: &PipelineState) -> Option<StageId> {
    match last {
        None | Some(StageId::Coordinator) => Some(StageId::Understand),
        Some(StageId::Understand) => Some(StageId::PlanStructure),
        Some(StageId::PlanStructure) => Some(StageId::RetrieveKnowledge),
        Some(StageId::RetrieveKnowledge) => Some(StageId::WriteAndPolish),
        Some(StageId::WriteAndPolish) => Some(StageId::Validate),
        Some(StageId::Validate) => {
            if state.validation_status == ValidationStatus::NeedsRevision
                && state.revision_count < MAX_REVISIONS
            {
                Some(StageId::Revise)
            } else {
                Some(StageId::GenerateReport)
            }
        }
        Some(StageId::Revise) => Some(StageId::Validate),
        Some(StageId::GenerateReport) => None,
    }
}

/// Drives the stage graph over one state.
pub struct Orchestrator {
    ctx: PipelineContext,
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    async fn execute_stage(&self, stage: StageId, state: PipelineState) -> PipelineState {
        match stage {
            StageId::Understand => stages::understand(&self.ctx, state).await,
            StageId::PlanStructure => stages::plan_structure(&self.ctx, state).await,
            StageId::RetrieveKnowledge => stages::retrieve_knowledge(&self.ctx, state).await,
            StageId::WriteAndPolish => stages::write_and_polish(&self.ctx, state).await,
            StageId::Validate => stages::validate(&self.ctx, state).await,
            StageId::Revise => stages::revise(&self.ctx, state).await,
            StageId::GenerateReport => stages::generate_report(&self.ctx, state).await,
            // The coordinator is a bookkeeping label for fresh state, not an
            // executable stage.
            StageId::Coordinator => state,
        }
    }

    /// Run the pipeline to completion, invoking `on_stage` after every stage
    /// so the caller can checkpoint each transition.
    pub async fn run<F>(&self, mut state: PipelineState, mut on_stage: F) -> PipelineState
    where
        F: FnMut(StageId, &PipelineState),
    {
        let mut last = None;
        while let Some(stage) = next_stage(last, &state) {
            tracing::info!(stage = %stage, "executing stage");
            state = self.execute_stage(stage, state).await;
            on_stage(stage, &state);
            last = Some(stage);
        }
        state
    }
}
