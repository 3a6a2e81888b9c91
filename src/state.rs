//! The shared pipeline state threaded through every stage.
//!
//! `PipelineState` is the single record every stage receives and returns.
//! Stages never mutate in place: each one builds an updated value so the
//! transition history stays auditable and every intermediate state can be
//! checkpointed. Every field round-trips through JSON; absent optional
//! fields are omitted from the serialized form entirely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of revise/validate cycles before the loop is forced to
/// terminate.
pub const MAX_REVISIONS: u32 = 3;

/// Broad topic area of a report query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainCategory {
    FrontierTechAi,
    BusinessMarkets,
    Sustainability,
    SocialChange,
    LifeSciences,
    GlobalAffairs,
    General,
}

impl DomainCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainCategory::FrontierTechAi => "frontier_tech_ai",
            DomainCategory::BusinessMarkets => "business_markets",
            DomainCategory::Sustainability => "sustainability",
            DomainCategory::SocialChange => "social_change",
            DomainCategory::LifeSciences => "life_sciences",
            DomainCategory::GlobalAffairs => "global_affairs",
            DomainCategory::General => "general",
        }
    }
}

impl fmt::Display for DomainCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of analysis the caller is asking for.
///
/// Deserialization is deliberately forgiving: snapshots written by earlier
/// versions used several spellings for the same intent, so `from_alias`
/// accepts them all and falls back to `Overview` rather than failing a
/// resume. Alias table:
///
/// | canonical           | accepted aliases                       |
/// |---------------------|----------------------------------------|
/// | `overview`          | `summary`, `general_overview`          |
/// | `comparison`        | `compare`, `versus`, `vs`              |
/// | `causal_analysis`   | `causal`, `cause_effect`               |
/// | `trend_prediction`  | `trend`, `forecast`, `prediction`      |
/// | `pros_cons`         | `pros-cons`, `pros_and_cons`           |
/// | `solution_proposal` | `solution`, `proposal`, `solutions`    |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisIntent {
    Overview,
    Comparison,
    CausalAnalysis,
    TrendPrediction,
    ProsCons,
    SolutionProposal,
}

impl AnalysisIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisIntent::Overview => "overview",
            AnalysisIntent::Comparison => "comparison",
            AnalysisIntent::CausalAnalysis => "causal_analysis",
            AnalysisIntent::TrendPrediction => "trend_prediction",
            AnalysisIntent::ProsCons => "pros_cons",
            AnalysisIntent::SolutionProposal => "solution_proposal",
        }
    }

    /// Coerce a raw string into an intent, accepting the documented aliases.
    /// Unknown strings default to `Overview` so a legacy snapshot never
    /// fails to load over an intent spelling.
    pub fn from_alias(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "overview" | "summary" | "general_overview" => AnalysisIntent::Overview,
            "comparison" | "compare" | "versus" | "vs" => AnalysisIntent::Comparison,
            "causal_analysis" | "causal" | "cause_effect" | "causalanalysis" => {
                AnalysisIntent::CausalAnalysis
            }
            "trend_prediction" | "trend" | "forecast" | "prediction" | "trendprediction" => {
                AnalysisIntent::TrendPrediction
            }
            "pros_cons" | "pros_and_cons" | "proscons" => AnalysisIntent::ProsCons,
            "solution_proposal" | "solution" | "solutions" | "proposal" | "solutionproposal" => {
                AnalysisIntent::SolutionProposal
            }
            _ => AnalysisIntent::Overview,
        }
    }
}

impl<'de> Deserialize<'de> for AnalysisIntent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(AnalysisIntent::from_alias(&raw))
    }
}

impl fmt::Display for AnalysisIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall verdict on the report, driving the conditional edge after the
/// validation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    #[serde(alias = "in-progress")]
    InProgress,
    Validated,
    #[serde(alias = "needs-revision")]
    NeedsRevision,
    Failed,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::InProgress => "in_progress",
            ValidationStatus::Validated => "validated",
            ValidationStatus::NeedsRevision => "needs_revision",
            ValidationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Coordinator,
    Understand,
    PlanStructure,
    RetrieveKnowledge,
    WriteAndPolish,
    Validate,
    Revise,
    GenerateReport,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Coordinator => "coordinator",
            StageId::Understand => "understand",
            StageId::PlanStructure => "plan_structure",
            StageId::RetrieveKnowledge => "retrieve_knowledge",
            StageId::WriteAndPolish => "write_and_polish",
            StageId::Validate => "validate",
            StageId::Revise => "revise",
            StageId::GenerateReport => "generate_report",
        }
    }

    /// Operation name used for progress events from this stage.
    pub fn operation(&self) -> String {
        format!("stage.{}", self.as_str())
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of query understanding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisQuery {
    pub domain: DomainCategory,
    pub analysis_intent: AnalysisIntent,
}

/// Lifecycle of a single report section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Outlined,
    Researching,
    Drafted,
    Polished,
}

/// One planned section of the report: the unit of fan-out work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub key_questions: Vec<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default = "default_section_status")]
    pub status: SectionStatus,
}

fn default_section_status() -> SectionStatus {
    SectionStatus::Outlined
}

impl Section {
    pub fn new(title: impl Into<String>, key_questions: Vec<String>) -> Self {
        Self {
            title: title.into(),
            key_questions,
            content: String::new(),
            sources: Vec::new(),
            status: SectionStatus::Outlined,
        }
    }
}

/// The planned outline of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportStructure {
    pub template_type: String,
    pub sections: Vec<Section>,
    #[serde(default = "default_true")]
    pub executive_summary_required: bool,
    #[serde(default = "default_true")]
    pub recommendations_required: bool,
    pub target_length: u32,
}

fn default_true() -> bool {
    true
}

/// The single mutable record threaded through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub user_query: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<AnalysisQuery>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<ReportStructure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,

    pub validation_status: ValidationStatus,
    #[serde(default)]
    pub revision_count: u32,
    pub current_stage: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_section: Option<String>,
    /// Titles of sections that already have generated content. Ordered,
    /// duplicate-free; never larger than the outline's section count.
    #[serde(default)]
    pub processed_sections: Vec<String>,

    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,

    #[serde(default)]
    pub quality_metrics: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,

    pub word_limit: u32,
}

impl PipelineState {
    /// Fresh state for a new run.
    pub fn new(user_query: impl Into<String>, word_limit: u32) -> Self {
        let now = Utc::now();
        Self {
            user_query: user_query.into(),
            requirements: None,
            structure: None,
            draft_report: None,
            final_report: None,
            validation_status: ValidationStatus::Pending,
            revision_count: 0,
            current_stage: StageId::Coordinator,
            active_section: None,
            processed_sections: Vec::new(),
            start_time: now,
            last_updated: now,
            error_message: None,
            warnings: Vec::new(),
            quality_metrics: BTreeMap::new(),
            processing_time: None,
            word_limit,
        }
    }

    /// Record that `stage` ran, bumping `last_updated`. `start_time` is
    /// write-once and never touched here.
    pub fn touch(&mut self, stage: StageId) {
        self.current_stage = stage;
        self.last_updated = Utc::now();
    }

    /// Convert this state into a failed state for `stage`.
    pub fn fail(mut self, stage: StageId, message: impl Into<String>) -> Self {
        self.touch(stage);
        self.error_message = Some(message.into());
        self.validation_status = ValidationStatus::Failed;
        self
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Append generated content for one section to the draft. The draft is
    /// append-only until the writing stage consumes it.
    pub fn append_section_draft(&mut self, title: &str, content: &str) {
        let draft = self.draft_report.get_or_insert_with(String::new);
        if !draft.is_empty() {
            draft.push_str("\n\n");
        }
        draft.push_str(&format!("[{title}]\n{content}"));
    }

    /// Mark a section as processed, keeping `processed_sections` set-like.
    pub fn mark_section_processed(&mut self, title: &str) {
        if !self.processed_sections.iter().any(|t| t == title) {
            self.processed_sections.push(title.to_string());
        }
    }

    /// Merge a batch of quality metric values into the state's mapping.
    pub fn merge_metrics(&mut self, metrics: BTreeMap<String, Value>) {
        self.quality_metrics.extend(metrics);
    }

    /// Whether the run has reached a terminal report: either the gate passed
    /// or the revision ceiling forced termination.
    pub fn is_final(&self) -> bool {
        self.validation_status == ValidationStatus::Validated
            || self.revision_count >= MAX_REVISIONS
    }
}
