//! The seven pipeline stages.
//!
//! Every stage follows the same contract: publish a start event, check its
//! reentrancy guard (if the expected output is already present, the stage is
//! a no-op that only records itself and publishes a skip event), check its
//! precondition (a missing upstream field produces a failed state), then do
//! its work. Nothing here returns an error: failures become state.

use serde_json::json;
use std::sync::Arc;

use crate::llm::{GenerateParams, generate_with_retry};
use crate::pipeline::PipelineContext;
use crate::pipeline::sections::{SectionContext, run_sections};
use crate::prompts;
use crate::quality::evaluate_report;
use crate::report;
use crate::revision::{build_revision_prompt, select_strategy};
use crate::state::{
    AnalysisIntent, AnalysisQuery, DomainCategory, MAX_REVISIONS, PipelineState, ReportStructure,
    Section, SectionStatus, StageId, ValidationStatus,
};
use crate::wordcount::{count_words, within_tolerance};
use crate::{classify, classify::DOMAIN_CONFIDENCE_THRESHOLD, classify::INTENT_CONFIDENCE_THRESHOLD};

fn skip(ctx: &PipelineContext, mut state: PipelineState, stage: StageId, reason: &str) -> PipelineState {
    state.touch(stage);
    ctx.bus
        .user(&stage.operation(), "skip", json!({"reason": reason}));
    state
}

fn fail(ctx: &PipelineContext, state: PipelineState, stage: StageId, message: String) -> PipelineState {
    ctx.bus
        .user(&stage.operation(), "error", json!({"message": message.clone()}));
    state.fail(stage, message)
}

/// Parse a classification response into an `AnalysisQuery`, accepting JSON
/// embedded in surrounding prose.
fn parse_analysis_query(response: &str) -> Option<AnalysisQuery> {
    if let Ok(query) = serde_json::from_str::<AnalysisQuery>(response) {
        return Some(query);
    }
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&response[start..=end]).ok()
}

pub async fn understand(ctx: &PipelineContext, mut state: PipelineState) -> PipelineState {
    let stage = StageId::Understand;
    let op = stage.operation();
    ctx.bus.user(&op, "start", json!({}));

    if state.requirements.is_some() {
        return skip(ctx, state, stage, "requirements exist");
    }

    let domain_match = classify::classify_domain(&state.user_query);
    let intent_match = classify::classify_intent(&state.user_query);

    let confident_domain = domain_match
        .clone()
        .filter(|m| m.confidence >= DOMAIN_CONFIDENCE_THRESHOLD);
    let confident_intent = intent_match
        .clone()
        .filter(|m| m.confidence >= INTENT_CONFIDENCE_THRESHOLD);

    if let (Some(domain), Some(intent)) = (&confident_domain, &confident_intent) {
        state.requirements = Some(AnalysisQuery {
            domain: domain.label,
            analysis_intent: intent.label,
        });
        state.push_warning(format!(
            "rule-based classification used (domain confidence {:.2}, intent confidence {:.2})",
            domain.confidence, intent.confidence,
        ));
        state.touch(stage);
        ctx.bus.user(
            &op,
            "done",
            json!({
                "method": "rule",
                "domain": domain.label.as_str(),
                "intent": intent.label.as_str(),
            }),
        );
        return state;
    }

    let mut existing_analysis = Vec::new();
    if let Some(m) = &confident_domain {
        existing_analysis.push(format!(
            "High-confidence domain match: {} (confidence {:.2}, keywords: {})",
            m.label,
            m.confidence,
            m.matched_keywords.join(", ")
        ));
    }
    if let Some(m) = &confident_intent {
        existing_analysis.push(format!(
            "High-confidence intent match: {} (confidence {:.2}, keywords: {})",
            m.label,
            m.confidence,
            m.matched_keywords.join(", ")
        ));
    }
    let existing_analysis = if existing_analysis.is_empty() {
        "No usable rule-based matches.".to_string()
    } else {
        existing_analysis.join("\n")
    };

    let prompt = prompts::classification_prompt(&state.user_query, &existing_analysis);
    let response = match generate_with_retry(
        &*ctx.generator,
        &prompt,
        &GenerateParams::default(),
        ctx.retry_policy(),
    )
    .await
    {
        Ok(response) => response,
        Err(err) => return fail(ctx, state, stage, format!("query analysis failed: {err}")),
    };

    let requirements = match parse_analysis_query(&response) {
        Some(query) => query,
        None => {
            // Best-effort fallback: trust whatever the rules found, default
            // the rest.
            state.push_warning("classification response was unparseable, defaulted".to_string());
            AnalysisQuery {
                domain: domain_match
                    .map(|m| m.label)
                    .unwrap_or(DomainCategory::General),
                analysis_intent: intent_match
                    .map(|m| m.label)
                    .unwrap_or(AnalysisIntent::Overview),
            }
        }
    };

    ctx.bus.user(
        &op,
        "parse_result",
        json!({
            "domain": requirements.domain.as_str(),
            "intent": requirements.analysis_intent.as_str(),
        }),
    );
    ctx.bus.user(
        &op,
        "done",
        json!({
            "method": "llm",
            "domain": requirements.domain.as_str(),
            "intent": requirements.analysis_intent.as_str(),
        }),
    );
    state.requirements = Some(requirements);
    state.touch(stage);
    state
}

/// Default outline per analysis intent, the seed the planner adapts.
fn default_sections(intent: AnalysisIntent) -> Vec<Section> {
    let entries: &[(&str, &str)] = match intent {
        AnalysisIntent::Overview => &[
            ("Executive Summary", "What are the core conclusions?"),
            ("Introduction", "What is the background and purpose?"),
            ("Current Landscape", "What is the state of play today?"),
            ("Key Developments", "What is changing and why does it matter?"),
            ("Conclusions", "What are the main takeaways?"),
        ],
        AnalysisIntent::Comparison => &[
            ("Executive Summary", "Which option comes out ahead and why?"),
            ("Comparison Criteria", "What dimensions matter for this comparison?"),
            ("Option Analysis", "How does each option perform on the criteria?"),
            ("Trade-offs", "Where do the options genuinely differ?"),
            ("Recommendations", "What should the reader choose, and when?"),
        ],
        AnalysisIntent::CausalAnalysis => &[
            ("Executive Summary", "What causes what, in brief?"),
            ("Background", "What context is needed to follow the analysis?"),
            ("Drivers", "What are the underlying causes?"),
            ("Effects", "What outcomes do those causes produce?"),
            ("Implications", "What follows from the causal picture?"),
        ],
        AnalysisIntent::TrendPrediction => &[
            ("Executive Summary", "What is the headline outlook?"),
            ("Current State", "Where do things stand today?"),
            ("Trend Drivers", "What forces are shaping the trajectory?"),
            ("Outlook", "What is the likely path forward?"),
            ("Recommendations", "How should the reader position for it?"),
        ],
        AnalysisIntent::ProsCons => &[
            ("Executive Summary", "What is the balanced verdict?"),
            ("Context", "What is being evaluated and for whom?"),
            ("Advantages", "What are the strongest points in favor?"),
            ("Disadvantages", "What are the significant drawbacks and risks?"),
            ("Balanced Assessment", "How do the pros and cons net out?"),
        ],
        AnalysisIntent::SolutionProposal => &[
            ("Executive Summary", "What is the proposed solution, in brief?"),
            ("Problem Statement", "What exactly needs to be solved?"),
            ("Options", "What approaches are available?"),
            ("Proposed Solution", "What is recommended and why?"),
            ("Implementation Plan", "How should the solution be rolled out?"),
        ],
    };
    entries.iter()
        .map(|(title, question)| Section::new(*title, vec![question.to_string()]))
        .collect()
}

#[derive(serde::Deserialize)]
struct SectionSpec {
    title: String,
    #[serde(default)]
    key_questions: Vec<String>,
}

fn parse_section_specs(response: &str) -> Option<Vec<Section>> {
    let slice = match serde_json::from_str::<Vec<SectionSpec>>(response) {
        Ok(specs) => return Some(specs_to_sections(specs)),
        Err(_) => {
            let start = response.find('[')?;
            let end = response.rfind(']')?;
            if end <= start {
                return None;
            }
            &response[start..=end]
        }
    };
    serde_json::from_str::<Vec<SectionSpec>>(slice)
        .ok()
        .map(specs_to_sections)
}

fn specs_to_sections(specs: Vec<SectionSpec>) -> Vec<Section> {
    specs
        .into_iter()
        .map(|s| Section::new(s.title, s.key_questions))
        .collect()
}

pub async fn plan_structure(ctx: &PipelineContext, mut state: PipelineState) -> PipelineState {
    let stage = StageId::PlanStructure;
    let op = stage.operation();
    ctx.bus.user(&op, "start", json!({}));

    if state.structure.is_some() {
        return skip(ctx, state, stage, "structure exists");
    }

    let Some(requirements) = state.requirements.clone() else {
        return fail(
            ctx,
            state,
            stage,
            "cannot plan the report structure: missing query analysis".to_string(),
        );
    };

    let template = default_sections(requirements.analysis_intent);
    let template_text = template
        .iter()
        .map(|s| format!("- {}: {}", s.title, s.key_questions.join(", ")))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = prompts::structure_prompt(
        &state.user_query,
        requirements.domain.as_str(),
        requirements.analysis_intent.as_str(),
        &template_text,
    );
    let sections = match generate_with_retry(
        &*ctx.generator,
        &prompt,
        &GenerateParams::default(),
        ctx.retry_policy(),
    )
    .await
    {
        Ok(response) => match parse_section_specs(&response) {
            Some(sections) if !sections.is_empty() => sections,
            _ => {
                state.push_warning(
                    "structure response was unparseable, using the default outline".to_string(),
                );
                template
            }
        },
        Err(err) => return fail(ctx, state, stage, format!("structure planning failed: {err}")),
    };

    ctx.bus.user(
        &op,
        "parse_result",
        json!({
            "sections_count": sections.len(),
            "sections": sections.iter().map(|s| s.title.clone()).collect::<Vec<_>>(),
        }),
    );

    state.structure = Some(ReportStructure {
        template_type: requirements.analysis_intent.as_str().to_string(),
        sections,
        executive_summary_required: true,
        recommendations_required: true,
        target_length: state.word_limit,
    });
    state.touch(stage);
    ctx.bus.user(&op, "done", json!({}));
    state
}

pub async fn retrieve_knowledge(
    ctx: &PipelineContext,
    mut state: PipelineState,
) -> PipelineState {
    let stage = StageId::RetrieveKnowledge;
    let op = stage.operation();
    ctx.bus.user(&op, "start", json!({}));

    let Some(structure) = state.structure.clone() else {
        return fail(
            ctx,
            state,
            stage,
            "cannot retrieve knowledge: missing report structure".to_string(),
        );
    };

    if !structure.sections.is_empty()
        && state.processed_sections.len() >= structure.sections.len()
    {
        return skip(ctx, state, stage, "all sections processed");
    }

    ctx.bus.user(&op, "external_search_start", json!({}));
    let docs = match ctx.search.search(&state.user_query).await {
        Ok(docs) => docs,
        Err(err) => return fail(ctx, state, stage, format!("external search failed: {err}")),
    };
    ctx.bus.user(
        &op,
        "external_search_done",
        json!({
            "docs": docs.len(),
            "doc_titles": docs.iter().take(5).map(|d| d.title.clone()).collect::<Vec<_>>(),
        }),
    );

    let domain = state
        .requirements
        .as_ref()
        .map(|r| r.domain.as_str())
        .unwrap_or("general")
        .to_string();
    let shared = SectionContext {
        query: state.user_query.clone(),
        domain,
        docs: Arc::new(docs),
    };

    let outcomes = run_sections(
        Arc::clone(&ctx.generator),
        &ctx.bus,
        ctx.retry_policy(),
        &structure.sections,
        &shared,
        &state.processed_sections,
        ctx.config.section_concurrency,
    )
    .await;

    // Merge in outline order: outcomes come back in the order the sections
    // were declared, so the draft reads like the outline.
    let mut structure = structure;
    for outcome in outcomes {
        match outcome.result {
            Ok(content) => {
                state.active_section = Some(outcome.title.clone());
                state.append_section_draft(&outcome.title, &content);
                state.mark_section_processed(&outcome.title);
                if let Some(section) = structure
                    .sections
                    .iter_mut()
                    .find(|s| s.title == outcome.title)
                {
                    section.content = content;
                    section.status = SectionStatus::Drafted;
                    section.sources = shared.docs.iter().map(|d| d.link.clone()).collect();
                }
            }
            Err(err) => {
                state.push_warning(format!("section '{}' failed: {err}", outcome.title));
            }
        }
    }
    state.active_section = None;
    state.structure = Some(structure);
    state.touch(stage);
    ctx.bus.user(
        &op,
        "done",
        json!({"sections_processed": state.processed_sections.len()}),
    );
    state
}

pub async fn write_and_polish(
    ctx: &PipelineContext,
    mut state: PipelineState,
) -> PipelineState {
    let stage = StageId::WriteAndPolish;
    let op = stage.operation();
    ctx.bus.user(&op, "start", json!({}));

    if state.final_report.is_some() {
        return skip(ctx, state, stage, "final report exists");
    }

    let Some(draft) = state.draft_report.clone() else {
        return fail(
            ctx,
            state,
            stage,
            "cannot polish the report: missing draft".to_string(),
        );
    };

    let prompt = prompts::writer_prompt(&state.user_query, &draft, state.word_limit);
    let mut report = match generate_with_retry(
        &*ctx.generator,
        &prompt,
        &GenerateParams::long_form(),
        ctx.retry_policy(),
    )
    .await
    {
        Ok(report) => report,
        Err(err) => return fail(ctx, state, stage, format!("report writing failed: {err}")),
    };

    // One-shot length correction; a failed correction keeps the unadjusted
    // report rather than failing the stage.
    let mut words = count_words(&report);
    if state.word_limit > 0 && !within_tolerance(words, Some(state.word_limit)) {
        let adjust = prompts::size_adjust_prompt(&report, state.word_limit);
        match generate_with_retry(
            &*ctx.generator,
            &adjust,
            &GenerateParams::long_form(),
            ctx.retry_policy(),
        )
        .await
        {
            Ok(adjusted) => {
                report = adjusted;
                words = count_words(&report);
            }
            Err(err) => {
                state.push_warning(format!("length correction failed: {err}"));
            }
        }
    }

    state.final_report = Some(report);
    state.touch(stage);
    ctx.bus.user(
        &op,
        "done",
        json!({"word_count": words, "target_word_limit": state.word_limit}),
    );
    state
}

pub async fn validate(ctx: &PipelineContext, mut state: PipelineState) -> PipelineState {
    let stage = StageId::Validate;
    let op = stage.operation();
    ctx.bus.user(&op, "start", json!({}));

    if state.validation_status == ValidationStatus::Validated {
        return skip(ctx, state, stage, "already validated");
    }

    let Some(report) = state.final_report.clone() else {
        return fail(
            ctx,
            state,
            stage,
            "cannot validate the report: missing final report".to_string(),
        );
    };

    let metrics = evaluate_report(
        &*ctx.generator,
        &ctx.bus,
        ctx.retry_policy(),
        &report,
        Some(state.word_limit),
        "validation",
    )
    .await;

    let passed = metrics.passes();
    state.validation_status = if passed {
        ValidationStatus::Validated
    } else {
        ValidationStatus::NeedsRevision
    };

    ctx.bus.user(
        &op,
        "parse_result",
        json!({
            "score": metrics.overall_score,
            "major_issues": metrics.major_issues.clone(),
            "feedback": metrics.feedback.clone(),
        }),
    );

    let mut values = metrics.to_metric_values();
    values.insert("validation_score".to_string(), json!(metrics.overall_score));
    state.merge_metrics(values);
    state.touch(stage);
    ctx.bus.user(
        &op,
        "done",
        json!({"score": metrics.overall_score, "status": state.validation_status.as_str()}),
    );
    state
}

pub async fn revise(ctx: &PipelineContext, mut state: PipelineState) -> PipelineState {
    let stage = StageId::Revise;
    let op = stage.operation();
    ctx.bus.user(&op, "start", json!({}));

    // Ceiling guard: once the budget is spent, the loop must terminate even
    // if the gate never genuinely passed. The counter is not incremented.
    if state.revision_count >= MAX_REVISIONS {
        state.validation_status = ValidationStatus::Validated;
        state.push_warning(format!(
            "reached the maximum of {MAX_REVISIONS} revisions, stopping"
        ));
        return skip(ctx, state, stage, "revision ceiling reached");
    }

    if state.revision_count > 0 && state.validation_status != ValidationStatus::NeedsRevision {
        return skip(ctx, state, stage, "no revision needed");
    }

    let Some(original_report) = state.final_report.clone() else {
        return fail(
            ctx,
            state,
            stage,
            "cannot revise the report: missing final report".to_string(),
        );
    };

    let original_metrics = evaluate_report(
        &*ctx.generator,
        &ctx.bus,
        ctx.retry_policy(),
        &original_report,
        Some(state.word_limit),
        "pre_revision",
    )
    .await;
    let original_score = original_metrics.overall_score;

    let strategy = select_strategy(&original_metrics);
    let prompt =
        build_revision_prompt(&original_report, &original_metrics, state.word_limit, strategy);
    ctx.bus.phase(&op, "llm_call", json!({"strategy": strategy.as_str()}));

    let candidate = match generate_with_retry(
        &*ctx.generator,
        &prompt,
        &GenerateParams::long_form(),
        ctx.retry_policy(),
    )
    .await
    {
        Ok(candidate) => candidate,
        Err(err) => {
            // A failed revision attempt still consumes one round; the
            // original report stays in place.
            state.push_warning(format!("revision generation failed: {err}"));
            original_report.clone()
        }
    };

    let revised_metrics = evaluate_report(
        &*ctx.generator,
        &ctx.bus,
        ctx.retry_policy(),
        &candidate,
        Some(state.word_limit),
        "revision",
    )
    .await;
    let revised_score = revised_metrics.overall_score;

    // Selection policy, in priority order: a gate-passing, non-regressing
    // candidate short-circuits the loop; a mere improvement is kept but
    // stays in the loop; otherwise the original survives.
    let (kept_report, kept_metrics, decision);
    if revised_metrics.passes() && revised_score >= original_score {
        kept_report = candidate;
        kept_metrics = Some(revised_metrics);
        decision = "keep_revised";
        state.validation_status = ValidationStatus::Validated;
    } else if revised_score > original_score {
        kept_report = candidate;
        kept_metrics = Some(revised_metrics);
        decision = "keep_revised";
        state.validation_status = ValidationStatus::NeedsRevision;
    } else {
        kept_report = original_report;
        kept_metrics = None;
        decision = "keep_original";
        state.validation_status = ValidationStatus::NeedsRevision;
    }

    ctx.bus.user(
        &op,
        "score_comparison",
        json!({
            "original_score": original_score,
            "revised_score": revised_score,
            "decision": decision,
        }),
    );

    // Single-shot size correction on whichever report was kept; only the
    // word count is re-measured afterwards, never the full score.
    let mut kept_report = kept_report;
    let mut words = count_words(&kept_report);
    if state.word_limit > 0 && !within_tolerance(words, Some(state.word_limit)) {
        let adjust = prompts::size_adjust_prompt(&kept_report, state.word_limit);
        match generate_with_retry(
            &*ctx.generator,
            &adjust,
            &GenerateParams::long_form(),
            ctx.retry_policy(),
        )
        .await
        {
            Ok(adjusted) => {
                kept_report = adjusted;
                words = count_words(&kept_report);
            }
            Err(err) => {
                state.push_warning(format!("length correction failed: {err}"));
            }
        }
    }

    if let Some(metrics) = kept_metrics {
        let mut values = metrics.to_metric_values();
        values.insert("revision_score".to_string(), json!(metrics.overall_score));
        values.insert("actual_word_count".to_string(), json!(words));
        values.insert(
            "word_count_accuracy".to_string(),
            json!(within_tolerance(words, Some(state.word_limit))),
        );
        state.merge_metrics(values);
    }

    state.final_report = Some(kept_report);
    state.revision_count += 1;
    state.push_warning(format!(
        "completed revision round {} ({decision}: revised {revised_score:.1} vs original {original_score:.1})",
        state.revision_count
    ));
    state.touch(stage);
    ctx.bus.user(
        &op,
        "done",
        json!({"revision_count": state.revision_count}),
    );
    state
}

pub async fn generate_report(
    ctx: &PipelineContext,
    mut state: PipelineState,
) -> PipelineState {
    let stage = StageId::GenerateReport;
    let op = stage.operation();
    ctx.bus.user(&op, "start", json!({}));

    if state.final_report.is_none() {
        return fail(
            ctx,
            state,
            stage,
            "cannot produce the final artifact: no report content exists".to_string(),
        );
    }

    let saved_files = match report::export_report(&state, &ctx.config.reports_dir) {
        Ok(files) => files,
        Err(err) => {
            // Export failure degrades the run, it does not fail it: the
            // report itself still rides in the state and the checkpoint.
            state.push_warning(format!("report export failed: {err}"));
            Vec::new()
        }
    };

    let stats = report::report_statistics(
        state.final_report.as_deref().unwrap_or_default(),
        &state,
    );
    let word_count = stats
        .get("word_count")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    state.merge_metrics(stats);
    state.merge_metrics(
        [
            (
                "saved_files".to_string(),
                json!(saved_files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()),
            ),
            ("report_generation_completed".to_string(), json!(true)),
        ]
        .into_iter()
        .collect(),
    );

    state.processing_time = Some(
        (chrono::Utc::now() - state.start_time)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0,
    );
    state.touch(stage);
    ctx.bus.user(
        &op,
        "done",
        json!({"files_saved": saved_files.len(), "word_count": word_count}),
    );
    state
}
