//! Prompt builders for every generation call in the pipeline.

use crate::quality::QualityMetrics;
use crate::search::Doc;
use crate::state::Section;

/// Classification prompt for the understanding stage. `existing_analysis`
/// carries whatever the rule-based classifier already established.
pub fn classification_prompt(query: &str, existing_analysis: &str) -> String {
    format!(
        r#"You are a research analyst classifying a report request.

Domains: frontier_tech_ai, business_markets, sustainability, social_change, life_sciences, global_affairs, general.
Intents: overview, comparison, causal_analysis, trend_prediction, pros_cons, solution_proposal.

Pre-analysis from rule matching:
{existing_analysis}

Respond with exactly one JSON object:
{{"domain": "<domain>", "analysis_intent": "<intent>"}}

Report request: {query}"#
    )
}

/// Structure-design prompt for the planning stage. `template_sections`
/// lists the default sections for the detected intent as a starting point.
pub fn structure_prompt(
    query: &str,
    domain: &str,
    intent: &str,
    template_sections: &str,
) -> String {
    format!(
        r#"You are designing the section outline for a research report.

Request: {query}
Domain: {domain}
Analysis intent: {intent}

Default outline for this intent:
{template_sections}

Adapt the outline to the request: rename, add or drop sections so the report
answers the question directly. Keep 4-7 sections. Respond with a JSON array:
[{{"title": "...", "key_questions": ["...", "..."]}}, ...]
No text outside the JSON array."#
    )
}

/// Section-content prompt for the fan-out workers.
pub fn section_prompt(query: &str, domain: &str, section: &Section, docs: &[Doc]) -> String {
    let key_questions = section.key_questions.join("; ");
    format!(
        r#"You are writing one section of a professional research report in the {domain} domain.

Overall request: {query}
Section title: {title}
Key questions this section must answer: {key_questions}

External sources:
{sources}

Write the section body only: focused, evidence-based prose grounded in the
sources above. Do not repeat the section title. Do not invent citations."#,
        title = section.title,
        sources = format_docs(docs),
    )
}

/// Render retrieved documents for inclusion in a prompt.
pub fn format_docs(docs: &[Doc]) -> String {
    if docs.is_empty() {
        return "No external sources available.".to_string();
    }
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            format!(
                "Source {n}: {title}\nLink: {link}\nSummary: {content}\n",
                n = i + 1,
                title = if doc.title.is_empty() { "untitled" } else { &doc.title },
                link = if doc.link.is_empty() { "none" } else { &doc.link },
                content = doc.content,
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Writer prompt: turn the accumulated draft into the polished report.
pub fn writer_prompt(query: &str, draft: &str, word_limit: u32) -> String {
    format!(
        r#"You are a professional report writer. Turn the section drafts below into
one coherent, polished research report answering: {query}

Target length: about {word_limit} words (within 5% either way).
Keep an executive summary first and a conclusions/recommendations section last.
Preserve the factual content of the drafts; improve flow, remove repetition,
and keep a consistent professional register.

Section drafts:
{draft}

Output the complete report text only, no commentary."#
    )
}

/// One-shot length-correction prompt.
pub fn size_adjust_prompt(report: &str, target: u32) -> String {
    format!(
        r#"Adjust the report below to about {target} words (within 5% either way)
without losing key information. Trim redundancy if too long; add necessary
evidence and detail if too short. Keep the structure and logical flow intact.
Output only the adjusted report text.

Report:
{report}"#
    )
}

/// Scoring prompt for the quality evaluator. Five criteria, two points each.
pub fn evaluation_prompt(report: &str, word_limit: Option<u32>) -> String {
    let budget = word_limit
        .map(|w| w.to_string())
        .unwrap_or_else(|| "no limit".to_string());
    format!(
        r#"Evaluate the report below against five criteria, each worth 2 points
(10 total): content completeness, logical clarity, language quality,
professional depth, structural soundness.

Requirements:
- Give an overall 0-10 score with one decimal place.
- List every major issue (defects that materially hurt the report).
- Give concrete improvement feedback.
- Target word budget: {budget}.

Report:
{report}

Respond with exactly this JSON shape:
{{
    "overall_score": 8.5,
    "detailed_scores": {{
        "content_completeness": 1.8,
        "logical_clarity": 1.7,
        "language_quality": 1.9,
        "professional_depth": 1.6,
        "structural_soundness": 1.5
    }},
    "major_issues": ["..."],
    "feedback": "..."
}}"#
    )
}

/// Conservative revision: protect what already works, fix only the listed
/// critical issues.
pub fn conservative_revision_prompt(
    report: &str,
    strengths: &[String],
    critical_issues: &[String],
    target_length: u32,
) -> String {
    let strengths_text = if strengths.is_empty() {
        "acceptable baseline quality".to_string()
    } else {
        strengths.join(", ")
    };
    let issues_text = critical_issues
        .iter()
        .take(3)
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"You are refining an already-good report. Its strengths: {strengths_text}.
Modify cautiously and keep those strengths.

Original report:
{report}

Fix ONLY these issues:
{issues_text}

Rules: keep accurate data and strong analysis untouched; improve
incrementally, never rewrite wholesale; the result must be better than the
original; stay near {target_length} words (within 5%); no fabricated content.
Output the complete improved report only."#
    )
}

/// Targeted revision: focus on the weak scoring dimensions.
pub fn targeted_revision_prompt(
    report: &str,
    metrics: &QualityMetrics,
    improvement_areas: &[String],
    target_length: u32,
) -> String {
    let areas_text = if improvement_areas.is_empty() {
        "overall polish".to_string()
    } else {
        improvement_areas.join(", ")
    };
    let issues_text = metrics
        .major_issues
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"You are improving a report that scored {score:.1}/10.

Original report:
{report}

Weak areas to focus on: {areas_text}
Known issues:
{issues_text}

Improve the weak areas systematically while keeping the strong parts intact.
Target about {target_length} words (within 5%), resolve every listed issue,
and aim for 8.5+. Output the complete improved report only."#,
        score = metrics.overall_score,
    )
}

/// Aggressive revision: the report needs a rebuild.
pub fn aggressive_revision_prompt(
    report: &str,
    metrics: &QualityMetrics,
    target_length: u32,
) -> String {
    let issues_text = metrics
        .major_issues
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"The report below scored {score:.1}/10 and needs substantial rework.

Original report:
{report}

Major problems:
{issues_text}

Restructure and rewrite for clarity, depth and accuracy, keeping the core
findings and any sound evidence. Target about {target_length} words (within
5%) and 8.0+. Output the complete rebuilt report only."#,
        score = metrics.overall_score,
    )
}
