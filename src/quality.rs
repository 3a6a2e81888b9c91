//! Quality evaluation and the pass/fail gate.
//!
//! The evaluator scores a report via a generation call and parses the
//! response through a ladder of fallbacks, so a malformed evaluation can
//! degrade the score but never crash the revision loop. Word-count accuracy
//! is measured locally, not trusted from the model.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::errors::ExternalCallError;
use crate::llm::{GenerateParams, Generator, RetryPolicy, generate_with_retry};
use crate::progress::ProgressBus;
use crate::prompts;
use crate::wordcount::{count_words, within_tolerance};

/// Score at or above which a report passes unconditionally.
pub const HIGH_QUALITY_SCORE: f64 = 8.3;
/// Score at or above which a report passes when it has no major issues.
pub const ACCEPTABLE_SCORE: f64 = 8.0;

/// Result of one quality evaluation. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityMetrics {
    pub overall_score: f64,
    pub detailed_scores: BTreeMap<String, f64>,
    pub major_issues: Vec<String>,
    pub feedback: String,
    pub word_count_accuracy: bool,
    pub actual_word_count: usize,
    pub evaluation_method: String,
    pub timestamp: DateTime<Utc>,
}

impl QualityMetrics {
    pub fn is_high_quality(&self) -> bool {
        self.overall_score >= HIGH_QUALITY_SCORE
    }

    pub fn is_acceptable_quality(&self) -> bool {
        self.overall_score >= ACCEPTABLE_SCORE && self.major_issues.is_empty()
    }

    /// The quality gate. Monotonic in `overall_score` for a fixed issue
    /// list: raising the score can only turn a fail into a pass.
    pub fn passes(&self) -> bool {
        self.is_high_quality() || self.is_acceptable_quality()
    }

    /// Flatten into the state's metrics mapping.
    pub fn to_metric_values(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert("overall_score".to_string(), json!(self.overall_score));
        map.insert("detailed_scores".to_string(), json!(self.detailed_scores));
        map.insert("major_issues".to_string(), json!(self.major_issues));
        map.insert("feedback".to_string(), json!(self.feedback));
        map.insert(
            "word_count_accuracy".to_string(),
            json!(self.word_count_accuracy),
        );
        map.insert(
            "actual_word_count".to_string(),
            json!(self.actual_word_count),
        );
        map.insert(
            "evaluation_method".to_string(),
            json!(self.evaluation_method),
        );
        map.insert(
            "evaluated_at".to_string(),
            json!(self.timestamp.to_rfc3339()),
        );
        map
    }
}

#[derive(Debug, Deserialize)]
struct RawEvaluation {
    overall_score: f64,
    #[serde(default)]
    detailed_scores: BTreeMap<String, f64>,
    #[serde(default)]
    major_issues: Vec<String>,
    #[serde(default)]
    feedback: String,
}

const SCORE_DIMENSIONS: [&str; 5] = [
    "content_completeness",
    "logical_clarity",
    "language_quality",
    "professional_depth",
    "structural_soundness",
];

fn prorated_scores(overall: f64) -> BTreeMap<String, f64> {
    SCORE_DIMENSIONS
        .iter()
        .map(|d| (d.to_string(), overall * 0.2))
        .collect()
}

/// Parse an evaluation response through layered fallbacks: direct JSON,
/// embedded `{…}` extraction, regex scraping, and finally a neutral default
/// that flags the parse failure as a major issue.
fn parse_evaluation(response: &str) -> RawEvaluation {
    if let Ok(parsed) = serde_json::from_str::<RawEvaluation>(response) {
        return parsed;
    }

    if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        if end > start {
            if let Ok(parsed) = serde_json::from_str::<RawEvaluation>(&response[start..=end]) {
                return parsed;
            }
        }
    }

    let score_re = Regex::new(r#""overall_score"\s*:\s*(\d+\.?\d*)"#).expect("static regex");
    if let Some(caps) = score_re.captures(response) {
        let overall: f64 = caps[1].parse().unwrap_or(5.0);

        let issues_re =
            Regex::new(r#"(?s)"major_issues"\s*:\s*\[(.*?)\]"#).expect("static regex");
        let major_issues = issues_re
            .captures(response)
            .map(|caps| {
                let item_re = Regex::new(r#""([^"]+)""#).expect("static regex");
                item_re
                    .captures_iter(&caps[1])
                    .map(|c| c[1].to_string())
                    .collect()
            })
            .unwrap_or_default();

        let feedback_re = Regex::new(r#""feedback"\s*:\s*"([^"]*)""#).expect("static regex");
        let feedback = feedback_re
            .captures(response)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "feedback could not be parsed".to_string());

        return RawEvaluation {
            overall_score: overall,
            detailed_scores: prorated_scores(overall),
            major_issues,
            feedback,
        };
    }

    RawEvaluation {
        overall_score: 5.0,
        detailed_scores: prorated_scores(5.0),
        major_issues: vec!["evaluation response could not be parsed".to_string()],
        feedback: "The evaluation output was not in the expected format; re-evaluation advised."
            .to_string(),
    }
}

/// Score `report` against the quality criteria.
///
/// A generation failure yields the zero-score metrics object rather than an
/// error: the caller decides what a failed evaluation means, the loop keeps
/// running either way.
pub async fn evaluate_report(
    generator: &dyn Generator,
    bus: &ProgressBus,
    policy: RetryPolicy,
    report: &str,
    word_limit: Option<u32>,
    method: &str,
) -> QualityMetrics {
    bus.user("quality.evaluation", "start", json!({"method": method}));

    let actual_word_count = count_words(report);
    let word_count_accuracy = within_tolerance(actual_word_count, word_limit);

    let prompt = prompts::evaluation_prompt(report, word_limit);
    let raw = match generate_with_retry(generator, &prompt, &GenerateParams::default(), policy)
        .await
    {
        Ok(response) => parse_evaluation(&response),
        Err(err) => {
            bus.user(
                "quality.evaluation",
                "error",
                json!({"message": err.to_string()}),
            );
            return failed_evaluation(err, actual_word_count, method);
        }
    };

    let metrics = QualityMetrics {
        overall_score: raw.overall_score,
        detailed_scores: raw.detailed_scores,
        major_issues: raw.major_issues,
        feedback: raw.feedback,
        word_count_accuracy,
        actual_word_count,
        evaluation_method: method.to_string(),
        timestamp: Utc::now(),
    };

    bus.user(
        "quality.evaluation",
        "done",
        json!({
            "score": metrics.overall_score,
            "major_issues_count": metrics.major_issues.len(),
            "word_count": metrics.actual_word_count,
        }),
    );

    metrics
}

fn failed_evaluation(
    err: ExternalCallError,
    actual_word_count: usize,
    method: &str,
) -> QualityMetrics {
    QualityMetrics {
        overall_score: 0.0,
        detailed_scores: BTreeMap::new(),
        major_issues: vec![format!("evaluation failed: {err}")],
        feedback: "The evaluation call failed; the report could not be scored.".to_string(),
        word_count_accuracy: false,
        actual_word_count,
        evaluation_method: method.to_string(),
        timestamp: Utc::now(),
    }
}
