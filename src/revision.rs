//! Revision strategy selection.
//!
//! The revise stage adapts its prompt to the current quality picture: a
//! near-passing report gets a protective, minimal edit; a mid-range report a
//! focused one; a weak report a rebuild. Selection mirrors the scoring
//! dimensions produced by the evaluator.

use crate::prompts;
use crate::quality::QualityMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionStrategy {
    Conservative,
    Targeted,
    Aggressive,
}

impl RevisionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevisionStrategy::Conservative => "conservative",
            RevisionStrategy::Targeted => "targeted",
            RevisionStrategy::Aggressive => "aggressive",
        }
    }
}

/// Per-dimension score above which a dimension counts as a strength
/// (out of 2 points).
const STRONG_DIMENSION: f64 = 1.6;
/// Per-dimension score below which a dimension needs focused work.
const WEAK_DIMENSION: f64 = 1.5;

fn dimension_label(key: &str) -> Option<&'static str> {
    match key {
        "content_completeness" => Some("content completeness"),
        "logical_clarity" => Some("logical clarity"),
        "language_quality" => Some("language quality"),
        "professional_depth" => Some("professional depth"),
        "structural_soundness" => Some("structural soundness"),
        _ => None,
    }
}

/// Identify what the report already does well, so a conservative revision
/// knows what to protect.
pub fn report_strengths(metrics: &QualityMetrics) -> Vec<String> {
    let mut strengths = Vec::new();
    for (key, score) in &metrics.detailed_scores {
        if *score >= STRONG_DIMENSION {
            if let Some(label) = dimension_label(key) {
                strengths.push(format!("strong {label}"));
            }
        }
    }
    if metrics.word_count_accuracy {
        strengths.push("accurate length".to_string());
    }
    if metrics.overall_score >= 7.5 {
        strengths.push("good overall quality".to_string());
    }
    strengths
}

/// Dimensions scoring below the focus threshold, as prompt-ready labels.
pub fn improvement_areas(metrics: &QualityMetrics) -> Vec<String> {
    metrics
        .detailed_scores
        .iter()
        .filter(|(_, score)| **score < WEAK_DIMENSION)
        .filter_map(|(key, _)| dimension_label(key))
        .map(|label| format!("improve {label}"))
        .collect()
}

/// Order issues so the revision prompt leads with the most damaging ones.
pub fn prioritize_issues(major_issues: &[String]) -> Vec<String> {
    const PRIORITY_KEYWORDS: [(&str, u32); 8] = [
        ("factual", 10),
        ("logic", 9),
        ("data", 9),
        ("missing", 8),
        ("structure", 7),
        ("language", 6),
        ("format", 5),
        ("word", 4),
    ];

    let weight = |issue: &str| -> u32 {
        let lower = issue.to_lowercase();
        PRIORITY_KEYWORDS
            .iter()
            .find(|(keyword, _)| lower.contains(keyword))
            .map(|(_, w)| *w)
            .unwrap_or(0)
    };

    let mut scored: Vec<(u32, &String)> = major_issues.iter().map(|i| (weight(i), i)).collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, i)| i.clone()).collect()
}

fn should_use_conservative(metrics: &QualityMetrics) -> bool {
    if metrics.overall_score >= 7.5 {
        return true;
    }
    if metrics.major_issues.len() <= 2 {
        return true;
    }
    // More than half the dimensions already near-perfect.
    let high_dimensions = metrics
        .detailed_scores
        .values()
        .filter(|s| **s >= 1.7)
        .count();
    high_dimensions >= 3
}

/// Pick the revision strategy for the current quality picture.
pub fn select_strategy(metrics: &QualityMetrics) -> RevisionStrategy {
    if should_use_conservative(metrics) {
        RevisionStrategy::Conservative
    } else if metrics.overall_score >= 6.0 {
        RevisionStrategy::Targeted
    } else {
        RevisionStrategy::Aggressive
    }
}

/// Build the revision prompt for the chosen strategy.
pub fn build_revision_prompt(
    report: &str,
    metrics: &QualityMetrics,
    target_length: u32,
    strategy: RevisionStrategy,
) -> String {
    match strategy {
        RevisionStrategy::Conservative => {
            let strengths = report_strengths(metrics);
            let issues = prioritize_issues(&metrics.major_issues);
            prompts::conservative_revision_prompt(report, &strengths, &issues, target_length)
        }
        RevisionStrategy::Targeted => {
            let areas = improvement_areas(metrics);
            prompts::targeted_revision_prompt(report, metrics, &areas, target_length)
        }
        RevisionStrategy::Aggressive => {
            prompts::aggressive_revision_prompt(report, metrics, target_length)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn metrics_with(score: f64, issues: usize, dims: &[(&str, f64)]) -> QualityMetrics {
        QualityMetrics {
            overall_score: score,
            detailed_scores: dims
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            major_issues: (0..issues).map(|i| format!("issue {i}")).collect(),
            feedback: String::new(),
            word_count_accuracy: false,
            actual_word_count: 900,
            evaluation_method: "test".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn high_score_selects_conservative() {
        let m = metrics_with(8.0, 5, &[]);
        assert_eq!(select_strategy(&m), RevisionStrategy::Conservative);
    }

    #[test]
    fn few_issues_select_conservative_even_at_low_score() {
        let m = metrics_with(5.0, 1, &[]);
        assert_eq!(select_strategy(&m), RevisionStrategy::Conservative);
    }

    #[test]
    fn mid_score_with_many_issues_selects_targeted() {
        let m = metrics_with(6.5, 4, &[("logical_clarity", 1.2)]);
        assert_eq!(select_strategy(&m), RevisionStrategy::Targeted);
    }

    #[test]
    fn weak_report_selects_aggressive() {
        let m = metrics_with(4.0, 5, &[("logical_clarity", 0.8)]);
        assert_eq!(select_strategy(&m), RevisionStrategy::Aggressive);
    }

    #[test]
    fn mostly_strong_dimensions_select_conservative() {
        let m = metrics_with(
            5.5,
            4,
            &[
                ("content_completeness", 1.8),
                ("logical_clarity", 1.7),
                ("language_quality", 1.9),
                ("professional_depth", 0.5),
            ],
        );
        assert_eq!(select_strategy(&m), RevisionStrategy::Conservative);
    }

    #[test]
    fn strengths_reflect_dimension_scores() {
        let mut m = metrics_with(
            7.8,
            0,
            &[("content_completeness", 1.8), ("logical_clarity", 1.0)],
        );
        m.word_count_accuracy = true;
        let strengths = report_strengths(&m);
        assert!(strengths.contains(&"strong content completeness".to_string()));
        assert!(strengths.contains(&"accurate length".to_string()));
        assert!(strengths.contains(&"good overall quality".to_string()));
        assert!(!strengths.iter().any(|s| s.contains("logical clarity")));
    }

    #[test]
    fn issues_sorted_by_severity() {
        let issues = vec![
            "word count slightly off".to_string(),
            "factual error in section 2".to_string(),
            "structure of conclusions is weak".to_string(),
        ];
        let sorted = prioritize_issues(&issues);
        assert_eq!(sorted[0], "factual error in section 2");
        assert_eq!(sorted[2], "word count slightly off");
    }

    #[test]
    fn revision_prompt_embeds_report_for_each_strategy() {
        let m = metrics_with(6.0, 3, &[("logical_clarity", 1.0)]);
        for strategy in [
            RevisionStrategy::Conservative,
            RevisionStrategy::Targeted,
            RevisionStrategy::Aggressive,
        ] {
            let prompt = build_revision_prompt("THE REPORT BODY", &m, 1000, strategy);
            assert!(prompt.contains("THE REPORT BODY"), "{strategy:?}");
            assert!(prompt.contains("1000"), "{strategy:?}");
        }
    }
}
