//! Rule-based domain and intent classification.
//!
//! Keyword matching with a confidence score lets the understanding stage
//! skip a generation call entirely when the query is unambiguous. Scores
//! are the number of matched keywords; confidence scales that count and is
//! boosted when one candidate clearly dominates the rest.

use crate::state::{AnalysisIntent, DomainCategory};

/// Confidence needed to trust the rule-based domain result.
pub const DOMAIN_CONFIDENCE_THRESHOLD: f64 = 0.7;
/// Confidence needed to trust the rule-based intent result.
pub const INTENT_CONFIDENCE_THRESHOLD: f64 = 0.6;

const DOMAIN_KEYWORDS: &[(DomainCategory, &[&str])] = &[
    (
        DomainCategory::FrontierTechAi,
        &[
            "ai", "artificial intelligence", "machine learning", "llm", "neural", "robotics",
            "quantum", "semiconductor", "chip", "algorithm", "autonomous", "deep learning",
            "software", "computing",
        ],
    ),
    (
        DomainCategory::BusinessMarkets,
        &[
            "market", "business model", "revenue", "startup", "competition", "industry",
            "investment", "pricing", "supply chain", "ecommerce", "monetization", "strategy",
            "merger", "valuation",
        ],
    ),
    (
        DomainCategory::Sustainability,
        &[
            "climate", "carbon", "renewable", "sustainability", "emission", "green energy",
            "solar", "wind power", "recycling", "environment", "esg", "biodiversity",
        ],
    ),
    (
        DomainCategory::SocialChange,
        &[
            "culture", "social media", "demographic", "education", "urbanization", "migration",
            "inequality", "generation", "lifestyle", "community", "workforce",
        ],
    ),
    (
        DomainCategory::LifeSciences,
        &[
            "health", "medicine", "vaccine", "biotech", "genomics", "pharmaceutical", "disease",
            "clinical", "public health", "longevity", "drug",
        ],
    ),
    (
        DomainCategory::GlobalAffairs,
        &[
            "geopolitic", "policy", "regulation", "trade war", "sanction", "diplomacy",
            "election", "governance", "international", "security", "sovereignty", "treaty",
        ],
    ),
];

const INTENT_KEYWORDS: &[(AnalysisIntent, &[&str])] = &[
    (
        AnalysisIntent::Overview,
        &["overview", "landscape", "state of", "introduction", "survey", "summary"],
    ),
    (
        AnalysisIntent::Comparison,
        &["versus", " vs ", "compare", "comparison", "difference between", "better than"],
    ),
    (
        AnalysisIntent::CausalAnalysis,
        &["why", "cause", "impact", "effect", "driver", "because", "influence", "consequence"],
    ),
    (
        AnalysisIntent::TrendPrediction,
        &["trend", "forecast", "future", "prediction", "outlook", "2030", "next decade"],
    ),
    (
        AnalysisIntent::ProsCons,
        &["pros and cons", "advantages", "disadvantages", "benefits", "risks", "trade-off"],
    ),
    (
        AnalysisIntent::SolutionProposal,
        &["how to", "solution", "proposal", "recommend", "strategy for", "mitigate", "address"],
    ),
];

/// Result of one rule-based classification pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch<T> {
    pub label: T,
    pub confidence: f64,
    pub matched_keywords: Vec<&'static str>,
}

fn matched<'a>(query_lower: &str, keywords: &[&'a str]) -> Vec<&'a str> {
    keywords
        .iter()
        .filter(|k| query_lower.contains(*k))
        .copied()
        .collect()
}

fn best_match<T: Copy>(
    query: &str,
    table: &[(T, &[&'static str])],
    scale: f64,
) -> Option<RuleMatch<T>> {
    let query_lower = query.to_lowercase();
    let scored: Vec<(T, Vec<&'static str>)> = table
        .iter()
        .map(|(label, keywords)| (*label, matched(&query_lower, keywords)))
        .collect();

    let best_idx = scored
        .iter()
        .enumerate()
        .max_by_key(|(_, (_, m))| m.len())
        .map(|(i, _)| i)?;
    let best_score = scored[best_idx].1.len();
    if best_score == 0 {
        return None;
    }

    let mut confidence = (best_score as f64 / scale).min(1.0);

    // Dominance boost: when the best candidate more than doubles every
    // rival's score, the match is trusted more. Ties never get the boost.
    let runner_up = scored
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != best_idx)
        .map(|(_, (_, m))| m.len())
        .max()
        .unwrap_or(0);
    if best_score > runner_up * 2 {
        confidence = (confidence * 1.5).min(1.0);
    }

    let (label, matched_keywords) = scored.into_iter().nth(best_idx).expect("index in range");
    Some(RuleMatch {
        label,
        confidence,
        matched_keywords,
    })
}

/// Classify the query's domain by keyword matching. Confidence is
/// `matches / 5`, capped at 1.0, with the dominance boost applied.
pub fn classify_domain(query: &str) -> Option<RuleMatch<DomainCategory>> {
    best_match(query, DOMAIN_KEYWORDS, 5.0)
}

/// Classify the query's analysis intent. Confidence is `matches / 3`,
/// capped at 1.0, with the dominance boost applied.
pub fn classify_intent(query: &str) -> Option<RuleMatch<AnalysisIntent>> {
    best_match(query, INTENT_KEYWORDS, 3.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ai_domain_from_keywords() {
        let result = classify_domain(
            "The impact of artificial intelligence and machine learning on semiconductor design",
        )
        .unwrap();
        assert_eq!(result.label, DomainCategory::FrontierTechAi);
        assert!(result.confidence > 0.0);
        assert!(result.matched_keywords.contains(&"semiconductor"));
    }

    #[test]
    fn no_keywords_means_no_match() {
        assert!(classify_domain("an entirely unrelated topic").is_none());
        assert!(classify_intent("an entirely unrelated topic").is_none());
    }

    #[test]
    fn confidence_scales_with_match_count() {
        let one = classify_domain("the vaccine rollout").unwrap();
        let many = classify_domain("vaccine biotech genomics clinical drug trials").unwrap();
        assert_eq!(one.label, DomainCategory::LifeSciences);
        assert_eq!(many.label, DomainCategory::LifeSciences);
        assert!(many.confidence > one.confidence);
    }

    #[test]
    fn dominance_boost_applies_when_best_doubles_rivals() {
        // Four matched LifeSciences keywords, nothing else matched: boosted.
        let result = classify_domain("vaccine biotech genomics clinical").unwrap();
        assert_eq!(result.label, DomainCategory::LifeSciences);
        // 4/5 * 1.5 capped at 1.0
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn intent_trend_prediction_detected() {
        let result = classify_intent("forecast of renewable energy trends for the next decade")
            .unwrap();
        assert_eq!(result.label, AnalysisIntent::TrendPrediction);
        assert!(result.confidence >= INTENT_CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn intent_comparison_detected() {
        let result = classify_intent("compare lithium versus sodium batteries").unwrap();
        assert_eq!(result.label, AnalysisIntent::Comparison);
    }

    #[test]
    fn confidence_never_exceeds_one() {
        let result = classify_intent(
            "why does the cause and impact and effect and driver and influence matter",
        )
        .unwrap();
        assert!(result.confidence <= 1.0);
    }
}
