//! Final report export and statistics.
//!
//! The last stage writes three artifacts per run into the reports
//! directory: the plain report text, a full JSON document (metadata +
//! content), and the metadata alone. File names combine a timestamp with a
//! slug derived from the query.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::state::PipelineState;
use crate::wordcount::count_words;

/// A short, filesystem-safe slug from the first words of the query.
pub fn query_slug(query: &str) -> String {
    let words: Vec<String> = query
        .split_whitespace()
        .filter_map(|w| {
            let cleaned: String = w.chars().filter(|c| c.is_alphanumeric()).collect();
            if cleaned.is_empty() { None } else { Some(cleaned) }
        })
        .take(3)
        .collect();
    let slug = words.join("_");
    if slug.is_empty() {
        "research".to_string()
    } else {
        slug.chars().take(30).collect()
    }
}

fn report_metadata(state: &PipelineState) -> Value {
    let report = state.final_report.as_deref().unwrap_or_default();
    json!({
        "report_info": {
            "query": state.user_query,
            "generated_at": Utc::now().to_rfc3339(),
            "word_limit": state.word_limit,
            "word_count": count_words(report),
            "revision_count": state.revision_count,
        },
        "analysis_info": {
            "domain": state.requirements.as_ref().map(|r| r.domain.as_str()),
            "analysis_intent": state.requirements.as_ref().map(|r| r.analysis_intent.as_str()),
            "validation_status": state.validation_status.as_str(),
        },
        "processing_info": {
            "start_time": state.start_time.to_rfc3339(),
            "sections_processed": state.processed_sections.len(),
        },
        "quality_metrics": state.quality_metrics,
        "warnings": state.warnings,
    })
}

/// Write the report artifacts; returns the paths written.
pub fn export_report(state: &PipelineState, reports_dir: &Path) -> Result<Vec<PathBuf>> {
    let report = state
        .final_report
        .as_deref()
        .context("no final report to export")?;

    std::fs::create_dir_all(reports_dir).context("Failed to create reports directory")?;

    let base = format!(
        "{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        query_slug(&state.user_query)
    );
    let metadata = report_metadata(state);
    let mut saved = Vec::new();

    let txt_path = reports_dir.join(format!("{base}.txt"));
    std::fs::write(&txt_path, report).context("Failed to write report text")?;
    saved.push(txt_path);

    let full_path = reports_dir.join(format!("{base}_full.json"));
    let full = json!({"metadata": metadata.clone(), "content": report});
    std::fs::write(&full_path, serde_json::to_string_pretty(&full)?)
        .context("Failed to write full report JSON")?;
    saved.push(full_path);

    let meta_path = reports_dir.join(format!("{base}_metadata.json"));
    std::fs::write(&meta_path, serde_json::to_string_pretty(&metadata)?)
        .context("Failed to write report metadata")?;
    saved.push(meta_path);

    Ok(saved)
}

/// Summary statistics merged into the state's quality metrics at the end of
/// a run.
pub fn report_statistics(report: &str, state: &PipelineState) -> BTreeMap<String, Value> {
    let word_count = count_words(report);
    let target = state.word_limit;
    let completion_rate = if target > 0 {
        (word_count as f64 / target as f64 * 1000.0).round() / 10.0
    } else {
        100.0
    };

    let lines: Vec<&str> = report.lines().collect();
    let paragraphs = lines.iter().filter(|l| !l.trim().is_empty()).count();
    let headers = lines.iter().filter(|l| l.trim_start().starts_with('#')).count();

    let mut stats = BTreeMap::new();
    stats.insert("word_count".to_string(), json!(word_count));
    stats.insert("character_count".to_string(), json!(report.chars().count()));
    stats.insert("target_word_count".to_string(), json!(target));
    stats.insert("completion_rate".to_string(), json!(completion_rate));
    stats.insert("paragraph_count".to_string(), json!(paragraphs));
    stats.insert("estimated_headers".to_string(), json!(headers));
    stats.insert("lines_count".to_string(), json!(lines.len()));
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state_with_report() -> PipelineState {
        let mut state = PipelineState::new("Global semiconductor supply chains in 2026", 100);
        state.final_report = Some("# Heading\n\nA short report body.\n\nSecond paragraph.".into());
        state
    }

    #[test]
    fn slug_takes_first_three_words() {
        assert_eq!(
            query_slug("Global semiconductor supply chains in 2026"),
            "Global_semiconductor_supply"
        );
    }

    #[test]
    fn slug_strips_punctuation_and_handles_empty() {
        assert_eq!(query_slug("AI: what's next?"), "AI_whats_next");
        assert_eq!(query_slug("!!! ???"), "research");
    }

    #[test]
    fn export_writes_three_artifacts() {
        let dir = tempdir().unwrap();
        let files = export_report(&state_with_report(), dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        for file in &files {
            assert!(file.exists(), "{file:?} missing");
        }
        assert!(files[0].to_string_lossy().ends_with(".txt"));
        assert!(files[1].to_string_lossy().ends_with("_full.json"));
        assert!(files[2].to_string_lossy().ends_with("_metadata.json"));
    }

    #[test]
    fn export_full_json_carries_content_and_metadata() {
        let dir = tempdir().unwrap();
        let files = export_report(&state_with_report(), dir.path()).unwrap();
        let full: Value =
            serde_json::from_str(&std::fs::read_to_string(&files[1]).unwrap()).unwrap();
        assert!(full["content"].as_str().unwrap().contains("report body"));
        assert_eq!(full["metadata"]["report_info"]["word_limit"], 100);
    }

    #[test]
    fn export_without_report_errors() {
        let dir = tempdir().unwrap();
        let state = PipelineState::new("q", 100);
        assert!(export_report(&state, dir.path()).is_err());
    }

    #[test]
    fn statistics_count_structure() {
        let state = state_with_report();
        let stats = report_statistics(state.final_report.as_deref().unwrap(), &state);
        assert_eq!(stats["estimated_headers"], json!(1));
        assert_eq!(stats["paragraph_count"], json!(3));
        assert!(stats["word_count"].as_u64().unwrap() > 0);
    }
}
