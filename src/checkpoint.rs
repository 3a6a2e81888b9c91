//! Checkpoint store: durable snapshots of the pipeline state.
//!
//! A checkpoint is a single JSON document `{state, meta: {saved_at,
//! version}}`. Saves go through a temporary sibling file followed by a
//! rename, so a crash mid-write can never corrupt the last good snapshot.
//! Loads tolerate legacy intent spellings (see `AnalysisIntent::from_alias`)
//! and a bare state document without the envelope; anything structurally
//! unrecognizable is a fatal `CheckpointError::Corrupt`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::errors::CheckpointError;
use crate::state::PipelineState;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta {
    saved_at: DateTime<Utc>,
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    state: PipelineState,
    meta: SnapshotMeta,
}

/// Atomically write `state` to `path`.
pub fn save(state: &PipelineState, path: &Path) -> Result<(), CheckpointError> {
    let snapshot = Snapshot {
        state: state.clone(),
        meta: SnapshotMeta {
            saved_at: Utc::now(),
            version: SNAPSHOT_VERSION,
        },
    };

    let json = serde_json::to_string_pretty(&snapshot).map_err(|e| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("state not serializable: {e}"),
    })?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                op: "create directory for",
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|source| CheckpointError::Io {
        op: "write",
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| CheckpointError::Io {
        op: "replace",
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// Load a snapshot from `path`.
pub fn load(path: &Path) -> Result<PipelineState, CheckpointError> {
    let content = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
        op: "read",
        path: path.to_path_buf(),
        source,
    })?;

    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("not valid JSON: {e}"),
        })?;

    // Accept both the `{state, meta}` envelope and a bare state document
    // written by early versions.
    let state_value = match value.get("state") {
        Some(inner) => inner.clone(),
        None => value,
    };

    serde_json::from_value(state_value).map_err(|e| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("unrecognized state structure: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AnalysisIntent, AnalysisQuery, DomainCategory, StageId};
    use tempfile::tempdir;

    fn populated_state() -> PipelineState {
        let mut state = PipelineState::new("semiconductor supply chains", 1000);
        state.requirements = Some(AnalysisQuery {
            domain: DomainCategory::GlobalAffairs,
            analysis_intent: AnalysisIntent::CausalAnalysis,
        });
        state.touch(StageId::Understand);
        state.push_warning("rule-based classification used");
        state
    }

    #[test]
    fn save_then_load_is_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let state = populated_state();

        save(&state, &path).unwrap();
        let restored = load(&path).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn save_creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/checkpoint.json");
        save(&populated_state(), &path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        save(&populated_state(), &path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn save_writes_envelope_with_meta() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        save(&populated_state(), &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.get("state").is_some());
        assert_eq!(value["meta"]["version"], 1);
        assert!(value["meta"]["saved_at"].is_string());
    }

    #[test]
    fn load_accepts_bare_state_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let state = populated_state();
        fs::write(&path, serde_json::to_string(&state).unwrap()).unwrap();
        assert_eq!(load(&path).unwrap(), state);
    }

    #[test]
    fn load_coerces_legacy_intent_spelling() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut value = serde_json::to_value(populated_state()).unwrap();
        value["requirements"]["analysis_intent"] = serde_json::json!("trend");
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let restored = load(&path).unwrap();
        assert_eq!(
            restored.requirements.unwrap().analysis_intent,
            AnalysisIntent::TrendPrediction
        );
    }

    #[test]
    fn load_unknown_intent_defaults_instead_of_failing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut value = serde_json::to_value(populated_state()).unwrap();
        value["requirements"]["analysis_intent"] = serde_json::json!("definitely-not-an-intent");
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let restored = load(&path).unwrap();
        assert_eq!(
            restored.requirements.unwrap().analysis_intent,
            AnalysisIntent::Overview
        );
    }

    #[test]
    fn load_rejects_non_json_as_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "this is not json").unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn load_rejects_unrecognized_structure_as_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, r#"{"state": {"something": "else"}}"#).unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn load_missing_file_is_io_not_corrupt() {
        let dir = tempdir().unwrap();
        let err = load(&dir.path().join("absent.json")).unwrap_err();
        assert!(!err.is_corrupt());
    }
}
