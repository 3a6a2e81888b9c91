//! Section fan-out executor.
//!
//! Runs one generation call per unprocessed section under a bounded worker
//! pool. Workers share only the read-only context (query, domain, retrieved
//! documents); no worker reads or writes another section's state. Results
//! come back in declared outline order regardless of completion order, so
//! the caller's merge is deterministic. A failed section surfaces as an
//! error outcome, never as an aborted stage.

use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::errors::ExternalCallError;
use crate::llm::{GenerateParams, Generator, RetryPolicy, generate_with_retry};
use crate::progress::ProgressBus;
use crate::prompts;
use crate::search::Doc;
use crate::state::Section;

/// Read-only context shared by every section worker.
#[derive(Clone)]
pub struct SectionContext {
    pub query: String,
    pub domain: String,
    pub docs: Arc<Vec<Doc>>,
}

/// Result of one section worker.
#[derive(Debug)]
pub struct SectionOutcome {
    pub title: String,
    pub result: Result<String, ExternalCallError>,
}

/// Generate content for every section not yet in `processed`, with at most
/// `concurrency` generation calls in flight. Outcomes are returned in the
/// order the sections appear in the outline.
pub async fn run_sections(
    generator: Arc<dyn Generator>,
    bus: &ProgressBus,
    policy: RetryPolicy,
    sections: &[Section],
    shared: &SectionContext,
    processed: &[String],
    concurrency: usize,
) -> Vec<SectionOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let pending: Vec<Section> = sections
        .iter()
        .filter(|s| !processed.iter().any(|p| p == &s.title))
        .cloned()
        .collect();

    let workers = pending.into_iter().map(|section| {
        let generator = Arc::clone(&generator);
        let semaphore = Arc::clone(&semaphore);
        let shared = shared.clone();
        let bus = bus.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            let prompt =
                prompts::section_prompt(&shared.query, &shared.domain, &section, &shared.docs);
            let result =
                generate_with_retry(&*generator, &prompt, &GenerateParams::default(), policy)
                    .await;

            match &result {
                Ok(content) => bus.user(
                    "stage.retrieve_knowledge",
                    "section_done",
                    json!({"title": section.title.clone(), "content_length": content.len()}),
                ),
                Err(err) => bus.user(
                    "stage.retrieve_knowledge",
                    "error",
                    json!({"message": format!("section '{}' failed: {err}", section.title)}),
                ),
            }

            SectionOutcome {
                title: section.title,
                result,
            }
        }
    });

    join_all(workers).await
}
