//! Run server: the pipeline over HTTP.
//!
//! `POST /run` executes a run to completion and returns the final state, or
//! streams progress as server-sent events when the request asks for it. In
//! streaming mode the pipeline runs on a background task; the response task
//! tails the durable progress log and the two sides share nothing but the
//! log file and a frame queue.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::checkpoint;
use crate::config::{Config, DEFAULT_WORD_LIMIT};
use crate::llm::{Generator, OpenAiStyleClient};
use crate::pipeline::{Orchestrator, PipelineContext};
use crate::progress::{EVENT_USER_PROGRESS, LogTailer, ProgressBus};
use crate::search::{SearchProvider, SerperClient};
use crate::state::PipelineState;
use crate::wordcount::count_words;

/// Shared server state: configuration plus the external capabilities every
/// run borrows.
pub struct AppState {
    pub config: Config,
    pub generator: Arc<dyn Generator>,
    pub search: Arc<dyn SearchProvider>,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub word_limit: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/checkpoint/exists", get(checkpoint_exists))
        .route("/run", post(run))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct ExistsQuery {
    path: PathBuf,
}

async fn checkpoint_exists(Query(params): Query<ExistsQuery>) -> Json<Value> {
    Json(json!({"exists": params.path.exists(), "path": params.path}))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(RunResponse {
            success: false,
            message: message.into(),
            final_report: None,
            state: None,
        }),
    )
        .into_response()
}

async fn run(State(app): State<Arc<AppState>>, Json(req): Json<RunRequest>) -> Response {
    let checkpoint_path = req
        .checkpoint
        .clone()
        .unwrap_or_else(|| app.config.checkpoint_path.clone());

    let initial_state = if req.resume && checkpoint_path.exists() {
        match checkpoint::load(&checkpoint_path) {
            Ok(state) => state,
            Err(err) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to restore checkpoint: {err}"),
                );
            }
        }
    } else {
        let Some(query) = req.query.as_deref().filter(|q| !q.trim().is_empty()) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "query must not be empty, unless resume=true with an existing checkpoint",
            );
        };
        PipelineState::new(query, req.word_limit.unwrap_or(DEFAULT_WORD_LIMIT))
    };

    let bus = ProgressBus::new(app.config.progress_log.clone());
    let ctx = PipelineContext {
        generator: Arc::clone(&app.generator),
        search: Arc::clone(&app.search),
        bus,
        config: app.config.clone(),
    };

    if req.stream {
        stream_run(ctx, initial_state, checkpoint_path).into_response()
    } else {
        blocking_run(ctx, initial_state, checkpoint_path)
            .await
            .into_response()
    }
}

fn save_checkpoint_best_effort(state: &PipelineState, path: &std::path::Path) {
    if let Err(err) = checkpoint::save(state, path) {
        tracing::warn!(error = %err, path = %path.display(), "checkpoint save failed");
    }
}

async fn blocking_run(
    ctx: PipelineContext,
    initial_state: PipelineState,
    checkpoint_path: PathBuf,
) -> Json<RunResponse> {
    let orchestrator = Orchestrator::new(ctx);
    let final_state = orchestrator
        .run(initial_state, |_stage, state| {
            save_checkpoint_best_effort(state, &checkpoint_path);
        })
        .await;

    Json(RunResponse {
        success: true,
        message: "ok".to_string(),
        final_report: final_state.final_report.clone(),
        state: serde_json::to_value(&final_state).ok(),
    })
}

fn sse_frame(payload: Value) -> Event {
    Event::default().data(payload.to_string())
}

fn stream_run(
    ctx: PipelineContext,
    initial_state: PipelineState,
    checkpoint_path: PathBuf,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(64);
    let done = Arc::new(AtomicBool::new(false));

    // Tail the durable log for progress frames. The pipeline task and this
    // one communicate only through the file.
    let mut tailer = LogTailer::from_end(ctx.bus.log_path());
    let tail_tx = tx.clone();
    let tail_done = Arc::clone(&done);
    tokio::spawn(async move {
        loop {
            let stopping = tail_done.load(Ordering::SeqCst);
            let records = tailer.poll().unwrap_or_default();
            for record in records {
                if record.event != EVENT_USER_PROGRESS {
                    continue;
                }
                let frame = sse_frame(json!({
                    "event": "progress",
                    "message": record.message.unwrap_or_default(),
                    "operation": record.operation,
                    "phase": record.phase,
                    "timestamp": record.ts.to_rfc3339(),
                }));
                if tail_tx.send(frame).await.is_err() {
                    return;
                }
            }
            if stopping {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let worker_tx = tx;
    let worker_done = done;
    tokio::spawn(async move {
        let orchestrator = Orchestrator::new(ctx);
        let final_state = orchestrator
            .run(initial_state, |_stage, state| {
                save_checkpoint_best_effort(state, &checkpoint_path);
            })
            .await;
        // Let the tailer drain the last records before the terminal frame.
        worker_done.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;

        if let Some(report) = final_state
            .final_report
            .as_deref()
            .filter(|_| final_state.is_final())
        {
            let _ = worker_tx
                .send(sse_frame(json!({
                    "event": "final_report",
                    "content": report,
                    "word_count": count_words(report),
                    "target_word_limit": final_state.word_limit,
                    "timestamp": Utc::now().to_rfc3339(),
                })))
                .await;
        }

        let frame = match &final_state.error_message {
            Some(message) if final_state.final_report.is_none() => {
                json!({"event": "error", "message": message})
            }
            _ => json!({
                "event": "done",
                "success": final_state.error_message.is_none(),
                "message": final_state
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "ok".to_string()),
                "final_report": final_state.final_report.clone(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        };
        let _ = worker_tx.send(sse_frame(frame)).await;
        // Dropping the last sender closes the stream after the terminal
        // frame, so the client is never left hanging.
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Start the run server on `port`. Dev mode adds permissive CORS for local
/// frontend development.
pub async fn start_server(app_state: AppState, port: u16, dev_mode: bool) -> anyhow::Result<()> {
    use anyhow::Context;

    app_state.config.ensure_directories()?;
    let mut app = build_router(Arc::new(app_state));
    if dev_mode {
        app = app.layer(tower_http::cors::CorsLayer::permissive());
    }

    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    println!("Scribe run server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

/// Build the default production state from configuration.
pub fn default_app_state(config: Config) -> AppState {
    let generator = OpenAiStyleClient::new(
        config.llm.base_url.clone(),
        config.llm.api_key.clone(),
        config.llm.model.clone(),
    );
    let search = SerperClient::new(config.serper_api_key.clone());
    AppState {
        config,
        generator: Arc::new(generator),
        search: Arc::new(search),
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExternalCallError;
    use crate::llm::GenerateParams;
    use crate::search::Doc;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Answers every pipeline prompt with a plausible canned response.
    struct ScriptedGenerator {
        word_limit: u32,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(
            &self,
            prompt: &str,
            _params: &GenerateParams,
        ) -> Result<String, ExternalCallError> {
            if prompt.contains("classifying a report request") {
                Ok(r#"{"domain": "general", "analysis_intent": "overview"}"#.to_string())
            } else if prompt.contains("designing the section outline") {
                Ok(r#"[{"title": "Overview", "key_questions": ["What is it?"]},
                       {"title": "Details", "key_questions": ["How does it work?"]}]"#
                    .to_string())
            } else if prompt.contains("writing one section") {
                Ok("Section body text.".to_string())
            } else if prompt.contains("Evaluate the report below") {
                Ok(r#"{"overall_score": 9.0, "major_issues": [], "feedback": "solid"}"#
                    .to_string())
            } else {
                // Writer, revision and size-adjust prompts: emit a report of
                // exactly the target length.
                Ok("word ".repeat(self.word_limit as usize).trim().to_string())
            }
        }
    }

    struct StubSearch;

    #[async_trait]
    impl SearchProvider for StubSearch {
        async fn search(&self, _query: &str) -> Result<Vec<Doc>, ExternalCallError> {
            Ok(vec![Doc::new("A source", "https://example.com", "snippet")])
        }
    }

    fn test_app(word_limit: u32) -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config::from_env(dir.path().join("out"));
        let state = AppState {
            config,
            generator: Arc::new(ScriptedGenerator { word_limit }),
            search: Arc::new(StubSearch),
        };
        (build_router(Arc::new(state)), dir)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (app, _dir) = test_app(50);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn checkpoint_exists_reports_missing_path() {
        let (app, _dir) = test_app(50);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/checkpoint/exists?path=/definitely/not/there.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["exists"], false);
    }

    #[tokio::test]
    async fn run_without_query_is_bad_request() {
        let (app, _dir) = test_app(50);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"resume": false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn blocking_run_returns_final_report_and_state() {
        let (app, dir) = test_app(50);
        let checkpoint = dir.path().join("out/checkpoint.json");
        let body = json!({
            "query": "Topic X",
            "checkpoint": checkpoint.clone(),
            "resume": false,
            "word_limit": 50,
            "stream": false,
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"], true);
        assert!(!value["final_report"].as_str().unwrap().is_empty());
        assert_eq!(value["state"]["validation_status"], "validated");
        assert!(value["state"]["revision_count"].as_u64().unwrap() <= 3);
        assert!(checkpoint.exists(), "checkpoint written after each stage");
    }

    #[tokio::test]
    async fn streaming_run_terminates_with_done_frame() {
        let (app, dir) = test_app(50);
        let body = json!({
            "query": "Topic X",
            "checkpoint": dir.path().join("out/checkpoint.json"),
            "word_limit": 50,
            "stream": true,
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        let events: Vec<Value> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();

        assert!(!events.is_empty());
        assert!(events.iter().any(|e| e["event"] == "progress"));
        assert!(events.iter().any(|e| e["event"] == "final_report"));
        let last = events.last().unwrap();
        assert_eq!(last["event"], "done");
        assert_eq!(last["success"], true);
    }

    #[tokio::test]
    async fn resume_with_existing_checkpoint_needs_no_query() {
        let (app, dir) = test_app(50);
        let checkpoint = dir.path().join("out/checkpoint.json");
        let mut state = PipelineState::new("resumed topic", 50);
        state.final_report = Some("word ".repeat(50).trim().to_string());
        checkpoint::save(&state, &checkpoint).unwrap();

        let body = json!({
            "checkpoint": checkpoint,
            "resume": true,
            "stream": false,
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["state"]["user_query"], "resumed topic");
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_a_server_error() {
        let (app, dir) = test_app(50);
        let checkpoint = dir.path().join("broken.json");
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(&checkpoint, "not json at all").unwrap();

        let body = json!({"checkpoint": checkpoint, "resume": true});
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
