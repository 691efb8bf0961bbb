//! HTTP server with streamed analysis.
//!
//! Wraps the pipeline in a JSON + Server-Sent Events API for browser
//! clients. Each session owns at most one [`ConversationContext`] and one
//! in-flight run. Sessions live in [`AppState`]; they are torn down by a
//! reset, by a failed run that created them implicitly, or by eviction of
//! the least recently used session once `server.max_sessions` is reached.
//!
//! A session is never locked across a model call. A question checks the
//! conversation out of its session and puts it back when answered, so a
//! reset or a new analysis is not held up by a slow answer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/session` | Create a session, returns `{ "session_id" }` |
//! | `POST` | `/api/analyze` | Analyse a local directory; `text/event-stream` response |
//! | `POST` | `/api/ask` | Ask a follow-up question about the last report |
//! | `POST` | `/api/session/reset` | Drop a session and return a fresh one |
//! | `GET`  | `/api/config` | Model and budget settings |
//! | `GET`  | `/health` | Health check (version and live session count) |
//!
//! # Event Stream
//!
//! `POST /api/analyze` answers with `progress` events (one [`RunProgress`]
//! JSON object each, in sequence order) followed by exactly one `report` or
//! `error` event. Closing the connection cancels the run.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (409),
//! `internal` (500), `upstream` (502).
//!
//! [`RunProgress`]: crate::models::RunProgress

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::Config;
use crate::conversation::ConversationContext;
use crate::error::ConversationError;
use crate::models::Report;
use crate::pipeline::Pipeline;
use crate::progress::ChannelProgress;
use crate::scan::scan_directory;

/// Per-session state: the conversation over the last report, and the
/// cancellation handle of the run in flight, if any.
#[derive(Default)]
struct Session {
    conversation: Option<ConversationContext>,
    run: Option<CancellationToken>,
    /// Set while a question is out and `conversation` is checked out.
    asking: bool,
}

type SharedSession = Arc<tokio::sync::Mutex<Session>>;

struct SessionSlot {
    session: SharedSession,
    last_used: Instant,
}

type SessionMap = HashMap<Uuid, SessionSlot>;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    sessions: Arc<Mutex<SessionMap>>,
}

impl AppState {
    pub fn new(config: Config, pipeline: Pipeline) -> Self {
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, SessionMap> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn create_session(&self) -> (Uuid, SharedSession) {
        let id = Uuid::new_v4();
        let session = SharedSession::default();
        let mut sessions = self.lock_sessions();

        while sessions.len() >= self.config.server.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(id, _)| *id)
            else {
                break;
            };
            sessions.remove(&oldest);
            tracing::info!(session = %oldest, "evicted least recently used session");
        }

        sessions.insert(
            id,
            SessionSlot {
                session: session.clone(),
                last_used: Instant::now(),
            },
        );
        tracing::debug!(session = %id, "session created");
        (id, session)
    }

    fn session(&self, id: &Uuid) -> Option<SharedSession> {
        let mut sessions = self.lock_sessions();
        let slot = sessions.get_mut(id)?;
        slot.last_used = Instant::now();
        Some(slot.session.clone())
    }

    fn remove_session(&self, id: &Uuid) -> Option<SharedSession> {
        self.lock_sessions().remove(id).map(|slot| slot.session)
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }
}

/// Builds the router. Exposed so tests and embedders can serve it on
/// their own listener.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/session", post(handle_new_session))
        .route("/api/analyze", post(handle_analyze))
        .route("/api/ask", post(handle_ask))
        .route("/api/session/reset", post(handle_reset))
        .route("/api/config", get(handle_config))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config)?;
    let bind_addr = config.server.bind.clone();
    let app = router(AppState::new(config.clone(), pipeline));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, model = %config.llm.model, "server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn not_ready(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "not_ready".to_string(),
        message: message.into(),
    }
}

fn upstream(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn unknown_session(id: &Uuid) -> AppError {
    not_found(format!("unknown session: {id}"))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    sessions: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.session_count(),
    })
}

// ============ GET /api/config ============

#[derive(Serialize)]
struct ConfigResponse {
    model: String,
    map_token_budget: usize,
    merge_token_budget: usize,
    workers: usize,
}

async fn handle_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        model: state.pipeline.client().model().to_string(),
        map_token_budget: state.config.pipeline.map_token_budget,
        merge_token_budget: state.config.pipeline.merge_token_budget,
        workers: state.config.pipeline.workers,
    })
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionResponse {
    session_id: Uuid,
}

async fn handle_new_session(State(state): State<AppState>) -> Json<SessionResponse> {
    let (session_id, _) = state.create_session();
    Json(SessionResponse { session_id })
}

#[derive(Deserialize)]
struct ResetRequest {
    session_id: Option<Uuid>,
}

/// Tears the session down (cancelling any run) and hands out a new one.
async fn handle_reset(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Json<SessionResponse> {
    if let Some(old) = req.session_id.and_then(|id| state.remove_session(&id)) {
        if let Some(run) = old.lock().await.run.take() {
            run.cancel();
        }
    }
    let (session_id, _) = state.create_session();
    Json(SessionResponse { session_id })
}

// ============ POST /api/analyze ============

#[derive(Deserialize)]
struct AnalyzeRequest {
    session_id: Option<Uuid>,
    /// Local directory to analyse.
    path: String,
}

#[derive(Serialize)]
struct ReportEvent {
    session_id: Uuid,
    #[serde(flatten)]
    report: Report,
}

#[derive(Serialize)]
struct ErrorEvent {
    session_id: Uuid,
    kind: String,
    message: String,
}

enum Outcome {
    Report(ReportEvent),
    Error(ErrorEvent),
}

impl Outcome {
    fn error(session_id: Uuid, kind: &str, message: impl Into<String>) -> Self {
        Outcome::Error(ErrorEvent {
            session_id,
            kind: kind.to_string(),
            message: message.into(),
        })
    }

    fn into_event(self) -> Result<Event, axum::Error> {
        match self {
            Outcome::Report(r) => Event::default().event("report").json_data(r),
            Outcome::Error(e) => Event::default().event("error").json_data(e),
        }
    }
}

async fn handle_analyze(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let path = req.path.trim();
    if path.is_empty() {
        return Err(bad_request("path must not be empty"));
    }
    let root = PathBuf::from(path);
    if !root.is_dir() {
        return Err(bad_request(format!("not a directory: {}", root.display())));
    }

    let implicit = req.session_id.is_none();
    let (session_id, session) = match req.session_id {
        Some(id) => (id, state.session(&id).ok_or_else(|| unknown_session(&id))?),
        None => state.create_session(),
    };

    let cancel = CancellationToken::new();
    {
        let mut s = session.lock().await;
        if let Some(previous) = s.run.replace(cancel.clone()) {
            previous.cancel();
        }
        s.conversation = None;
    }

    let (progress_tx, progress_rx) = tokio::sync::mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = tokio::sync::mpsc::unbounded_channel();

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let repository = root.display().to_string();
        let scan_config = state.config.scan.clone();
        let scanned =
            tokio::task::spawn_blocking(move || scan_directory(&root, &scan_config)).await;

        let outcome = match scanned {
            Ok(Ok(files)) => {
                let sink = ChannelProgress(progress_tx);
                let result = state
                    .pipeline
                    .run(&repository, files, &sink, task_cancel.clone())
                    .await;
                drop(sink);
                match result {
                    Ok(report) => {
                        let mut s = session.lock().await;
                        if !task_cancel.is_cancelled() {
                            s.conversation = Some(state.pipeline.conversation(report.clone()));
                            s.run = None;
                        }
                        Outcome::Report(ReportEvent { session_id, report })
                    }
                    Err(e) => Outcome::error(session_id, e.kind(), e.to_string()),
                }
            }
            Ok(Err(e)) => Outcome::error(session_id, "scan", format!("{e:#}")),
            Err(e) => Outcome::error(session_id, "internal", e.to_string()),
        };
        if implicit && matches!(outcome, Outcome::Error(_)) {
            // Nothing to ask about in a session nobody asked for.
            state.remove_session(&session_id);
        }
        let _ = outcome_tx.send(outcome);
    });

    // Dropping the stream (client disconnect) cancels the run.
    let guard = cancel.drop_guard();
    let progress = UnboundedReceiverStream::new(progress_rx)
        .map(|ev| Event::default().event("progress").json_data(ev));
    let outcome = UnboundedReceiverStream::new(outcome_rx).map(Outcome::into_event);
    let stream = progress.chain(outcome).map(move |ev| {
        let _guard = &guard;
        ev
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ POST /api/ask ============

#[derive(Deserialize)]
struct AskRequest {
    session_id: Uuid,
    question: String,
}

#[derive(Serialize)]
struct AskResponse {
    session_id: Uuid,
    sequence: u64,
    answer: String,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let session = state
        .session(&req.session_id)
        .ok_or_else(|| unknown_session(&req.session_id))?;

    let mut conversation = {
        let mut s = session.lock().await;
        if s.asking {
            return Err(not_ready("a question is already being answered in this session"));
        }
        let conversation = s
            .conversation
            .take()
            .ok_or_else(|| not_ready("no finished analysis in this session"))?;
        s.asking = true;
        conversation
    };

    // Spawned so the conversation is returned even if the client goes away.
    let question = req.question;
    let answered = tokio::spawn(async move {
        let result = conversation.ask(&question).await;
        let mut s = session.lock().await;
        s.asking = false;
        // An analysis started meanwhile replaces this conversation.
        if s.run.is_none() && s.conversation.is_none() {
            s.conversation = Some(conversation);
        }
        result
    })
    .await
    .map_err(|e| internal(e.to_string()))?;

    let turn = answered.map_err(|e| match e {
        ConversationError::EmptyQuestion => bad_request(e.to_string()),
        ConversationError::Completion(inner) => upstream(inner.to_string()),
    })?;

    Ok(Json(AskResponse {
        session_id: req.session_id,
        sequence: turn.sequence,
        answer: turn.answer,
    }))
}
