//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness, version, and generation backend health |
//! | `GET`  | `/v1/partitions` | Partition definitions |
//! | `POST` | `/v1/turn` | Buffered generation turn |
//! | `POST` | `/v1/retrieve` | Retrieval |
//! | `POST` | `/v1/ingest` | Ingest one document |
//! | `POST` | `/v1/stream` | Start a streamed turn, returns `{token, events_path}` |
//! | `GET`  | `/v1/stream/{token}` | Server-Sent Events for a session |
//! | `POST` | `/v1/research` | Research report |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation_error", "message": "query must not be empty" } }
//! ```
//!
//! Codes: `validation_error` (400), `access_denied` (403),
//! `upstream_timeout` (504), `upstream_error` (502), `internal` (500).
//!
//! The stream read endpoint needs no credential beyond the token itself.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use knowledge_relay_core::embedding::Embedder;
use knowledge_relay_core::index::VectorIndex;
use knowledge_relay_core::partition::{PartitionDef, PartitionRegistry};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::RelayError;
use crate::index_rest::create_index;
use crate::intent::IntentClassifier;
use crate::provider::{create_provider, GenerationProvider, Health};
use crate::research::{build_sources, LookupSource, ResearchOrchestrator, ResearchReport, ResearchRequest};
use crate::retrieval::{IngestOutcome, IngestRequest, RetrievalRequest, RetrievalResult, Retriever};
use crate::session::memory::InMemorySessionStore;
use crate::session::{SessionManager, SessionSettings, SessionStore};
use crate::turn::{StreamStart, TurnOrchestrator, TurnRequest, TurnResponse};

/// Every long-lived component, wired once at startup.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<PartitionRegistry>,
    pub retriever: Arc<Retriever>,
    pub provider: Arc<dyn GenerationProvider>,
    pub sessions: Arc<SessionManager>,
    pub research: Arc<ResearchOrchestrator>,
    pub turns: Arc<TurnOrchestrator>,
}

impl Services {
    /// Build the configured collaborators and wire them together.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Arc::new(config.registry()?);
        let embedder = create_embedder(&config.embedding)?;
        let index = create_index(&config.index)?;
        let provider = create_provider(&config.generation)?;
        let sources = build_sources(&config.research, provider.clone())?;
        Ok(Self::with_collaborators(
            config,
            registry,
            embedder,
            index,
            provider,
            sources,
            Arc::new(InMemorySessionStore::new()),
        ))
    }

    /// Wire services around explicit collaborators.
    pub fn with_collaborators(
        config: &Config,
        registry: Arc<PartitionRegistry>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        provider: Arc<dyn GenerationProvider>,
        sources: Vec<Arc<dyn LookupSource>>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let retriever = Arc::new(Retriever::new(
            registry.clone(),
            embedder,
            index,
            &config.retrieval,
        ));
        let sessions = Arc::new(SessionManager::new(
            store,
            SessionSettings::from(&config.stream),
        ));
        let research = Arc::new(ResearchOrchestrator::new(
            sources,
            provider.clone(),
            &config.research,
        ));
        let intents = Arc::new(IntentClassifier::new(
            provider.clone(),
            registry.clone(),
            &config.intent,
        ));
        let turns = Arc::new(TurnOrchestrator::new(
            provider.clone(),
            retriever.clone(),
            intents,
            sessions.clone(),
            &config.turn,
            &config.generation,
        ));
        Self {
            registry,
            retriever,
            provider,
            sessions,
            research,
            turns,
        }
    }
}

/// Build the router over `services`.
pub fn router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/partitions", get(handle_partitions))
        .route("/v1/turn", post(handle_turn))
        .route("/v1/retrieve", post(handle_retrieve))
        .route("/v1/ingest", post(handle_ingest))
        .route("/v1/stream", post(handle_stream_start))
        .route("/v1/stream/{token}", get(handle_stream_events))
        .route("/v1/research", post(handle_research))
        .layer(cors)
        .with_state(services)
}

/// Start the server on `[server].bind` and run until the process exits.
pub async fn run_server(config: &Config) -> Result<()> {
    let services = Services::from_config(config)?;
    let listener = TcpListener::bind(&config.server.bind).await?;
    serve(listener, services).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, services: Services) -> Result<()> {
    info!(
        addr = %listener.local_addr()?,
        partitions = services.registry.len(),
        provider = services.provider.name(),
        "server listening"
    );
    axum::serve(listener, router(services)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

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

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        let status = match &err {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Access(_) => StatusCode::FORBIDDEN,
            RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        RelayError::validation(rejection.body_text()).into()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    backend: Health,
}

async fn handle_health(State(services): State<Services>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: services.provider.health_check().await,
    })
}

// ============ GET /v1/partitions ============

#[derive(Serialize)]
struct PartitionListResponse {
    partitions: Vec<PartitionDef>,
}

async fn handle_partitions(State(services): State<Services>) -> Json<PartitionListResponse> {
    Json(PartitionListResponse {
        partitions: services.registry.partitions().cloned().collect(),
    })
}

// ============ POST /v1/turn ============

async fn handle_turn(
    State(services): State<Services>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Json<TurnResponse>, AppError> {
    let Json(req) = payload?;
    Ok(Json(services.turns.run(&req).await?))
}

// ============ POST /v1/retrieve ============

async fn handle_retrieve(
    State(services): State<Services>,
    payload: Result<Json<RetrievalRequest>, JsonRejection>,
) -> Result<Json<RetrievalResult>, AppError> {
    let Json(req) = payload?;
    Ok(Json(services.retriever.retrieve(&req).await?))
}

// ============ POST /v1/ingest ============

async fn handle_ingest(
    State(services): State<Services>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestOutcome>, AppError> {
    let Json(req) = payload?;
    Ok(Json(services.retriever.ingest(&req).await?))
}

// ============ POST /v1/stream, GET /v1/stream/{token} ============

async fn handle_stream_start(
    State(services): State<Services>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Json<StreamStart>, AppError> {
    let Json(req) = payload?;
    Ok(Json(services.turns.start_stream(&req).await?))
}

/// Forward a session's events as SSE, one named event per delivery. An
/// unknown or expired token yields a single `error` event and closes.
async fn handle_stream_events(
    State(services): State<Services>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    let events = services
        .sessions
        .subscribe(&token)
        .map(|event| {
            let sse = Event::default().event(event.name());
            Ok::<_, Infallible>(sse.json_data(&event).unwrap_or_else(|e| {
                warn!(error = %e, "failed to encode stream event");
                Event::default().event("error").data(r#"{"event":"error","message":"encoding failed"}"#)
            }))
        });
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ============ POST /v1/research ============

async fn handle_research(
    State(services): State<Services>,
    payload: Result<Json<ResearchRequest>, JsonRejection>,
) -> Result<Json<ResearchReport>, AppError> {
    let Json(req) = payload?;
    Ok(Json(services.research.research(&req).await?))
}
