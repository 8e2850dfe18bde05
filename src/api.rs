//! HTTP trigger surface.
//!
//! Small, trusted, operator-facing API: enqueue entities, trigger a detection
//! batch, run maintenance, inspect queue depths. Production traffic enters
//! through the queues, not through here.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::embedding::EmbeddingService;
use crate::error::PipelineError;
use crate::graph::{DetectionTrigger, EntityStore, EntityType, RawEntityRef};
use crate::maintenance::MaintenanceJob;
use crate::patterns::PatternDetector;
use crate::queue::DurableQueue;

#[derive(Clone)]
pub struct AppState {
    pub store: EntityStore,
    pub embedder: Arc<dyn EmbeddingService>,
    pub detector: Arc<PatternDetector>,
    pub memory_queue: Arc<DurableQueue<RawEntityRef>>,
    pub code_queue: Arc<DurableQueue<RawEntityRef>>,
    pub trigger_queue: Arc<DurableQueue<DetectionTrigger>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/enqueue", post(enqueue))
        .route("/patterns/detect", post(detect))
        .route("/maintenance/dedupe", post(dedupe))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(120)))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> crate::error::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| PipelineError::Configuration(format!("cannot bind {addr}: {e}")))?;
    info!("HTTP trigger API listening on {addr}");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| PipelineError::Configuration(e.to_string()))?;
    Ok(())
}

struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::EntityNotFound { .. } => StatusCode::NOT_FOUND,
            PipelineError::Configuration(_) => StatusCode::BAD_REQUEST,
            PipelineError::EmbeddingUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!("Request failed: {}", self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.health_check().await?;
    let embedding = state.embedder.health_check().await.is_ok();
    Ok(Json(json!({
        "status": "healthy",
        "database": true,
        "embedding": embedding,
    })))
}

async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(json!({
        "queues": {
            "memory": {
                "depth": state.memory_queue.depth().await?,
                "dead": state.memory_queue.dead_letter_depth().await?,
            },
            "code": {
                "depth": state.code_queue.depth().await?,
                "dead": state.code_queue.dead_letter_depth().await?,
            },
            "detection": {
                "depth": state.trigger_queue.depth().await?,
            },
        },
    })))
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    entity_id: Uuid,
    entity_type: EntityType,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    msg_id: i64,
    queue: String,
}

async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let queue = match request.entity_type {
        EntityType::Memory => &state.memory_queue,
        EntityType::Code => &state.code_queue,
    };
    let msg_id = queue
        .send(&RawEntityRef {
            entity_id: request.entity_id,
            entity_type: request.entity_type,
            enqueued_at: Utc::now(),
        })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            msg_id,
            queue: queue.name().to_string(),
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct DetectRequest {
    batch_id: Option<Uuid>,
}

async fn detect(
    State(state): State<AppState>,
    body: Option<Json<DetectRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batch_id = body
        .and_then(|Json(r)| r.batch_id)
        .unwrap_or_else(Uuid::new_v4);
    let report = state.detector.detect_patterns(batch_id).await?;
    Ok(Json(json!({
        "batch_id": batch_id,
        "patterns_created": report.patterns_created,
        "patterns_updated": report.patterns_updated,
        "seeds_processed": report.seeds_processed,
        "seeds_skipped": report.seeds_skipped,
    })))
}

async fn dedupe(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let job = MaintenanceJob::new(state.store.clone());
    let report = job.run().await?;
    Ok(Json(json!({
        "groups_processed": report.groups_processed,
        "summaries_deleted": report.summaries_deleted,
    })))
}
