//! REST endpoints for entity stages and their nudge audit trail.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::manager::StageTransitionCoordinator;
use super::state::Stage;
use crate::error::{DatabaseError, Error};

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub coordinator: Arc<StageTransitionCoordinator>,
}

#[derive(Debug, Deserialize)]
struct AdvanceRequest {
    stage: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn internal_error(e: Error) -> Response {
    match e {
        Error::Database(DatabaseError::NotFound { id, .. }) => {
            error_response(StatusCode::NOT_FOUND, format!("Unknown entity {id}"))
        }
        other => {
            tracing::error!("Onboarding request failed: {other}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

/// POST /api/entities/{id}
///
/// Registers the entity at `new`; existing entities are left untouched.
async fn create_entity(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<String>,
) -> Response {
    match state.coordinator.ensure_entity(&id).await {
        Ok(created) => {
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(serde_json::json!({ "id": id, "created": created }))).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// GET /api/entities/{id}
async fn get_entity(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<String>,
) -> Response {
    match state.coordinator.timeline(&id).await {
        Ok(Some(timeline)) => Json(timeline).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Unknown entity {id}")),
        Err(e) => internal_error(e),
    }
}

/// POST /api/entities/{id}/stage
///
/// Body: `{"stage": "wait_payment"}`. Returns whether the stage changed.
async fn advance_stage(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<String>,
    Json(req): Json<AdvanceRequest>,
) -> Response {
    let stage: Stage = match req.stage.parse() {
        Ok(stage) => stage,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match state.coordinator.advance(&id, stage).await {
        Ok(changed) => {
            Json(serde_json::json!({ "changed": changed, "stage": stage })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// GET /api/entities/{id}/messages
async fn list_messages(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<String>,
) -> Response {
    match state.coordinator.scheduled_messages(&id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Build the onboarding REST routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/api/entities/{id}", get(get_entity).post(create_entity))
        .route("/api/entities/{id}/stage", post(advance_stage))
        .route("/api/entities/{id}/messages", get(list_messages))
        .with_state(state)
}
