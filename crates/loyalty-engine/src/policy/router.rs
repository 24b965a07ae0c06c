use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde_json::json;
use tracing::info;

use super::domain::{PolicyContext, PolicyId};
use super::engine::PolicyEngine;
use super::errors::EvaluationError;
use super::registry::PolicySource;

/// Router builder exposing evaluation and cache invalidation endpoints.
pub fn policy_router<S>(engine: Arc<PolicyEngine<S>>) -> Router
where
    S: PolicySource + 'static,
{
    Router::new()
        .route("/api/v1/evaluations", post(evaluate_handler::<S>))
        .route(
            "/api/v1/policies/:policy_id/invalidate",
            post(invalidate_policy_handler::<S>),
        )
        .route(
            "/api/v1/policies/invalidate",
            post(invalidate_all_handler::<S>),
        )
        .with_state(engine)
}

pub(crate) fn evaluation_status(error: &EvaluationError) -> StatusCode {
    match error {
        EvaluationError::InvalidContext(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EvaluationError::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
        EvaluationError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        EvaluationError::Overflow => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) async fn evaluate_handler<S>(
    State(engine): State<Arc<PolicyEngine<S>>>,
    axum::Json(context): axum::Json<PolicyContext>,
) -> Response
where
    S: PolicySource + 'static,
{
    match engine.evaluate(&context).await {
        Ok(result) => (StatusCode::OK, axum::Json(result)).into_response(),
        Err(error) => {
            let payload = json!({
                "error": error.to_string(),
            });
            (evaluation_status(&error), axum::Json(payload)).into_response()
        }
    }
}

pub(crate) async fn invalidate_policy_handler<S>(
    State(engine): State<Arc<PolicyEngine<S>>>,
    Path(policy_id): Path<String>,
) -> Response
where
    S: PolicySource + 'static,
{
    let policy_id = PolicyId(policy_id);
    let invalidated = engine.registry().invalidate(&policy_id);
    info!(%policy_id, invalidated, "policy cache invalidated");
    let payload = json!({
        "policy_id": policy_id,
        "invalidated_scopes": invalidated,
    });
    (StatusCode::ACCEPTED, axum::Json(payload)).into_response()
}

pub(crate) async fn invalidate_all_handler<S>(
    State(engine): State<Arc<PolicyEngine<S>>>,
) -> Response
where
    S: PolicySource + 'static,
{
    let invalidated = engine.registry().invalidate_all();
    info!(invalidated, "policy cache cleared");
    let payload = json!({
        "invalidated_scopes": invalidated,
    });
    (StatusCode::ACCEPTED, axum::Json(payload)).into_response()
}
