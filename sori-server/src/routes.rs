//! Router and handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthContext, auth_middleware};
use crate::error::{Result, ServerError};
use crate::minter::MintContext;
use crate::state::AppState;

/// Token mint request from the client.
#[derive(Debug, Deserialize)]
pub struct TokenMintRequest {
    pub model: Option<String>,
    pub voice: Option<String>,
    #[serde(rename = "scenarioId")]
    pub scenario_id: Option<String>,
    #[serde(rename = "isScenarioBased", default)]
    pub is_scenario_based: bool,
    #[serde(rename = "isLessonBased", default)]
    pub is_lesson_based: bool,
    #[serde(rename = "lessonDetails")]
    pub lesson_details: Option<String>,
    pub level: Option<String>,
    pub user: Option<Value>,
}

/// Build the application router.
pub fn create_app(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/openai/realtime/token", post(mint_token))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

/// POST /openai/realtime/token — mint an ephemeral realtime credential.
async fn mint_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<TokenMintRequest>,
) -> Result<Json<Value>> {
    // Rate-limit on the end user where known, falling back to the
    // authenticated app principal.
    let rate_key = request
        .user
        .as_ref()
        .and_then(|u| u.get("id"))
        .and_then(|id| id.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| auth.principal.clone());
    state.limiter.check(&rate_key)?;

    let level = request.level.unwrap_or_else(|| "beginner".to_string());
    match level.as_str() {
        "beginner" | "intermediate" | "advanced" => {}
        other => {
            return Err(ServerError::BadRequest(format!("unknown level: {other}")));
        }
    }

    let model = request.model.unwrap_or_else(|| state.config.default_model.clone());
    let voice = request.voice.unwrap_or_else(|| state.config.default_voice.clone());
    let context = MintContext {
        scenario_id: request.scenario_id,
        level,
        is_scenario_based: request.is_scenario_based,
        is_lesson_based: request.is_lesson_based,
        lesson_details: request.lesson_details,
    };

    tracing::info!(
        principal = %auth.principal,
        user = %rate_key,
        scenario = context.scenario_id.as_deref().unwrap_or("-"),
        %model,
        "minting realtime credential"
    );
    let ephemeral_key = state.minter.mint(&model, &voice, &context).await?;

    Ok(Json(json!({
        "success": true,
        "data": { "ephemeralKey": ephemeral_key },
    })))
}
