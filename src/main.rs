use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use cinerec::services::events::EventSubmission;
use cinerec::services::feedback::{FeedbackAck, FeedbackSubmission};
use cinerec::utils::validation;
use cinerec::{init_tracing, AppError, AppState, Config};
use serde::Deserialize;
use uuid::Uuid;
use serde_json::{json, Value};
use std::collections::HashMap;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendationQuery {
    count: Option<usize>,
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventHistoryQuery {
    event_type: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshQuery {
    days_back: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ReloadRequest {
    path: Option<String>,
}

async fn health_check() -> Json<HashMap<String, String>> {
    let mut status = HashMap::new();
    status.insert("status".to_string(), "healthy".to_string());
    status.insert("service".to_string(), "cinerec".to_string());
    status.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
    Json(status)
}

async fn submit_event(
    State(state): State<AppState>,
    Json(submission): Json<EventSubmission>,
) -> Result<Json<cinerec::EventResponse>, AppError> {
    let response = state.events.process_event(submission).await?;
    Ok(Json(response))
}

/// Body of the per-type event endpoints; the event type comes from the path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypedEventBody {
    request_id: Option<Uuid>,
    user_id: String,
    movie_id: Option<String>,
    #[serde(default)]
    event_data: serde_json::Value,
    client_timestamp: Option<DateTime<Utc>>,
}

async fn submit_typed(
    state: AppState,
    event_type: &str,
    body: TypedEventBody,
) -> Result<Json<cinerec::EventResponse>, AppError> {
    let submission = EventSubmission {
        request_id: body.request_id,
        user_id: body.user_id,
        movie_id: body.movie_id,
        event_type: event_type.to_string(),
        event_data: body.event_data,
        client_timestamp: body.client_timestamp,
    };
    Ok(Json(state.events.process_event(submission).await?))
}

async fn submit_watch_event(
    State(state): State<AppState>,
    Json(body): Json<TypedEventBody>,
) -> Result<Json<cinerec::EventResponse>, AppError> {
    submit_typed(state, "watch", body).await
}

async fn submit_search_event(
    State(state): State<AppState>,
    Json(body): Json<TypedEventBody>,
) -> Result<Json<cinerec::EventResponse>, AppError> {
    submit_typed(state, "search", body).await
}

async fn submit_rating_event(
    State(state): State<AppState>,
    Json(body): Json<TypedEventBody>,
) -> Result<Json<cinerec::EventResponse>, AppError> {
    submit_typed(state, "rating", body).await
}

async fn submit_favorite_event(
    State(state): State<AppState>,
    Json(body): Json<TypedEventBody>,
) -> Result<Json<cinerec::EventResponse>, AppError> {
    submit_typed(state, "favorite", body).await
}

async fn get_user_events(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<EventHistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let events = state
        .events
        .get_user_events(&user_id, query.event_type.as_deref(), query.limit.unwrap_or(20))
        .await?;
    Ok(Json(json!({
        "userId": user_id,
        "count": events.len(),
        "events": events,
    })))
}

async fn get_recommendations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<RecommendationQuery>,
) -> Result<Json<cinerec::RecommendationResponse>, AppError> {
    let count = query
        .count
        .unwrap_or(state.config.recommendation.default_count);
    let context = query.context.as_deref().unwrap_or("home");

    let response = state.engine.recommend(&user_id, count, context).await?;
    Ok(Json(response))
}

async fn get_features(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<cinerec::UserFeaturesResponse>, AppError> {
    let stored = state
        .features
        .get(&user_id)
        .await
        .map_err(AppError::Storage)?
        .ok_or_else(|| AppError::NotFound(format!("no features for user {}", user_id)))?;

    Ok(Json(cinerec::UserFeaturesResponse {
        user_id,
        version: stored.version,
        updated_at: stored.updated_at,
        features: stored.features,
    }))
}

async fn refresh_features(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<cinerec::UserFeatures>, AppError> {
    let days_back = validation::validate_days_back(query.days_back.unwrap_or(30))?;
    let features = state
        .features
        .refresh(&user_id, days_back)
        .await
        .map_err(AppError::Storage)?;
    Ok(Json(features))
}

async fn reload_model(
    State(state): State<AppState>,
    Json(request): Json<ReloadRequest>,
) -> Result<Json<cinerec::ModelReloadResponse>, AppError> {
    let response = state.engine.reload_model(request.path).await?;
    Ok(Json(response))
}

async fn submit_feedback(
    State(state): State<AppState>,
    Json(submission): Json<FeedbackSubmission>,
) -> Result<Json<FeedbackAck>, AppError> {
    let ack = state.feedback.submit(submission).await?;
    Ok(Json(ack))
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/events", post(submit_event))
        .route("/api/v1/events/watch", post(submit_watch_event))
        .route("/api/v1/events/search", post(submit_search_event))
        .route("/api/v1/events/rating", post(submit_rating_event))
        .route("/api/v1/events/favorite", post(submit_favorite_event))
        .route("/api/v1/events/:user_id", get(get_user_events))
        .route("/api/v1/recommend/:user_id", get(get_recommendations))
        .route("/api/v1/features/:user_id", get(get_features))
        .route("/api/v1/features/:user_id/refresh", post(refresh_features))
        .route("/api/v1/model/reload", post(reload_model))
        .route("/api/v1/feedback", post(submit_feedback))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing().await;

    let config_path =
        std::env::var("CINEREC_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::from_file(&config_path)?
    } else {
        info!("config file not found at {}, using defaults", config_path);
        Config::default()
    };

    info!("starting cinerec server on {}", config.server.socket_addr());

    let state = AppState::new(config.clone()).await?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.socket_addr()).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
