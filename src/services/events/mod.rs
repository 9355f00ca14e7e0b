use crate::config::Config;
use crate::error::AppError;
use crate::models::{
    AuditEvent, AuditStatus, EventResponse, EventStatus, EventType, InteractionEvent,
};
use crate::services::cache::{processed_request_key, Cache};
use crate::services::features::FeatureService;
use crate::services::kafka::EventPublisher;
use crate::services::recommendation::RecommendationEngine;
use crate::services::store::EventStore;
use crate::utils::validation;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Incoming event payload as submitted by clients. `request_id` is minted
/// server-side when absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubmission {
    pub request_id: Option<Uuid>,
    pub user_id: String,
    pub movie_id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub event_data: serde_json::Value,
    pub client_timestamp: Option<DateTime<Utc>>,
}

/// Event intake pipeline: validate, deduplicate, persist, publish, then
/// update features and refresh recommendations off the request path.
pub struct EventService {
    event_store: Arc<dyn EventStore>,
    features: Arc<FeatureService>,
    cache: Arc<dyn Cache>,
    publisher: Option<Arc<EventPublisher>>,
    engine: Arc<RecommendationEngine>,
    config: Arc<Config>,
}

impl EventService {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        features: Arc<FeatureService>,
        cache: Arc<dyn Cache>,
        publisher: Option<Arc<EventPublisher>>,
        engine: Arc<RecommendationEngine>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            event_store,
            features,
            cache,
            publisher,
            engine,
            config,
        }
    }

    /// Accepts one interaction event.
    ///
    /// Duplicate detection is two-layered: a best-effort idempotency marker
    /// in the cache, then the store's unique `request_id` constraint. The
    /// marker check and the eventual mark are not atomic, so concurrent
    /// retries can race past the marker; the store constraint ensures at
    /// most one of them persists the event.
    pub async fn process_event(
        &self,
        submission: EventSubmission,
    ) -> Result<EventResponse, AppError> {
        let event_type = validation::validate_submission(&submission)?;
        let request_id = submission.request_id.unwrap_or_else(Uuid::new_v4);
        let server_timestamp = Utc::now();

        if self.already_processed(request_id).await {
            debug!("duplicate request {} short-circuited by marker", request_id);
            return Ok(EventResponse {
                request_id,
                status: EventStatus::Duplicate,
                server_timestamp,
            });
        }

        let event = InteractionEvent::new(
            request_id,
            submission.user_id,
            submission.movie_id,
            event_type,
            submission.event_data,
            submission.client_timestamp,
            server_timestamp,
        );

        let inserted = self
            .event_store
            .insert_event(&event)
            .await
            .map_err(AppError::Storage)?;
        if !inserted {
            self.mark_processed(request_id).await;
            return Ok(EventResponse {
                request_id,
                status: EventStatus::Duplicate,
                server_timestamp,
            });
        }

        let published = match &self.publisher {
            Some(publisher) if self.config.kafka.enabled => {
                publisher.publish_interaction_event(&event).await
            }
            _ => false,
        };

        self.event_store
            .insert_audit(&AuditEvent {
                id: Uuid::new_v4(),
                event_id: event.id,
                status: if published {
                    AuditStatus::Published
                } else {
                    AuditStatus::Pending
                },
                message: format!("{} event accepted", event_type.as_str()),
                processed_at: server_timestamp,
            })
            .await
            .map_err(AppError::Storage)?;

        if self.config.recommendation.inline_feature_update {
            let features = self
                .features
                .apply_and_persist(&event)
                .await
                .map_err(AppError::Storage)?;

            if let Some(publisher) = &self.publisher {
                if self.config.kafka.enabled {
                    publisher
                        .publish_processed_features(
                            &event.user_id,
                            &json!({
                                "userId": event.user_id,
                                "features": features,
                                "processedAt": Utc::now(),
                            }),
                        )
                        .await;
                }
            }
        }

        self.mark_processed(request_id).await;
        self.spawn_recommendation_refresh(event.user_id.clone());

        info!(
            "accepted {} event {} for user {}",
            event_type.as_str(),
            request_id,
            event.user_id
        );
        Ok(EventResponse {
            request_id,
            status: EventStatus::Accepted,
            server_timestamp,
        })
    }

    /// Most recent events for a user, optionally filtered by type.
    pub async fn get_user_events(
        &self,
        user_id: &str,
        event_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InteractionEvent>, AppError> {
        let limit = validation::validate_history_limit(limit)?;
        let event_type = match event_type {
            Some(raw) => Some(EventType::parse(raw).ok_or_else(|| {
                AppError::Validation(format!("unknown event type: {}", raw))
            })?),
            None => None,
        };

        self.event_store
            .recent_events(user_id, event_type, limit)
            .await
            .map_err(AppError::Storage)
    }

    async fn already_processed(&self, request_id: Uuid) -> bool {
        match self
            .cache
            .get(&processed_request_key(&request_id.to_string()))
            .await
        {
            Ok(marker) => marker.is_some(),
            Err(e) => {
                warn!("idempotency marker read failed: {}", e);
                false
            }
        }
    }

    async fn mark_processed(&self, request_id: Uuid) {
        if let Err(e) = self
            .cache
            .set_with_ttl(
                &processed_request_key(&request_id.to_string()),
                b"1".to_vec(),
                self.config.redis.idempotency_ttl_seconds,
            )
            .await
        {
            warn!("idempotency marker write failed: {}", e);
        }
    }

    /// Recommendation refresh never blocks event acceptance. The task is
    /// detached; failures are logged, not surfaced.
    fn spawn_recommendation_refresh(&self, user_id: String) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(e) = engine.warm(&user_id).await {
                error!("background recommendation refresh failed for {}: {}", user_id, e);
            }
        });
    }
}
