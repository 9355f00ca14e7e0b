use crate::models::{
    AuditEvent, EventType, FeedbackRecord, InteractionEvent, RatingRow, UserFeatures,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

/// A stored feature document together with its persistence metadata.
#[derive(Debug, Clone)]
pub struct StoredFeatures {
    pub features: UserFeatures,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

/// Append-only store of interaction events and their audit trail.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists the event. Returns `false` without writing when an event
    /// with the same `request_id` already exists.
    async fn insert_event(&self, event: &InteractionEvent) -> Result<bool>;

    async fn insert_audit(&self, audit: &AuditEvent) -> Result<()>;

    /// Events for one user since `cutoff`, oldest first. Used for full
    /// feature recomputation.
    async fn events_since(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>>;

    /// Most recent events for one user, newest first.
    async fn recent_events(
        &self,
        user_id: &str,
        event_type: Option<EventType>,
        limit: usize,
    ) -> Result<Vec<InteractionEvent>>;
}

/// Point-lookup / full-overwrite store of per-user feature documents.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<StoredFeatures>>;

    async fn upsert(&self, user_id: &str, features: &UserFeatures) -> Result<()>;

    /// Flattens every user's ratings map into the collaborative corpus.
    async fn all_ratings(&self) -> Result<Vec<RatingRow>>;
}

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn insert_feedback(&self, feedback: &FeedbackRecord) -> Result<()>;
}

// ============== Postgres ==============

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .context("failed to connect to postgres")?;
        info!("postgres connection pool established");
        Ok(Self { pool })
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<InteractionEvent> {
        let event_type: String = row.try_get("event_type")?;
        Ok(InteractionEvent {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            user_id: row.try_get("user_id")?,
            movie_id: row.try_get("movie_id")?,
            event_type: EventType::parse(&event_type)
                .ok_or_else(|| anyhow::anyhow!("unknown event type in store: {}", event_type))?,
            event_data: row.try_get("event_data")?,
            client_timestamp: row.try_get("client_timestamp")?,
            server_timestamp: row.try_get("server_timestamp")?,
        })
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_event(&self, event: &InteractionEvent) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO interaction_events \
             (id, request_id, user_id, movie_id, event_type, event_data, client_timestamp, server_timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (request_id) DO NOTHING",
        )
        .bind(event.id)
        .bind(event.request_id)
        .bind(&event.user_id)
        .bind(&event.movie_id)
        .bind(event.event_type.as_str())
        .bind(&event.event_data)
        .bind(event.client_timestamp)
        .bind(event.server_timestamp)
        .execute(&self.pool)
        .await
        .context("failed to persist interaction event")?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_audit(&self, audit: &AuditEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_events (id, event_id, status, message, processed_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(audit.id)
        .bind(audit.event_id)
        .bind(match audit.status {
            crate::models::AuditStatus::Published => "published",
            crate::models::AuditStatus::Pending => "pending",
        })
        .bind(&audit.message)
        .bind(audit.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_since(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM interaction_events \
             WHERE user_id = $1 AND server_timestamp >= $2 \
             ORDER BY server_timestamp ASC",
        )
        .bind(user_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn recent_events(
        &self,
        user_id: &str,
        event_type: Option<EventType>,
        limit: usize,
    ) -> Result<Vec<InteractionEvent>> {
        let rows = match event_type {
            Some(event_type) => {
                sqlx::query(
                    "SELECT * FROM interaction_events \
                     WHERE user_id = $1 AND event_type = $2 \
                     ORDER BY server_timestamp DESC LIMIT $3",
                )
                .bind(user_id)
                .bind(event_type.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM interaction_events \
                     WHERE user_id = $1 \
                     ORDER BY server_timestamp DESC LIMIT $2",
                )
                .bind(user_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(Self::row_to_event).collect()
    }
}

#[async_trait]
impl FeatureStore for PostgresStore {
    async fn get(&self, user_id: &str) -> Result<Option<StoredFeatures>> {
        let row = sqlx::query(
            "SELECT features, version, updated_at FROM user_features WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let features: serde_json::Value = row.try_get("features")?;
                Ok(Some(StoredFeatures {
                    features: serde_json::from_value(features)?,
                    version: row.try_get("version")?,
                    updated_at: row.try_get("updated_at")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, user_id: &str, features: &UserFeatures) -> Result<()> {
        let doc = serde_json::to_value(features)?;
        sqlx::query(
            "INSERT INTO user_features (user_id, features, version, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id) DO UPDATE \
             SET features = $2, version = $3, updated_at = $4",
        )
        .bind(user_id)
        .bind(&doc)
        .bind(&features.version)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to upsert user features")?;
        Ok(())
    }

    async fn all_ratings(&self) -> Result<Vec<RatingRow>> {
        let rows = sqlx::query("SELECT user_id, features FROM user_features")
            .fetch_all(&self.pool)
            .await?;

        let mut ratings = Vec::new();
        for row in &rows {
            let user_id: String = row.try_get("user_id")?;
            let doc: serde_json::Value = row.try_get("features")?;
            let features: UserFeatures = serde_json::from_value(doc)?;
            for (movie_id, rating) in features.ratings {
                ratings.push(RatingRow {
                    user_id: user_id.clone(),
                    movie_id,
                    rating,
                });
            }
        }
        Ok(ratings)
    }
}

#[async_trait]
impl FeedbackStore for PostgresStore {
    async fn insert_feedback(&self, feedback: &FeedbackRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO model_feedback \
             (id, user_id, model_version, impression_list, clicked_item_id, watch_time_sec, \
              context, feedback_timestamp, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(feedback.id)
        .bind(&feedback.user_id)
        .bind(&feedback.model_version)
        .bind(serde_json::to_value(&feedback.impression_list)?)
        .bind(&feedback.clicked_item_id)
        .bind(feedback.watch_time_sec.map(|v| v as i64))
        .bind(&feedback.context)
        .bind(feedback.feedback_timestamp)
        .bind(feedback.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============== In-memory (tests and local development) ==============

#[derive(Default)]
pub struct InMemoryStore {
    events: RwLock<Vec<InteractionEvent>>,
    request_ids: DashMap<Uuid, ()>,
    audits: RwLock<Vec<AuditEvent>>,
    features: DashMap<String, StoredFeatures>,
    feedback: RwLock<Vec<FeedbackRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    pub fn audit_count(&self) -> usize {
        self.audits.read().len()
    }

    pub fn feedback_count(&self) -> usize {
        self.feedback.read().len()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(&self, event: &InteractionEvent) -> Result<bool> {
        use dashmap::mapref::entry::Entry;
        match self.request_ids.entry(event.request_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                self.events.write().push(event.clone());
                Ok(true)
            }
        }
    }

    async fn insert_audit(&self, audit: &AuditEvent) -> Result<()> {
        self.audits.write().push(audit.clone());
        Ok(())
    }

    async fn events_since(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        let mut events: Vec<InteractionEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| e.user_id == user_id && e.server_timestamp >= cutoff)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.server_timestamp);
        Ok(events)
    }

    async fn recent_events(
        &self,
        user_id: &str,
        event_type: Option<EventType>,
        limit: usize,
    ) -> Result<Vec<InteractionEvent>> {
        let mut events: Vec<InteractionEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| {
                e.user_id == user_id && event_type.map_or(true, |t| e.event_type == t)
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| std::cmp::Reverse(e.server_timestamp));
        events.truncate(limit);
        Ok(events)
    }
}

#[async_trait]
impl FeatureStore for InMemoryStore {
    async fn get(&self, user_id: &str) -> Result<Option<StoredFeatures>> {
        Ok(self.features.get(user_id).map(|entry| entry.clone()))
    }

    async fn upsert(&self, user_id: &str, features: &UserFeatures) -> Result<()> {
        self.features.insert(
            user_id.to_string(),
            StoredFeatures {
                features: features.clone(),
                version: features.version.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn all_ratings(&self) -> Result<Vec<RatingRow>> {
        let mut ratings = Vec::new();
        for entry in self.features.iter() {
            for (movie_id, &rating) in &entry.value().features.ratings {
                ratings.push(RatingRow {
                    user_id: entry.key().clone(),
                    movie_id: movie_id.clone(),
                    rating,
                });
            }
        }
        Ok(ratings)
    }
}

#[async_trait]
impl FeedbackStore for InMemoryStore {
    async fn insert_feedback(&self, feedback: &FeedbackRecord) -> Result<()> {
        self.feedback.write().push(feedback.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(request_id: Uuid, user: &str) -> InteractionEvent {
        InteractionEvent::new(
            request_id,
            user.to_string(),
            Some("m1".to_string()),
            EventType::Watch,
            serde_json::json!({}),
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_rejected_once() {
        let store = InMemoryStore::new();
        let request_id = Uuid::new_v4();

        assert!(store.insert_event(&event(request_id, "u1")).await.unwrap());
        assert!(!store.insert_event(&event(request_id, "u1")).await.unwrap());
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_all_ratings_flattens_every_user() {
        let store = InMemoryStore::new();
        let mut features = UserFeatures::default();
        features.ratings.insert("m1".to_string(), 4.0);
        features.ratings.insert("m2".to_string(), 3.5);
        store.upsert("u1", &features).await.unwrap();

        let mut other = UserFeatures::default();
        other.ratings.insert("m1".to_string(), 2.0);
        store.upsert("u2", &other).await.unwrap();

        let rows = store.all_ratings().await.unwrap();
        assert_eq!(rows.len(), 3);
    }
}
