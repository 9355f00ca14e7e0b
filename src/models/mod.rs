use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Watch,
    Search,
    Rating,
    Favorite,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Watch => "watch",
            EventType::Search => "search",
            EventType::Rating => "rating",
            EventType::Favorite => "favorite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "watch" => Some(EventType::Watch),
            "search" => Some(EventType::Search),
            "rating" => Some(EventType::Rating),
            "favorite" => Some(EventType::Favorite),
            _ => None,
        }
    }
}

/// Immutable interaction fact. Persisted once per accepted request and
/// retained for audit and full feature recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEvent {
    pub id: Uuid,
    pub request_id: Uuid,
    pub user_id: String,
    pub movie_id: Option<String>,
    pub event_type: EventType,
    pub event_data: serde_json::Value,
    pub client_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: DateTime<Utc>,
}

impl InteractionEvent {
    pub fn new(
        request_id: Uuid,
        user_id: String,
        movie_id: Option<String>,
        event_type: EventType,
        event_data: serde_json::Value,
        client_timestamp: Option<DateTime<Utc>>,
        server_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            user_id,
            movie_id,
            event_type,
            event_data,
            client_timestamp,
            server_timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Published,
    Pending,
}

/// Audit trail entry recorded alongside every accepted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_id: Uuid,
    pub status: AuditStatus,
    pub message: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchEntry {
    pub query: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub results_count: u64,
}

/// Per-user aggregate profile derived from historical events.
///
/// Invariants maintained by the feature aggregator:
/// - `rating_count == ratings.len()`
/// - `avg_rating == mean(ratings.values())` whenever ratings are non-empty
/// - `favorite_count == favorites.len()` and `favorites` has set semantics
/// - `watch_history` holds at most the 100 most recent distinct movies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserFeatures {
    pub total_interactions: u64,
    pub watch_history: Vec<String>,
    pub watch_count: u64,
    pub total_watch_time: f64,
    pub avg_watch_duration: f64,
    pub search_history: Vec<SearchEntry>,
    pub search_count: u64,
    pub search_keywords: BTreeMap<String, u64>,
    pub ratings: BTreeMap<String, f64>,
    pub rating_count: u64,
    pub avg_rating: f64,
    pub high_rated_movies: Vec<String>,
    pub favorites: Vec<String>,
    pub favorite_count: u64,
    pub preferred_devices: BTreeMap<String, u64>,
    pub preferred_quality: BTreeMap<String, u64>,
    pub version: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Default for UserFeatures {
    fn default() -> Self {
        Self {
            total_interactions: 0,
            watch_history: Vec::new(),
            watch_count: 0,
            total_watch_time: 0.0,
            avg_watch_duration: 0.0,
            search_history: Vec::new(),
            search_count: 0,
            search_keywords: BTreeMap::new(),
            ratings: BTreeMap::new(),
            rating_count: 0,
            avg_rating: 0.0,
            high_rated_movies: Vec::new(),
            favorites: Vec::new(),
            favorite_count: 0,
            preferred_devices: BTreeMap::new(),
            preferred_quality: BTreeMap::new(),
            version: String::new(),
            created_at: None,
            last_activity_at: None,
        }
    }
}

/// Movie catalog entry as consumed from the external catalog service.
/// Read-only to this service; only used to build the content model corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieCatalogEntry {
    pub id: String,
    pub title: String,
    pub genres: String,
    pub overview: String,
}

/// One cell of the user x movie rating matrix, flattened from all users'
/// feature documents. Rebuilt from scratch for every collaborative build.
#[derive(Debug, Clone)]
pub struct RatingRow {
    pub user_id: String,
    pub movie_id: String,
    pub rating: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub movie_id: String,
    pub score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResponse {
    pub user_id: String,
    pub model_version: String,
    pub cached: bool,
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Accepted,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub request_id: Uuid,
    pub status: EventStatus,
    pub server_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFeaturesResponse {
    pub user_id: String,
    pub features: UserFeatures,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReloadResponse {
    pub previous_version: String,
    pub new_version: String,
    pub reloaded_at: DateTime<Utc>,
}

/// User feedback on a served recommendation list, kept for offline analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub user_id: String,
    pub model_version: String,
    pub impression_list: Vec<String>,
    pub clicked_item_id: Option<String>,
    pub watch_time_sec: Option<u64>,
    pub context: Option<String>,
    pub feedback_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
