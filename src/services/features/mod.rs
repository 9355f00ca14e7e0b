use crate::config::Config;
use crate::models::{EventType, InteractionEvent, SearchEntry, UserFeatures};
use crate::services::cache::{feature_key, recommendations_prefix, Cache};
use crate::services::store::{EventStore, FeatureStore, StoredFeatures};
use anyhow::Result;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const WATCH_HISTORY_LIMIT: usize = 100;
const SEARCH_HISTORY_LIMIT: usize = 50;
const SEARCH_KEYWORD_LIMIT: usize = 50;
const HIGH_RATED_LIMIT: usize = 50;
const HIGH_RATING_THRESHOLD: f64 = 4.0;

/// Applies one interaction event to a feature document. Pure transformation,
/// no I/O. Ratings overwrite rather than accumulate.
pub fn apply_event(features: &mut UserFeatures, event: &InteractionEvent, model_version: &str) {
    match event.event_type {
        EventType::Watch => apply_watch(features, event),
        EventType::Search => apply_search(features, event),
        EventType::Rating => apply_rating(features, event),
        EventType::Favorite => apply_favorite(features, event),
    }

    features.total_interactions += 1;
    features.last_activity_at = Some(event.server_timestamp);
    features.version = model_version.to_string();
    if features.created_at.is_none() {
        features.created_at = Some(event.server_timestamp);
    }
}

fn apply_watch(features: &mut UserFeatures, event: &InteractionEvent) {
    if let Some(movie_id) = &event.movie_id {
        if !features.watch_history.contains(movie_id) {
            features.watch_history.push(movie_id.clone());
            trim_to_last(&mut features.watch_history, WATCH_HISTORY_LIMIT);
        }
    }

    features.watch_count += 1;

    let duration = event
        .event_data
        .get("watchDuration")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    if duration > 0.0 {
        features.total_watch_time += duration;
        features.avg_watch_duration = features.total_watch_time / features.watch_count as f64;
    }

    for (key, counter) in [
        ("device", &mut features.preferred_devices),
        ("quality", &mut features.preferred_quality),
    ] {
        if let Some(value) = event.event_data.get(key).and_then(|v| v.as_str()) {
            *counter.entry(value.to_string()).or_insert(0) += 1;
        }
    }
}

fn apply_search(features: &mut UserFeatures, event: &InteractionEvent) {
    let query = event
        .event_data
        .get("query")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    features.search_history.push(SearchEntry {
        query: query.to_string(),
        // Entries always carry a time; event server time stands in when the
        // client did not send one.
        timestamp: Some(event.client_timestamp.unwrap_or(event.server_timestamp)),
        results_count: event
            .event_data
            .get("resultsCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    });
    trim_to_last(&mut features.search_history, SEARCH_HISTORY_LIMIT);
    features.search_count += 1;

    for token in query.split_whitespace() {
        let token = token.to_lowercase();
        if token.chars().count() <= 2 {
            continue;
        }
        *features.search_keywords.entry(token).or_insert(0) += 1;
    }

    // Keep the top keywords by frequency. Alphabetical order breaks ties,
    // which keeps repeated replays deterministic.
    if features.search_keywords.len() > SEARCH_KEYWORD_LIMIT {
        let mut entries: Vec<(String, u64)> = features
            .search_keywords
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(SEARCH_KEYWORD_LIMIT);
        features.search_keywords = entries.into_iter().collect();
    }
}

fn apply_rating(features: &mut UserFeatures, event: &InteractionEvent) {
    let Some(movie_id) = &event.movie_id else {
        return;
    };
    let Some(rating) = event.event_data.get("rating").and_then(|v| v.as_f64()) else {
        return;
    };

    features.ratings.insert(movie_id.clone(), rating);
    features.rating_count = features.ratings.len() as u64;
    features.avg_rating =
        features.ratings.values().sum::<f64>() / features.ratings.len() as f64;

    if rating >= HIGH_RATING_THRESHOLD {
        if !features.high_rated_movies.contains(movie_id) {
            features.high_rated_movies.push(movie_id.clone());
            trim_to_last(&mut features.high_rated_movies, HIGH_RATED_LIMIT);
        }
    } else {
        features.high_rated_movies.retain(|m| m != movie_id);
    }
}

fn apply_favorite(features: &mut UserFeatures, event: &InteractionEvent) {
    let Some(movie_id) = &event.movie_id else {
        return;
    };
    let action = event
        .event_data
        .get("action")
        .and_then(|v| v.as_str())
        .unwrap_or("add");

    match action {
        "add" => {
            if !features.favorites.contains(movie_id) {
                features.favorites.push(movie_id.clone());
            }
        }
        "remove" => features.favorites.retain(|m| m != movie_id),
        _ => {}
    }
    features.favorite_count = features.favorites.len() as u64;
}

fn trim_to_last<T>(list: &mut Vec<T>, limit: usize) {
    if list.len() > limit {
        list.drain(..list.len() - limit);
    }
}

/// Read/write access to per-user feature documents: cache read-through,
/// store write-through, recommendation-cache invalidation on change.
pub struct FeatureService {
    feature_store: Arc<dyn FeatureStore>,
    event_store: Arc<dyn EventStore>,
    cache: Arc<dyn Cache>,
    config: Arc<Config>,
    data_version: AtomicU64,
}

impl FeatureService {
    pub fn new(
        feature_store: Arc<dyn FeatureStore>,
        event_store: Arc<dyn EventStore>,
        cache: Arc<dyn Cache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            feature_store,
            event_store,
            cache,
            config,
            data_version: AtomicU64::new(0),
        }
    }

    /// Monotonic counter bumped on every feature mutation. The recommendation
    /// engine compares it against its last collaborative build to decide
    /// whether the ratings corpus is stale.
    pub fn data_version(&self) -> u64 {
        self.data_version.load(Ordering::Acquire)
    }

    fn bump_data_version(&self) {
        self.data_version.fetch_add(1, Ordering::Release);
    }

    /// Stored features, or `None` for an unknown user. Cache failures fall
    /// back to the store.
    pub async fn get(&self, user_id: &str) -> Result<Option<StoredFeatures>> {
        let key = feature_key(user_id);
        match self.cache.get(&key).await {
            Ok(Some(bytes)) => {
                if let Ok(features) = serde_json::from_slice::<UserFeatures>(&bytes) {
                    debug!("feature cache hit for {}", user_id);
                    return Ok(Some(StoredFeatures {
                        version: features.version.clone(),
                        updated_at: features.last_activity_at.unwrap_or_else(Utc::now),
                        features,
                    }));
                }
                warn!("dropping undecodable feature cache entry for {}", user_id);
            }
            Ok(None) => {}
            Err(e) => warn!("feature cache read failed for {}: {}", user_id, e),
        }

        let stored = self.feature_store.get(user_id).await?;
        if let Some(stored) = &stored {
            self.cache_features(user_id, &stored.features).await;
        }
        Ok(stored)
    }

    /// Current features or all-zero defaults. Store read failures degrade to
    /// defaults so the event path stays available.
    pub async fn load_or_default(&self, user_id: &str) -> UserFeatures {
        match self.get(user_id).await {
            Ok(Some(stored)) => stored.features,
            Ok(None) => UserFeatures::default(),
            Err(e) => {
                warn!(
                    "feature load failed for {}, using defaults: {}",
                    user_id, e
                );
                UserFeatures::default()
            }
        }
    }

    /// Applies one event and persists the result. The store write is fatal
    /// to the request; cache writes are best effort.
    pub async fn apply_and_persist(&self, event: &InteractionEvent) -> Result<UserFeatures> {
        let mut features = self.load_or_default(&event.user_id).await;
        apply_event(&mut features, event, &self.config.model.version);

        self.feature_store.upsert(&event.user_id, &features).await?;
        self.cache_features(&event.user_id, &features).await;
        self.invalidate_recommendations(&event.user_id).await;
        self.bump_data_version();

        Ok(features)
    }

    /// Recomputes a user's features from scratch by replaying the persisted
    /// event log within the window, oldest first.
    pub async fn refresh(&self, user_id: &str, days_back: i64) -> Result<UserFeatures> {
        let cutoff = Utc::now() - Duration::days(days_back);
        let events = self.event_store.events_since(user_id, cutoff).await?;

        let mut features = UserFeatures::default();
        for event in &events {
            apply_event(&mut features, event, &self.config.model.version);
        }

        self.feature_store.upsert(user_id, &features).await?;
        self.cache_features(user_id, &features).await;
        self.invalidate_recommendations(user_id).await;
        self.bump_data_version();

        debug!(
            "recomputed features for {} from {} events",
            user_id,
            events.len()
        );
        Ok(features)
    }

    async fn cache_features(&self, user_id: &str, features: &UserFeatures) {
        let Ok(bytes) = serde_json::to_vec(features) else {
            return;
        };
        if let Err(e) = self
            .cache
            .set_with_ttl(
                &feature_key(user_id),
                bytes,
                self.config.redis.feature_ttl_seconds,
            )
            .await
        {
            warn!("feature cache write failed for {}: {}", user_id, e);
        }
    }

    async fn invalidate_recommendations(&self, user_id: &str) {
        if let Err(e) = self
            .cache
            .delete_by_prefix(&recommendations_prefix(user_id))
            .await
        {
            warn!(
                "recommendation cache invalidation failed for {}: {}",
                user_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MemoryCache;
    use crate::services::store::InMemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    fn event(event_type: EventType, movie_id: Option<&str>, data: serde_json::Value) -> InteractionEvent {
        InteractionEvent::new(
            Uuid::new_v4(),
            "u1".to_string(),
            movie_id.map(String::from),
            event_type,
            data,
            None,
            Utc::now(),
        )
    }

    #[test]
    fn test_watch_updates_history_and_duration() {
        let mut features = UserFeatures::default();
        apply_event(
            &mut features,
            &event(
                EventType::Watch,
                Some("m1"),
                json!({"watchDuration": 3600.0, "device": "tv", "quality": "hd"}),
            ),
            "v1.0.0",
        );

        assert_eq!(features.watch_history, vec!["m1"]);
        assert_eq!(features.watch_count, 1);
        assert_eq!(features.total_watch_time, 3600.0);
        assert_eq!(features.avg_watch_duration, 3600.0);
        assert_eq!(features.preferred_devices.get("tv"), Some(&1));
        assert_eq!(features.preferred_quality.get("hd"), Some(&1));
        assert_eq!(features.total_interactions, 1);
        assert!(features.last_activity_at.is_some());
    }

    #[test]
    fn test_watch_history_is_bounded_and_deduplicated() {
        let mut features = UserFeatures::default();
        for i in 0..150 {
            let movie = format!("m{}", i);
            apply_event(
                &mut features,
                &event(EventType::Watch, Some(&movie), json!({})),
                "v1.0.0",
            );
        }
        // Rewatch should not duplicate.
        apply_event(
            &mut features,
            &event(EventType::Watch, Some("m149"), json!({})),
            "v1.0.0",
        );

        assert_eq!(features.watch_history.len(), 100);
        assert_eq!(features.watch_history[0], "m50");
        assert_eq!(features.watch_history[99], "m149");
        assert_eq!(features.watch_count, 151);
    }

    #[test]
    fn test_search_tokenizes_and_bounds_keywords() {
        let mut features = UserFeatures::default();
        apply_event(
            &mut features,
            &event(
                EventType::Search,
                None,
                json!({"query": "The Space Odyssey in 4k", "resultsCount": 12}),
            ),
            "v1.0.0",
        );

        // Tokens of length <= 2 are dropped.
        assert!(features.search_keywords.contains_key("the"));
        assert!(features.search_keywords.contains_key("space"));
        assert!(features.search_keywords.contains_key("odyssey"));
        assert!(!features.search_keywords.contains_key("in"));
        assert!(!features.search_keywords.contains_key("4k"));
        assert_eq!(features.search_history.len(), 1);
        assert_eq!(features.search_history[0].results_count, 12);
        // The test event carries no client timestamp; the entry still gets
        // stamped with the event's server time.
        assert!(features.search_history[0].timestamp.is_some());

        for i in 0..80 {
            let query = format!("keyword{:03}", i);
            apply_event(
                &mut features,
                &event(EventType::Search, None, json!({"query": query})),
                "v1.0.0",
            );
        }
        assert!(features.search_keywords.len() <= 50);
        assert_eq!(features.search_history.len(), 50);
    }

    #[test]
    fn test_rating_overwrites_and_maintains_invariants() {
        let mut features = UserFeatures::default();
        apply_event(
            &mut features,
            &event(EventType::Rating, Some("m1"), json!({"rating": 4.5})),
            "v1.0.0",
        );
        apply_event(
            &mut features,
            &event(EventType::Rating, Some("m2"), json!({"rating": 3.0})),
            "v1.0.0",
        );
        assert_eq!(features.ratings.get("m1"), Some(&4.5));
        assert_eq!(features.rating_count, 2);
        assert!((features.avg_rating - 3.75).abs() < 1e-9);
        assert_eq!(features.high_rated_movies, vec!["m1"]);

        // Re-rating the same movie overwrites, never accumulates.
        apply_event(
            &mut features,
            &event(EventType::Rating, Some("m1"), json!({"rating": 2.0})),
            "v1.0.0",
        );
        assert_eq!(features.ratings.get("m1"), Some(&2.0));
        assert_eq!(features.rating_count, 2);
        assert!((features.avg_rating - 2.5).abs() < 1e-9);
        assert!(features.high_rated_movies.is_empty());
    }

    #[test]
    fn test_favorites_have_set_semantics() {
        let mut features = UserFeatures::default();
        let add = event(EventType::Favorite, Some("m1"), json!({"action": "add"}));
        apply_event(&mut features, &add, "v1.0.0");
        apply_event(&mut features, &add, "v1.0.0");
        assert_eq!(features.favorites, vec!["m1"]);
        assert_eq!(features.favorite_count, 1);

        apply_event(
            &mut features,
            &event(EventType::Favorite, Some("m2"), json!({"action": "remove"})),
            "v1.0.0",
        );
        assert_eq!(features.favorite_count, 1);

        apply_event(
            &mut features,
            &event(EventType::Favorite, Some("m1"), json!({"action": "remove"})),
            "v1.0.0",
        );
        assert!(features.favorites.is_empty());
        assert_eq!(features.favorite_count, 0);
    }

    fn service() -> FeatureService {
        let store = Arc::new(InMemoryStore::new());
        FeatureService::new(
            store.clone(),
            store,
            Arc::new(MemoryCache::new()),
            Arc::new(Config::default()),
        )
    }

    #[tokio::test]
    async fn test_apply_and_persist_round_trip() {
        let service = service();
        let before = service.data_version();

        service
            .apply_and_persist(&event(
                EventType::Watch,
                Some("m1"),
                json!({"watchDuration": 120.0}),
            ))
            .await
            .unwrap();

        let stored = service.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.features.watch_history, vec!["m1"]);
        assert!(service.data_version() > before);
    }

    #[tokio::test]
    async fn test_refresh_replays_event_log() {
        let store = Arc::new(InMemoryStore::new());
        let service = FeatureService::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryCache::new()),
            Arc::new(Config::default()),
        );

        for (movie, rating) in [("m1", 4.5), ("m2", 2.0), ("m1", 3.0)] {
            let e = event(EventType::Rating, Some(movie), json!({"rating": rating}));
            store.insert_event(&e).await.unwrap();
        }

        let features = service.refresh("u1", 30).await.unwrap();
        assert_eq!(features.ratings.get("m1"), Some(&3.0));
        assert_eq!(features.rating_count, 2);
        assert!(features.high_rated_movies.is_empty());
        assert_eq!(features.total_interactions, 3);
    }
}
