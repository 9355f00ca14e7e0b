use cinerec::services::cache::MemoryCache;
use cinerec::services::catalog::StaticCatalog;
use cinerec::services::events::{EventService, EventSubmission};
use cinerec::services::features::FeatureService;
use cinerec::services::recommendation::RecommendationEngine;
use cinerec::services::store::InMemoryStore;
use cinerec::{Config, EventStatus, MovieCatalogEntry};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

struct TestStack {
    store: Arc<InMemoryStore>,
    features: Arc<FeatureService>,
    engine: Arc<RecommendationEngine>,
    events: Arc<EventService>,
}

fn stack(catalog: Vec<MovieCatalogEntry>) -> TestStack {
    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let config = Arc::new(Config::default());

    let features = Arc::new(FeatureService::new(
        store.clone(),
        store.clone(),
        cache.clone(),
        config.clone(),
    ));
    let engine = Arc::new(RecommendationEngine::new(
        Arc::new(StaticCatalog::new(catalog)),
        features.clone(),
        store.clone(),
        cache.clone(),
        config.clone(),
    ));
    let events = Arc::new(EventService::new(
        store.clone(),
        features.clone(),
        cache,
        None,
        engine.clone(),
        config,
    ));

    TestStack {
        store,
        features,
        engine,
        events,
    }
}

fn sample_catalog() -> Vec<MovieCatalogEntry> {
    vec![
        catalog_entry("m1", "science fiction", "a crew drifts through deep space"),
        catalog_entry("m2", "science fiction", "astronauts chart a distant galaxy"),
        catalog_entry("m3", "romance drama", "two strangers meet in a rainy city"),
        catalog_entry("m4", "crime thriller", "a heist crew plans one last job"),
    ]
}

fn catalog_entry(id: &str, genres: &str, overview: &str) -> MovieCatalogEntry {
    MovieCatalogEntry {
        id: id.to_string(),
        title: id.to_string(),
        genres: genres.to_string(),
        overview: overview.to_string(),
    }
}

fn submission(
    user_id: &str,
    event_type: &str,
    movie_id: Option<&str>,
    data: serde_json::Value,
) -> EventSubmission {
    EventSubmission {
        request_id: None,
        user_id: user_id.to_string(),
        movie_id: movie_id.map(String::from),
        event_type: event_type.to_string(),
        event_data: data,
        client_timestamp: None,
    }
}

#[tokio::test]
async fn test_watch_event_flows_into_features() {
    let stack = stack(sample_catalog());

    let response = stack
        .events
        .process_event(submission(
            "u1",
            "watch",
            Some("m1"),
            json!({"watchDuration": 3600.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status, EventStatus::Accepted);

    let stored = stack.features.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.features.watch_history, vec!["m1"]);
    assert_eq!(stored.features.total_watch_time, 3600.0);
    assert_eq!(stored.features.avg_watch_duration, 3600.0);
    assert_eq!(stored.features.total_interactions, 1);
}

#[tokio::test]
async fn test_rating_shapes_recommendations() {
    let stack = stack(sample_catalog());

    stack
        .events
        .process_event(submission(
            "u1",
            "rating",
            Some("m1"),
            json!({"rating": 4.5}),
        ))
        .await
        .unwrap();

    let response = stack.engine.recommend("u1", 5, "home").await.unwrap();
    assert!(response.recommendations.len() <= 5);
    assert!(!response.recommendations.is_empty());
    for item in &response.recommendations {
        assert!(!item.reasons.is_empty());
        assert!(item.score >= 0.0);
    }
    for pair in response.recommendations.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    // The rated space movie dominates the profile, so the other space movie
    // outranks the romance.
    let pos = |id: &str| {
        response
            .recommendations
            .iter()
            .position(|r| r.movie_id == id)
            .unwrap()
    };
    assert!(pos("m2") < pos("m3"));
}

#[tokio::test]
async fn test_empty_catalog_still_serves_recommendations() {
    let stack = stack(Vec::new());

    let response = stack.engine.recommend("u1", 10, "home").await.unwrap();
    assert!(response.recommendations.is_empty());
}

#[tokio::test]
async fn test_concurrent_duplicate_requests_persist_one_event() {
    let stack = stack(sample_catalog());
    let request_id = Uuid::new_v4();

    let make = |events: Arc<EventService>| {
        let mut s = submission("u1", "watch", Some("m1"), json!({}));
        s.request_id = Some(request_id);
        async move { events.process_event(s).await.unwrap() }
    };

    let (a, b) = tokio::join!(make(stack.events.clone()), make(stack.events.clone()));

    let accepted = [&a, &b]
        .iter()
        .filter(|r| r.status == EventStatus::Accepted)
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(stack.store.event_count(), 1);
}

#[tokio::test]
async fn test_new_event_invalidates_cached_recommendations() {
    let stack = stack(sample_catalog());

    stack
        .events
        .process_event(submission(
            "u1",
            "rating",
            Some("m1"),
            json!({"rating": 4.0}),
        ))
        .await
        .unwrap();

    let first = stack.engine.recommend("u1", 4, "home").await.unwrap();
    let second = stack.engine.recommend("u1", 4, "home").await.unwrap();
    assert!(second.cached || !first.cached);

    stack
        .events
        .process_event(submission(
            "u1",
            "rating",
            Some("m3"),
            json!({"rating": 5.0}),
        ))
        .await
        .unwrap();

    // The cached list for this user was dropped when features changed, so
    // the next request recomputes against the new profile.
    let third = stack.engine.recommend("u1", 4, "home").await.unwrap();
    assert!(!third.cached);
}

#[tokio::test]
async fn test_refresh_rebuilds_features_from_event_log() {
    let stack = stack(sample_catalog());

    for (event_type, movie, data) in [
        ("watch", Some("m1"), json!({"watchDuration": 1200.0})),
        ("rating", Some("m2"), json!({"rating": 4.5})),
        ("favorite", Some("m4"), json!({"action": "add"})),
        ("search", None, json!({"query": "space thriller"})),
    ] {
        stack
            .events
            .process_event(submission("u1", event_type, movie, data))
            .await
            .unwrap();
    }

    let replayed = stack.features.refresh("u1", 30).await.unwrap();
    assert_eq!(replayed.watch_history, vec!["m1"]);
    assert_eq!(replayed.ratings.get("m2"), Some(&4.5));
    assert_eq!(replayed.favorites, vec!["m4"]);
    assert_eq!(replayed.search_count, 1);
    assert_eq!(replayed.total_interactions, 4);

    let stored = stack.features.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.features.total_interactions, 4);
}

#[tokio::test]
async fn test_collaborative_signal_marks_hybrid_reasons() {
    let stack = stack(sample_catalog());

    // Two users with overlapping ratings give the SVD a 2x2 matrix to work
    // with, which is the minimum for a collaborative build.
    for (user, movie, rating) in [
        ("u1", "m1", 5.0),
        ("u1", "m2", 4.0),
        ("u2", "m1", 4.5),
        ("u2", "m3", 3.5),
    ] {
        stack
            .events
            .process_event(submission(
                user,
                "rating",
                Some(movie),
                json!({"rating": rating}),
            ))
            .await
            .unwrap();
    }

    let response = stack.engine.recommend("u1", 4, "home").await.unwrap();
    assert!(!response.recommendations.is_empty());
    assert!(response
        .recommendations
        .iter()
        .any(|r| r.reasons.contains(&"hybrid".to_string())));
}
