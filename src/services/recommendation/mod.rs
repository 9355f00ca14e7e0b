use crate::algorithms::collaborative::CollaborativeModel;
use crate::algorithms::content::ContentModel;
use crate::config::Config;
use crate::error::AppError;
use crate::models::{
    ModelReloadResponse, MovieCatalogEntry, Recommendation, RecommendationResponse, UserFeatures,
};
use crate::services::cache::{recommendations_key, Cache};
use crate::services::catalog::CatalogSource;
use crate::services::features::FeatureService;
use crate::services::store::FeatureStore;
use crate::utils::validation;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CATALOG_CACHE_KEY: &str = "catalog:movies";

/// Content model built from one catalog fetch. Immutable once published.
struct ContentState {
    catalog: Vec<MovieCatalogEntry>,
    model: ContentModel,
    fetched_at: DateTime<Utc>,
}

/// Collaborative model built from one pass over the ratings corpus, tagged
/// with the feature data version it was built from.
struct CollabState {
    model: Option<CollaborativeModel>,
    data_version: u64,
}

#[derive(Serialize, Deserialize)]
struct PersistedModel {
    version: String,
}

/// Hybrid recommender over content similarity and collaborative latent
/// factors.
///
/// Models are immutable snapshots behind a lock and swapped whole, so
/// readers never observe a half-built model. At most one rebuild runs at a
/// time; a request that finds the build lock taken serves the previous
/// snapshot instead of waiting.
pub struct RecommendationEngine {
    catalog_source: Arc<dyn CatalogSource>,
    features: Arc<FeatureService>,
    feature_store: Arc<dyn FeatureStore>,
    cache: Arc<dyn Cache>,
    config: Arc<Config>,
    content_state: RwLock<Option<Arc<ContentState>>>,
    collab_state: RwLock<Option<Arc<CollabState>>>,
    build_lock: Mutex<()>,
    model_version: RwLock<String>,
    model_path: RwLock<String>,
    reload_count: AtomicU64,
}

impl RecommendationEngine {
    pub fn new(
        catalog_source: Arc<dyn CatalogSource>,
        features: Arc<FeatureService>,
        feature_store: Arc<dyn FeatureStore>,
        cache: Arc<dyn Cache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            catalog_source,
            features,
            feature_store,
            cache,
            model_version: RwLock::new(config.model.version.clone()),
            model_path: RwLock::new(config.model.path.clone()),
            config,
            content_state: RwLock::new(None),
            collab_state: RwLock::new(None),
            build_lock: Mutex::new(()),
            reload_count: AtomicU64::new(0),
        }
    }

    pub fn model_version(&self) -> String {
        self.model_version.read().clone()
    }

    /// Top-k recommendations for a user in a given context, served from
    /// cache when fresh.
    pub async fn recommend(
        &self,
        user_id: &str,
        count: usize,
        context: &str,
    ) -> Result<RecommendationResponse, AppError> {
        let count = validation::validate_count(count, self.config.recommendation.max_count)?;
        let cache_key = recommendations_key(user_id, context);

        if let Some(list) = self.cached_recommendations(&cache_key).await {
            debug!("recommendation cache hit for {} ({})", user_id, context);
            return Ok(self.response(user_id, context, list, count, true));
        }

        let (content, collab) = self.current_models().await;
        let features = self.features.load_or_default(user_id).await;

        let weight = self.config.recommendation.collaborative_weight;
        let user = user_id.to_string();
        let recommendations = tokio::task::spawn_blocking(move || {
            score_catalog(&content, collab.as_deref(), &user, &features, weight)
        })
        .await
        .map_err(|e| AppError::ModelBuild(format!("scoring task failed: {}", e)))?;

        let mut recommendations = recommendations;
        recommendations.truncate(self.config.recommendation.max_count);
        self.cache_recommendations(&cache_key, &recommendations).await;

        Ok(self.response(user_id, context, recommendations, count, false))
    }

    /// Precomputes and caches the default recommendation list for a user.
    /// Called from the detached post-event refresh task.
    pub async fn warm(&self, user_id: &str) -> Result<(), AppError> {
        self.recommend(user_id, self.config.recommendation.default_count, "home")
            .await?;
        Ok(())
    }

    /// Swaps in a fresh model without restarting: reads the persisted model
    /// tag when present, drops both snapshots, and lets the next request
    /// re-derive from the catalog and ratings corpus.
    pub async fn reload_model(
        &self,
        new_path: Option<String>,
    ) -> Result<ModelReloadResponse, AppError> {
        let _guard = self.build_lock.lock().await;

        if let Some(path) = new_path {
            *self.model_path.write() = path;
        }
        let path = self.model_path.read().clone();

        let new_version = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<PersistedModel>(&raw) {
                Ok(persisted) => persisted.version,
                Err(e) => {
                    warn!("model payload at {} is not parseable: {}", path, e);
                    self.bumped_version()
                }
            },
            Err(e) => {
                debug!("no model payload at {} ({}), re-deriving", path, e);
                self.bumped_version()
            }
        };

        let previous_version = {
            let mut version = self.model_version.write();
            std::mem::replace(&mut *version, new_version.clone())
        };

        *self.content_state.write() = None;
        *self.collab_state.write() = None;

        info!("model reloaded: {} -> {}", previous_version, new_version);
        Ok(ModelReloadResponse {
            previous_version,
            new_version,
            reloaded_at: Utc::now(),
        })
    }

    fn bumped_version(&self) -> String {
        let n = self.reload_count.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-r{}", self.config.model.version, n)
    }

    /// Returns current model snapshots, rebuilding stale ones first.
    ///
    /// The content model is stale once its catalog fetch falls outside the
    /// freshness window; the collaborative model is stale once any user's
    /// features changed after it was built.
    async fn current_models(&self) -> (Arc<ContentState>, Option<Arc<CollabState>>) {
        if let (Some(content), Some(collab)) = (self.fresh_content(), self.fresh_collab()) {
            return (content, Some(collab));
        }

        match self.build_lock.try_lock() {
            Ok(_guard) => self.rebuild_stale().await,
            Err(_) => {
                // A rebuild is in flight. Serve the previous snapshot when
                // one exists, otherwise wait for the first build.
                if let Some(content) = self.content_state.read().clone() {
                    let collab = self.collab_state.read().clone();
                    return (content, collab);
                }
                let _guard = self.build_lock.lock().await;
                self.rebuild_stale().await
            }
        }
    }

    fn fresh_content(&self) -> Option<Arc<ContentState>> {
        let state = self.content_state.read().clone()?;
        let ttl = Duration::seconds(self.config.catalog.ttl_seconds as i64);
        (state.fetched_at + ttl > Utc::now()).then_some(state)
    }

    fn fresh_collab(&self) -> Option<Arc<CollabState>> {
        let state = self.collab_state.read().clone()?;
        (state.data_version == self.features.data_version()).then_some(state)
    }

    /// Must hold `build_lock`.
    async fn rebuild_stale(&self) -> (Arc<ContentState>, Option<Arc<CollabState>>) {
        let content = match self.fresh_content() {
            Some(content) => content,
            None => {
                let catalog = self.fetch_catalog().await;
                let built = tokio::task::spawn_blocking(move || {
                    let model = ContentModel::build(&catalog);
                    (catalog, model)
                })
                .await;

                match built {
                    Ok((catalog, model)) => {
                        let state = Arc::new(ContentState {
                            catalog,
                            model,
                            fetched_at: Utc::now(),
                        });
                        *self.content_state.write() = Some(state.clone());
                        state
                    }
                    Err(e) => {
                        warn!("content model build task failed: {}", e);
                        let state = Arc::new(ContentState {
                            catalog: Vec::new(),
                            model: ContentModel::build(&[]),
                            fetched_at: Utc::now(),
                        });
                        *self.content_state.write() = Some(state.clone());
                        state
                    }
                }
            }
        };

        let collab = match self.fresh_collab() {
            Some(collab) => Some(collab),
            None => {
                // Read the version before the corpus so the snapshot is
                // never tagged newer than the data it was built from.
                let data_version = self.features.data_version();
                let model = match self.feature_store.all_ratings().await {
                    Ok(rows) => {
                        let max_k = self.config.recommendation.svd_components;
                        match tokio::task::spawn_blocking(move || {
                            CollaborativeModel::build_with_components(&rows, max_k)
                        })
                        .await
                        {
                            Ok(model) => model,
                            Err(e) => {
                                warn!("collaborative build task failed: {}", e);
                                None
                            }
                        }
                    }
                    Err(e) => {
                        warn!("ratings corpus unavailable, skipping collaborative model: {}", e);
                        None
                    }
                };

                let state = Arc::new(CollabState {
                    model,
                    data_version,
                });
                *self.collab_state.write() = Some(state.clone());
                Some(state)
            }
        };

        (content, collab)
    }

    /// Catalog fetch with a cache in front. Fetch failures degrade to an
    /// empty catalog so recommendation requests keep succeeding.
    async fn fetch_catalog(&self) -> Vec<MovieCatalogEntry> {
        match self.cache.get(CATALOG_CACHE_KEY).await {
            Ok(Some(bytes)) => {
                if let Ok(catalog) = serde_json::from_slice::<Vec<MovieCatalogEntry>>(&bytes) {
                    debug!("catalog cache hit ({} movies)", catalog.len());
                    return catalog;
                }
                warn!("dropping undecodable catalog cache entry");
            }
            Ok(None) => {}
            Err(e) => warn!("catalog cache read failed: {}", e),
        }

        let catalog = match self.catalog_source.list_movies().await {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!("catalog fetch failed, using empty catalog: {}", e);
                Vec::new()
            }
        };

        if !catalog.is_empty() {
            if let Ok(bytes) = serde_json::to_vec(&catalog) {
                if let Err(e) = self
                    .cache
                    .set_with_ttl(CATALOG_CACHE_KEY, bytes, self.config.catalog.ttl_seconds)
                    .await
                {
                    warn!("catalog cache write failed: {}", e);
                }
            }
        }
        catalog
    }

    async fn cached_recommendations(&self, key: &str) -> Option<Vec<Recommendation>> {
        match self.cache.get(key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("recommendation cache read failed: {}", e);
                None
            }
        }
    }

    async fn cache_recommendations(&self, key: &str, list: &[Recommendation]) {
        let Ok(bytes) = serde_json::to_vec(list) else {
            return;
        };
        if let Err(e) = self
            .cache
            .set_with_ttl(key, bytes, self.config.redis.cache_ttl_seconds)
            .await
        {
            warn!("recommendation cache write failed: {}", e);
        }
    }

    fn response(
        &self,
        user_id: &str,
        context: &str,
        mut list: Vec<Recommendation>,
        count: usize,
        cached: bool,
    ) -> RecommendationResponse {
        list.truncate(count);
        RecommendationResponse {
            user_id: user_id.to_string(),
            model_version: self.model_version(),
            cached,
            recommendations: list,
            generated_at: Utc::now(),
            context: context.to_string(),
        }
    }
}

/// Scores every catalog movie for one user. Pure CPU work.
///
/// Blend rule: `0.6*collab + 0.4*content` where the collaborative model has
/// a signal for the movie, content similarity alone otherwise. A movie with
/// no signal on either axis scores exactly 0 and ranks last. When neither
/// model can say anything about this user, ranking falls back to a
/// position-based heuristic over the catalog.
fn score_catalog(
    content: &ContentState,
    collab: Option<&CollabState>,
    user_id: &str,
    features: &UserFeatures,
    collaborative_weight: f64,
) -> Vec<Recommendation> {
    let profile = content.model.profile_vector(features);
    let content_scores = profile
        .as_ref()
        .map(|p| content.model.score(p))
        .unwrap_or_default();

    let collab_scores = collab
        .and_then(|state| state.model.as_ref())
        .filter(|model| model.knows_user(user_id))
        .map(|model| model.score_all(user_id))
        .unwrap_or_default();

    if content_scores.is_empty() && collab_scores.is_empty() {
        let pool: Vec<String> = content.catalog.iter().map(|m| m.id.clone()).collect();
        return fallback_rank(&pool, features);
    }

    let content_weight = 1.0 - collaborative_weight;
    let mut scored: Vec<Recommendation> = content
        .model
        .movie_ids()
        .iter()
        .map(|movie_id| {
            let content_score = content_scores.get(movie_id).copied();
            let collab_score = collab_scores.get(movie_id).copied();

            let (score, reasons) = match (collab_score, content_score) {
                (Some(k), Some(c)) => (
                    collaborative_weight * k + content_weight * c,
                    vec!["hybrid".to_string()],
                ),
                (Some(k), None) => (
                    collaborative_weight * k,
                    vec!["collaborative".to_string()],
                ),
                (None, Some(c)) => (c, vec!["content".to_string()]),
                (None, None) => (0.0, vec!["catalog".to_string()]),
            };
            Recommendation {
                movie_id: movie_id.clone(),
                // Truncated-SVD reconstruction can dip below zero; served
                // scores are floored at 0.
                score: score.max(0.0),
                reasons,
            }
        })
        .collect();

    // Stable sort keeps catalog insertion order on ties.
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Cold-start ranking over a fixed candidate pool. Position decides the base
/// score; favorites and highly rated movies get a boost; already watched
/// movies are skipped unless that would empty the pool.
fn fallback_rank(pool: &[String], features: &UserFeatures) -> Vec<Recommendation> {
    let mut candidates: Vec<&String> = pool
        .iter()
        .filter(|id| !features.watch_history.contains(id))
        .collect();
    if candidates.is_empty() {
        candidates = pool.iter().collect();
    }

    let pool_size = candidates.len();
    let mut scored: Vec<Recommendation> = candidates
        .into_iter()
        .enumerate()
        .map(|(rank, movie_id)| {
            let mut score = 1.0 - (rank as f64 / pool_size as f64) * 0.5;
            let mut reasons = vec!["popular".to_string()];

            let favorite = features.favorites.contains(movie_id);
            let high_rated = features.high_rated_movies.contains(movie_id);
            if favorite || high_rated {
                score = (score + 0.2).min(1.0);
                if favorite {
                    reasons.push("favorite".to_string());
                }
                if high_rated {
                    reasons.push("highly-rated".to_string());
                }
            }

            Recommendation {
                movie_id: movie_id.clone(),
                score,
                reasons,
            }
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MemoryCache;
    use crate::services::catalog::StaticCatalog;
    use crate::services::store::InMemoryStore;

    fn movie(id: &str, genres: &str, overview: &str) -> MovieCatalogEntry {
        MovieCatalogEntry {
            id: id.to_string(),
            title: id.to_string(),
            genres: genres.to_string(),
            overview: overview.to_string(),
        }
    }

    fn engine_with(
        catalog: Vec<MovieCatalogEntry>,
    ) -> (RecommendationEngine, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let config = Arc::new(Config::default());
        let features = Arc::new(FeatureService::new(
            store.clone(),
            store.clone(),
            cache.clone(),
            config.clone(),
        ));
        let engine = RecommendationEngine::new(
            Arc::new(StaticCatalog::new(catalog)),
            features,
            store.clone(),
            cache,
            config,
        );
        (engine, store)
    }

    fn sample_catalog() -> Vec<MovieCatalogEntry> {
        vec![
            movie("m1", "science fiction", "a crew drifts through deep space"),
            movie("m2", "science fiction", "astronauts explore a distant galaxy"),
            movie("m3", "romance", "two strangers meet in a rainy city"),
        ]
    }

    #[tokio::test]
    async fn test_rated_user_gets_content_driven_ranking() {
        let (engine, store) = engine_with(sample_catalog());

        let mut features = UserFeatures::default();
        features.ratings.insert("m1".to_string(), 4.5);
        features.rating_count = 1;
        features.avg_rating = 4.5;
        store.upsert("u1", &features).await.unwrap();

        let response = engine.recommend("u1", 5, "home").await.unwrap();
        assert!(!response.cached);
        assert!(response.recommendations.len() <= 5);
        assert!(!response.recommendations.is_empty());
        for item in &response.recommendations {
            assert!(!item.reasons.is_empty());
        }
        for pair in response.recommendations.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        // The profile is m1's own row, so m1 ranks first and the other
        // space movie beats the romance.
        assert_eq!(response.recommendations[0].movie_id, "m1");
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
    async fn test_second_request_is_served_from_cache() {
        let (engine, _) = engine_with(sample_catalog());

        let first = engine.recommend("u1", 3, "home").await.unwrap();
        assert!(!first.cached);

        let second = engine.recommend("u1", 3, "home").await.unwrap();
        assert!(second.cached);
        assert_eq!(
            first.recommendations.len(),
            second.recommendations.len()
        );

        // Different context misses the cache.
        let detail = engine.recommend("u1", 3, "detail").await.unwrap();
        assert!(!detail.cached);
    }

    #[tokio::test]
    async fn test_empty_catalog_yields_empty_list_not_error() {
        let (engine, _) = engine_with(Vec::new());
        let response = engine.recommend("u1", 10, "home").await.unwrap();
        assert!(response.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_boosts_favorites_and_skips_watched() {
        // Empty text corpus means no content signal for anyone.
        let catalog = vec![
            movie("m1", "", ""),
            movie("m2", "", ""),
            movie("m3", "", ""),
            movie("m4", "", ""),
        ];
        let (engine, store) = engine_with(catalog);

        let mut features = UserFeatures::default();
        features.watch_history.push("m1".to_string());
        features.favorites.push("m3".to_string());
        features.favorite_count = 1;
        store.upsert("u1", &features).await.unwrap();

        let response = engine.recommend("u1", 10, "home").await.unwrap();
        let ids: Vec<&str> = response
            .recommendations
            .iter()
            .map(|r| r.movie_id.as_str())
            .collect();

        assert!(!ids.contains(&"m1"));
        assert_eq!(ids[0], "m3");
        assert!(response.recommendations[0]
            .reasons
            .contains(&"favorite".to_string()));
        assert!(response.recommendations[0].score <= 1.0);
    }

    #[tokio::test]
    async fn test_collaborative_scores_are_floored_at_zero() {
        // No catalog text, so ranking rests entirely on the collaborative
        // model. The anti-correlated clusters make its raw predictions go
        // negative for cross-cluster movies.
        let catalog = vec![
            movie("m1", "", ""),
            movie("m2", "", ""),
            movie("m3", "", ""),
            movie("m4", "", ""),
        ];
        let (engine, store) = engine_with(catalog);

        let corpora: [(&str, &[(&str, f64)]); 4] = [
            ("u1", &[("m1", 5.0), ("m2", 5.0)]),
            ("u2", &[("m3", 5.0), ("m4", 5.0)]),
            ("u3", &[("m1", 5.0), ("m2", 5.0), ("m3", 0.5)]),
            ("u4", &[("m3", 5.0), ("m4", 5.0), ("m1", 0.5)]),
        ];
        for (user, ratings) in corpora {
            let mut features = UserFeatures::default();
            for (movie, rating) in ratings {
                features.ratings.insert(movie.to_string(), *rating);
            }
            features.rating_count = features.ratings.len() as u64;
            store.upsert(user, &features).await.unwrap();
        }

        let response = engine.recommend("u1", 4, "home").await.unwrap();
        assert_eq!(response.recommendations.len(), 4);
        for item in &response.recommendations {
            assert!(
                item.score >= 0.0,
                "{} scored {}",
                item.movie_id,
                item.score
            );
        }
        for pair in response.recommendations.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_invalid_count_is_rejected() {
        let (engine, _) = engine_with(sample_catalog());
        assert!(matches!(
            engine.recommend("u1", 0, "home").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            engine.recommend("u1", 1000, "home").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_model_bumps_version() {
        let (engine, _) = engine_with(sample_catalog());
        let before = engine.model_version();

        let response = engine
            .reload_model(Some("/nonexistent/model.json".to_string()))
            .await
            .unwrap();
        assert_eq!(response.previous_version, before);
        assert_ne!(response.new_version, before);
        assert_eq!(engine.model_version(), response.new_version);
    }

    #[test]
    fn test_fallback_position_scores_decrease() {
        let pool: Vec<String> = (0..4).map(|i| format!("m{}", i)).collect();
        let ranked = fallback_rank(&pool, &UserFeatures::default());

        assert_eq!(ranked.len(), 4);
        assert!((ranked[0].score - 1.0).abs() < 1e-9);
        assert!((ranked[1].score - 0.875).abs() < 1e-9);
        assert!((ranked[3].score - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_serves_watched_rather_than_nothing() {
        let pool = vec!["m1".to_string()];
        let mut features = UserFeatures::default();
        features.watch_history.push("m1".to_string());

        let ranked = fallback_rank(&pool, &features);
        assert_eq!(ranked.len(), 1);
    }
}
