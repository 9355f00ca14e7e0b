pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::AppError;
pub use models::*;

use anyhow::Result;
use std::sync::Arc;

use services::cache::{Cache, RedisCache};
use services::catalog::{CatalogSource, HttpCatalog};
use services::events::EventService;
use services::features::FeatureService;
use services::feedback::FeedbackService;
use services::kafka::{EventPublisher, InteractionConsumer};
use services::recommendation::RecommendationEngine;
use services::store::PostgresStore;

/// Composition root. Every collaborator is wired here and handed to the
/// routing layer by handle; no module-level singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub features: Arc<FeatureService>,
    pub events: Arc<EventService>,
    pub engine: Arc<RecommendationEngine>,
    pub feedback: Arc<FeedbackService>,
    pub consumer: Option<Arc<InteractionConsumer>>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let store = Arc::new(
            PostgresStore::connect(&config.postgres.url, config.postgres.max_connections).await?,
        );

        let cache: Arc<dyn Cache> = Arc::new(RedisCache::new(&config.redis.url)?);

        let catalog: Arc<dyn CatalogSource> =
            Arc::new(HttpCatalog::new(&config.catalog.base_url));

        let (publisher, consumer) = if config.kafka.enabled {
            (
                Some(Arc::new(EventPublisher::new(&config)?)),
                Some(Arc::new(InteractionConsumer::new(&config)?)),
            )
        } else {
            (None, None)
        };

        let features = Arc::new(FeatureService::new(
            store.clone(),
            store.clone(),
            cache.clone(),
            config.clone(),
        ));

        let engine = Arc::new(RecommendationEngine::new(
            catalog,
            features.clone(),
            store.clone(),
            cache.clone(),
            config.clone(),
        ));

        let events = Arc::new(EventService::new(
            store.clone(),
            features.clone(),
            cache.clone(),
            publisher.clone(),
            engine.clone(),
            config.clone(),
        ));

        let feedback = Arc::new(FeedbackService::new(
            store.clone(),
            publisher.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            features,
            events,
            engine,
            feedback,
            consumer,
        })
    }
}

pub async fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
