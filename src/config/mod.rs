use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub catalog: CatalogConfig,
    pub recommendation: RecommendationConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("invalid server host/port")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// TTL for cached recommendation lists.
    pub cache_ttl_seconds: u64,
    /// TTL for cached feature documents.
    pub feature_ttl_seconds: u64,
    /// TTL for idempotency markers.
    pub idempotency_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub enabled: bool,
    pub brokers: String,
    pub interaction_topic: String,
    pub features_topic: String,
    pub feedback_topic: String,
    pub dlq_topic: String,
    pub group_id: String,
    pub auto_offset_reset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub base_url: String,
    /// Freshness window for the locally cached catalog.
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    pub default_count: usize,
    pub max_count: usize,
    /// Blend weight applied to the collaborative score when present;
    /// the content score gets the remainder.
    pub collaborative_weight: f64,
    pub svd_components: usize,
    /// Apply feature updates on the event request path, before the request
    /// is acknowledged. Disable when a dedicated worker consumes the
    /// interaction topic instead.
    pub inline_feature_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: String,
    pub version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                workers: num_cpus::get(),
            },
            postgres: PostgresConfig {
                url: "postgresql://localhost:5432/cinerec".to_string(),
                max_connections: 10,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                cache_ttl_seconds: 3600,
                feature_ttl_seconds: 86400,
                idempotency_ttl_seconds: 86400,
            },
            kafka: KafkaConfig {
                enabled: true,
                brokers: "localhost:9092".to_string(),
                interaction_topic: "interaction_events".to_string(),
                features_topic: "processed_features".to_string(),
                feedback_topic: "model_feedback".to_string(),
                dlq_topic: "interaction_events_dlq".to_string(),
                group_id: "cinerec-consumers".to_string(),
                auto_offset_reset: "earliest".to_string(),
            },
            catalog: CatalogConfig {
                base_url: "http://localhost:8081".to_string(),
                ttl_seconds: 3600,
            },
            recommendation: RecommendationConfig {
                default_count: 20,
                max_count: 100,
                collaborative_weight: 0.6,
                svd_components: 20,
                inline_feature_update: true,
            },
            model: ModelConfig {
                path: "models/recommender.json".to_string(),
                version: "v1.0.0".to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CINEREC").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
