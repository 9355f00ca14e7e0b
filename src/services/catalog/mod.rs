use crate::models::MovieCatalogEntry;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

/// Container keys probed, in order, when the catalog response wraps its
/// movie list in an object instead of returning a bare array.
const CONTAINER_KEYS: &[&str] = &["movies", "data", "items", "results", "content"];

/// External movie-catalog collaborator. Read-only.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_movies(&self) -> Result<Vec<MovieCatalogEntry>>;
}

pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn list_movies(&self) -> Result<Vec<MovieCatalogEntry>> {
        let url = format!("{}/api/v1/movies", self.base_url);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body: Value = response.json().await?;

        let movies = decode_catalog(&body);
        info!("fetched {} movies from catalog", movies.len());
        Ok(movies)
    }
}

/// Fixed catalog, used in tests and as a seed source.
pub struct StaticCatalog {
    movies: Vec<MovieCatalogEntry>,
}

impl StaticCatalog {
    pub fn new(movies: Vec<MovieCatalogEntry>) -> Self {
        Self { movies }
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn list_movies(&self) -> Result<Vec<MovieCatalogEntry>> {
        Ok(self.movies.clone())
    }
}

/// Tolerant decode of a catalog response: accepts a bare array or an object
/// wrapping the array under one of the conventional keys. Malformed entries
/// are skipped; an unrecognized shape decodes to an empty catalog.
pub fn decode_catalog(body: &Value) -> Vec<MovieCatalogEntry> {
    let list = match body {
        Value::Array(list) => Some(list),
        Value::Object(map) => CONTAINER_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array)),
        _ => None,
    };

    let Some(list) = list else {
        warn!("unrecognized catalog response shape; treating as empty catalog");
        return Vec::new();
    };

    let mut movies = Vec::with_capacity(list.len());
    for entry in list {
        match decode_entry(entry) {
            Some(movie) => movies.push(movie),
            None => warn!("skipping malformed catalog entry"),
        }
    }
    movies
}

fn decode_entry(entry: &Value) -> Option<MovieCatalogEntry> {
    let obj = entry.as_object()?;

    let id = match obj.get("id")? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    let title = obj
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let genres = match obj.get("genres").or_else(|| obj.get("categories")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    };

    let overview = obj
        .get("overview")
        .or_else(|| obj.get("description"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(MovieCatalogEntry {
        id,
        title,
        genres,
        overview,
    })
}
