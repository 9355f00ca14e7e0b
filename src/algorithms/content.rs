use crate::models::{MovieCatalogEntry, UserFeatures};
use ndarray::{Array1, Array2, Axis};
use std::collections::HashMap;
use tracing::warn;

/// TF-IDF vector space over the movie catalog.
///
/// Each document is the concatenation of a movie's genres and overview.
/// Rows of the document-term matrix are L2-normalized, so the cosine of a
/// document against itself is 1.0 and disjoint-vocabulary documents score 0.
pub struct ContentModel {
    vocab: HashMap<String, usize>,
    matrix: Array2<f64>,
    movie_ids: Vec<String>,
    movie_index: HashMap<String, usize>,
}

impl ContentModel {
    /// Builds the vectorizer over the catalog. Never fails: a degenerate
    /// corpus (all entries empty) yields an empty vocabulary and constant
    /// zero similarity downstream.
    pub fn build(catalog: &[MovieCatalogEntry]) -> Self {
        let docs: Vec<Vec<String>> = catalog
            .iter()
            .map(|m| super::tokenize(&format!("{} {}", m.genres, m.overview)))
            .collect();

        let mut vocab: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: Vec<usize> = Vec::new();
        for tokens in &docs {
            let mut seen: Vec<usize> = Vec::new();
            for token in tokens {
                let idx = match vocab.get(token) {
                    Some(&idx) => idx,
                    None => {
                        let idx = vocab.len();
                        vocab.insert(token.clone(), idx);
                        doc_freq.push(0);
                        idx
                    }
                };
                if !seen.contains(&idx) {
                    seen.push(idx);
                    doc_freq[idx] += 1;
                }
            }
        }

        if vocab.is_empty() && !catalog.is_empty() {
            warn!(
                "content corpus is degenerate ({} movies, empty vocabulary); \
                 content scores will be zero",
                catalog.len()
            );
        }

        let n_docs = catalog.len();
        let n_terms = vocab.len();
        let idf: Vec<f64> = doc_freq
            .iter()
            .map(|&df| (((1 + n_docs) as f64) / ((1 + df) as f64)).ln() + 1.0)
            .collect();

        let mut matrix = Array2::<f64>::zeros((n_docs, n_terms));
        for (row, tokens) in docs.iter().enumerate() {
            for token in tokens {
                let idx = vocab[token];
                matrix[(row, idx)] += 1.0;
            }
            // tf * idf, then L2-normalize the row
            let mut norm = 0.0;
            for idx in 0..n_terms {
                let v = matrix[(row, idx)] * idf[idx];
                matrix[(row, idx)] = v;
                norm += v * v;
            }
            let norm = norm.sqrt();
            if norm > 0.0 {
                for idx in 0..n_terms {
                    matrix[(row, idx)] /= norm;
                }
            }
        }

        let movie_ids: Vec<String> = catalog.iter().map(|m| m.id.clone()).collect();
        let movie_index = movie_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        Self {
            vocab,
            matrix,
            movie_ids,
            movie_index,
        }
    }

    pub fn movie_ids(&self) -> &[String] {
        &self.movie_ids
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn row(&self, movie_id: &str) -> Option<ndarray::ArrayView1<'_, f64>> {
        self.movie_index
            .get(movie_id)
            .map(|&i| self.matrix.index_axis(Axis(0), i))
    }

    /// Synthesizes the user taste vector from the feature document.
    ///
    /// Priority: rating-weighted average of rated movies' rows; else the most
    /// recently watched movie's row; else the element-wise max across
    /// favorited movies' rows. `None` when the user gives no content signal.
    pub fn profile_vector(&self, features: &UserFeatures) -> Option<Array1<f64>> {
        if self.vocab.is_empty() {
            return None;
        }

        let mut profile = Array1::<f64>::zeros(self.vocab.len());
        let mut total_weight = 0.0;
        for (movie_id, &rating) in &features.ratings {
            if let Some(row) = self.row(movie_id) {
                profile = profile + &row.mapv(|v| v * rating);
                total_weight += rating;
            }
        }
        if total_weight > 0.0 {
            return Some(profile.mapv(|v| v / total_weight));
        }

        for movie_id in features.watch_history.iter().rev() {
            if let Some(row) = self.row(movie_id) {
                return Some(row.to_owned());
            }
        }

        let mut max_profile: Option<Array1<f64>> = None;
        for movie_id in &features.favorites {
            if let Some(row) = self.row(movie_id) {
                max_profile = Some(match max_profile {
                    Some(acc) => ndarray::Zip::from(&acc)
                        .and(&row)
                        .map_collect(|&a, &b| a.max(b)),
                    None => row.to_owned(),
                });
            }
        }
        max_profile
    }

    /// Cosine similarity of the profile against every catalog row.
    pub fn score(&self, profile: &Array1<f64>) -> HashMap<String, f64> {
        let profile_norm = profile.dot(profile).sqrt();
        let mut scores = HashMap::with_capacity(self.movie_ids.len());
        for (i, movie_id) in self.movie_ids.iter().enumerate() {
            let row = self.matrix.index_axis(Axis(0), i);
            // rows are already unit-length
            let sim = if profile_norm > 0.0 {
                profile.dot(&row) / profile_norm
            } else {
                0.0
            };
            scores.insert(movie_id.clone(), sim);
        }
        scores
    }
}
