use crate::models::RatingRow;
use nalgebra::DMatrix;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Maximum number of latent factors kept from the factorization.
pub const MAX_COMPONENTS: usize = 20;

/// Low-rank factorization of the user x movie rating matrix.
///
/// The dense matrix (zero where unrated) is factorized with a truncated SVD;
/// predicted affinity is the dot product of a user's latent row with a
/// movie's latent column.
pub struct CollaborativeModel {
    user_index: HashMap<String, usize>,
    movie_ids: Vec<String>,
    movie_index: HashMap<String, usize>,
    /// users x k
    user_latent: DMatrix<f64>,
    /// k x movies
    components: DMatrix<f64>,
}

impl CollaborativeModel {
    /// Builds the model from the flattened ratings corpus, or returns `None`
    /// when the matrix is too small to factorize (fewer than 2 users or
    /// 2 movies) or the decomposition does not converge.
    pub fn build(rows: &[RatingRow]) -> Option<Self> {
        Self::build_with_components(rows, MAX_COMPONENTS)
    }

    pub fn build_with_components(rows: &[RatingRow], max_k: usize) -> Option<Self> {
        let users: BTreeSet<&str> = rows.iter().map(|r| r.user_id.as_str()).collect();
        let movies: BTreeSet<&str> = rows.iter().map(|r| r.movie_id.as_str()).collect();

        let n_users = users.len();
        let n_movies = movies.len();
        if n_users < 2 || n_movies < 2 {
            return None;
        }

        let user_ids: Vec<String> = users.into_iter().map(|s| s.to_string()).collect();
        let movie_ids: Vec<String> = movies.into_iter().map(|s| s.to_string()).collect();
        let user_index: HashMap<String, usize> = user_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let movie_index: HashMap<String, usize> = movie_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut matrix = DMatrix::<f64>::zeros(n_users, n_movies);
        for row in rows {
            let u = user_index[&row.user_id];
            let m = movie_index[&row.movie_id];
            matrix[(u, m)] = row.rating;
        }

        let k = max_k.min(n_users.min(n_movies) - 1).max(1);

        let svd = match matrix.try_svd(true, true, f64::EPSILON, 0) {
            Some(svd) => svd,
            None => {
                warn!("svd failed to converge on {}x{} rating matrix", n_users, n_movies);
                return None;
            }
        };
        let u = svd.u?;
        let v_t = svd.v_t?;
        let singular = svd.singular_values;

        // nalgebra does not guarantee ordering; select the k largest.
        let mut order: Vec<usize> = (0..singular.len()).collect();
        order.sort_by(|&a, &b| {
            singular[b]
                .partial_cmp(&singular[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(k);

        let mut user_latent = DMatrix::<f64>::zeros(n_users, k);
        let mut components = DMatrix::<f64>::zeros(k, n_movies);
        for (j, &src) in order.iter().enumerate() {
            let sigma = singular[src];
            for row in 0..n_users {
                user_latent[(row, j)] = u[(row, src)] * sigma;
            }
            for col in 0..n_movies {
                components[(j, col)] = v_t[(src, col)];
            }
        }

        Some(Self {
            user_index,
            movie_ids,
            movie_index,
            user_latent,
            components,
        })
    }

    pub fn num_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn knows_user(&self, user_id: &str) -> bool {
        self.user_index.contains_key(user_id)
    }

    /// Predicted affinity, 0.0 for unseen users or movies.
    pub fn predict(&self, user_id: &str, movie_id: &str) -> f64 {
        let (Some(&u), Some(&m)) = (self.user_index.get(user_id), self.movie_index.get(movie_id))
        else {
            return 0.0;
        };
        (0..self.num_components())
            .map(|j| self.user_latent[(u, j)] * self.components[(j, m)])
            .sum()
    }

    /// Predicted affinity for every known movie; empty for unseen users.
    pub fn score_all(&self, user_id: &str) -> HashMap<String, f64> {
        let Some(&u) = self.user_index.get(user_id) else {
            return HashMap::new();
        };
        let mut scores = HashMap::with_capacity(self.movie_ids.len());
        for (m, movie_id) in self.movie_ids.iter().enumerate() {
            let score: f64 = (0..self.num_components())
                .map(|j| self.user_latent[(u, j)] * self.components[(j, m)])
                .sum();
            scores.insert(movie_id.clone(), score);
        }
        scores
    }
}
