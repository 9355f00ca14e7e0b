use crate::error::AppError;
use crate::models::EventType;
use crate::services::events::EventSubmission;

pub const MIN_RATING: f64 = 0.5;
pub const MAX_RATING: f64 = 5.0;
pub const MAX_EVENT_HISTORY_LIMIT: usize = 100;
pub const MAX_REFRESH_DAYS: i64 = 365;

/// Boundary validation for an event submission. Malformed payloads are
/// rejected here and never reach the aggregator.
pub fn validate_submission(submission: &EventSubmission) -> Result<EventType, AppError> {
    if submission.user_id.trim().is_empty() {
        return Err(AppError::Validation("userId must not be empty".to_string()));
    }

    let event_type = EventType::parse(&submission.event_type).ok_or_else(|| {
        AppError::Validation(format!("unknown event type: {}", submission.event_type))
    })?;

    match event_type {
        EventType::Watch | EventType::Rating | EventType::Favorite => {
            if submission
                .movie_id
                .as_deref()
                .map_or(true, |id| id.trim().is_empty())
            {
                return Err(AppError::Validation(format!(
                    "{} events require movieId",
                    event_type.as_str()
                )));
            }
        }
        EventType::Search => {
            let query = submission
                .event_data
                .get("query")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if query.trim().is_empty() {
                return Err(AppError::Validation(
                    "search events require a non-empty query".to_string(),
                ));
            }
        }
    }

    if event_type == EventType::Rating {
        let rating = submission
            .event_data
            .get("rating")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| {
                AppError::Validation("rating events require a numeric rating".to_string())
            })?;
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(AppError::Validation(format!(
                "rating must be between {} and {}",
                MIN_RATING, MAX_RATING
            )));
        }
    }

    if event_type == EventType::Favorite {
        let action = submission
            .event_data
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("add");
        if action != "add" && action != "remove" {
            return Err(AppError::Validation(format!(
                "unknown favorite action: {}",
                action
            )));
        }
    }

    Ok(event_type)
}

pub fn validate_count(count: usize, max_count: usize) -> Result<usize, AppError> {
    if count == 0 || count > max_count {
        return Err(AppError::Validation(format!(
            "count must be between 1 and {}",
            max_count
        )));
    }
    Ok(count)
}

pub fn validate_history_limit(limit: usize) -> Result<usize, AppError> {
    if limit == 0 || limit > MAX_EVENT_HISTORY_LIMIT {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_EVENT_HISTORY_LIMIT
        )));
    }
    Ok(limit)
}

pub fn validate_days_back(days_back: i64) -> Result<i64, AppError> {
    if !(1..=MAX_REFRESH_DAYS).contains(&days_back) {
        return Err(AppError::Validation(format!(
            "daysBack must be between 1 and {}",
            MAX_REFRESH_DAYS
        )));
    }
    Ok(days_back)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission(event_type: &str, movie_id: Option<&str>, data: serde_json::Value) -> EventSubmission {
        EventSubmission {
            request_id: None,
            user_id: "u1".to_string(),
            movie_id: movie_id.map(String::from),
            event_type: event_type.to_string(),
            event_data: data,
            client_timestamp: None,
        }
    }

    #[test]
    fn test_accepts_well_formed_events() {
        assert!(validate_submission(&submission("watch", Some("m1"), json!({}))).is_ok());
        assert!(
            validate_submission(&submission("rating", Some("m1"), json!({"rating": 4.5}))).is_ok()
        );
        assert!(validate_submission(&submission(
            "favorite",
            Some("m1"),
            json!({"action": "remove"})
        ))
        .is_ok());
        assert!(
            validate_submission(&submission("search", None, json!({"query": "heist"}))).is_ok()
        );
    }

    #[test]
    fn test_rejects_out_of_range_rating() {
        for rating in [0.0, 0.4, 5.5] {
            let result =
                validate_submission(&submission("rating", Some("m1"), json!({"rating": rating})));
            assert!(matches!(result, Err(AppError::Validation(_))), "{}", rating);
        }
    }

    #[test]
    fn test_rejects_missing_movie_id() {
        let result = validate_submission(&submission("watch", None, json!({})));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_rejects_unknown_favorite_action() {
        let result =
            validate_submission(&submission("favorite", Some("m1"), json!({"action": "toggle"})));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_rejects_unknown_event_type_and_empty_user() {
        assert!(validate_submission(&submission("click", Some("m1"), json!({}))).is_err());

        let mut s = submission("watch", Some("m1"), json!({}));
        s.user_id = "  ".to_string();
        assert!(validate_submission(&s).is_err());
    }
}
