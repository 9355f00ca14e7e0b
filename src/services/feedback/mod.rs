use crate::config::Config;
use crate::error::AppError;
use crate::models::FeedbackRecord;
use crate::services::kafka::EventPublisher;
use crate::services::store::FeedbackStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const HIGH_ENGAGEMENT_SECS: u64 = 600;
const MEDIUM_ENGAGEMENT_SECS: u64 = 180;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackSubmission {
    pub user_id: String,
    pub model_version: Option<String>,
    pub impression_list: Vec<String>,
    pub clicked_item_id: Option<String>,
    pub watch_time_sec: Option<u64>,
    pub context: Option<String>,
    pub feedback_timestamp: Option<DateTime<Utc>>,
}

/// Derived engagement metrics returned to the caller and attached to the
/// published feedback message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackMetrics {
    pub impression_count: usize,
    pub has_click: bool,
    pub has_watch: bool,
    /// 1-based position of the clicked item within the impression list.
    pub click_position: Option<usize>,
    pub engagement: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackAck {
    pub feedback_id: Uuid,
    pub metrics: FeedbackMetrics,
    pub recorded_at: DateTime<Utc>,
}

/// Records user feedback on served recommendation lists for offline model
/// evaluation.
pub struct FeedbackService {
    store: Arc<dyn FeedbackStore>,
    publisher: Option<Arc<EventPublisher>>,
    config: Arc<Config>,
}

impl FeedbackService {
    pub fn new(
        store: Arc<dyn FeedbackStore>,
        publisher: Option<Arc<EventPublisher>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub async fn submit(&self, submission: FeedbackSubmission) -> Result<FeedbackAck, AppError> {
        if submission.user_id.trim().is_empty() {
            return Err(AppError::Validation("userId must not be empty".to_string()));
        }
        if submission.impression_list.is_empty() {
            return Err(AppError::Validation(
                "impressionList must not be empty".to_string(),
            ));
        }

        let metrics = compute_metrics(&submission);
        let now = Utc::now();
        let record = FeedbackRecord {
            id: Uuid::new_v4(),
            user_id: submission.user_id,
            model_version: submission
                .model_version
                .unwrap_or_else(|| self.config.model.version.clone()),
            impression_list: submission.impression_list,
            clicked_item_id: submission.clicked_item_id,
            watch_time_sec: submission.watch_time_sec,
            context: submission.context,
            feedback_timestamp: submission.feedback_timestamp.unwrap_or(now),
            created_at: now,
        };

        self.store
            .insert_feedback(&record)
            .await
            .map_err(AppError::Storage)?;

        if let Some(publisher) = &self.publisher {
            if self.config.kafka.enabled {
                publisher
                    .publish_feedback(
                        &record.user_id,
                        &json!({
                            "feedbackId": record.id,
                            "userId": record.user_id,
                            "modelVersion": record.model_version,
                            "clickedItemId": record.clicked_item_id,
                            "metrics": metrics,
                        }),
                    )
                    .await;
            }
        }

        info!("feedback {} recorded for user {}", record.id, record.user_id);
        Ok(FeedbackAck {
            feedback_id: record.id,
            metrics,
            recorded_at: now,
        })
    }
}

fn compute_metrics(submission: &FeedbackSubmission) -> FeedbackMetrics {
    let click_position = submission.clicked_item_id.as_ref().and_then(|clicked| {
        submission
            .impression_list
            .iter()
            .position(|id| id == clicked)
            .map(|i| i + 1)
    });

    let engagement = submission.watch_time_sec.map(|secs| {
        if secs > HIGH_ENGAGEMENT_SECS {
            "high".to_string()
        } else if secs > MEDIUM_ENGAGEMENT_SECS {
            "medium".to_string()
        } else {
            "low".to_string()
        }
    });

    FeedbackMetrics {
        impression_count: submission.impression_list.len(),
        has_click: submission.clicked_item_id.is_some(),
        has_watch: submission.watch_time_sec.is_some(),
        click_position,
        engagement,
    }
}
