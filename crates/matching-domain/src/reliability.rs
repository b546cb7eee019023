use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{MatchStore, ReviewWritten, StoreError};

pub const RATING_MIN: u8 = 1;
pub const RATING_MAX: u8 = 5;
pub const REVIEW_TEXT_MAX_CHARS: usize = 500;

const GOLD_MIN_COMPLETION_RATE: f64 = 95.0;
const GOLD_MIN_REVIEWS: u64 = 10;
const SILVER_MIN_COMPLETION_RATE: f64 = 90.0;
const SILVER_MIN_REVIEWS: u64 = 5;

/// Closed vocabulary of reviewable guide qualities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAttribute {
    Knowledgeable,
    Friendly,
    Punctual,
    GreatCommunication,
    Flexible,
    Safe,
}

impl ReviewAttribute {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Knowledgeable => "knowledgeable",
            Self::Friendly => "friendly",
            Self::Punctual => "punctual",
            Self::GreatCommunication => "great_communication",
            Self::Flexible => "flexible",
            Self::Safe => "safe",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "knowledgeable" => Some(Self::Knowledgeable),
            "friendly" => Some(Self::Friendly),
            "punctual" => Some(Self::Punctual),
            "great_communication" => Some(Self::GreatCommunication),
            "flexible" => Some(Self::Flexible),
            "safe" => Some(Self::Safe),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReliabilityBadge {
    Bronze,
    Silver,
    Gold,
}

impl ReliabilityBadge {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
        }
    }

    pub fn for_history(completion_rate: f64, review_count: u64) -> Self {
        if completion_rate >= GOLD_MIN_COMPLETION_RATE && review_count >= GOLD_MIN_REVIEWS {
            Self::Gold
        } else if completion_rate >= SILVER_MIN_COMPLETION_RATE
            && review_count >= SILVER_MIN_REVIEWS
        {
            Self::Silver
        } else {
            Self::Bronze
        }
    }
}

/// A tourist's review of a hosted trip. Immutable once created; at most one
/// per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: String,
    pub request_id: String,
    pub student_id: String,
    pub rating: u8,
    pub text: Option<String>,
    pub attributes: Vec<ReviewAttribute>,
    pub no_show: bool,
    pub price_paid_cents: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// The slice of a review that metrics are computed from.
#[derive(Debug, Clone, Copy)]
pub struct ReviewStats {
    pub rating: u8,
    pub no_show: bool,
}

/// Derived trust metrics for one guide, recomputed in full after every
/// review. Absent entirely (never zeroed) while the guide has no reviews.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentMetrics {
    pub student_id: String,
    pub average_rating: f64,
    pub completion_rate: f64,
    pub reliability_badge: ReliabilityBadge,
    pub trips_hosted: u64,
    pub no_show_count: u64,
    pub review_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl StudentMetrics {
    /// Full recompute from the guide's complete review history.
    ///
    /// O(n) per review, by choice: recomputing from scratch cannot drift the
    /// way incremental patches can, and per-guide review volume is small and
    /// bounded. Returns `None` for an empty history so an average of zero is
    /// never fabricated.
    pub fn from_history(
        student_id: &str,
        history: &[ReviewStats],
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if history.is_empty() {
            return None;
        }

        let review_count = history.len() as u64;
        let trips_hosted = history.iter().filter(|row| !row.no_show).count() as u64;
        let no_show_count = review_count - trips_hosted;
        let average_rating = history
            .iter()
            .map(|row| f64::from(row.rating))
            .sum::<f64>()
            / review_count as f64;
        let completion_rate = 100.0 * trips_hosted as f64 / review_count as f64;

        Some(Self {
            student_id: student_id.to_string(),
            average_rating,
            completion_rate,
            reliability_badge: ReliabilityBadge::for_history(completion_rate, review_count),
            trips_hosted,
            no_show_count,
            review_count,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CreateReviewInput {
    pub request_id: String,
    pub student_id: String,
    pub rating: u8,
    pub text: Option<String>,
    pub attributes: Vec<String>,
    pub no_show: bool,
    pub price_paid_cents: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("a review already exists for this request")]
    Conflict,
    #[error("request not found")]
    RequestNotFound,
    #[error(transparent)]
    Store(StoreError),
}

/// Validates and records reviews, keeping the guide's derived metrics in
/// lockstep: the store recomputes them in the same transaction as the
/// insert.
#[derive(Clone)]
pub struct ReliabilityScorer {
    store: Arc<dyn MatchStore>,
}

impl ReliabilityScorer {
    pub fn new(store: Arc<dyn MatchStore>) -> Self {
        Self { store }
    }

    pub async fn create_review(
        &self,
        input: CreateReviewInput,
    ) -> Result<ReviewWritten, ReviewError> {
        let request_id = non_empty(&input.request_id, "request_id")?;
        let student_id = non_empty(&input.student_id, "student_id")?;

        if !(RATING_MIN..=RATING_MAX).contains(&input.rating) {
            return Err(ReviewError::Validation {
                field: "rating",
                message: format!("rating must be between {RATING_MIN} and {RATING_MAX}"),
            });
        }

        let text = input
            .text
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);
        if let Some(text) = text.as_deref() {
            if text.chars().count() > REVIEW_TEXT_MAX_CHARS {
                return Err(ReviewError::Validation {
                    field: "text",
                    message: format!(
                        "review text may not be longer than {REVIEW_TEXT_MAX_CHARS} characters"
                    ),
                });
            }
        }

        let mut attributes = Vec::new();
        for raw in &input.attributes {
            let Some(attribute) = ReviewAttribute::parse(raw) else {
                return Err(ReviewError::Validation {
                    field: "attributes",
                    message: format!("unknown attribute '{}'", raw.trim()),
                });
            };
            if !attributes.contains(&attribute) {
                attributes.push(attribute);
            }
        }

        let review = ReviewRecord {
            id: format!("rev_{}", Uuid::new_v4().simple()),
            request_id,
            student_id,
            rating: input.rating,
            text,
            attributes,
            no_show: input.no_show,
            price_paid_cents: input.price_paid_cents,
            created_at: Utc::now(),
        };

        match self.store.record_review(review).await {
            Ok(written) => Ok(written),
            Err(StoreError::Conflict { .. }) => Err(ReviewError::Conflict),
            Err(StoreError::NotFound) => Err(ReviewError::RequestNotFound),
            Err(other) => Err(ReviewError::Store(other)),
        }
    }
}

fn non_empty(value: &str, field: &'static str) -> Result<String, ReviewError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ReviewError::Validation {
            field,
            message: format!("{field} is required"),
        });
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::store::{CreateRequestInput, JsonMatchStore};
    use crate::store::MatchStore as _;

    fn stats(ratings_and_no_shows: &[(u8, bool)]) -> Vec<ReviewStats> {
        ratings_and_no_shows
            .iter()
            .map(|(rating, no_show)| ReviewStats {
                rating: *rating,
                no_show: *no_show,
            })
            .collect()
    }

    fn review_input(request_id: &str, student_id: &str, rating: u8) -> CreateReviewInput {
        CreateReviewInput {
            request_id: request_id.to_string(),
            student_id: student_id.to_string(),
            rating,
            text: Some("Great weekend walking the old town.".to_string()),
            attributes: vec!["knowledgeable".to_string(), "friendly".to_string()],
            no_show: false,
            price_paid_cents: Some(4_500),
        }
    }

    async fn store_with_requests(request_count: usize) -> (JsonMatchStore, Vec<String>) {
        let store = JsonMatchStore::in_memory();
        let mut ids = Vec::new();
        for _ in 0..request_count {
            let request = store
                .create_request(CreateRequestInput {
                    city: "Sevilla".to_string(),
                    start_date: NaiveDate::from_ymd_opt(2026, 5, 2).expect("valid date"),
                    end_date: NaiveDate::from_ymd_opt(2026, 5, 4).expect("valid date"),
                })
                .await
                .expect("request");
            ids.push(request.id);
        }
        (store, ids)
    }

    #[test]
    fn metrics_for_an_empty_history_are_absent() {
        assert!(StudentMetrics::from_history("stu_a", &[], Utc::now()).is_none());
    }

    #[test]
    fn four_good_reviews_average_correctly_but_stay_bronze() {
        let history = stats(&[(5, false), (4, false), (3, false), (5, false)]);
        let metrics =
            StudentMetrics::from_history("stu_a", &history, Utc::now()).expect("metrics");

        assert!((metrics.average_rating - 4.25).abs() < f64::EPSILON);
        assert!((metrics.completion_rate - 100.0).abs() < f64::EPSILON);
        assert_eq!(metrics.trips_hosted, 4);
        assert_eq!(metrics.no_show_count, 0);
        assert_eq!(metrics.reliability_badge, ReliabilityBadge::Bronze);
    }

    #[test]
    fn ten_perfect_reviews_reach_gold() {
        let mut history = stats(&[(5, false), (4, false), (3, false), (5, false)]);
        history.extend(stats(&[(5, false); 6]));
        let metrics =
            StudentMetrics::from_history("stu_a", &history, Utc::now()).expect("metrics");

        assert_eq!(metrics.review_count, 10);
        assert!((metrics.completion_rate - 100.0).abs() < f64::EPSILON);
        assert_eq!(metrics.reliability_badge, ReliabilityBadge::Gold);
    }

    #[test]
    fn badge_tiers_follow_completion_rate_and_volume() {
        // 5 reviews, all hosted: silver volume, silver rate.
        assert_eq!(
            ReliabilityBadge::for_history(100.0, 5),
            ReliabilityBadge::Silver
        );
        // 9 completed of 10 -> 90%: silver even at gold volume.
        assert_eq!(
            ReliabilityBadge::for_history(90.0, 10),
            ReliabilityBadge::Silver
        );
        // One no-show in 10 keeps 90% but 95% gates gold.
        assert_eq!(
            ReliabilityBadge::for_history(95.0, 10),
            ReliabilityBadge::Gold
        );
        // High rate with thin history stays bronze.
        assert_eq!(
            ReliabilityBadge::for_history(100.0, 4),
            ReliabilityBadge::Bronze
        );
        assert_eq!(
            ReliabilityBadge::for_history(89.9, 20),
            ReliabilityBadge::Bronze
        );
    }

    #[test]
    fn no_shows_count_against_completion_and_hosting() {
        let history = stats(&[(5, false), (1, true), (4, false), (2, true)]);
        let metrics =
            StudentMetrics::from_history("stu_a", &history, Utc::now()).expect("metrics");

        assert_eq!(metrics.trips_hosted, 2);
        assert_eq!(metrics.no_show_count, 2);
        assert!((metrics.completion_rate - 50.0).abs() < f64::EPSILON);
        assert!((metrics.average_rating - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn create_review_recomputes_metrics_in_the_same_transaction() {
        let (store, request_ids) = store_with_requests(2).await;
        let store = Arc::new(store);
        let scorer = ReliabilityScorer::new(store.clone());

        let written = scorer
            .create_review(review_input(&request_ids[0], "stu_a", 5))
            .await
            .expect("review");
        assert_eq!(written.metrics.review_count, 1);
        assert!((written.metrics.average_rating - 5.0).abs() < f64::EPSILON);

        // The stored metrics match what the write returned.
        let stored = store
            .student_metrics("stu_a")
            .await
            .expect("metrics")
            .expect("metrics exist");
        assert_eq!(stored.review_count, 1);
        assert_eq!(stored.reliability_badge, ReliabilityBadge::Bronze);

        let written = scorer
            .create_review(review_input(&request_ids[1], "stu_a", 4))
            .await
            .expect("second review");
        assert_eq!(written.metrics.review_count, 2);
        assert!((written.metrics.average_rating - 4.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn a_second_review_for_the_same_request_conflicts() {
        let (store, request_ids) = store_with_requests(1).await;
        let scorer = ReliabilityScorer::new(Arc::new(store));

        scorer
            .create_review(review_input(&request_ids[0], "stu_a", 5))
            .await
            .expect("first review");

        for attempt in 0..2 {
            let result = scorer
                .create_review(review_input(&request_ids[0], "stu_a", 1))
                .await;
            assert!(
                matches!(result, Err(ReviewError::Conflict)),
                "attempt {attempt} must conflict",
            );
        }
    }

    #[tokio::test]
    async fn review_validation_rejects_out_of_bounds_input() {
        let (store, request_ids) = store_with_requests(1).await;
        let scorer = ReliabilityScorer::new(Arc::new(store));
        let request_id = &request_ids[0];

        for rating in [0u8, 6] {
            let result = scorer
                .create_review(review_input(request_id, "stu_a", rating))
                .await;
            assert!(matches!(
                result,
                Err(ReviewError::Validation { field: "rating", .. })
            ));
        }

        let mut long_text = review_input(request_id, "stu_a", 5);
        long_text.text = Some("x".repeat(REVIEW_TEXT_MAX_CHARS + 1));
        let result = scorer.create_review(long_text).await;
        assert!(matches!(
            result,
            Err(ReviewError::Validation { field: "text", .. })
        ));

        let mut bad_attribute = review_input(request_id, "stu_a", 5);
        bad_attribute.attributes = vec!["telepathic".to_string()];
        let result = scorer.create_review(bad_attribute).await;
        assert!(matches!(
            result,
            Err(ReviewError::Validation {
                field: "attributes",
                ..
            })
        ));

        let result = scorer
            .create_review(review_input("req_ghost", "stu_a", 5))
            .await;
        assert!(matches!(result, Err(ReviewError::RequestNotFound)));
    }

    #[tokio::test]
    async fn attributes_are_deduplicated_and_text_is_trimmed() {
        let (store, request_ids) = store_with_requests(1).await;
        let scorer = ReliabilityScorer::new(Arc::new(store));

        let mut input = review_input(&request_ids[0], "stu_a", 5);
        input.attributes = vec![
            "friendly".to_string(),
            " friendly ".to_string(),
            "safe".to_string(),
        ];
        input.text = Some("  lovely trip  ".to_string());

        let written = scorer.create_review(input).await.expect("review");
        assert_eq!(
            written.review.attributes,
            vec![ReviewAttribute::Friendly, ReviewAttribute::Safe]
        );
        assert_eq!(written.review.text.as_deref(), Some("lovely trip"));
    }
}
