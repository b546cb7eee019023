use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::reliability::{ReviewRecord, ReviewStats, StudentMetrics};
use crate::selection::{RequestStatus, SelectionRecord, SelectionStatus, TripRequest};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("{message}")]
    Conflict { message: String },
    /// Retryable: bounded timeouts and transient I/O. Callers retry with
    /// backoff; the core never retries internally, so a transient failure can
    /// never surface as a `LostRace` or duplicate a notification.
    #[error("storage is temporarily unavailable: {message}")]
    Unavailable { message: String },
    #[error("{message}")]
    Persistence { message: String },
}

#[derive(Debug, Clone)]
pub struct CreateRequestInput {
    pub city: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub enum DeclineOutcome {
    Declined(SelectionRecord),
    AlreadyResolved(SelectionRecord),
}

#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    /// The conditional transition succeeded: this selection is accepted, the
    /// request is matched, and every previously pending sibling is expired.
    Won {
        selection: SelectionRecord,
        request: TripRequest,
        expired_siblings: Vec<SelectionRecord>,
    },
    /// A sibling already holds the accept; this selection was expired if it
    /// was still pending.
    SiblingAccepted { selection: SelectionRecord },
    /// The selection itself was already terminal with no sibling winner.
    AlreadyResolved(SelectionRecord),
}

#[derive(Debug, Clone)]
pub struct ReviewWritten {
    pub review: ReviewRecord,
    pub metrics: StudentMetrics,
}

/// Transactional storage contract for the match core.
///
/// Every method is one transaction. The three conditional methods carry the
/// correctness of the whole system and MUST each execute as a single atomic
/// operation against storage:
///
/// - [`decline_if_pending`](Self::decline_if_pending)
/// - [`accept_if_unclaimed`](Self::accept_if_unclaimed) — enforces the global
///   invariant that at most one selection per request ever reaches
///   `accepted`. A SQL implementation would use a serializable transaction or
///   a partial unique index on `(request_id) WHERE status = 'accepted'` and
///   translate the constraint violation into `SiblingAccepted`; it must never
///   be approximated with read-then-write application code.
/// - [`record_review`](Self::record_review) — inserts the review and
///   recomputes the guide's metrics in the same transaction, so metrics are
///   never observably stale relative to a committed review.
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn create_request(&self, input: CreateRequestInput) -> Result<TripRequest, StoreError>;

    async fn find_request(&self, request_id: &str) -> Result<Option<TripRequest>, StoreError>;

    /// Inserts one pending selection per candidate while the request is open.
    ///
    /// Existing (request_id, student_id) pairs are skipped, not errors;
    /// only newly created selections are returned. Fails with `NotFound` for
    /// an unknown request and `Conflict` for a non-open one.
    async fn create_selections(
        &self,
        request_id: &str,
        student_ids: &[String],
    ) -> Result<Vec<SelectionRecord>, StoreError>;

    /// Looks up a selection by the full (selection, request, student) triple;
    /// any mismatch is `None`.
    async fn find_selection(
        &self,
        selection_id: &str,
        request_id: &str,
        student_id: &str,
    ) -> Result<Option<SelectionRecord>, StoreError>;

    async fn selections_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<SelectionRecord>, StoreError>;

    async fn decline_if_pending(
        &self,
        selection_id: &str,
    ) -> Result<DeclineOutcome, StoreError>;

    async fn accept_if_unclaimed(
        &self,
        selection_id: &str,
        request_id: &str,
    ) -> Result<AcceptOutcome, StoreError>;

    /// Fails with `Conflict` when the request already has a review (the 1:1
    /// uniqueness invariant) and `NotFound` for an unknown request.
    async fn record_review(&self, review: ReviewRecord) -> Result<ReviewWritten, StoreError>;

    async fn student_metrics(
        &self,
        student_id: &str,
    ) -> Result<Option<StudentMetrics>, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MatchStoreState {
    requests: HashMap<String, TripRequest>,
    selections: HashMap<String, SelectionRecord>,
    /// Keyed by request_id: the map key IS the 1:1 review invariant.
    reviews: HashMap<String, ReviewRecord>,
    student_metrics: HashMap<String, StudentMetrics>,
}

/// Reference [`MatchStore`]: in-memory state behind a single `RwLock`,
/// optionally persisted to a JSON file after every mutation.
///
/// All mutations run inside [`mutate`](Self::mutate), a single-writer
/// critical section, which is what makes the conditional transitions
/// linearizable here without any help from the callers.
#[derive(Clone)]
pub struct JsonMatchStore {
    state: Arc<RwLock<MatchStoreState>>,
    path: Option<PathBuf>,
}

impl JsonMatchStore {
    pub fn in_memory() -> Self {
        Self::at_path(None)
    }

    pub fn at_path(path: Option<PathBuf>) -> Self {
        let state = Self::load_state(path.as_ref());
        Self {
            state: Arc::new(RwLock::new(state)),
            path,
        }
    }

    fn load_state(path: Option<&PathBuf>) -> MatchStoreState {
        let Some(path) = path else {
            return MatchStoreState::default();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return MatchStoreState::default();
            }
            Err(error) => {
                tracing::warn!(
                    target: "tripmatch.match_store",
                    path = %path.display(),
                    error = %error,
                    "failed to read match store; booting with empty state",
                );
                return MatchStoreState::default();
            }
        };

        match serde_json::from_str::<MatchStoreState>(&raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(
                    target: "tripmatch.match_store",
                    path = %path.display(),
                    error = %error,
                    "failed to parse match store; booting with empty state",
                );
                MatchStoreState::default()
            }
        }
    }

    async fn persist_state(&self, snapshot: &MatchStoreState) -> Result<(), StoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| StoreError::Unavailable {
                    message: format!("failed to prepare match store directory: {error}"),
                })?;
        }

        let payload = serde_json::to_vec(snapshot).map_err(|error| StoreError::Persistence {
            message: format!("failed to encode match store payload: {error}"),
        })?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| StoreError::Unavailable {
                message: format!("failed to write match store payload: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|error| StoreError::Unavailable {
                message: format!("failed to finalize match store payload: {error}"),
            })?;

        Ok(())
    }

    async fn mutate<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut MatchStoreState) -> Result<T, StoreError>,
    {
        let (result, snapshot) = {
            let mut state = self.state.write().await;
            let result = operation(&mut state)?;
            (result, state.clone())
        };

        self.persist_state(&snapshot).await?;
        Ok(result)
    }
}

#[async_trait]
impl MatchStore for JsonMatchStore {
    async fn create_request(&self, input: CreateRequestInput) -> Result<TripRequest, StoreError> {
        self.mutate(|state| {
            let request = TripRequest::new(input.city, input.start_date, input.end_date, Utc::now());
            state.requests.insert(request.id.clone(), request.clone());
            Ok(request)
        })
        .await
    }

    async fn find_request(&self, request_id: &str) -> Result<Option<TripRequest>, StoreError> {
        let state = self.state.read().await;
        Ok(state.requests.get(request_id).cloned())
    }

    async fn create_selections(
        &self,
        request_id: &str,
        student_ids: &[String],
    ) -> Result<Vec<SelectionRecord>, StoreError> {
        let request_id = request_id.to_string();
        let student_ids = student_ids.to_vec();
        self.mutate(move |state| {
            let request = state.requests.get(&request_id).ok_or(StoreError::NotFound)?;
            if request.status != RequestStatus::Open {
                return Err(StoreError::Conflict {
                    message: format!(
                        "request {request_id} is {}, not open",
                        request.status.as_str()
                    ),
                });
            }

            let now = Utc::now();
            let mut created = Vec::new();
            for student_id in &student_ids {
                let exists = state.selections.values().any(|selection| {
                    selection.request_id == request_id && selection.student_id == *student_id
                });
                if exists {
                    continue;
                }
                let record = SelectionRecord::new(request_id.clone(), student_id.clone(), now);
                state.selections.insert(record.id.clone(), record.clone());
                created.push(record);
            }
            Ok(created)
        })
        .await
    }

    async fn find_selection(
        &self,
        selection_id: &str,
        request_id: &str,
        student_id: &str,
    ) -> Result<Option<SelectionRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .selections
            .get(selection_id)
            .filter(|selection| {
                selection.request_id == request_id && selection.student_id == student_id
            })
            .cloned())
    }

    async fn selections_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<SelectionRecord>, StoreError> {
        let state = self.state.read().await;
        let mut rows: Vec<SelectionRecord> = state
            .selections
            .values()
            .filter(|selection| selection.request_id == request_id)
            .cloned()
            .collect();
        rows.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(rows)
    }

    async fn decline_if_pending(
        &self,
        selection_id: &str,
    ) -> Result<DeclineOutcome, StoreError> {
        let selection_id = selection_id.to_string();
        self.mutate(move |state| {
            let selection = state
                .selections
                .get_mut(&selection_id)
                .ok_or(StoreError::NotFound)?;

            if selection.status != SelectionStatus::Pending {
                return Ok(DeclineOutcome::AlreadyResolved(selection.clone()));
            }

            let now = Utc::now();
            selection.status = SelectionStatus::Declined;
            selection.responded_at = Some(now);
            selection.updated_at = now;
            Ok(DeclineOutcome::Declined(selection.clone()))
        })
        .await
    }

    async fn accept_if_unclaimed(
        &self,
        selection_id: &str,
        request_id: &str,
    ) -> Result<AcceptOutcome, StoreError> {
        let selection_id = selection_id.to_string();
        let request_id = request_id.to_string();
        self.mutate(move |state| {
            let selection = state
                .selections
                .get(&selection_id)
                .filter(|selection| selection.request_id == request_id)
                .cloned()
                .ok_or(StoreError::NotFound)?;

            if selection.status == SelectionStatus::Accepted {
                return Ok(AcceptOutcome::AlreadyResolved(selection));
            }

            let now = Utc::now();
            let sibling_accepted = state.selections.values().any(|sibling| {
                sibling.request_id == request_id
                    && sibling.id != selection_id
                    && sibling.status == SelectionStatus::Accepted
            });
            if sibling_accepted {
                if selection.status == SelectionStatus::Pending {
                    let loser = state
                        .selections
                        .get_mut(&selection_id)
                        .ok_or(StoreError::NotFound)?;
                    loser.status = SelectionStatus::Expired;
                    loser.responded_at = Some(now);
                    loser.updated_at = now;
                    return Ok(AcceptOutcome::SiblingAccepted {
                        selection: loser.clone(),
                    });
                }
                return Ok(AcceptOutcome::SiblingAccepted { selection });
            }

            if selection.status != SelectionStatus::Pending {
                return Ok(AcceptOutcome::AlreadyResolved(selection));
            }

            // Conditional transition: still pending, no sibling winner. The
            // whole block runs inside one write-locked mutate, so the
            // accepted flip, the sibling expiry, and the request transition
            // commit together or not at all.
            let winner = state
                .selections
                .get_mut(&selection_id)
                .ok_or(StoreError::NotFound)?;
            winner.status = SelectionStatus::Accepted;
            winner.responded_at = Some(now);
            winner.updated_at = now;
            let winner = winner.clone();

            let mut expired_siblings = Vec::new();
            for sibling in state.selections.values_mut() {
                if sibling.request_id == request_id
                    && sibling.id != winner.id
                    && sibling.status == SelectionStatus::Pending
                {
                    sibling.status = SelectionStatus::Expired;
                    sibling.updated_at = now;
                    expired_siblings.push(sibling.clone());
                }
            }
            expired_siblings.sort_by(|left, right| left.id.cmp(&right.id));

            let request = state
                .requests
                .get_mut(&request_id)
                .ok_or(StoreError::NotFound)?;
            request.status = RequestStatus::Matched;
            request.updated_at = now;

            Ok(AcceptOutcome::Won {
                selection: winner,
                request: request.clone(),
                expired_siblings,
            })
        })
        .await
    }

    async fn record_review(&self, review: ReviewRecord) -> Result<ReviewWritten, StoreError> {
        self.mutate(move |state| {
            if !state.requests.contains_key(&review.request_id) {
                return Err(StoreError::NotFound);
            }
            if state.reviews.contains_key(&review.request_id) {
                return Err(StoreError::Conflict {
                    message: format!("request {} already has a review", review.request_id),
                });
            }

            state
                .reviews
                .insert(review.request_id.clone(), review.clone());

            // Full recompute from the complete history, inside the same
            // critical section as the insert.
            let history: Vec<ReviewStats> = state
                .reviews
                .values()
                .filter(|row| row.student_id == review.student_id)
                .map(|row| ReviewStats {
                    rating: row.rating,
                    no_show: row.no_show,
                })
                .collect();
            let Some(metrics) =
                StudentMetrics::from_history(&review.student_id, &history, Utc::now())
            else {
                return Err(StoreError::Persistence {
                    message: format!(
                        "review history for {} vanished mid-transaction",
                        review.student_id
                    ),
                });
            };
            state
                .student_metrics
                .insert(review.student_id.clone(), metrics.clone());

            Ok(ReviewWritten { review, metrics })
        })
        .await
    }

    async fn student_metrics(
        &self,
        student_id: &str,
    ) -> Result<Option<StudentMetrics>, StoreError> {
        let state = self.state.read().await;
        Ok(state.student_metrics.get(student_id).cloned())
    }
}
