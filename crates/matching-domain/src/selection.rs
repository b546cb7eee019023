use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::notify::{EmailSender, OutcomeEmail};
use crate::store::{AcceptOutcome, DeclineOutcome, MatchStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Open,
    Matched,
    Closed,
}

impl RequestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Matched => "matched",
            Self::Closed => "closed",
        }
    }
}

/// Selection lifecycle. Every non-pending state is terminal.
///
/// ```text
/// pending --> accepted | declined | expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl SelectionStatus {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Expired => "expired",
        }
    }
}

/// What a guide's action link authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RespondAction {
    Accept,
    Decline,
}

impl RespondAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
        }
    }
}

/// A tourist's trip request. Owned by the intake flow; the arbiter only ever
/// writes its `matched` transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRequest {
    pub id: String,
    pub city: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TripRequest {
    pub fn new(
        city: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("req_{}", Uuid::new_v4().simple()),
            city: city.into(),
            start_date,
            end_date,
            status: RequestStatus::Open,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One guide's candidacy for one request. Unique per (request_id,
/// student_id); mutated only through [`SelectionArbiter::respond`], never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub id: String,
    pub request_id: String,
    pub student_id: String,
    pub status: SelectionStatus,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SelectionRecord {
    pub fn new(
        request_id: impl Into<String>,
        student_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("sel_{}", Uuid::new_v4().simple()),
            request_id: request_id.into(),
            student_id: student_id.into(),
            status: SelectionStatus::Pending,
            responded_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of a guide responding to their selection. These are ordinary
/// values, not errors: callers branch on them.
#[derive(Debug, Clone)]
pub enum RespondOutcome {
    /// This guide won the request; siblings were expired and the request
    /// marked matched in the same atomic step.
    Won {
        selection: SelectionRecord,
        request: TripRequest,
        expired_siblings: Vec<SelectionRecord>,
    },
    /// A sibling won first; this selection is now expired.
    LostRace { selection: SelectionRecord },
    Declined { selection: SelectionRecord },
    /// The selection was already terminal; double-clicks land here and
    /// mutate nothing.
    AlreadyResolved { selection: SelectionRecord },
}

impl RespondOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Won { .. } => "won",
            Self::LostRace { .. } => "lost_race",
            Self::Declined { .. } => "declined",
            Self::AlreadyResolved { .. } => "already_resolved",
        }
    }

    pub fn selection(&self) -> &SelectionRecord {
        match self {
            Self::Won { selection, .. }
            | Self::LostRace { selection }
            | Self::Declined { selection }
            | Self::AlreadyResolved { selection } => selection,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RespondError {
    /// The (selection, request, student) triple matched nothing. Externally
    /// indistinguishable from an invalid token by design.
    #[error("selection not found")]
    SelectionNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("request not found")]
    RequestNotFound,
    #[error("request is no longer open")]
    RequestClosed,
    #[error("at least one candidate is required")]
    NoCandidates,
    #[error(transparent)]
    Store(StoreError),
}

/// State machine and race arbitration for a request's candidate guides.
///
/// The arbiter itself holds no locks and no state: handlers are stateless and
/// may run on any number of server instances, so the at-most-one-winner
/// guarantee lives entirely in the store's atomic conditional transitions.
#[derive(Clone)]
pub struct SelectionArbiter {
    store: Arc<dyn MatchStore>,
    emails: Arc<dyn EmailSender>,
}

impl SelectionArbiter {
    pub fn new(store: Arc<dyn MatchStore>, emails: Arc<dyn EmailSender>) -> Self {
        Self { store, emails }
    }

    /// Invites candidate guides by creating one pending selection each.
    ///
    /// Idempotent fan-out: candidates already holding a selection for this
    /// request are skipped, and only newly created selections are returned,
    /// so repeated invites never re-notify anyone.
    pub async fn invite_candidates(
        &self,
        request_id: &str,
        student_ids: &[String],
    ) -> Result<Vec<SelectionRecord>, InviteError> {
        let mut candidates: Vec<String> = Vec::new();
        for raw in student_ids {
            let student_id = raw.trim();
            if student_id.is_empty() {
                continue;
            }
            if !candidates.iter().any(|existing| existing == student_id) {
                candidates.push(student_id.to_string());
            }
        }
        if candidates.is_empty() {
            return Err(InviteError::NoCandidates);
        }

        match self.store.create_selections(request_id, &candidates).await {
            Ok(created) => Ok(created),
            Err(StoreError::NotFound) => Err(InviteError::RequestNotFound),
            Err(StoreError::Conflict { .. }) => Err(InviteError::RequestClosed),
            Err(other) => Err(InviteError::Store(other)),
        }
    }

    /// Applies a guide's response to their selection.
    ///
    /// Accepts are arbitrated by a single conditional operation on the store;
    /// the arbiter never does check-then-act across two store calls, so any
    /// number of concurrent accepts for one request produce exactly one
    /// [`RespondOutcome::Won`].
    pub async fn respond(
        &self,
        selection_id: &str,
        request_id: &str,
        student_id: &str,
        action: RespondAction,
    ) -> Result<RespondOutcome, RespondError> {
        let Some(selection) = self
            .store
            .find_selection(selection_id, request_id, student_id)
            .await?
        else {
            return Err(RespondError::SelectionNotFound);
        };

        if selection.status.is_terminal() {
            return Ok(RespondOutcome::AlreadyResolved { selection });
        }

        match action {
            RespondAction::Decline => match self.store.decline_if_pending(selection_id).await? {
                DeclineOutcome::Declined(selection) => {
                    info!(
                        target: "tripmatch.matching",
                        request_id,
                        selection_id = %selection.id,
                        "selection declined",
                    );
                    Ok(RespondOutcome::Declined { selection })
                }
                DeclineOutcome::AlreadyResolved(selection) => {
                    Ok(RespondOutcome::AlreadyResolved { selection })
                }
            },
            RespondAction::Accept => {
                match self
                    .store
                    .accept_if_unclaimed(selection_id, request_id)
                    .await?
                {
                    AcceptOutcome::Won {
                        selection,
                        request,
                        expired_siblings,
                    } => {
                        info!(
                            target: "tripmatch.matching",
                            request_id = %request.id,
                            selection_id = %selection.id,
                            student_id = %selection.student_id,
                            expired_siblings = expired_siblings.len(),
                            "selection accepted; request matched",
                        );
                        self.fan_out_match_emails(&request, &selection, &expired_siblings)
                            .await;
                        Ok(RespondOutcome::Won {
                            selection,
                            request,
                            expired_siblings,
                        })
                    }
                    AcceptOutcome::SiblingAccepted { selection } => {
                        info!(
                            target: "tripmatch.matching",
                            request_id,
                            selection_id = %selection.id,
                            "accept lost the race to a sibling selection",
                        );
                        Ok(RespondOutcome::LostRace { selection })
                    }
                    AcceptOutcome::AlreadyResolved(selection) => {
                        Ok(RespondOutcome::AlreadyResolved { selection })
                    }
                }
            }
        }
    }

    /// Post-win fanout. Failures are logged and swallowed: the guide already
    /// won, and retrying delivery is the mailer's job, not the arbiter's.
    async fn fan_out_match_emails(
        &self,
        request: &TripRequest,
        winner: &SelectionRecord,
        expired_siblings: &[SelectionRecord],
    ) {
        let tourist_email = OutcomeEmail::TouristMatched {
            request_id: request.id.clone(),
            city: request.city.clone(),
            student_id: winner.student_id.clone(),
        };
        if let Err(error) = self.emails.send(tourist_email).await {
            warn!(
                target: "tripmatch.matching",
                request_id = %request.id,
                error = %error,
                "failed to send tourist-matched email",
            );
        }

        for sibling in expired_siblings {
            let filled_email = OutcomeEmail::GuideFilled {
                request_id: request.id.clone(),
                student_id: sibling.student_id.clone(),
            };
            if let Err(error) = self.emails.send(filled_email).await {
                warn!(
                    target: "tripmatch.matching",
                    request_id = %request.id,
                    student_id = %sibling.student_id,
                    error = %error,
                    "failed to send guide-filled email",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::notify::{EmailError, RecordingEmailSender};
    use crate::store::{CreateRequestInput, JsonMatchStore, MatchStore as _};

    fn request_input() -> CreateRequestInput {
        CreateRequestInput {
            city: "Lisbon".to_string(),
            start_date: NaiveDate::from_ymd_opt(2026, 6, 1).expect("valid date"),
            end_date: NaiveDate::from_ymd_opt(2026, 6, 4).expect("valid date"),
        }
    }

    fn students(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| (*id).to_string()).collect()
    }

    async fn arbiter_fixture() -> (SelectionArbiter, Arc<JsonMatchStore>, Arc<RecordingEmailSender>)
    {
        let store = Arc::new(JsonMatchStore::in_memory());
        let emails = Arc::new(RecordingEmailSender::new());
        let arbiter = SelectionArbiter::new(store.clone(), emails.clone());
        (arbiter, store, emails)
    }

    struct FailingEmailSender;

    #[async_trait]
    impl EmailSender for FailingEmailSender {
        async fn send(&self, _email: OutcomeEmail) -> Result<(), EmailError> {
            Err(EmailError::Delivery {
                message: "smtp unreachable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn invite_creates_one_pending_selection_per_candidate() {
        let (arbiter, store, _emails) = arbiter_fixture().await;
        let request = store.create_request(request_input()).await.expect("request");

        let created = arbiter
            .invite_candidates(&request.id, &students(&["stu_a", "stu_b", "stu_c"]))
            .await
            .expect("invite");

        assert_eq!(created.len(), 3);
        assert!(created.iter().all(|s| s.status == SelectionStatus::Pending));
        assert!(created.iter().all(|s| s.request_id == request.id));
    }

    #[tokio::test]
    async fn invite_is_idempotent_and_dedupes_candidates() {
        let (arbiter, store, _emails) = arbiter_fixture().await;
        let request = store.create_request(request_input()).await.expect("request");

        let first = arbiter
            .invite_candidates(&request.id, &students(&["stu_a", " stu_a ", "stu_b"]))
            .await
            .expect("invite");
        assert_eq!(first.len(), 2);

        let second = arbiter
            .invite_candidates(&request.id, &students(&["stu_a", "stu_b", "stu_c"]))
            .await
            .expect("re-invite");
        let second_ids: Vec<&str> = second.iter().map(|s| s.student_id.as_str()).collect();
        assert_eq!(second_ids, vec!["stu_c"]);
    }

    #[tokio::test]
    async fn invite_rejects_unknown_and_non_open_requests() {
        let (arbiter, store, _emails) = arbiter_fixture().await;

        let missing = arbiter
            .invite_candidates("req_missing", &students(&["stu_a"]))
            .await;
        assert!(matches!(missing, Err(InviteError::RequestNotFound)));

        let request = store.create_request(request_input()).await.expect("request");
        arbiter
            .invite_candidates(&request.id, &students(&["stu_a"]))
            .await
            .expect("invite");
        let selections = store
            .selections_for_request(&request.id)
            .await
            .expect("selections");
        arbiter
            .respond(
                &selections[0].id,
                &request.id,
                "stu_a",
                RespondAction::Accept,
            )
            .await
            .expect("accept");

        let closed = arbiter
            .invite_candidates(&request.id, &students(&["stu_b"]))
            .await;
        assert!(matches!(closed, Err(InviteError::RequestClosed)));

        let empty = arbiter.invite_candidates(&request.id, &students(&[" "])).await;
        assert!(matches!(empty, Err(InviteError::NoCandidates)));
    }

    #[tokio::test]
    async fn accept_wins_expires_siblings_and_marks_request_matched() {
        let (arbiter, store, emails) = arbiter_fixture().await;
        let request = store.create_request(request_input()).await.expect("request");
        arbiter
            .invite_candidates(&request.id, &students(&["stu_a", "stu_b", "stu_c"]))
            .await
            .expect("invite");
        let selections = store
            .selections_for_request(&request.id)
            .await
            .expect("selections");
        let winner = selections
            .iter()
            .find(|s| s.student_id == "stu_b")
            .expect("stu_b invited");

        let outcome = arbiter
            .respond(&winner.id, &request.id, "stu_b", RespondAction::Accept)
            .await
            .expect("respond");

        let RespondOutcome::Won {
            selection,
            request: matched,
            expired_siblings,
        } = outcome
        else {
            panic!("expected Won, got {}", outcome.as_str());
        };
        assert_eq!(selection.status, SelectionStatus::Accepted);
        assert_eq!(matched.status, RequestStatus::Matched);
        assert_eq!(expired_siblings.len(), 2);
        assert!(
            expired_siblings
                .iter()
                .all(|s| s.status == SelectionStatus::Expired)
        );

        let sent = emails.sent().await;
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent.iter().filter(|e| e.kind() == "tourist_matched").count(),
            1
        );
        assert_eq!(
            sent.iter().filter(|e| e.kind() == "guide_filled").count(),
            2
        );
    }

    #[tokio::test]
    async fn decline_resolves_the_selection_without_email() {
        let (arbiter, store, emails) = arbiter_fixture().await;
        let request = store.create_request(request_input()).await.expect("request");
        let created = arbiter
            .invite_candidates(&request.id, &students(&["stu_a"]))
            .await
            .expect("invite");

        let outcome = arbiter
            .respond(&created[0].id, &request.id, "stu_a", RespondAction::Decline)
            .await
            .expect("respond");

        assert!(matches!(outcome, RespondOutcome::Declined { .. }));
        assert_eq!(outcome.selection().status, SelectionStatus::Declined);
        assert!(outcome.selection().responded_at.is_some());
        assert!(emails.sent().await.is_empty());

        // The request stays open for the remaining candidates.
        let request = store
            .find_request(&request.id)
            .await
            .expect("find")
            .expect("request exists");
        assert_eq!(request.status, RequestStatus::Open);
    }

    #[tokio::test]
    async fn double_click_returns_already_resolved_without_mutation() {
        let (arbiter, store, emails) = arbiter_fixture().await;
        let request = store.create_request(request_input()).await.expect("request");
        let created = arbiter
            .invite_candidates(&request.id, &students(&["stu_a"]))
            .await
            .expect("invite");

        let first = arbiter
            .respond(&created[0].id, &request.id, "stu_a", RespondAction::Accept)
            .await
            .expect("first accept");
        assert!(matches!(first, RespondOutcome::Won { .. }));
        let resolved_at = first.selection().updated_at;

        for _ in 0..2 {
            let again = arbiter
                .respond(&created[0].id, &request.id, "stu_a", RespondAction::Accept)
                .await
                .expect("repeat accept");
            let RespondOutcome::AlreadyResolved { selection } = again else {
                panic!("expected AlreadyResolved, got {}", again.as_str());
            };
            assert_eq!(selection.status, SelectionStatus::Accepted);
            assert_eq!(selection.updated_at, resolved_at);
        }

        // Only the original win produced email traffic.
        assert_eq!(emails.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn late_accept_after_a_sibling_won_never_unseats_the_winner() {
        let (arbiter, store, _emails) = arbiter_fixture().await;
        let request = store.create_request(request_input()).await.expect("request");
        arbiter
            .invite_candidates(&request.id, &students(&["stu_a", "stu_b", "stu_c"]))
            .await
            .expect("invite");
        let selections = store
            .selections_for_request(&request.id)
            .await
            .expect("selections");
        let s1 = selections
            .iter()
            .find(|s| s.student_id == "stu_a")
            .expect("s1");
        let s2 = selections
            .iter()
            .find(|s| s.student_id == "stu_b")
            .expect("s2");

        let won = arbiter
            .respond(&s2.id, &request.id, "stu_b", RespondAction::Accept)
            .await
            .expect("winner");
        assert!(matches!(won, RespondOutcome::Won { .. }));

        let late = arbiter
            .respond(&s1.id, &request.id, "stu_a", RespondAction::Accept)
            .await
            .expect("late accept");
        assert!(matches!(
            late,
            RespondOutcome::AlreadyResolved { .. } | RespondOutcome::LostRace { .. }
        ));

        let selections = store
            .selections_for_request(&request.id)
            .await
            .expect("selections");
        let winner = selections.iter().find(|s| s.id == s2.id).expect("winner");
        assert_eq!(winner.status, SelectionStatus::Accepted);
    }

    #[tokio::test]
    async fn triple_mismatch_is_selection_not_found() {
        let (arbiter, store, _emails) = arbiter_fixture().await;
        let request = store.create_request(request_input()).await.expect("request");
        let created = arbiter
            .invite_candidates(&request.id, &students(&["stu_a"]))
            .await
            .expect("invite");

        // Right selection id, wrong student: a token replayed against the
        // wrong triple.
        let result = arbiter
            .respond(&created[0].id, &request.id, "stu_b", RespondAction::Accept)
            .await;
        assert!(matches!(result, Err(RespondError::SelectionNotFound)));

        let result = arbiter
            .respond("sel_forged", &request.id, "stu_a", RespondAction::Accept)
            .await;
        assert!(matches!(result, Err(RespondError::SelectionNotFound)));
    }

    #[tokio::test]
    async fn email_failures_never_fail_the_accept() {
        let store = Arc::new(JsonMatchStore::in_memory());
        let arbiter = SelectionArbiter::new(store.clone(), Arc::new(FailingEmailSender));
        let request = store.create_request(request_input()).await.expect("request");
        let created = arbiter
            .invite_candidates(&request.id, &students(&["stu_a", "stu_b"]))
            .await
            .expect("invite");

        let outcome = arbiter
            .respond(&created[0].id, &request.id, "stu_a", RespondAction::Accept)
            .await
            .expect("accept must survive email failure");
        assert!(matches!(outcome, RespondOutcome::Won { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_accepts_produce_exactly_one_winner() {
        let (arbiter, store, _emails) = arbiter_fixture().await;
        let request = store.create_request(request_input()).await.expect("request");
        let candidates: Vec<String> = (0..8).map(|n| format!("stu_{n}")).collect();
        arbiter
            .invite_candidates(&request.id, &candidates)
            .await
            .expect("invite");
        let selections = store
            .selections_for_request(&request.id)
            .await
            .expect("selections");

        let mut tasks = Vec::new();
        for selection in &selections {
            let arbiter = arbiter.clone();
            let selection_id = selection.id.clone();
            let request_id = selection.request_id.clone();
            let student_id = selection.student_id.clone();
            tasks.push(tokio::spawn(async move {
                arbiter
                    .respond(&selection_id, &request_id, &student_id, RespondAction::Accept)
                    .await
            }));
        }

        let mut won = 0usize;
        for task in tasks {
            let outcome = task.await.expect("task").expect("respond");
            match outcome {
                RespondOutcome::Won { .. } => won += 1,
                RespondOutcome::LostRace { .. } | RespondOutcome::AlreadyResolved { .. } => {}
                RespondOutcome::Declined { .. } => panic!("nobody declined"),
            }
        }
        assert_eq!(won, 1, "exactly one concurrent accept may win");

        let selections = store
            .selections_for_request(&request.id)
            .await
            .expect("selections");
        let accepted = selections
            .iter()
            .filter(|s| s.status == SelectionStatus::Accepted)
            .count();
        assert_eq!(accepted, 1);
        assert!(
            selections
                .iter()
                .filter(|s| s.status != SelectionStatus::Accepted)
                .all(|s| s.status == SelectionStatus::Expired)
        );

        let request = store
            .find_request(&request.id)
            .await
            .expect("find")
            .expect("request exists");
        assert_eq!(request.status, RequestStatus::Matched);
    }
}
