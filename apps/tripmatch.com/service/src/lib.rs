use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use matching_domain::clock::SystemClock;
use matching_domain::match_token::{
    MatchTokenCodec, RespondGrant, TokenMintError, TokenVerifyError, ViewGrant,
};
use matching_domain::notify::{EmailSender, OutcomeEmail};
use matching_domain::reliability::{
    CreateReviewInput, ReliabilityScorer, ReviewError, ReviewRecord, StudentMetrics,
};
use matching_domain::selection::{
    InviteError, RespondAction, RespondError, RespondOutcome, SelectionArbiter, SelectionRecord,
    TripRequest,
};
use matching_domain::store::{CreateRequestInput, JsonMatchStore, MatchStore, StoreError};
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub mod api_envelope;
pub mod config;
pub mod email;


use crate::api_envelope::{
    ApiErrorCode, ApiErrorTuple, error_response, not_found_error, ok_data, unauthorized_error,
    validation_error,
};
use crate::config::{Config, ConfigError};
use crate::email::TracingEmailSender;

const SERVICE_NAME: &str = "tripmatch-match-service";
const REQUEST_TIMEOUT_SECONDS: u64 = 30;

// Invalid tokens and unknown selection triples share one response on purpose:
// the difference would hand an attacker an existence oracle.
const INVALID_LINK_MESSAGE: &str = "This link is not valid.";
const EXPIRED_LINK_MESSAGE: &str = "This link has expired. Ask for a fresh one.";

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<JsonMatchStore>,
    emails: Arc<dyn EmailSender>,
    codec: MatchTokenCodec,
    arbiter: SelectionArbiter,
    scorer: ReliabilityScorer,
}

pub fn build_router(config: Config) -> Result<Router, ConfigError> {
    let store = Arc::new(JsonMatchStore::at_path(config.match_store_path.clone()));
    build_router_with_collaborators(config, store, Arc::new(TracingEmailSender))
}

/// Router construction with injectable collaborators, used directly by tests
/// to share the store and capture outgoing email.
pub fn build_router_with_collaborators(
    config: Config,
    store: Arc<JsonMatchStore>,
    emails: Arc<dyn EmailSender>,
) -> Result<Router, ConfigError> {
    let codec = MatchTokenCodec::new(&config.match_token_secret, Arc::new(SystemClock))?;
    let store_seam: Arc<dyn MatchStore> = store.clone();
    let arbiter = SelectionArbiter::new(store_seam.clone(), emails.clone());
    let scorer = ReliabilityScorer::new(store_seam);

    let state = AppState {
        config: Arc::new(config),
        store,
        emails,
        codec,
        arbiter,
        scorer,
    };

    Ok(Router::new()
        .route("/healthz", get(health))
        .route("/api/v1/requests", post(create_request))
        .route(
            "/api/v1/requests/:request_id/invitations",
            post(invite_candidates),
        )
        .route("/api/v1/requests/view", post(view_request))
        .route("/api/v1/selections/respond", post(respond_to_selection))
        .route("/api/v1/reviews", post(create_review))
        .route("/api/v1/students/:student_id/metrics", get(student_metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(
                    REQUEST_TIMEOUT_SECONDS,
                ))),
        ))
}

async fn health() -> impl IntoResponse {
    ok_data(json!({"status": "ok", "service": SERVICE_NAME}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequestPayload {
    city: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

async fn create_request(
    State(state): State<AppState>,
    Json(payload): Json<CreateRequestPayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let city = payload.city.trim();
    if city.is_empty() {
        return Err(validation_error("city", "City is required."));
    }
    if payload.end_date < payload.start_date {
        return Err(validation_error(
            "endDate",
            "End date may not be before start date.",
        ));
    }

    let request = state
        .store
        .create_request(CreateRequestInput {
            city: city.to_string(),
            start_date: payload.start_date,
            end_date: payload.end_date,
        })
        .await
        .map_err(map_store_error)?;

    Ok(ok_data(json!({"request": request_json(&request)})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvitePayload {
    student_ids: Vec<String>,
}

async fn invite_candidates(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(payload): Json<InvitePayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let created = state
        .arbiter
        .invite_candidates(&request_id, &payload.student_ids)
        .await
        .map_err(map_invite_error)?;

    if !created.is_empty() {
        let request = state
            .store
            .find_request(&request_id)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| not_found_error("Request not found."))?;

        for selection in &created {
            let email = invite_email(&state, &request, selection).map_err(map_mint_error)?;
            if let Err(error) = state.emails.send(email).await {
                warn!(
                    target: "tripmatch.service",
                    request_id = %request.id,
                    student_id = %selection.student_id,
                    error = %error,
                    "failed to send guide-invited email",
                );
            }
        }
    }

    let selections: Vec<Value> = created.iter().map(selection_json).collect();
    Ok(ok_data(json!({"selections": selections})))
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    token: String,
}

async fn respond_to_selection(
    State(state): State<AppState>,
    Json(payload): Json<TokenPayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let claims = state
        .codec
        .verify_respond(payload.token.trim())
        .map_err(map_token_error)?;

    let outcome = state
        .arbiter
        .respond(
            &claims.selection_id,
            &claims.request_id,
            &claims.student_id,
            claims.action,
        )
        .await
        .map_err(map_respond_error)?;

    let mut body = json!({
        "outcome": outcome.as_str(),
        "selection": selection_json(outcome.selection()),
    });
    if let RespondOutcome::Won { request, .. } = &outcome {
        body["request"] = request_json(request);
    }
    Ok(ok_data(body))
}

async fn view_request(
    State(state): State<AppState>,
    Json(payload): Json<TokenPayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let claims = state
        .codec
        .verify_view(payload.token.trim())
        .map_err(map_token_error)?;

    let request = state
        .store
        .find_request(&claims.request_id)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| unauthorized_error(INVALID_LINK_MESSAGE))?;
    let selections = state
        .store
        .selections_for_request(&claims.request_id)
        .await
        .map_err(map_store_error)?;

    let selections: Vec<Value> = selections.iter().map(selection_json).collect();
    Ok(ok_data(json!({
        "request": request_json(&request),
        "selections": selections,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateReviewPayload {
    request_id: String,
    student_id: String,
    rating: u8,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attributes: Vec<String>,
    #[serde(default)]
    no_show: bool,
    #[serde(default)]
    price_paid_cents: Option<u64>,
}

async fn create_review(
    State(state): State<AppState>,
    Json(payload): Json<CreateReviewPayload>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let written = state
        .scorer
        .create_review(CreateReviewInput {
            request_id: payload.request_id,
            student_id: payload.student_id,
            rating: payload.rating,
            text: payload.text,
            attributes: payload.attributes,
            no_show: payload.no_show,
            price_paid_cents: payload.price_paid_cents,
        })
        .await
        .map_err(map_review_error)?;

    Ok(ok_data(json!({
        "review": review_json(&written.review),
        "metrics": metrics_json(&written.metrics),
    })))
}

async fn student_metrics(
    State(state): State<AppState>,
    Path(student_id): Path<String>,
) -> Result<impl IntoResponse, ApiErrorTuple> {
    let metrics = state
        .store
        .student_metrics(&student_id)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| not_found_error("No reviews recorded for this guide yet."))?;

    Ok(ok_data(json!({"metrics": metrics_json(&metrics)})))
}

fn invite_email(
    state: &AppState,
    request: &TripRequest,
    selection: &SelectionRecord,
) -> Result<OutcomeEmail, TokenMintError> {
    let respond_ttl = state.config.respond_token_ttl_hours;
    let accept = state.codec.mint_respond(
        &RespondGrant {
            request_id: request.id.clone(),
            student_id: selection.student_id.clone(),
            selection_id: selection.id.clone(),
            action: RespondAction::Accept,
        },
        respond_ttl,
    )?;
    let decline = state.codec.mint_respond(
        &RespondGrant {
            request_id: request.id.clone(),
            student_id: selection.student_id.clone(),
            selection_id: selection.id.clone(),
            action: RespondAction::Decline,
        },
        respond_ttl,
    )?;
    let view = state.codec.mint_view(
        &ViewGrant {
            request_id: request.id.clone(),
            student_id: selection.student_id.clone(),
        },
        state.config.view_token_ttl_hours,
    )?;

    let base_url = &state.config.public_base_url;
    Ok(OutcomeEmail::GuideInvited {
        request_id: request.id.clone(),
        student_id: selection.student_id.clone(),
        city: request.city.clone(),
        accept_link: fragment_link(base_url, "selections/respond", &accept),
        decline_link: fragment_link(base_url, "selections/respond", &decline),
        view_link: fragment_link(base_url, "requests/view", &view),
    })
}

/// Action links carry the token in the URL fragment, which browsers never
/// send over the wire, so intermediary HTTP logs cannot capture it.
fn fragment_link(base_url: &str, path: &str, token: &str) -> String {
    format!("{}/{path}#token={token}", base_url.trim_end_matches('/'))
}

fn map_token_error(error: TokenVerifyError) -> ApiErrorTuple {
    match error {
        TokenVerifyError::Invalid => unauthorized_error(INVALID_LINK_MESSAGE),
        TokenVerifyError::Expired => unauthorized_error(EXPIRED_LINK_MESSAGE),
    }
}

fn map_respond_error(error: RespondError) -> ApiErrorTuple {
    match error {
        // Same status, code, and message as a bad signature.
        RespondError::SelectionNotFound => unauthorized_error(INVALID_LINK_MESSAGE),
        RespondError::Store(error) => map_store_error(error),
    }
}

fn map_invite_error(error: InviteError) -> ApiErrorTuple {
    match error {
        InviteError::RequestNotFound => not_found_error("Request not found."),
        InviteError::RequestClosed => error_response(
            ApiErrorCode::Conflict,
            "The request is no longer accepting invitations.",
        ),
        InviteError::NoCandidates => {
            validation_error("studentIds", "At least one candidate is required.")
        }
        InviteError::Store(error) => map_store_error(error),
    }
}

fn map_review_error(error: ReviewError) -> ApiErrorTuple {
    match error {
        ReviewError::Validation { field, message } => validation_error(field, &message),
        ReviewError::Conflict => error_response(
            ApiErrorCode::Conflict,
            "A review already exists for this request.",
        ),
        ReviewError::RequestNotFound => not_found_error("Request not found."),
        ReviewError::Store(error) => map_store_error(error),
    }
}

fn map_store_error(error: StoreError) -> ApiErrorTuple {
    match error {
        StoreError::NotFound => not_found_error("Record not found."),
        StoreError::Conflict { .. } => error_response(
            ApiErrorCode::Conflict,
            "The request conflicts with existing state.",
        ),
        StoreError::Unavailable { message } => {
            tracing::error!(
                target: "tripmatch.service",
                message = %message,
                "storage temporarily unavailable",
            );
            error_response(
                ApiErrorCode::ServiceUnavailable,
                "Storage is temporarily unavailable. Retry shortly.",
            )
        }
        StoreError::Persistence { message } => {
            tracing::error!(
                target: "tripmatch.service",
                message = %message,
                "storage failure",
            );
            error_response(ApiErrorCode::InternalError, "Internal error.")
        }
    }
}

fn map_mint_error(error: TokenMintError) -> ApiErrorTuple {
    tracing::error!(
        target: "tripmatch.service",
        error = %error,
        "failed to mint action token",
    );
    error_response(ApiErrorCode::InternalError, "Internal error.")
}

fn request_json(request: &TripRequest) -> Value {
    json!({
        "id": request.id,
        "city": request.city,
        "startDate": request.start_date,
        "endDate": request.end_date,
        "status": request.status.as_str(),
        "createdAt": request.created_at,
        "updatedAt": request.updated_at,
    })
}

fn selection_json(selection: &SelectionRecord) -> Value {
    json!({
        "id": selection.id,
        "requestId": selection.request_id,
        "studentId": selection.student_id,
        "status": selection.status.as_str(),
        "respondedAt": selection.responded_at,
        "createdAt": selection.created_at,
        "updatedAt": selection.updated_at,
    })
}

fn review_json(review: &ReviewRecord) -> Value {
    let attributes: Vec<&'static str> = review
        .attributes
        .iter()
        .map(|attribute| attribute.as_str())
        .collect();
    json!({
        "id": review.id,
        "requestId": review.request_id,
        "studentId": review.student_id,
        "rating": review.rating,
        "text": review.text,
        "attributes": attributes,
        "noShow": review.no_show,
        "pricePaidCents": review.price_paid_cents,
        "createdAt": review.created_at,
    })
}

fn metrics_json(metrics: &StudentMetrics) -> Value {
    json!({
        "studentId": metrics.student_id,
        "averageRating": metrics.average_rating,
        "completionRate": metrics.completion_rate,
        "reliabilityBadge": metrics.reliability_badge.as_str(),
        "tripsHosted": metrics.trips_hosted,
        "noShowCount": metrics.no_show_count,
        "reviewCount": metrics.review_count,
        "updatedAt": metrics.updated_at,
    })
}
