//! API handlers for the TicketVault backend
//!
//! Handlers stay thin: extract the actor, validate the payload, call the
//! service, wrap the result. All error-to-status mapping lives on
//! `ServiceError`.

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::Json;
use uuid::Uuid;
use validator::Validate;

use crate::app_state::AppState;
use crate::error::ServiceError;
use crate::models::{
    Actor, ApiResponse, Complaint, CreateEventRequest, CreateIntentResponse,
    CreateReservationRequest, CreateUserRequest, Event, ListComplaintsQuery, ListEventsQuery,
    Payment, ProviderWebhookEvent, Reservation, ResolveComplaintRequest, SubmitComplaintRequest,
    UpdateComplaintStatusRequest, UpdateReservationRequest, User,
};

/// The fronting gateway authenticates requests and forwards the caller's
/// identity in headers; this extractor only reads them back.
#[axum::async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(ServiceError::Unauthenticated)?;
        let is_admin = parts
            .headers
            .get("x-user-role")
            .and_then(|v| v.to_str().ok())
            .map(|role| role.eq_ignore_ascii_case("admin"))
            .unwrap_or(false);
        Ok(Actor { user_id, is_admin })
    }
}

fn validated(req: &impl Validate) -> Result<(), ServiceError> {
    req.validate().map_err(|e| ServiceError::InvalidInput {
        field: "request",
        message: e.to_string(),
    })
}

fn require_admin(actor: &Actor) -> Result<(), ServiceError> {
    if actor.is_admin {
        Ok(())
    } else {
        Err(ServiceError::Forbidden {
            action: "perform administrative actions",
        })
    }
}

// ===== User handlers =====

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<ApiResponse<User>>, ServiceError> {
    validated(&req)?;
    let user = state.users.create(&req).await?;
    Ok(Json(ApiResponse::ok(user)))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<User>>, ServiceError> {
    let user = state.users.get(user_id).await?;
    Ok(Json(ApiResponse::ok(user)))
}

// ===== Event handlers =====

pub async fn create_event(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<CreateEventRequest>,
) -> Result<Json<ApiResponse<Event>>, ServiceError> {
    validated(&req)?;
    let event = state.events.create(actor.user_id, &req).await?;
    Ok(Json(ApiResponse::ok(event)))
}

pub async fn publish_event(
    State(state): State<AppState>,
    actor: Actor,
    Path(event_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Event>>, ServiceError> {
    let event = state.events.publish(event_id, &actor).await?;
    Ok(Json(ApiResponse::ok(event)))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Event>>, ServiceError> {
    let event = state.events.get(event_id).await?;
    Ok(Json(ApiResponse::ok(event)))
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<ApiResponse<Vec<Event>>>, ServiceError> {
    let events = state.events.list_published(&query).await?;
    Ok(Json(ApiResponse::ok(events)))
}

// ===== Reservation handlers =====

pub async fn create_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<CreateReservationRequest>,
) -> Result<Json<ApiResponse<Reservation>>, ServiceError> {
    validated(&req)?;
    let reservation = state.reservations.create(actor.user_id, &req).await?;
    Ok(Json(ApiResponse::ok(reservation)))
}

pub async fn list_my_reservations(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<ApiResponse<Vec<Reservation>>>, ServiceError> {
    let reservations = state.reservations.list_for_user(actor.user_id).await?;
    Ok(Json(ApiResponse::ok(reservations)))
}

pub async fn get_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Reservation>>, ServiceError> {
    let reservation = state.reservations.get(reservation_id, &actor).await?;
    Ok(Json(ApiResponse::ok(reservation)))
}

pub async fn update_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
    Json(req): Json<UpdateReservationRequest>,
) -> Result<Json<ApiResponse<Reservation>>, ServiceError> {
    validated(&req)?;
    let reservation = state
        .reservations
        .update(reservation_id, &actor, &req)
        .await?;
    Ok(Json(ApiResponse::ok(reservation)))
}

pub async fn cancel_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Reservation>>, ServiceError> {
    let reservation = state.reservations.cancel(reservation_id, &actor).await?;
    Ok(Json(ApiResponse::ok(reservation)))
}

// ===== Payment handlers =====

pub async fn create_payment_intent(
    State(state): State<AppState>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiResponse<CreateIntentResponse>>, ServiceError> {
    let intent = state.payments.create_intent(reservation_id, &actor).await?;
    Ok(Json(ApiResponse::ok(intent)))
}

pub async fn get_reservation_payment(
    State(state): State<AppState>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Payment>>, ServiceError> {
    let payment = state
        .payments
        .get_for_reservation(reservation_id, &actor)
        .await?;
    Ok(Json(ApiResponse::ok(payment)))
}

/// Webhook endpoint for provider payment events.
///
/// Authenticated by a shared secret header, fail-closed: with no secret
/// configured every request is rejected.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<ProviderWebhookEvent>,
) -> Result<Json<ApiResponse<()>>, ServiceError> {
    match &state.webhook_secret {
        Some(secret) if !secret.is_empty() => {
            let provided = headers
                .get("x-webhook-secret")
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default();
            if provided != secret {
                return Err(ServiceError::Unauthenticated);
            }
        }
        _ => {
            tracing::error!("webhook secret not configured - rejecting request");
            return Err(ServiceError::WebhookNotConfigured);
        }
    }

    state.payments.confirm(&event).await?;
    Ok(Json(ApiResponse::ok(())))
}

// ===== Complaint handlers =====

pub async fn submit_complaint(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<SubmitComplaintRequest>,
) -> Result<Json<ApiResponse<Complaint>>, ServiceError> {
    validated(&req)?;
    let complaint = state.complaints.submit(actor.user_id, &req).await?;
    Ok(Json(ApiResponse::ok(complaint)))
}

pub async fn get_complaint(
    State(state): State<AppState>,
    actor: Actor,
    Path(complaint_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Complaint>>, ServiceError> {
    let complaint = state.complaints.get(complaint_id, &actor).await?;
    Ok(Json(ApiResponse::ok(complaint)))
}

pub async fn list_complaints(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<ListComplaintsQuery>,
) -> Result<Json<ApiResponse<Vec<Complaint>>>, ServiceError> {
    require_admin(&actor)?;
    let complaints = state.complaints.list(&query).await?;
    Ok(Json(ApiResponse::ok(complaints)))
}

pub async fn resolve_complaint(
    State(state): State<AppState>,
    actor: Actor,
    Path(complaint_id): Path<Uuid>,
    Json(req): Json<ResolveComplaintRequest>,
) -> Result<Json<ApiResponse<Complaint>>, ServiceError> {
    require_admin(&actor)?;
    validated(&req)?;
    let complaint = state.complaints.resolve(complaint_id, &req).await?;
    Ok(Json(ApiResponse::ok(complaint)))
}

pub async fn update_complaint_status(
    State(state): State<AppState>,
    actor: Actor,
    Path(complaint_id): Path<Uuid>,
    Json(req): Json<UpdateComplaintStatusRequest>,
) -> Result<Json<ApiResponse<Complaint>>, ServiceError> {
    require_admin(&actor)?;
    let complaint = state.complaints.update_status(complaint_id, &req).await?;
    Ok(Json(ApiResponse::ok(complaint)))
}
