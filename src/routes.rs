//! Route definitions for TicketVault API

use axum::{routing::get, Router};

use crate::app_state::AppState;
use crate::handlers::*;

// User routes
pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/api/users", axum::routing::post(create_user))
        .route("/api/users/:id", get(get_user))
}

// Event routes
pub fn event_routes() -> Router<AppState> {
    Router::new()
        .route("/api/events", axum::routing::post(create_event))
        .route("/api/events", get(list_events))
        .route("/api/events/:id", get(get_event))
        .route("/api/events/:id/publish", axum::routing::post(publish_event))
}

// Reservation routes
pub fn reservation_routes() -> Router<AppState> {
    Router::new()
        .route("/api/reservations", axum::routing::post(create_reservation))
        .route("/api/reservations", get(list_my_reservations))
        .route("/api/reservations/:id", get(get_reservation))
        .route(
            "/api/reservations/:id",
            axum::routing::patch(update_reservation),
        )
        .route(
            "/api/reservations/:id/cancel",
            axum::routing::post(cancel_reservation),
        )
}

// Payment routes
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/reservations/:id/payment-intent",
            axum::routing::post(create_payment_intent),
        )
        .route("/api/reservations/:id/payment", get(get_reservation_payment))
        .route(
            "/api/payments/webhook",
            axum::routing::post(payment_webhook),
        )
}

// Complaint routes
pub fn complaint_routes() -> Router<AppState> {
    Router::new()
        .route("/api/complaints", axum::routing::post(submit_complaint))
        .route("/api/complaints", get(list_complaints))
        .route("/api/complaints/:id", get(get_complaint))
        .route(
            "/api/complaints/:id/resolve",
            axum::routing::post(resolve_complaint),
        )
        .route(
            "/api/complaints/:id/status",
            axum::routing::patch(update_complaint_status),
        )
}
