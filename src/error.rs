//! Error taxonomy for the reservation/payment/complaint engine.
//!
//! Validation and state-machine violations are surfaced synchronously with
//! enough context to render a user message; notification failures and
//! provider failures during refunds are swallowed and logged by the services
//! and never appear here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::models::{ApiResponse, EventStatus, ReservationStatus};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{resource} not found")]
    NotFound { resource: &'static str },

    #[error("caller is not authenticated")]
    Unauthenticated,

    #[error("not allowed to {action}")]
    Forbidden { action: &'static str },

    #[error("invalid {field}: {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    #[error("{0}")]
    InvalidState(String),

    #[error("event is not open for reservations (status: {status})")]
    EventNotReservable { status: EventStatus },

    #[error("only {available} tickets are available ({requested} requested)")]
    InsufficientInventory { requested: i32, available: i32 },

    #[error("reservation is already {status}")]
    AlreadyTerminal { status: ReservationStatus },

    #[error("the event has already ended")]
    EventAlreadyEnded,

    #[error("reservation is not awaiting payment")]
    AlreadyPaid,

    #[error("free reservations do not require payment")]
    FreeEventNoPayment,

    #[error("cannot refund a free reservation")]
    CannotRefundFreeEvent,

    #[error("payment provider error: {0}")]
    ExternalProvider(String),

    #[error("webhook endpoint is not configured")]
    WebhookNotConfigured,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::InvalidInput { .. }
            | Self::FreeEventNoPayment
            | Self::CannotRefundFreeEvent => StatusCode::BAD_REQUEST,
            Self::InvalidState(_)
            | Self::EventNotReservable { .. }
            | Self::InsufficientInventory { .. }
            | Self::AlreadyTerminal { .. }
            | Self::EventAlreadyEnded
            | Self::AlreadyPaid => StatusCode::CONFLICT,
            Self::ExternalProvider(_) => StatusCode::BAD_GATEWAY,
            Self::WebhookNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        let body = Json(ApiResponse::<()>::err(self.to_string()));
        (status, body).into_response()
    }
}
