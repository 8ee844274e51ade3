//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::complaint_service::ComplaintService;
use crate::event_service::EventService;
use crate::payment_service::PaymentService;
use crate::reservation_service::ReservationService;
use crate::user_service::UserService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UserService>,
    pub events: Arc<EventService>,
    pub reservations: Arc<ReservationService>,
    pub payments: Arc<PaymentService>,
    pub complaints: Arc<ComplaintService>,
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(
        users: Arc<UserService>,
        events: Arc<EventService>,
        reservations: Arc<ReservationService>,
        payments: Arc<PaymentService>,
        complaints: Arc<ComplaintService>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            users,
            events,
            reservations,
            payments,
            complaints,
            webhook_secret,
        }
    }
}

impl FromRef<AppState> for Arc<UserService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.users.clone()
    }
}

impl FromRef<AppState> for Arc<EventService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.events.clone()
    }
}

impl FromRef<AppState> for Arc<ReservationService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.reservations.clone()
    }
}

impl FromRef<AppState> for Arc<PaymentService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.payments.clone()
    }
}

impl FromRef<AppState> for Arc<ComplaintService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.complaints.clone()
    }
}
