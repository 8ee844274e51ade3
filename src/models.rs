//! Data models for the TicketVault backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// User model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Organizer,
    Admin,
}

/// Event model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: Uuid,
    pub organizer_id: Uuid,
    pub title: String,
    pub location: String,
    pub status: EventStatus,
    /// Immutable once the event is created.
    pub total_tickets: i32,
    /// Mutated only through the inventory ledger.
    pub available_tickets: i32,
    /// Ticket price in minor units (cents). Zero means the event is free.
    pub ticket_price: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Event status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Draft,
    Published,
    Cancelled,
    Completed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reservation model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub ticket_count: i32,
    /// Frozen at creation: ticket_count x the event's price at that moment.
    pub total_amount: i64,
    pub status: ReservationStatus,
    pub reservation_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reservation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reservation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Paid,
    Cancelled,
    Refunded,
}

impl ReservationStatus {
    /// Cancelled and refunded reservations never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub reservation_id: Uuid,
    /// Frozen at creation; only status and paid_at mutate afterwards.
    pub amount: i64,
    pub status: PaymentStatus,
    /// Payment-provider intent id, if an intent was created.
    pub external_ref: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Refunded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complaint model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Complaint {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
    pub description: String,
    pub status: ComplaintStatus,
    pub admin_response: Option<String>,
    /// Monotonic: once true it never goes back to false.
    pub refund_issued: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Complaint status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "complaint_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ComplaintStatus {
    Submitted,
    InReview,
    Rejected,
    Resolved,
}

impl ComplaintStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::InReview => "in_review",
            Self::Rejected => "rejected",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for ComplaintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated caller, as established by the fronting gateway.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: Uuid,
    pub is_admin: bool,
}

// ===== Request / response payloads =====

#[derive(Debug, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub first_name: String,
    #[validate(length(min = 1))]
    pub last_name: String,
    pub role: Option<UserRole>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateEventRequest {
    #[validate(length(min = 1))]
    pub title: String,
    #[validate(length(min = 1))]
    pub location: String,
    #[validate(range(min = 1))]
    pub total_tickets: i32,
    #[validate(range(min = 0))]
    pub ticket_price: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub page: Option<i32>,
    pub limit: Option<i32>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateReservationRequest {
    pub event_id: Uuid,
    #[validate(range(min = 1))]
    pub ticket_count: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateReservationRequest {
    #[validate(range(min = 1))]
    pub ticket_count: i32,
}

/// Returned by the payment intent endpoint; the client finishes the payment
/// with the provider using the client secret.
#[derive(Debug, Serialize)]
pub struct CreateIntentResponse {
    pub payment_id: Uuid,
    pub client_secret: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitComplaintRequest {
    pub reservation_id: Uuid,
    #[validate(length(min = 1))]
    pub reason: String,
    pub description: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResolveComplaintRequest {
    #[validate(length(min = 1))]
    pub admin_response: String,
    pub should_refund: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateComplaintStatusRequest {
    pub status: ComplaintStatus,
    pub admin_response: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListComplaintsQuery {
    pub status: Option<ComplaintStatus>,
    pub page: Option<i32>,
    pub limit: Option<i32>,
}

/// Webhook event envelope as posted by the payment provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderWebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: ProviderWebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderWebhookData {
    pub object: ProviderWebhookObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderWebhookObject {
    /// Provider-side payment intent id.
    pub id: String,
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
