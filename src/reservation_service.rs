//! Reservation lifecycle service.
//!
//! Owns the reservation state machine (pending -> paid -> cancelled/refunded)
//! and ties it to the inventory ledger and to payment bookkeeping. Every
//! multi-entity mutation here is one database transaction; the only thing
//! that ever happens outside a transaction is the external refund call and
//! the post-commit notifications.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::complaint_service;
use crate::error::ServiceError;
use crate::inventory;
use crate::models::{
    Actor, CreateReservationRequest, Event, Payment, Reservation, ReservationStatus,
    UpdateReservationRequest, User,
};
use crate::notifications::{Notification, NotificationSender};
use crate::payment_provider::PaymentProvider;

const RESERVATION_CODE_LEN: usize = 8;
const RESERVATION_CODE_ATTEMPTS: u32 = 3;

/// Reservation service for managing the reservation lifecycle
pub struct ReservationService {
    pool: PgPool,
    provider: Arc<dyn PaymentProvider>,
    notifications: NotificationSender,
}

/// What cancelling a reservation must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelOutcome {
    /// Payment was captured: reverse it and land on `refunded`.
    Refund,
    /// Nothing captured: land on `cancelled`.
    Cancel,
}

impl ReservationService {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn PaymentProvider>,
        notifications: NotificationSender,
    ) -> Self {
        Self {
            pool,
            provider,
            notifications,
        }
    }

    /// Creates a reservation, decrementing event inventory in the same
    /// transaction as the insert.
    ///
    /// Free events short-circuit: the reservation is created `paid` with a
    /// synthetic completed zero-amount payment and never touches the payment
    /// gateway.
    pub async fn create(
        &self,
        user_id: Uuid,
        req: &CreateReservationRequest,
    ) -> Result<Reservation, ServiceError> {
        if req.ticket_count < 1 {
            return Err(ServiceError::InvalidInput {
                field: "ticket_count",
                message: "must be at least 1".to_string(),
            });
        }
        let user = self.fetch_user(user_id).await?;

        for attempt in 1..=RESERVATION_CODE_ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            let event = inventory::reserve(&mut tx, req.event_id, req.ticket_count).await?;
            let total_amount = event.ticket_price * i64::from(req.ticket_count);
            let status = if total_amount == 0 {
                ReservationStatus::Paid
            } else {
                ReservationStatus::Pending
            };
            let code = generate_reservation_code();

            let inserted = sqlx::query_as::<_, Reservation>(
                r#"
                INSERT INTO reservations
                    (id, event_id, user_id, ticket_count, total_amount, status, reservation_code)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(req.event_id)
            .bind(user_id)
            .bind(req.ticket_count)
            .bind(total_amount)
            .bind(status)
            .bind(&code)
            .fetch_one(&mut *tx)
            .await;

            let reservation = match inserted {
                Ok(reservation) => reservation,
                Err(e) if is_code_conflict(&e) => {
                    warn!("reservation code collision (attempt {}); retrying", attempt);
                    let _ = tx.rollback().await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if total_amount == 0 {
                sqlx::query(
                    r#"
                    INSERT INTO payments (id, reservation_id, amount, status, paid_at)
                    VALUES ($1, $2, 0, 'completed', now())
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(reservation.id)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            info!(
                "reservation {} created for event {} ({} tickets, {} minor units)",
                reservation.id, event.id, reservation.ticket_count, reservation.total_amount
            );

            self.send_confirmations(&user, &event, &reservation).await;
            return Ok(reservation);
        }

        Err(ServiceError::Internal(
            "could not allocate a unique reservation code".to_string(),
        ))
    }

    /// Changes the ticket count of a pending reservation, re-checking
    /// availability for growth and releasing the delta for shrink, and
    /// recomputes the total from the event's frozen price.
    pub async fn update(
        &self,
        reservation_id: Uuid,
        actor: &Actor,
        req: &UpdateReservationRequest,
    ) -> Result<Reservation, ServiceError> {
        let new_count = req.ticket_count;
        if new_count < 1 {
            return Err(ServiceError::InvalidInput {
                field: "ticket_count",
                message: "must be at least 1".to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;
        let reservation = lock_reservation(&mut tx, reservation_id).await?;
        if reservation.user_id != actor.user_id {
            return Err(ServiceError::Forbidden {
                action: "modify this reservation",
            });
        }
        if reservation.status != ReservationStatus::Pending {
            return Err(ServiceError::InvalidState(format!(
                "only pending reservations can be changed (status: {})",
                reservation.status
            )));
        }

        let delta = new_count - reservation.ticket_count;
        if delta == 0 {
            return Ok(reservation);
        }
        let event = if delta > 0 {
            inventory::reserve(&mut tx, reservation.event_id, delta).await?
        } else {
            inventory::release(&mut tx, reservation.event_id, -delta).await?
        };
        let total_amount = event.ticket_price * i64::from(new_count);

        // A pending payment was created for the old amount and can no longer
        // be captured at the right price; void it so the next intent request
        // starts fresh.
        let voided = sqlx::query(
            "DELETE FROM payments WHERE reservation_id = $1 AND status = 'pending'",
        )
        .bind(reservation_id)
        .execute(&mut *tx)
        .await?;
        if voided.rows_affected() > 0 {
            info!(
                "voided stale pending payment for reservation {}",
                reservation_id
            );
        }

        let updated = sqlx::query_as::<_, Reservation>(
            r#"
            UPDATE reservations
            SET ticket_count = $2, total_amount = $3, updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(reservation_id)
        .bind(new_count)
        .bind(total_amount)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            "reservation {} updated to {} tickets ({} minor units)",
            reservation_id, new_count, total_amount
        );
        Ok(updated)
    }

    /// Cancels a reservation on behalf of its owner or an admin.
    ///
    /// A captured payment is reversed first (provider call outside the
    /// transaction, non-fatal on provider error) and the reservation lands on
    /// `refunded`; otherwise it lands on `cancelled`. Either way the tickets
    /// go back to the event in the same transaction as the status flip.
    pub async fn cancel(
        &self,
        reservation_id: Uuid,
        actor: &Actor,
    ) -> Result<Reservation, ServiceError> {
        let reservation = self.fetch_reservation(reservation_id).await?;
        if reservation.user_id != actor.user_id && !actor.is_admin {
            return Err(ServiceError::Forbidden {
                action: "cancel this reservation",
            });
        }
        let event = self.fetch_event(reservation.event_id).await?;
        let payment = self.fetch_payment(reservation_id).await?;

        let paid_amount = payment.as_ref().map(|p| p.amount).unwrap_or(0);
        let outcome =
            cancellation_outcome(reservation.status, paid_amount, event.ends_at, Utc::now())?;

        if outcome == CancelOutcome::Refund {
            if let Some(payment) = &payment {
                // Money-movement authority is external but seat inventory is
                // ours: provider failure is logged inside reverse_payment and
                // the internal correction below still runs.
                complaint_service::reverse_payment(self.provider.as_ref(), payment).await?;
            }
        }

        let mut tx = self.pool.begin().await?;
        let locked = lock_reservation(&mut tx, reservation_id).await?;
        if locked.status.is_terminal() {
            return Err(ServiceError::AlreadyTerminal {
                status: locked.status,
            });
        }
        if locked.status != reservation.status {
            return Err(ServiceError::InvalidState(
                "reservation changed concurrently; retry the cancellation".to_string(),
            ));
        }

        let new_status = match outcome {
            CancelOutcome::Refund => {
                sqlx::query(
                    r#"
                    UPDATE payments
                    SET status = 'refunded', updated_at = now()
                    WHERE reservation_id = $1 AND status <> 'refunded'
                    "#,
                )
                .bind(reservation_id)
                .execute(&mut *tx)
                .await?;
                ReservationStatus::Refunded
            }
            CancelOutcome::Cancel => ReservationStatus::Cancelled,
        };

        let updated = sqlx::query_as::<_, Reservation>(
            "UPDATE reservations SET status = $2, updated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(reservation_id)
        .bind(new_status)
        .fetch_one(&mut *tx)
        .await?;
        inventory::release(&mut tx, locked.event_id, locked.ticket_count).await?;
        tx.commit().await?;

        info!("reservation {} is now {}", reservation_id, new_status);
        match self.fetch_user(reservation.user_id).await {
            Ok(user) => self.notifications.dispatch(Notification::ReservationCancellation {
                recipient_email: user.email,
                first_name: user.first_name,
                event_title: event.title.clone(),
                reservation_code: updated.reservation_code.clone(),
                ticket_count: updated.ticket_count,
                total_amount: updated.total_amount,
                event_date: event.starts_at,
                event_location: event.location.clone(),
            }),
            Err(e) => warn!("could not load user for cancellation notice: {}", e),
        }
        Ok(updated)
    }

    /// Fetches a reservation, visible to its owner or an admin.
    pub async fn get(
        &self,
        reservation_id: Uuid,
        actor: &Actor,
    ) -> Result<Reservation, ServiceError> {
        let reservation = self.fetch_reservation(reservation_id).await?;
        if reservation.user_id != actor.user_id && !actor.is_admin {
            return Err(ServiceError::Forbidden {
                action: "view this reservation",
            });
        }
        Ok(reservation)
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Reservation>, ServiceError> {
        let reservations = sqlx::query_as::<_, Reservation>(
            "SELECT * FROM reservations WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(reservations)
    }

    // ===== Private helpers =====

    async fn send_confirmations(&self, user: &User, event: &Event, reservation: &Reservation) {
        self.notifications.dispatch(Notification::ReservationConfirmation {
            recipient_email: user.email.clone(),
            first_name: user.first_name.clone(),
            event_title: event.title.clone(),
            reservation_code: reservation.reservation_code.clone(),
            ticket_count: reservation.ticket_count,
            total_amount: reservation.total_amount,
            event_date: event.starts_at,
            event_location: event.location.clone(),
        });
        match self.fetch_user(event.organizer_id).await {
            Ok(organizer) => self.notifications.dispatch(Notification::ReservationConfirmation {
                recipient_email: organizer.email,
                first_name: organizer.first_name,
                event_title: event.title.clone(),
                reservation_code: reservation.reservation_code.clone(),
                ticket_count: reservation.ticket_count,
                total_amount: reservation.total_amount,
                event_date: event.starts_at,
                event_location: event.location.clone(),
            }),
            Err(e) => warn!("could not load organizer for confirmation notice: {}", e),
        }
    }

    async fn fetch_reservation(&self, id: Uuid) -> Result<Reservation, ServiceError> {
        sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ServiceError::NotFound {
                resource: "reservation",
            })
    }

    async fn fetch_event(&self, id: Uuid) -> Result<Event, ServiceError> {
        sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ServiceError::NotFound { resource: "event" })
    }

    async fn fetch_payment(&self, reservation_id: Uuid) -> Result<Option<Payment>, ServiceError> {
        let payment =
            sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE reservation_id = $1")
                .bind(reservation_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(payment)
    }

    async fn fetch_user(&self, id: Uuid) -> Result<User, ServiceError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ServiceError::NotFound { resource: "user" })
    }
}

async fn lock_reservation(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Reservation, ServiceError> {
    sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ServiceError::NotFound {
            resource: "reservation",
        })
}

/// Decides which terminal state a cancellation leads to, or why it is
/// rejected. Pure so the state table is testable without a database.
fn cancellation_outcome(
    status: ReservationStatus,
    paid_amount: i64,
    event_ends_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<CancelOutcome, ServiceError> {
    if status.is_terminal() {
        return Err(ServiceError::AlreadyTerminal { status });
    }
    if event_ends_at <= now {
        return Err(ServiceError::EventAlreadyEnded);
    }
    if status == ReservationStatus::Paid && paid_amount > 0 {
        Ok(CancelOutcome::Refund)
    } else {
        Ok(CancelOutcome::Cancel)
    }
}

/// 8 random alphanumeric characters. Uniqueness is enforced by the database
/// constraint; `create` retries on the (negligible) chance of a collision.
fn generate_reservation_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RESERVATION_CODE_LEN)
        .map(char::from)
        .collect()
}

fn is_code_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.constraint() == Some("reservations_reservation_code_key"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn reservation_codes_are_eight_alphanumeric_chars() {
        for _ in 0..100 {
            let code = generate_reservation_code();
            assert_eq!(code.len(), 8);
            assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn reservation_codes_vary() {
        let codes: std::collections::HashSet<String> =
            (0..50).map(|_| generate_reservation_code()).collect();
        assert!(codes.len() > 1);
    }

    #[test]
    fn paid_reservations_with_captured_money_are_refunded_not_cancelled() {
        let now = Utc::now();
        let ends = now + Duration::hours(2);
        let outcome =
            cancellation_outcome(ReservationStatus::Paid, 5000, ends, now).unwrap();
        assert_eq!(outcome, CancelOutcome::Refund);
    }

    #[test]
    fn pending_and_free_paid_reservations_cancel_plainly() {
        let now = Utc::now();
        let ends = now + Duration::hours(2);
        assert_eq!(
            cancellation_outcome(ReservationStatus::Pending, 0, ends, now).unwrap(),
            CancelOutcome::Cancel
        );
        // Free event: paid status but zero captured amount.
        assert_eq!(
            cancellation_outcome(ReservationStatus::Paid, 0, ends, now).unwrap(),
            CancelOutcome::Cancel
        );
    }

    #[test]
    fn terminal_reservations_cannot_be_cancelled_again() {
        let now = Utc::now();
        let ends = now + Duration::hours(2);
        for status in [ReservationStatus::Cancelled, ReservationStatus::Refunded] {
            let err = cancellation_outcome(status, 5000, ends, now).unwrap_err();
            assert!(matches!(err, ServiceError::AlreadyTerminal { .. }));
        }
    }

    #[test]
    fn ended_events_reject_cancellation() {
        let now = Utc::now();
        let ended = now - Duration::minutes(1);
        let err = cancellation_outcome(ReservationStatus::Paid, 5000, ended, now).unwrap_err();
        assert!(matches!(err, ServiceError::EventAlreadyEnded));
    }
}
