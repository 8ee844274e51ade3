//! Payment intent gateway.
//!
//! Creates and reuses one provider intent per payment row, and reconciles the
//! provider's asynchronous webhook events into reservation state. Webhook
//! application is idempotent by the payment-status guard: replays and
//! out-of-order deliveries are acknowledged without a second mutation, and
//! never surface an error to the provider (which would only cause retry
//! storms).

use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{
    Actor, CreateIntentResponse, Payment, PaymentStatus, ProviderWebhookEvent, Reservation,
    ReservationStatus,
};
use crate::payment_provider::PaymentProvider;

const EVENT_PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";
const EVENT_PAYMENT_FAILED: &str = "payment_intent.payment_failed";

/// Payment service bridging reservations and the external provider
pub struct PaymentService {
    pool: PgPool,
    provider: Arc<dyn PaymentProvider>,
    currency: String,
}

impl PaymentService {
    pub fn new(pool: PgPool, provider: Arc<dyn PaymentProvider>, currency: String) -> Self {
        Self {
            pool,
            provider,
            currency,
        }
    }

    /// Creates (or reuses) the provider intent for a pending, priced
    /// reservation owned by the caller, and returns its client secret.
    pub async fn create_intent(
        &self,
        reservation_id: Uuid,
        actor: &Actor,
    ) -> Result<CreateIntentResponse, ServiceError> {
        let reservation = self.fetch_reservation(reservation_id).await?;
        if reservation.user_id != actor.user_id {
            return Err(ServiceError::Forbidden {
                action: "pay for this reservation",
            });
        }
        if reservation.total_amount == 0 {
            return Err(ServiceError::FreeEventNoPayment);
        }
        if reservation.status != ReservationStatus::Pending {
            return Err(ServiceError::AlreadyPaid);
        }

        let payment = match self.fetch_payment(reservation_id).await? {
            Some(payment) => payment,
            None => {
                sqlx::query_as::<_, Payment>(
                    r#"
                    INSERT INTO payments (id, reservation_id, amount, status)
                    VALUES ($1, $2, $3, 'pending')
                    RETURNING *
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(reservation_id)
                .bind(reservation.total_amount)
                .fetch_one(&self.pool)
                .await?
            }
        };

        // One provider intent per payment row: reuse when we already hold a
        // reference, otherwise create and attach one.
        if let Some(intent_id) = &payment.external_ref {
            let intent = self
                .provider
                .retrieve_intent(intent_id)
                .await
                .map_err(|e| ServiceError::ExternalProvider(e.to_string()))?;
            let client_secret = intent.client_secret.ok_or_else(|| {
                ServiceError::ExternalProvider("intent has no client secret".to_string())
            })?;
            debug!("reusing intent {} for payment {}", intent.id, payment.id);
            return Ok(CreateIntentResponse {
                payment_id: payment.id,
                client_secret,
                amount: payment.amount,
                currency: self.currency.clone(),
            });
        }

        let intent = self
            .provider
            .create_intent(payment.amount, &self.currency, reservation_id)
            .await
            .map_err(|e| ServiceError::ExternalProvider(e.to_string()))?;
        let client_secret = intent.client_secret.clone().ok_or_else(|| {
            ServiceError::ExternalProvider("intent has no client secret".to_string())
        })?;

        sqlx::query("UPDATE payments SET external_ref = $2, updated_at = now() WHERE id = $1")
            .bind(payment.id)
            .bind(&intent.id)
            .execute(&self.pool)
            .await?;

        info!(
            "created intent {} for reservation {} ({} {})",
            intent.id, reservation_id, payment.amount, self.currency
        );
        Ok(CreateIntentResponse {
            payment_id: payment.id,
            client_secret,
            amount: payment.amount,
            currency: self.currency.clone(),
        })
    }

    /// Applies a verified provider webhook event.
    ///
    /// Unknown intents, replays, and events for already-terminal reservations
    /// are logged and acknowledged without mutation.
    pub async fn confirm(&self, event: &ProviderWebhookEvent) -> Result<(), ServiceError> {
        let intent_id = event.data.object.id.as_str();
        match event.event_type.as_str() {
            EVENT_PAYMENT_SUCCEEDED => self.apply_success(intent_id).await,
            EVENT_PAYMENT_FAILED => self.apply_failure(intent_id).await,
            other => {
                debug!("ignoring provider event type {}", other);
                Ok(())
            }
        }
    }

    async fn apply_success(&self, intent_id: &str) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        // Resolve the payment without a lock first so rows are always locked
        // reservation-before-payment, the same order as the refund paths.
        let Some(payment) =
            sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE external_ref = $1")
                .bind(intent_id)
                .fetch_optional(&mut *tx)
                .await?
        else {
            warn!("webhook for unknown intent {}; acknowledging", intent_id);
            return Ok(());
        };

        let reservation = sqlx::query_as::<_, Reservation>(
            "SELECT * FROM reservations WHERE id = $1 FOR UPDATE",
        )
        .bind(payment.reservation_id)
        .fetch_one(&mut *tx)
        .await?;
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
            .bind(payment.id)
            .fetch_one(&mut *tx)
            .await?;

        if payment.status == PaymentStatus::Completed {
            info!(
                "replayed confirmation for payment {}; already completed",
                payment.id
            );
            return Ok(());
        }
        if payment.status == PaymentStatus::Refunded {
            warn!(
                "confirmation for refunded payment {}; acknowledging without change",
                payment.id
            );
            return Ok(());
        }
        if reservation.status.is_terminal() {
            warn!(
                "confirmation for {} reservation {}; acknowledging without change",
                reservation.status, reservation.id
            );
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE payments
            SET status = 'completed', paid_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .execute(&mut *tx)
        .await?;
        if reservation.status == ReservationStatus::Pending {
            sqlx::query(
                "UPDATE reservations SET status = 'paid', updated_at = now() WHERE id = $1",
            )
            .bind(reservation.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(
            "payment {} completed; reservation {} is paid",
            payment.id, reservation.id
        );
        Ok(())
    }

    async fn apply_failure(&self, intent_id: &str) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'failed', updated_at = now()
            WHERE external_ref = $1 AND status = 'pending'
            "#,
        )
        .bind(intent_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if updated.rows_affected() > 0 {
            info!("payment intent {} failed; reservation stays pending", intent_id);
        } else {
            debug!(
                "failure event for intent {} matched no pending payment; acknowledging",
                intent_id
            );
        }
        Ok(())
    }

    /// Fetches the payment attached to a reservation, visible to the owner or
    /// an admin.
    pub async fn get_for_reservation(
        &self,
        reservation_id: Uuid,
        actor: &Actor,
    ) -> Result<Payment, ServiceError> {
        let reservation = self.fetch_reservation(reservation_id).await?;
        if reservation.user_id != actor.user_id && !actor.is_admin {
            return Err(ServiceError::Forbidden {
                action: "view this payment",
            });
        }
        self.fetch_payment(reservation_id)
            .await?
            .ok_or(ServiceError::NotFound { resource: "payment" })
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

    async fn fetch_payment(&self, reservation_id: Uuid) -> Result<Option<Payment>, ServiceError> {
        let payment =
            sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE reservation_id = $1")
                .bind(reservation_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(payment)
    }
}
