//! Refund and complaint resolution engine.
//!
//! Two flows end up here: complaint resolution and (via `reverse_payment`)
//! reservation cancellation of a captured payment. Compensation is
//! exactly-once: the provider call is guarded by the payment status, the
//! internal bookkeeping only applies when the payment was not already
//! refunded, and resolving one complaint with a refund force-resolves every
//! other open complaint on the same reservation so siblings cannot trigger a
//! second refund.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::inventory;
use crate::models::{
    Actor, Complaint, ComplaintStatus, ListComplaintsQuery, Payment, PaymentStatus,
    ResolveComplaintRequest, Reservation, ReservationStatus, SubmitComplaintRequest,
    UpdateComplaintStatusRequest,
};
use crate::notifications::{Notification, NotificationSender};
use crate::payment_provider::PaymentProvider;

const SIBLING_RESOLUTION_NOTE: &str =
    "A refund has been issued for this reservation; this complaint was closed together with it.";

/// Reverses a captured payment with the external provider.
///
/// The internal ledger correction takes priority over provider-side
/// confirmation: the money-movement authority is external, but seat inventory
/// is ours. Provider errors and timeouts are therefore logged for manual
/// reconciliation and never stop the caller. Already-refunded payments skip
/// the provider call entirely, which makes retries safe.
pub async fn reverse_payment(
    provider: &dyn PaymentProvider,
    payment: &Payment,
) -> Result<(), ServiceError> {
    if payment.amount == 0 {
        return Err(ServiceError::CannotRefundFreeEvent);
    }
    if payment.status == PaymentStatus::Refunded {
        info!(
            "payment {} already refunded; skipping provider call",
            payment.id
        );
        return Ok(());
    }
    match &payment.external_ref {
        Some(intent_id) => match provider.refund(intent_id, Some(payment.amount)).await {
            Ok(refund) => info!(
                "provider refund {} ({}) for payment {}",
                refund.id, refund.status, payment.id
            ),
            Err(e) => warn!(
                "provider refund failed for payment {}; proceeding with internal \
                 correction, flag for manual reconciliation: {}",
                payment.id, e
            ),
        },
        None => warn!(
            "payment {} has no provider reference; refunding internally only",
            payment.id
        ),
    }
    Ok(())
}

/// Complaint service for dispute intake and resolution
pub struct ComplaintService {
    pool: PgPool,
    provider: Arc<dyn PaymentProvider>,
    notifications: NotificationSender,
}

impl ComplaintService {
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

    /// Files a complaint against the caller's own reservation.
    pub async fn submit(
        &self,
        user_id: Uuid,
        req: &SubmitComplaintRequest,
    ) -> Result<Complaint, ServiceError> {
        let reservation = sqlx::query_as::<_, Reservation>(
            "SELECT * FROM reservations WHERE id = $1",
        )
        .bind(req.reservation_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ServiceError::NotFound {
            resource: "reservation",
        })?;
        if reservation.user_id != user_id {
            return Err(ServiceError::Forbidden {
                action: "complain about this reservation",
            });
        }

        let complaint = sqlx::query_as::<_, Complaint>(
            r#"
            INSERT INTO complaints (id, reservation_id, user_id, reason, description)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(req.reservation_id)
        .bind(user_id)
        .bind(&req.reason)
        .bind(&req.description)
        .fetch_one(&self.pool)
        .await?;

        info!(
            "complaint {} submitted for reservation {}",
            complaint.id, req.reservation_id
        );
        Ok(complaint)
    }

    /// Resolves a complaint, optionally issuing a refund.
    ///
    /// With `should_refund`, the payment must be captured and the reservation
    /// still live (see `refund_precheck`); then the provider reversal runs
    /// first (outside the transaction), and one transaction resolves the
    /// complaint with `refund_issued = true` and, when the refund bookkeeping
    /// has not been applied yet, flips the payment and reservation to
    /// `refunded`, returns the tickets to the event, and force-resolves
    /// sibling complaints.
    pub async fn resolve(
        &self,
        complaint_id: Uuid,
        req: &ResolveComplaintRequest,
    ) -> Result<Complaint, ServiceError> {
        let case = self.fetch_case(complaint_id).await?;
        let payment = case.payment();

        if req.should_refund {
            let payment = refund_precheck(case.r_status, payment.as_ref())?;
            reverse_payment(self.provider.as_ref(), payment).await?;
        }

        let mut tx = self.pool.begin().await?;
        let resolved = if req.should_refund {
            self.apply_refund_resolution(&mut tx, &case, &req.admin_response)
                .await?
        } else {
            sqlx::query_as::<_, Complaint>(
                r#"
                UPDATE complaints
                SET status = 'resolved', admin_response = $2, resolved_at = now(),
                    updated_at = now()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(complaint_id)
            .bind(&req.admin_response)
            .fetch_one(&mut *tx)
            .await?
        };
        tx.commit().await?;

        info!(
            "complaint {} resolved (refund: {})",
            complaint_id, req.should_refund
        );
        let refund_amount = if req.should_refund {
            payment.map(|p| p.amount)
        } else {
            None
        };
        self.send_response_notice(&resolved, refund_amount).await;
        Ok(resolved)
    }

    /// Administrative status edit that never moves money.
    ///
    /// A complaint whose refund was issued can no longer return to
    /// `submitted` or `in_review`: the money already moved and the history is
    /// immutable going forward.
    pub async fn update_status(
        &self,
        complaint_id: Uuid,
        req: &UpdateComplaintStatusRequest,
    ) -> Result<Complaint, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let complaint = lock_complaint(&mut tx, complaint_id).await?;

        if complaint.refund_issued
            && matches!(
                req.status,
                ComplaintStatus::Submitted | ComplaintStatus::InReview
            )
        {
            return Err(ServiceError::InvalidState(
                "refund cannot be reversed: this complaint cannot return to review".to_string(),
            ));
        }

        let terminal = matches!(
            req.status,
            ComplaintStatus::Rejected | ComplaintStatus::Resolved
        );
        let updated = sqlx::query_as::<_, Complaint>(
            r#"
            UPDATE complaints
            SET status = $2,
                admin_response = COALESCE($3, admin_response),
                resolved_at = CASE WHEN $4 THEN COALESCE(resolved_at, now()) ELSE NULL END,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(complaint_id)
        .bind(req.status)
        .bind(&req.admin_response)
        .bind(terminal)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Fetches a complaint, visible to its author or an admin.
    pub async fn get(&self, complaint_id: Uuid, actor: &Actor) -> Result<Complaint, ServiceError> {
        let complaint =
            sqlx::query_as::<_, Complaint>("SELECT * FROM complaints WHERE id = $1")
                .bind(complaint_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(ServiceError::NotFound {
                    resource: "complaint",
                })?;
        if complaint.user_id != actor.user_id && !actor.is_admin {
            return Err(ServiceError::Forbidden {
                action: "view this complaint",
            });
        }
        Ok(complaint)
    }

    /// Lists complaints with filtering and pagination (admin view).
    pub async fn list(&self, query: &ListComplaintsQuery) -> Result<Vec<Complaint>, ServiceError> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(20).clamp(1, 100);
        let offset = (page - 1) * limit;

        let mut builder: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("SELECT * FROM complaints WHERE 1=1");
        if let Some(status) = query.status {
            builder.push(" AND status = ");
            builder.push_bind(status);
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(i64::from(limit));
        builder.push(" OFFSET ");
        builder.push_bind(i64::from(offset));

        let complaints = builder
            .build_query_as::<Complaint>()
            .fetch_all(&self.pool)
            .await?;
        Ok(complaints)
    }

    // ===== Private helpers =====

    async fn apply_refund_resolution(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        case: &ComplaintCase,
        admin_response: &str,
    ) -> Result<Complaint, ServiceError> {
        // Lock order everywhere: reservation, then payment, then event.
        let reservation = sqlx::query_as::<_, Reservation>(
            "SELECT * FROM reservations WHERE id = $1 FOR UPDATE",
        )
        .bind(case.reservation_id)
        .fetch_one(&mut **tx)
        .await?;
        let payment =
            sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE reservation_id = $1 FOR UPDATE")
                .bind(case.reservation_id)
                .fetch_optional(&mut **tx)
                .await?
                .ok_or(ServiceError::NotFound { resource: "payment" })?;
        // Re-check on the locked rows: the pre-check read was unlocked.
        let bookkeeping_done =
            payment.status == PaymentStatus::Refunded || reservation.status.is_terminal();

        let resolved = sqlx::query_as::<_, Complaint>(
            r#"
            UPDATE complaints
            SET status = 'resolved', refund_issued = TRUE, admin_response = $2,
                resolved_at = now(), updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(case.id)
        .bind(admin_response)
        .fetch_one(&mut **tx)
        .await?;

        if bookkeeping_done {
            info!(
                "reservation {} is already {}; complaint {} resolved without new bookkeeping",
                case.reservation_id, reservation.status, case.id
            );
            return Ok(resolved);
        }

        sqlx::query("UPDATE payments SET status = 'refunded', updated_at = now() WHERE id = $1")
            .bind(payment.id)
            .execute(&mut **tx)
            .await?;
        sqlx::query(
            "UPDATE reservations SET status = 'refunded', updated_at = now() WHERE id = $1",
        )
        .bind(case.reservation_id)
        .execute(&mut **tx)
        .await?;
        inventory::release(tx, case.r_event_id, case.r_ticket_count).await?;

        let siblings = sqlx::query(
            r#"
            UPDATE complaints
            SET status = 'resolved', refund_issued = TRUE, admin_response = $3,
                resolved_at = now(), updated_at = now()
            WHERE reservation_id = $1 AND id <> $2
              AND status IN ('submitted', 'in_review')
            "#,
        )
        .bind(case.reservation_id)
        .bind(case.id)
        .bind(SIBLING_RESOLUTION_NOTE)
        .execute(&mut **tx)
        .await?;
        if siblings.rows_affected() > 0 {
            info!(
                "force-resolved {} sibling complaints for reservation {}",
                siblings.rows_affected(),
                case.reservation_id
            );
        }
        Ok(resolved)
    }

    /// Loads complaint + reservation + payment in one read.
    async fn fetch_case(&self, complaint_id: Uuid) -> Result<ComplaintCase, ServiceError> {
        sqlx::query_as::<_, ComplaintCase>(
            r#"
            SELECT c.id, c.reservation_id,
                   r.event_id AS r_event_id, r.ticket_count AS r_ticket_count,
                   r.status AS r_status,
                   p.id AS p_id, p.amount AS p_amount, p.status AS p_status,
                   p.external_ref AS p_external_ref, p.paid_at AS p_paid_at,
                   p.created_at AS p_created_at, p.updated_at AS p_updated_at
            FROM complaints c
            JOIN reservations r ON r.id = c.reservation_id
            LEFT JOIN payments p ON p.reservation_id = r.id
            WHERE c.id = $1
            "#,
        )
        .bind(complaint_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ServiceError::NotFound {
            resource: "complaint",
        })
    }

    async fn send_response_notice(&self, complaint: &Complaint, refund_amount: Option<i64>) {
        let recipient = sqlx::query_as::<_, (String, String, String)>(
            r#"
            SELECT u.email, u.first_name, e.title
            FROM complaints c
            JOIN users u ON u.id = c.user_id
            JOIN reservations r ON r.id = c.reservation_id
            JOIN events e ON e.id = r.event_id
            WHERE c.id = $1
            "#,
        )
        .bind(complaint.id)
        .fetch_optional(&self.pool)
        .await;
        match recipient {
            Ok(Some((email, first_name, event_title))) => {
                self.notifications.dispatch(Notification::ComplaintResponse {
                    recipient_email: email,
                    first_name,
                    event_title,
                    status: complaint.status,
                    admin_response: complaint.admin_response.clone().unwrap_or_default(),
                    refund_amount,
                });
            }
            Ok(None) => warn!(
                "no recipient found for complaint {} response notice",
                complaint.id
            ),
            Err(e) => warn!(
                "could not load recipient for complaint {} response notice: {}",
                complaint.id, e
            ),
        }
    }
}

/// Money only moves for money that was collected: the refund path requires a
/// captured payment and a reservation that is still live (or already refunded,
/// in which case the provider call and the bookkeeping are both skipped
/// downstream). Anything else is a state-machine violation, not a refund.
fn refund_precheck(
    reservation_status: ReservationStatus,
    payment: Option<&Payment>,
) -> Result<&Payment, ServiceError> {
    let payment = payment
        .filter(|p| p.amount > 0)
        .ok_or(ServiceError::CannotRefundFreeEvent)?;
    match payment.status {
        PaymentStatus::Completed | PaymentStatus::Refunded => {}
        other => {
            return Err(ServiceError::InvalidState(format!(
                "only captured payments can be refunded (payment status: {other})"
            )))
        }
    }
    if reservation_status.is_terminal() && payment.status != PaymentStatus::Refunded {
        return Err(ServiceError::InvalidState(format!(
            "reservation is already {reservation_status}; there is nothing to refund"
        )));
    }
    Ok(payment)
}

/// Flattened complaint + reservation + payment join.
#[derive(Debug, sqlx::FromRow)]
struct ComplaintCase {
    id: Uuid,
    reservation_id: Uuid,
    r_event_id: Uuid,
    r_ticket_count: i32,
    r_status: ReservationStatus,
    p_id: Option<Uuid>,
    p_amount: Option<i64>,
    p_status: Option<PaymentStatus>,
    p_external_ref: Option<String>,
    p_paid_at: Option<DateTime<Utc>>,
    p_created_at: Option<DateTime<Utc>>,
    p_updated_at: Option<DateTime<Utc>>,
}

impl ComplaintCase {
    fn payment(&self) -> Option<Payment> {
        let id = self.p_id?;
        Some(Payment {
            id,
            reservation_id: self.reservation_id,
            amount: self.p_amount.unwrap_or(0),
            status: self.p_status.unwrap_or(PaymentStatus::Pending),
            external_ref: self.p_external_ref.clone(),
            paid_at: self.p_paid_at,
            created_at: self.p_created_at.unwrap_or_else(Utc::now),
            updated_at: self.p_updated_at.unwrap_or_else(Utc::now),
        })
    }
}

async fn lock_complaint(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Complaint, ServiceError> {
    sqlx::query_as::<_, Complaint>("SELECT * FROM complaints WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ServiceError::NotFound {
            resource: "complaint",
        })
}
