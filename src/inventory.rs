//! Inventory ledger: the single authority over an event's remaining tickets.
//!
//! Both operations run inside a caller-owned transaction and take a row-level
//! lock on the event, so concurrent reservations for the same event serialize
//! on the check-and-decrement instead of racing past a stale read. No other
//! code in this crate writes `available_tickets`.

use sqlx::{Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{Event, EventStatus};

/// Reserves `count` tickets for an event, decrementing availability.
///
/// Returns the event row as it was locked, so the caller can read the frozen
/// ticket price inside the same unit of work.
pub async fn reserve(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    count: i32,
) -> Result<Event, ServiceError> {
    let event = lock_event(tx, event_id).await?;

    if event.status != EventStatus::Published {
        return Err(ServiceError::EventNotReservable {
            status: event.status,
        });
    }
    if event.available_tickets < count {
        return Err(ServiceError::InsufficientInventory {
            requested: count,
            available: event.available_tickets,
        });
    }

    let updated = sqlx::query_as::<_, Event>(
        r#"
        UPDATE events
        SET available_tickets = available_tickets - $2, updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(event_id)
    .bind(count)
    .fetch_one(&mut **tx)
    .await?;

    debug!(
        "reserved {} tickets for event {} ({} left)",
        count, event_id, updated.available_tickets
    );

    Ok(updated)
}

/// Returns `count` previously reserved tickets to an event.
///
/// Never exceeds `total_tickets` because releases only ever return tickets
/// that `reserve` handed out.
pub async fn release(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    count: i32,
) -> Result<Event, ServiceError> {
    lock_event(tx, event_id).await?;

    let updated = sqlx::query_as::<_, Event>(
        r#"
        UPDATE events
        SET available_tickets = available_tickets + $2, updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(event_id)
    .bind(count)
    .fetch_one(&mut **tx)
    .await?;

    debug!(
        "released {} tickets for event {} ({} available)",
        count, event_id, updated.available_tickets
    );

    Ok(updated)
}

async fn lock_event(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
) -> Result<Event, ServiceError> {
    sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1 FOR UPDATE")
        .bind(event_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ServiceError::NotFound { resource: "event" })
}
