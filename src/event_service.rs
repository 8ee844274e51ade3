//! Event provisioning: the thin surface organizers use to create and publish
//! events. Availability mutations stay out of here; they belong to the
//! inventory ledger.

use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{Actor, CreateEventRequest, Event, EventStatus, ListEventsQuery};

pub struct EventService {
    pool: PgPool,
}

impl EventService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a draft event with the full ticket allotment available.
    pub async fn create(
        &self,
        organizer_id: Uuid,
        req: &CreateEventRequest,
    ) -> Result<Event, ServiceError> {
        if req.ends_at <= req.starts_at {
            return Err(ServiceError::InvalidInput {
                field: "ends_at",
                message: "must be after starts_at".to_string(),
            });
        }

        let event = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO events
                (id, organizer_id, title, location, status, total_tickets,
                 available_tickets, ticket_price, starts_at, ends_at)
            VALUES ($1, $2, $3, $4, 'draft', $5, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(organizer_id)
        .bind(&req.title)
        .bind(&req.location)
        .bind(req.total_tickets)
        .bind(req.ticket_price)
        .bind(req.starts_at)
        .bind(req.ends_at)
        .fetch_one(&self.pool)
        .await?;

        info!("event {} created by organizer {}", event.id, organizer_id);
        Ok(event)
    }

    /// Publishes a draft event, opening it for reservations.
    pub async fn publish(&self, event_id: Uuid, actor: &Actor) -> Result<Event, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1 FOR UPDATE")
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ServiceError::NotFound { resource: "event" })?;

        if event.organizer_id != actor.user_id && !actor.is_admin {
            return Err(ServiceError::Forbidden {
                action: "publish this event",
            });
        }
        if event.status != EventStatus::Draft {
            return Err(ServiceError::InvalidState(format!(
                "only draft events can be published (status: {})",
                event.status
            )));
        }

        let published = sqlx::query_as::<_, Event>(
            "UPDATE events SET status = 'published', updated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(event_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("event {} published", event_id);
        Ok(published)
    }

    pub async fn get(&self, event_id: Uuid) -> Result<Event, ServiceError> {
        sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ServiceError::NotFound { resource: "event" })
    }

    /// Lists published events, soonest first.
    pub async fn list_published(&self, query: &ListEventsQuery) -> Result<Vec<Event>, ServiceError> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(20).clamp(1, 100);
        let offset = (page - 1) * limit;

        let events = sqlx::query_as::<_, Event>(
            r#"
            SELECT * FROM events
            WHERE status = 'published'
            ORDER BY starts_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
