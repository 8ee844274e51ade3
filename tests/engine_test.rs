//! End-to-end consistency tests against a real Postgres database.
//!
//! Opt-in infrastructure tests: point `TEST_DATABASE_URL` at a disposable
//! database and run `cargo test -- --ignored`. Every test seeds its own
//! users and events, so the suite tolerates a shared database.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use ticketvault_server::complaint_service::ComplaintService;
use ticketvault_server::error::ServiceError;
use ticketvault_server::event_service::EventService;
use ticketvault_server::models::{
    Actor, ComplaintStatus, CreateEventRequest, CreateReservationRequest, CreateUserRequest,
    Event, Payment, PaymentStatus, ProviderWebhookData, ProviderWebhookEvent,
    ProviderWebhookObject, Reservation, ReservationStatus, ResolveComplaintRequest,
    SubmitComplaintRequest, UpdateComplaintStatusRequest, UpdateReservationRequest, User,
};
use ticketvault_server::notifications::{Notification, NotificationSender};
use ticketvault_server::payment_provider::{PaymentIntent, PaymentProvider, ProviderRefund};
use ticketvault_server::payment_service::PaymentService;
use ticketvault_server::reservation_service::ReservationService;
use ticketvault_server::user_service::UserService;

/// Recording in-memory provider: every call succeeds unless told otherwise.
struct FakeProvider {
    intents: AtomicU32,
    refunds: AtomicU32,
}

impl FakeProvider {
    fn new() -> Self {
        Self {
            intents: AtomicU32::new(0),
            refunds: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_intent(
        &self,
        _amount_minor: i64,
        _currency: &str,
        reservation_id: Uuid,
    ) -> anyhow::Result<PaymentIntent> {
        let n = self.intents.fetch_add(1, Ordering::SeqCst);
        let id = format!("pi_test_{n}_{reservation_id}");
        Ok(PaymentIntent {
            client_secret: Some(format!("{id}_secret")),
            status: "requires_payment_method".to_string(),
            id,
        })
    }

    async fn retrieve_intent(&self, intent_id: &str) -> anyhow::Result<PaymentIntent> {
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            client_secret: Some(format!("{intent_id}_secret")),
            status: "requires_payment_method".to_string(),
        })
    }

    async fn refund(
        &self,
        intent_id: &str,
        _amount_minor: Option<i64>,
    ) -> anyhow::Result<ProviderRefund> {
        self.refunds.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderRefund {
            id: format!("re_{intent_id}"),
            status: "succeeded".to_string(),
        })
    }
}

struct Harness {
    pool: PgPool,
    provider: Arc<FakeProvider>,
    users: UserService,
    events: EventService,
    reservations: ReservationService,
    payments: PaymentService,
    complaints: ComplaintService,
    // Keeps the queue open so dispatch is not a closed-channel warning.
    _notifications: mpsc::Receiver<Notification>,
}

impl Harness {
    async fn new() -> Arc<Self> {
        let url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL not set - point it at a disposable Postgres database");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&url)
            .await
            .expect("connect to test database");
        sqlx::migrate!().run(&pool).await.expect("run migrations");

        let provider = Arc::new(FakeProvider::new());
        let (sender, receiver) = NotificationSender::new(64);
        let dyn_provider: Arc<dyn PaymentProvider> = provider.clone();

        Arc::new(Self {
            users: UserService::new(pool.clone()),
            events: EventService::new(pool.clone()),
            reservations: ReservationService::new(
                pool.clone(),
                dyn_provider.clone(),
                sender.clone(),
            ),
            payments: PaymentService::new(pool.clone(), dyn_provider.clone(), "usd".to_string()),
            complaints: ComplaintService::new(pool.clone(), dyn_provider, sender),
            pool,
            provider,
            _notifications: receiver,
        })
    }

    async fn seed_user(&self) -> User {
        self.users
            .create(&CreateUserRequest {
                email: format!("{}@example.com", Uuid::new_v4()),
                first_name: "Test".to_string(),
                last_name: "User".to_string(),
                role: None,
            })
            .await
            .expect("seed user")
    }

    /// Creates and publishes an event a week out.
    async fn seed_event(&self, total_tickets: i32, ticket_price: i64) -> Event {
        let organizer = self.seed_user().await;
        let starts_at = Utc::now() + Duration::days(7);
        let event = self
            .events
            .create(
                organizer.id,
                &CreateEventRequest {
                    title: "Engine Test Night".to_string(),
                    location: "Test Hall".to_string(),
                    total_tickets,
                    ticket_price,
                    starts_at,
                    ends_at: starts_at + Duration::hours(3),
                },
            )
            .await
            .expect("seed event");
        self.events
            .publish(event.id, &actor(organizer.id))
            .await
            .expect("publish event")
    }

    async fn reserve(&self, user: &User, event: &Event, count: i32) -> Reservation {
        self.reservations
            .create(
                user.id,
                &CreateReservationRequest {
                    event_id: event.id,
                    ticket_count: count,
                },
            )
            .await
            .expect("create reservation")
    }

    /// Runs the intent + success-webhook path, returning the intent id.
    async fn pay(&self, user: &User, reservation: &Reservation) -> String {
        self.payments
            .create_intent(reservation.id, &actor(user.id))
            .await
            .expect("create intent");
        let intent_id = self
            .payment_row(reservation.id)
            .await
            .external_ref
            .expect("intent attached");
        self.payments
            .confirm(&webhook("payment_intent.succeeded", &intent_id))
            .await
            .expect("confirm payment");
        intent_id
    }

    async fn event_row(&self, event_id: Uuid) -> Event {
        sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await
            .expect("fetch event")
    }

    async fn reservation_row(&self, reservation_id: Uuid) -> Reservation {
        sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE id = $1")
            .bind(reservation_id)
            .fetch_one(&self.pool)
            .await
            .expect("fetch reservation")
    }

    async fn payment_row(&self, reservation_id: Uuid) -> Payment {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE reservation_id = $1")
            .bind(reservation_id)
            .fetch_one(&self.pool)
            .await
            .expect("fetch payment")
    }
}

fn actor(user_id: Uuid) -> Actor {
    Actor {
        user_id,
        is_admin: false,
    }
}

fn admin(user_id: Uuid) -> Actor {
    Actor {
        user_id,
        is_admin: true,
    }
}

fn webhook(event_type: &str, intent_id: &str) -> ProviderWebhookEvent {
    ProviderWebhookEvent {
        event_type: event_type.to_string(),
        data: ProviderWebhookData {
            object: ProviderWebhookObject {
                id: intent_id.to_string(),
            },
        },
    }
}

#[tokio::test]
#[ignore]
async fn concurrent_reservations_never_oversell() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 2500).await;
    let alice = h.seed_user().await;
    let bob = h.seed_user().await;

    let (a, b) = {
        let (ha, hb) = (h.clone(), h.clone());
        let (event_a, event_b) = (event.clone(), event.clone());
        let ta = tokio::spawn(async move {
            ha.reservations
                .create(
                    alice.id,
                    &CreateReservationRequest {
                        event_id: event_a.id,
                        ticket_count: 6,
                    },
                )
                .await
        });
        let tb = tokio::spawn(async move {
            hb.reservations
                .create(
                    bob.id,
                    &CreateReservationRequest {
                        event_id: event_b.id,
                        ticket_count: 5,
                    },
                )
                .await
        });
        (ta.await.unwrap(), tb.await.unwrap())
    };

    // 6 + 5 > 10: exactly one side wins, whichever locked the row first.
    let winner_count = match (&a, &b) {
        (Ok(r), Err(ServiceError::InsufficientInventory { .. })) => r.ticket_count,
        (Err(ServiceError::InsufficientInventory { .. }), Ok(r)) => r.ticket_count,
        other => panic!("expected one success and one insufficient-inventory: {other:?}"),
    };
    let event = h.event_row(event.id).await;
    assert_eq!(event.available_tickets, 10 - winner_count);
}

#[tokio::test]
#[ignore]
async fn oversell_stress_stops_exactly_at_zero() {
    let h = Harness::new().await;
    let event = h.seed_event(20, 1000).await;

    let mut tasks = Vec::new();
    for _ in 0..30 {
        let h = h.clone();
        let event_id = event.id;
        tasks.push(tokio::spawn(async move {
            let user = h.seed_user().await;
            h.reservations
                .create(
                    user.id,
                    &CreateReservationRequest {
                        event_id,
                        ticket_count: 1,
                    },
                )
                .await
        }));
    }

    let mut won = 0;
    let mut lost = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => won += 1,
            Err(ServiceError::InsufficientInventory { .. }) => lost += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 20);
    assert_eq!(lost, 10);
    assert_eq!(h.event_row(event.id).await.available_tickets, 0);
}

#[tokio::test]
#[ignore]
async fn free_events_skip_the_payment_gateway() {
    let h = Harness::new().await;
    let event = h.seed_event(50, 0).await;
    let user = h.seed_user().await;

    let reservation = h.reserve(&user, &event, 3).await;
    assert_eq!(reservation.status, ReservationStatus::Paid);
    assert_eq!(reservation.total_amount, 0);

    let payment = h.payment_row(reservation.id).await;
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.amount, 0);
    assert!(payment.paid_at.is_some());
    assert_eq!(h.provider.intents.load(Ordering::SeqCst), 0);

    let err = h
        .payments
        .create_intent(reservation.id, &actor(user.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::FreeEventNoPayment));
}

#[tokio::test]
#[ignore]
async fn webhook_confirmation_is_idempotent() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 2500).await;
    let user = h.seed_user().await;
    let reservation = h.reserve(&user, &event, 2).await;
    assert_eq!(reservation.status, ReservationStatus::Pending);

    let intent_id = h.pay(&user, &reservation).await;
    let first = h.payment_row(reservation.id).await;
    assert_eq!(first.status, PaymentStatus::Completed);
    assert_eq!(
        h.reservation_row(reservation.id).await.status,
        ReservationStatus::Paid
    );

    // Replay: acknowledged, nothing moves.
    h.payments
        .confirm(&webhook("payment_intent.succeeded", &intent_id))
        .await
        .unwrap();
    let second = h.payment_row(reservation.id).await;
    assert_eq!(second.status, PaymentStatus::Completed);
    assert_eq!(second.paid_at, first.paid_at);
}

#[tokio::test]
#[ignore]
async fn unknown_intents_are_acknowledged_without_mutation() {
    let h = Harness::new().await;
    h.payments
        .confirm(&webhook("payment_intent.succeeded", "pi_never_seen"))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn payment_failure_keeps_the_reservation_pending() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 2500).await;
    let user = h.seed_user().await;
    let reservation = h.reserve(&user, &event, 1).await;

    h.payments
        .create_intent(reservation.id, &actor(user.id))
        .await
        .unwrap();
    let intent_id = h.payment_row(reservation.id).await.external_ref.unwrap();
    h.payments
        .confirm(&webhook("payment_intent.payment_failed", &intent_id))
        .await
        .unwrap();

    assert_eq!(
        h.payment_row(reservation.id).await.status,
        PaymentStatus::Failed
    );
    // The customer can retry or cancel; the seats stay held.
    assert_eq!(
        h.reservation_row(reservation.id).await.status,
        ReservationStatus::Pending
    );
}

#[tokio::test]
#[ignore]
async fn cancelling_a_paid_reservation_refunds_and_restores_inventory() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 2500).await;
    let user = h.seed_user().await;
    let reservation = h.reserve(&user, &event, 4).await;
    h.pay(&user, &reservation).await;

    let cancelled = h
        .reservations
        .cancel(reservation.id, &actor(user.id))
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Refunded);
    assert_eq!(h.provider.refunds.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.payment_row(reservation.id).await.status,
        PaymentStatus::Refunded
    );
    assert_eq!(h.event_row(event.id).await.available_tickets, 10);

    let err = h
        .reservations
        .cancel(reservation.id, &actor(user.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyTerminal { .. }));
}

#[tokio::test]
#[ignore]
async fn cancelling_an_unpaid_reservation_lands_on_cancelled() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 2500).await;
    let user = h.seed_user().await;
    let reservation = h.reserve(&user, &event, 2).await;

    let cancelled = h
        .reservations
        .cancel(reservation.id, &actor(user.id))
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(h.provider.refunds.load(Ordering::SeqCst), 0);
    assert_eq!(h.event_row(event.id).await.available_tickets, 10);
}

#[tokio::test]
#[ignore]
async fn refund_applies_exactly_once_across_sibling_complaints() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 2500).await;
    let user = h.seed_user().await;
    let staff = h.seed_user().await;
    let reservation = h.reserve(&user, &event, 4).await;
    h.pay(&user, &reservation).await;

    let first = h
        .complaints
        .submit(
            user.id,
            &SubmitComplaintRequest {
                reservation_id: reservation.id,
                reason: "event_misrepresented".to_string(),
                description: "Not what was advertised".to_string(),
            },
        )
        .await
        .unwrap();
    let second = h
        .complaints
        .submit(
            user.id,
            &SubmitComplaintRequest {
                reservation_id: reservation.id,
                reason: "venue_unsafe".to_string(),
                description: "Blocked fire exits".to_string(),
            },
        )
        .await
        .unwrap();

    let resolved = h
        .complaints
        .resolve(
            first.id,
            &ResolveComplaintRequest {
                admin_response: "Refund approved.".to_string(),
                should_refund: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, ComplaintStatus::Resolved);
    assert!(resolved.refund_issued);

    // One provider call, one ledger correction, one inventory release.
    assert_eq!(h.provider.refunds.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.payment_row(reservation.id).await.status,
        PaymentStatus::Refunded
    );
    assert_eq!(
        h.reservation_row(reservation.id).await.status,
        ReservationStatus::Refunded
    );
    assert_eq!(h.event_row(event.id).await.available_tickets, 10);

    // The sibling was closed together with the refund.
    let sibling = h.complaints.get(second.id, &admin(staff.id)).await.unwrap();
    assert_eq!(sibling.status, ComplaintStatus::Resolved);
    assert!(sibling.refund_issued);
    assert!(sibling.admin_response.is_some());

    // Resolving it again with a refund stays a single provider refund.
    h.complaints
        .resolve(
            second.id,
            &ResolveComplaintRequest {
                admin_response: "Already refunded with your other complaint.".to_string(),
                should_refund: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(h.provider.refunds.load(Ordering::SeqCst), 1);
    assert_eq!(h.event_row(event.id).await.available_tickets, 10);
}

#[tokio::test]
#[ignore]
async fn refund_resolution_rejects_cancelled_reservations() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 2500).await;
    let bystander = h.seed_user().await;
    let user = h.seed_user().await;
    let staff = h.seed_user().await;

    // Another reservation is outstanding, so a double release would create
    // phantom availability that could be oversold.
    h.reserve(&bystander, &event, 4).await;
    let reservation = h.reserve(&user, &event, 2).await;
    h.payments
        .create_intent(reservation.id, &actor(user.id))
        .await
        .unwrap();
    let cancelled = h
        .reservations
        .cancel(reservation.id, &actor(user.id))
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(h.event_row(event.id).await.available_tickets, 6);

    let complaint = h
        .complaints
        .submit(
            user.id,
            &SubmitComplaintRequest {
                reservation_id: reservation.id,
                reason: "billing_error".to_string(),
                description: "Want my money back anyway".to_string(),
            },
        )
        .await
        .unwrap();
    let err = h
        .complaints
        .resolve(
            complaint.id,
            &ResolveComplaintRequest {
                admin_response: "Refund approved.".to_string(),
                should_refund: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidState(_)));

    // The terminal state stands and the tickets were not released twice.
    assert_eq!(
        h.reservation_row(reservation.id).await.status,
        ReservationStatus::Cancelled
    );
    assert_eq!(h.event_row(event.id).await.available_tickets, 6);
    assert_eq!(h.provider.refunds.load(Ordering::SeqCst), 0);
    let complaint = h.complaints.get(complaint.id, &admin(staff.id)).await.unwrap();
    assert_eq!(complaint.status, ComplaintStatus::Submitted);
    assert!(!complaint.refund_issued);
}

#[tokio::test]
#[ignore]
async fn refund_resolution_rejects_uncaptured_payments() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 2500).await;
    let user = h.seed_user().await;
    let reservation = h.reserve(&user, &event, 2).await;
    h.payments
        .create_intent(reservation.id, &actor(user.id))
        .await
        .unwrap();

    let complaint = h
        .complaints
        .submit(
            user.id,
            &SubmitComplaintRequest {
                reservation_id: reservation.id,
                reason: "changed_mind".to_string(),
                description: "Never paid, want a refund regardless".to_string(),
            },
        )
        .await
        .unwrap();
    let err = h
        .complaints
        .resolve(
            complaint.id,
            &ResolveComplaintRequest {
                admin_response: "Refund approved.".to_string(),
                should_refund: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidState(_)));

    // No money was collected, so none moves back.
    assert_eq!(h.provider.refunds.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.payment_row(reservation.id).await.status,
        PaymentStatus::Pending
    );
    assert_eq!(
        h.reservation_row(reservation.id).await.status,
        ReservationStatus::Pending
    );
    assert_eq!(h.event_row(event.id).await.available_tickets, 8);
}

#[tokio::test]
#[ignore]
async fn refunded_complaints_cannot_return_to_review() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 2500).await;
    let user = h.seed_user().await;
    let reservation = h.reserve(&user, &event, 1).await;
    h.pay(&user, &reservation).await;

    let complaint = h
        .complaints
        .submit(
            user.id,
            &SubmitComplaintRequest {
                reservation_id: reservation.id,
                reason: "billing_error".to_string(),
                description: "Charged twice".to_string(),
            },
        )
        .await
        .unwrap();
    h.complaints
        .resolve(
            complaint.id,
            &ResolveComplaintRequest {
                admin_response: "Refunded.".to_string(),
                should_refund: true,
            },
        )
        .await
        .unwrap();

    for status in [ComplaintStatus::Submitted, ComplaintStatus::InReview] {
        let err = h
            .complaints
            .update_status(
                complaint.id,
                &UpdateComplaintStatusRequest {
                    status,
                    admin_response: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }
}

#[tokio::test]
#[ignore]
async fn free_reservations_cannot_be_refunded_through_complaints() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 0).await;
    let user = h.seed_user().await;
    let staff = h.seed_user().await;
    let reservation = h.reserve(&user, &event, 2).await;

    let complaint = h
        .complaints
        .submit(
            user.id,
            &SubmitComplaintRequest {
                reservation_id: reservation.id,
                reason: "event_cancelled".to_string(),
                description: "Nothing happened at the venue".to_string(),
            },
        )
        .await
        .unwrap();
    let err = h
        .complaints
        .resolve(
            complaint.id,
            &ResolveComplaintRequest {
                admin_response: "Refund approved.".to_string(),
                should_refund: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CannotRefundFreeEvent));

    // Nothing moved: complaint open, reservation untouched.
    let complaint = h.complaints.get(complaint.id, &admin(staff.id)).await.unwrap();
    assert_eq!(complaint.status, ComplaintStatus::Submitted);
    assert!(!complaint.refund_issued);
    assert_eq!(
        h.reservation_row(reservation.id).await.status,
        ReservationStatus::Paid
    );
    assert_eq!(h.provider.refunds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[ignore]
async fn updating_ticket_count_moves_inventory_both_ways() {
    let h = Harness::new().await;
    let event = h.seed_event(10, 1000).await;
    let user = h.seed_user().await;
    let reservation = h.reserve(&user, &event, 2).await;
    assert_eq!(h.event_row(event.id).await.available_tickets, 8);

    let grown = h
        .reservations
        .update(
            reservation.id,
            &actor(user.id),
            &UpdateReservationRequest { ticket_count: 5 },
        )
        .await
        .unwrap();
    assert_eq!(grown.ticket_count, 5);
    assert_eq!(grown.total_amount, 5000);
    assert_eq!(h.event_row(event.id).await.available_tickets, 5);

    let shrunk = h
        .reservations
        .update(
            reservation.id,
            &actor(user.id),
            &UpdateReservationRequest { ticket_count: 1 },
        )
        .await
        .unwrap();
    assert_eq!(shrunk.ticket_count, 1);
    assert_eq!(shrunk.total_amount, 1000);
    assert_eq!(h.event_row(event.id).await.available_tickets, 9);

    let err = h
        .reservations
        .update(
            reservation.id,
            &actor(user.id),
            &UpdateReservationRequest { ticket_count: 11 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientInventory { .. }));
    assert_eq!(h.event_row(event.id).await.available_tickets, 9);
}
