//! Fire-and-forget notification dispatch.
//!
//! Business transactions never wait on a notification and never roll back
//! because one failed. Services push onto a bounded channel with `try_send`;
//! a background worker drains the channel and hands each message to the
//! configured `Notifier`. Every failure path here is log-only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::ComplaintStatus;

/// Outbound notification payloads. Template rendering is the relay's
/// concern; we only ship the facts.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    ReservationConfirmation {
        recipient_email: String,
        first_name: String,
        event_title: String,
        reservation_code: String,
        ticket_count: i32,
        total_amount: i64,
        event_date: DateTime<Utc>,
        event_location: String,
    },
    ReservationCancellation {
        recipient_email: String,
        first_name: String,
        event_title: String,
        reservation_code: String,
        ticket_count: i32,
        total_amount: i64,
        event_date: DateTime<Utc>,
        event_location: String,
    },
    ComplaintResponse {
        recipient_email: String,
        first_name: String,
        event_title: String,
        status: ComplaintStatus,
        admin_response: String,
        refund_amount: Option<i64>,
    },
}

impl Notification {
    fn kind(&self) -> &'static str {
        match self {
            Self::ReservationConfirmation { .. } => "reservation_confirmation",
            Self::ReservationCancellation { .. } => "reservation_cancellation",
            Self::ComplaintResponse { .. } => "complaint_response",
        }
    }
}

/// Delivery backend for notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Cheap clonable handle that services use to enqueue notifications.
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<Notification>,
}

impl NotificationSender {
    /// Creates the bounded queue; the receiver goes to `spawn_worker`.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueues without blocking. A full or closed queue drops the message
    /// with a warning; the caller's transaction has already committed.
    pub fn dispatch(&self, notification: Notification) {
        let kind = notification.kind();
        if let Err(e) = self.tx.try_send(notification) {
            warn!("dropping {} notification: {}", kind, e);
        }
    }
}

/// Drains the queue until every sender is gone.
pub fn spawn_worker(
    mut rx: mpsc::Receiver<Notification>,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            if let Err(e) = notifier.send(&notification).await {
                warn!(
                    "failed to deliver {} notification: {}",
                    notification.kind(),
                    e
                );
            }
        }
        info!("notification channel closed; worker exiting");
    })
}

/// Posts notifications as JSON to a relay endpoint. With no relay configured
/// it only logs, which keeps local development dependency-free.
pub struct HttpNotifier {
    client: reqwest::Client,
    relay_url: Option<String>,
}

impl HttpNotifier {
    pub fn new(relay_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            relay_url,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        match &self.relay_url {
            Some(url) => {
                let response = self.client.post(url).json(notification).send().await?;
                if !response.status().is_success() {
                    anyhow::bail!("notification relay returned {}", response.status());
                }
                Ok(())
            }
            None => {
                info!("no notification relay configured; {} logged only", notification.kind());
                Ok(())
            }
        }
    }
}
