//! Payment provider collaborator.
//!
//! The engine never talks to the provider's wire format directly; it goes
//! through the `PaymentProvider` trait so tests can substitute a recording
//! fake. The production implementation speaks a Stripe-shaped REST API over
//! reqwest.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// How long a single provider call may take before we give up and let the
/// internal bookkeeping proceed without provider confirmation.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// A provider-side payment intent.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub status: String,
}

/// A provider-side refund.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRefund {
    pub id: String,
    pub status: String,
}

/// External payment provider operations used by the engine.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Creates an intent to collect `amount_minor` in `currency` for the
    /// given reservation.
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        reservation_id: Uuid,
    ) -> anyhow::Result<PaymentIntent>;

    /// Fetches an existing intent (used to reuse one intent per payment row).
    async fn retrieve_intent(&self, intent_id: &str) -> anyhow::Result<PaymentIntent>;

    /// Refunds a captured intent, fully when `amount_minor` is None.
    async fn refund(
        &self,
        intent_id: &str,
        amount_minor: Option<i64>,
    ) -> anyhow::Result<ProviderRefund>;
}

/// Stripe-shaped HTTP implementation.
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpPaymentProvider {
    pub fn new(base_url: String, secret_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key,
        })
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> anyhow::Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.secret_key)
            .form(params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("provider returned {status}: {body}");
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        reservation_id: Uuid,
    ) -> anyhow::Result<PaymentIntent> {
        let params = intent_params(amount_minor, currency, reservation_id);
        self.post_form("/v1/payment_intents", &params).await
    }

    async fn retrieve_intent(&self, intent_id: &str) -> anyhow::Result<PaymentIntent> {
        let response = self
            .client
            .get(format!("{}/v1/payment_intents/{}", self.base_url, intent_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("provider returned {status}: {body}");
        }
        Ok(response.json().await?)
    }

    async fn refund(
        &self,
        intent_id: &str,
        amount_minor: Option<i64>,
    ) -> anyhow::Result<ProviderRefund> {
        let mut params = vec![("payment_intent".to_string(), intent_id.to_string())];
        if let Some(amount) = amount_minor {
            params.push(("amount".to_string(), amount.to_string()));
        }
        self.post_form("/v1/refunds", &params).await
    }
}

fn intent_params(amount_minor: i64, currency: &str, reservation_id: Uuid) -> Vec<(String, String)> {
    vec![
        ("amount".to_string(), amount_minor.to_string()),
        ("currency".to_string(), currency.to_string()),
        (
            "metadata[reservation_id]".to_string(),
            reservation_id.to_string(),
        ),
    ]
}
