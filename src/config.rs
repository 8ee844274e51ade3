//! Environment-driven configuration

use std::env;

use anyhow::Context;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_PROVIDER_URL: &str = "https://api.stripe.com";
const DEFAULT_CURRENCY: &str = "usd";
const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub provider_base_url: String,
    pub provider_secret_key: String,
    pub currency: String,
    pub webhook_secret: Option<String>,
    pub notification_relay_url: Option<String>,
    pub notification_queue_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().context("PORT must be a number")?,
            Err(_) => DEFAULT_PORT,
        };

        let provider_base_url =
            env::var("PAYMENT_PROVIDER_URL").unwrap_or_else(|_| DEFAULT_PROVIDER_URL.to_string());
        let provider_secret_key = env::var("PAYMENT_PROVIDER_SECRET_KEY").unwrap_or_default();
        let currency = env::var("PAYMENT_CURRENCY")
            .unwrap_or_else(|_| DEFAULT_CURRENCY.to_string())
            .to_lowercase();

        let webhook_secret = env::var("WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let notification_relay_url = env::var("NOTIFICATION_RELAY_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let notification_queue_capacity = match env::var("NOTIFICATION_QUEUE_CAPACITY") {
            Ok(raw) => raw
                .parse()
                .context("NOTIFICATION_QUEUE_CAPACITY must be a number")?,
            Err(_) => DEFAULT_NOTIFICATION_QUEUE_CAPACITY,
        };

        Ok(Self {
            database_url,
            port,
            provider_base_url,
            provider_secret_key,
            currency,
            webhook_secret,
            notification_relay_url,
            notification_queue_capacity,
        })
    }
}
