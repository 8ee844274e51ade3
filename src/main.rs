//! TicketVault Backend Server
//!
//! This is the main Rust backend server for TicketVault, providing APIs for
//! events, seat reservations, payment-provider integration, and complaint
//! resolution.

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ticketvault_server::app_state::AppState;
use ticketvault_server::complaint_service::ComplaintService;
use ticketvault_server::config::AppConfig;
use ticketvault_server::event_service::EventService;
use ticketvault_server::notifications::{self, HttpNotifier, NotificationSender, Notifier};
use ticketvault_server::payment_provider::{HttpPaymentProvider, PaymentProvider};
use ticketvault_server::payment_service::PaymentService;
use ticketvault_server::reservation_service::ReservationService;
use ticketvault_server::routes;
use ticketvault_server::user_service::UserService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    info!("database connected and migrated");

    if config.provider_secret_key.is_empty() {
        warn!("PAYMENT_PROVIDER_SECRET_KEY is empty; provider calls will be rejected upstream");
    }
    if config.webhook_secret.is_none() {
        warn!("WEBHOOK_SECRET is not set; webhook deliveries will be rejected");
    }

    let provider: Arc<dyn PaymentProvider> = Arc::new(HttpPaymentProvider::new(
        config.provider_base_url.clone(),
        config.provider_secret_key.clone(),
    )?);
    let notifier: Arc<dyn Notifier> =
        Arc::new(HttpNotifier::new(config.notification_relay_url.clone()));

    let (sender, receiver) = NotificationSender::new(config.notification_queue_capacity);
    notifications::spawn_worker(receiver, notifier);

    let state = AppState::new(
        Arc::new(UserService::new(pool.clone())),
        Arc::new(EventService::new(pool.clone())),
        Arc::new(ReservationService::new(
            pool.clone(),
            provider.clone(),
            sender.clone(),
        )),
        Arc::new(PaymentService::new(
            pool.clone(),
            provider.clone(),
            config.currency.clone(),
        )),
        Arc::new(ComplaintService::new(pool, provider, sender)),
        config.webhook_secret.clone(),
    );

    // Create the app router
    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(routes::user_routes())
        .merge(routes::event_routes())
        .merge(routes::reservation_routes())
        .merge(routes::payment_routes())
        .merge(routes::complaint_routes())
        .with_state(state)
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root() -> &'static str {
    "TicketVault API Server"
}

async fn health_check() -> &'static str {
    "OK"
}

fn build_cors_layer() -> CorsLayer {
    let allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string())
        .split(',')
        .filter_map(|origin| origin.trim().parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(false)
}
