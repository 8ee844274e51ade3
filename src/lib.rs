//! TicketVault Backend Library
//!
//! This library exports the core modules for the TicketVault backend server.

pub mod app_state;
pub mod complaint_service;
pub mod config;
pub mod error;
pub mod event_service;
pub mod handlers;
pub mod inventory;
pub mod models;
pub mod notifications;
pub mod payment_provider;
pub mod payment_service;
pub mod reservation_service;
pub mod routes;
pub mod user_service;
