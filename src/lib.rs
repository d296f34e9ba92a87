pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod jobs;
pub mod models;
pub mod store;
