//! Synchronous HTTP surface of a relaykit service

pub mod error;
pub mod health;
pub mod router;
pub mod server;

pub use error::AppError;
pub use health::{create_health_router, HealthResponse};
pub use router::create_router;
pub use server::ApiServer;
