pub mod auth;
pub mod collection_handlers;
pub mod health_handlers;
pub mod usage_handlers;
