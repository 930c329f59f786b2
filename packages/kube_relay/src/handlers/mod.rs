pub mod health;
pub mod topics;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use topics::list_topics;
pub use websocket::relay_websocket_handler;
