//! acremail API - public HTTP boundary
//!
//! Tracking pixel and click redirects, the provider webhook, unsubscribe
//! pages, health probes and the metrics scrape endpoint.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
