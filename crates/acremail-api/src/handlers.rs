//! API request handlers

pub mod analytics;
pub mod health;
pub mod metrics;
pub mod tracking;
pub mod unsubscribe;
pub mod webhook;

use serde::{Deserialize, Serialize};

/// `{"message": ...}` body used for both outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
