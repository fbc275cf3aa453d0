//! acremail Common - Shared types and configuration
//!
//! This crate provides configuration, the shared error type and id aliases
//! used by every acremail component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
