//! acremail storage
//!
//! Models, repository traits with PostgreSQL and in-memory implementations,
//! and the SQL migrations.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
