//! Postgres adapters for the append-only event store.

pub mod connection;
pub mod event_repository;

pub use connection::{create_seed_pool, sanitize_seed, seed_database_name, ConnectionError};
pub use event_repository::PostgresEventRepository;
