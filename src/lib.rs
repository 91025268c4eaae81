//! Basalt - planning and execution core for an autonomous voxel agent
//!
//! Converts cognitive signals (thoughts and goals) into a stream of
//! verified low-level actions dispatched to a game-interface service:
//! - Task store with a status machine and invariant-enforcing finalization
//! - Goal-binding protocol with deduplication and serialized effects
//! - Polling executor with rate limiting, circuit breaking, and
//!   shadow/live modes
//! - Sterling solver integration: plan digests, replans, episode reports
//! - Append-only Postgres event store, per world seed

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::models::{Config, Task, TaskId, TaskKind, TaskSource, TaskStatus};
pub use services::{Executor, TaskService};
