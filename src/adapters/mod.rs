//! Adapters: concrete implementations of the domain ports.

pub mod cache;
pub mod http;
pub mod postgres;
