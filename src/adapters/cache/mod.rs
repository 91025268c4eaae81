//! Caching decorators over ports.
//!
//! Uses `moka` for TTL-based concurrent caching with explicit
//! invalidation after mutating operations.

pub mod cached_inventory;

pub use cached_inventory::CachedInventory;
