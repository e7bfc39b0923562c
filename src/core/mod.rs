//! In-memory authoritative cart store.

/// Cart store, persisted projection and change records.
pub mod store;
