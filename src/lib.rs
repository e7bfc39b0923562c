//! Client-side task cart for lecture processing batches.
//!
//! Items are queued in a single-writer [`core::store::CartStore`] owned by the
//! runtime task, persisted to SQLite through a debounced worker, submitted as a
//! batch through a [`api::BatchApi`] gateway and reconciled from its event
//! stream. Without a gateway the engine simulates the batch locally.
//!
//! # Examples
//!
//! In-memory usage with [`core::store::CartStore`]:
//! ```
//! use lecturecart::{core::store::CartStore, item::ItemDraft, types::ItemState};
//!
//! let mut store = CartStore::new();
//! let id = store.add_item(ItemDraft::new("Week 1 audio", "transcribe"));
//! assert_eq!(store.item(id).map(|i| i.state), Some(ItemState::Idle));
//! ```
//!
//! Runtime usage with a SQLite sink and a simulated run:
//! ```no_run
//! use lecturecart::{
//!     core::store::CartStore,
//!     engine::{EngineConfig, cart::{CartEngine, RunOptions}},
//!     item::ItemDraft,
//!     persist::{restore_store, sqlite::SqliteStateSink},
//!     runtime::handle::{RuntimeConfig, spawn_cart},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteStateSink::open("lecturecart.db").expect("open sqlite");
//! let store = restore_store(&sink);
//! let handle = spawn_cart(store, Some(Box::new(sink)), RuntimeConfig::default());
//! handle.add_item(ItemDraft::new("Week 1 audio", "transcribe")).await.expect("add");
//!
//! let engine = CartEngine::new(handle.clone(), None, EngineConfig::default());
//! engine.run(RunOptions::default()).await.expect("run");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```

/// Bulk upload classification and its worker.
pub mod analyzer;
/// Gateway trait, wire payloads and HTTP client.
pub mod api;
/// Class, module and lecture catalog.
pub mod catalog;
/// Environment and TOML configuration.
pub mod config;
/// Core in-memory store.
pub mod core;
/// Run lifecycle, reconciliation and simulation.
pub mod engine;
/// User-facing error taxonomy.
pub mod error;
/// Cart items, logs and typed task parameters.
pub mod item;
/// Persistence abstraction, migrations and SQLite implementation.
pub mod persist;
/// Saved cart templates.
pub mod preset;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
