//! # sync-kit
//!
//! A paginated fetch-and-cache synchronization engine.
//!
//! Fetch a resource from a paginated remote API, persist it to a local store
//! under a cache key, expose it as a live, ordered collection, and decide when a
//! re-fetch is needed versus when the cache is authoritative.
//!
//! ## Components
//!
//! - **[`Paginator`]:** follows "next" tokens until exhausted, with a cycle guard
//! - **[`CacheKey`]:** deterministic identity from resource type, context and parameters
//! - **[`LocalStore`]:** persistent typed tables with atomic snapshots and change notifications
//! - **[`RefreshCoordinator`]:** staleness decisions and at most one fetch per key
//! - **[`LiveCollection`]:** a filtered, ordered view recomputed on every store change
//!
//! ## Quick Start
//!
//! ```ignore
//! use sync_kit::{
//!     CacheKeyBuilder, CollectionSync, KeyParams, Query, Resource, Scope, SyncService,
//!     backend::InMemoryBackend,
//!     transport::PageRequest,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! // 1. Define your record
//! #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! struct Assignment {
//!     id: String,
//!     course_id: String,
//!     position: u32,
//! }
//!
//! // 2. Implement Resource
//! impl Resource for Assignment {
//!     type Id = String;
//!     fn id(&self) -> Self::Id { self.id.clone() }
//!     fn resource_type() -> &'static str { "assignment" }
//!     fn context_id(&self) -> Option<String> { Some(self.course_id.clone()) }
//! }
//!
//! // 3. Create the service for this session
//! let sync = SyncService::new(Scope::new("user_1"), InMemoryBackend::new());
//!
//! // 4. Register how a key is refreshed
//! let key = CacheKeyBuilder::for_resource::<Assignment>(Some("course_1"), &KeyParams::new());
//! let request = PageRequest::new("courses/course_1/assignments");
//! sync.register(key.clone(), CollectionSync::<Assignment, _>::new(transport, request))?;
//!
//! // 5. Observe it
//! let mut assignments = sync.live_collection(&key, Query::new().order_by_key(|a: &Assignment| a.position));
//! while let Some(diff) = assignments.changed().await {
//!     render(assignments.items(), &diff);
//! }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod key;
pub mod live;
pub mod observability;
pub mod operation;
pub mod paginate;
pub mod query;
pub mod scope;
pub mod serialization;
pub mod service;
pub mod store;
pub mod strategy;
pub mod transport;

// Re-exports for convenience
pub use backend::PersistenceBackend;
pub use cancel::Cancellation;
pub use config::SyncConfig;
pub use coordinator::{RefreshCoordinator, RefreshHandle, RefreshOutcome, RefreshPhase, RefreshState};
pub use entity::Resource;
pub use error::{Error, Result};
pub use key::{cache_key, CacheKey, CacheKeyBuilder, KeyParams};
pub use live::{CollectionDiff, LiveCollection, LiveSections, Section};
pub use operation::{CollectionSync, CompositeSync, Invalidation, SyncContext, SyncOperation, SyncSummary};
pub use paginate::{drain_all, Paginator};
pub use query::{fuzzy_match, Query};
pub use scope::{Scope, SectionVisibility};
pub use service::SyncService;
pub use store::{ChangeEvent, ChangeKind, LocalStore};
pub use strategy::RefreshStrategy;
pub use transport::{Page, PageRequest, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
