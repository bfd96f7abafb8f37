//! bibsync - shared bibliographies for groups of authors.
//!
//! A daemon keeps one BibTeX bibliography per realm, each backed by a git
//! work tree. Clients push their local bibliography, resolve the entries the
//! server finds too similar to existing ones, and pull the entries their
//! documents cite.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           CLIENT                                │
//! │  change detection, push, interactive resolution, pull, suggest  │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ HTTP/JSON under /v1
//! ┌───────────────────────────────┴─────────────────────────────────┐
//! │                           DAEMON                                │
//! │  api → library: realm lookup, token authorization,              │
//! │  duplicate classification, policy gate, reconciliation          │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ one lock per realm
//! ┌───────────────────────────────┴─────────────────────────────────┐
//! │                           REALMS                                │
//! │  <data_dir>/<realm>/references.bib + tokens.json + git log      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

// === Records ===

/// Bibliography entries and the BibTeX codec.
pub mod record;

/// Record store and search.
pub mod store;

/// Duplicate classification and suggestions.
pub mod classify;

// === Server ===

/// Admission policy.
pub mod policy;

/// Token capabilities.
pub mod auth;

/// Realm registry and durable log.
pub mod realm;

/// Bulk and single-entry reconciliation.
pub mod reconcile;

/// Operation surface of the daemon.
pub mod library;

/// REST API.
pub mod api;

// === Client ===

/// Wire types shared by both ends.
pub mod wire;

/// Sync client.
pub mod client;

// === Re-exports ===

pub use library::{Access, Library};
pub use realm::{RealmRegistry, ServerConfig};
pub use record::{Record, RecordError};
pub use wire::PROTOCOL_VERSION;
