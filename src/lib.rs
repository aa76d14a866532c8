//! # stratakv
//!
//! An embedded key-value store kept in a single memory-mapped file:
//! - Copy-on-write B+trees, one per named bucket
//! - Snapshot isolation: one writer and any number of readers, which never
//!   block each other
//! - Crash safety through two alternating meta pages
//! - Nested write transactions, sorted duplicates and overflow values
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Database                             │
//! │           (writer lock, reader table, meta pages)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 Transaction / Cursor                         │
//! │        (frames of dirty pages, buckets, duplicates)          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   B+Tree    │          │  Free List  │
//!   │ (TreeCursor)│          │ (reclaim)   │
//!   └──────┬──────┘          └──────┬──────┘
//!          └────────────┬───────────┘
//!                       ▼
//!               ┌─────────────┐
//!               │  PageStore  │
//!               │   (mmap)    │
//!               └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use stratakv::{BucketFlags, Database, PutFlags};
//!
//! # fn main() -> stratakv::Result<()> {
//! let db = Database::open_path("example.db")?;
//! db.update(|txn| {
//!     let users = txn.create_bucket("users", BucketFlags::empty())?;
//!     txn.put(&users, b"alice", b"admin", PutFlags::empty())
//! })?;
//!
//! let role = db.view(|txn| {
//!     let users = txn.open_bucket("users")?;
//!     txn.get(&users, b"alice")
//! })?;
//! assert_eq!(role, b"admin");
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod page;
pub mod store;
pub mod freelist;
pub mod meta;
pub mod btree;
pub mod cursor;
pub mod txn;
pub mod db;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, SyncMode};
pub use cursor::{Cursor, Entry, PutFlags};
pub use db::{Database, Info};
pub use error::{Result, StrataError};
pub use page::BucketFlags;
pub use txn::{Bucket, Stat, Transaction};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of stratakv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
