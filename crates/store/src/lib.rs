//! keel-store: the record store behind the keel state layer.
//!
//! A small document store with the four capabilities the state layer needs:
//!
//! - **Point reads** by record id ([`Database::get`])
//! - **Predicate queries** for set membership ([`Database::find`])
//! - **Atomic conditional batches** ([`Database::commit`] with [`Op`]s)
//! - **Change observation** ([`Database::subscribe`] yielding [`CommitEvent`]s)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Database API                 │
//! │   (get, find, commit, subscribe, close)     │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │         Collections of versioned records    │
//! │   (CollectionId -> id -> revno + document)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Storage Backend                  │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use keel_store::{Collection, CollectionId, Database, Op};
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct Seq { next: u64 }
//! struct Sequences;
//! impl Collection for Sequences {
//!     const ID: CollectionId = CollectionId::Sequences;
//!     type Doc = Seq;
//! }
//!
//! let db = Database::open_in_memory()?;
//! db.commit(vec![Op::on::<Sequences>("machine").missing().insert(Seq { next: 0 })])?;
//! let record = db.get::<Sequences>("machine")?;
//! assert_eq!(record.map(|r| r.doc.next), Some(0));
//! # Ok::<(), keel_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod collections;
pub mod db;
pub mod error;
pub mod op;

pub use backend::{FileBackend, InMemoryBackend, StorageBackend};
pub use collections::{Collection, CollectionId};
pub use db::{Change, CommitEvent, Database, DatabaseConfig, DatabaseStats, Record};
pub use error::{Error, Result};
pub use op::{Assert, Effect, Op, OpBuilder};
