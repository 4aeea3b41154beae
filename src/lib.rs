//! # PinDB: Embedded In-Memory Object Database
//!
//! PinDB is a single-process, embedded, in-memory object database backed by
//! a file-mapped memory segment. Client code declares strongly-typed object
//! collections and mutates them through short-lived write sessions; the
//! engine provides multi-level undo, atomic rollback on failure, and durable
//! persistence via the shared mapped file.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pindb::{ArenaObject, Database, MapMode};
//!
//! let db = Database::open(path, true, 8 << 20, false, MapMode::Mapped)?;
//! db.add_index::<Book>()?;
//!
//! let id = db.create::<Book>(|b| b.a = 3)?;
//! {
//!     let session = db.start_undo_session(true);
//!     db.modify::<Book>(id, |b| {
//!         b.a = 7;
//!         Ok(())
//!     })?;
//!     // dropped without push: rolled back
//! }
//! assert_eq!(db.get_value::<Book>(id)?.a, 3);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │       Database (typed collections, sessions)    │
//! ├─────────────────────────────────────────────────┤
//! │   UndoIndex (frames, commit/rollback/squash)    │
//! ├──────────────────────┬──────────────────────────┤
//! │  NodePool (per type) │  SharedBlob (COW bytes)  │
//! ├──────────────────────┴──────────────────────────┤
//! │ SmallSizeAllocator (64 slab classes, 8..512 B)  │
//! ├─────────────────────────────────────────────────┤
//! │  SegmentManager (free list, occupancy, grow)    │
//! ├─────────────────────────────────────────────────┤
//! │  PinnableMappedFile (4 map modes, dirty flag,   │
//! │  soft-dirty flush, OOM tracker)                 │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Everything persisted inside the arena is linked with self-relative
//! [`OffsetPtr`]s, so the file can be mapped at a different address on every
//! open. The four map modes (`mapped`, `mapped_private`, `heap`, `locked`)
//! trade kernel-managed write-back against explicit page-level control; see
//! [`pinnable`] for the details.
//!
//! ## Concurrency model
//!
//! One logical writer per process, on the opener thread, enforced by an
//! advisory file lock. Read-only openings of the same file may run in other
//! processes and accept that the writer updates pages underneath them. The
//! only multi-threaded component is the size-class allocator, which carries
//! its own locks.

pub mod config;
pub mod database;
pub mod error;
pub mod pinnable;
pub mod segment;
pub mod undo;

pub use database::{Database, DatabaseSession};
pub use error::DbError;
pub use pinnable::{MapMode, MemoryCheckResult, PinnableMappedFile};
pub use segment::{
    BlobSnapshot, NodePool, OffsetPtr, PoolState, SegmentManager, SharedBlob, SmallSizeAllocator,
};
pub use undo::{ArenaObject, IndexDir, UndoIndex, UndoSession};
