//! # Segment Allocator Stack
//!
//! Everything that lives *inside* the mapped byte arena: the self-relative
//! pointer primitive, the general-purpose segment manager, the slab layer
//! for small fixed sizes, the per-type node pools, and the copy-on-write
//! byte vector built on top of them.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  file header (1024 B)                                        |
//! +--------------------------------------------------------------+
//! |  SegmentManager            <- constructed in place           |
//! |    free list, occupancy table, small/index roots             |
//! +--------------------------------------------------------------+
//! |  SmallAllocState           <- first bootstrap allocation     |
//! |    64 slab freelist heads                                    |
//! +--------------------------------------------------------------+
//! |  heap: slab batches, node-pool batches, blob buffers,        |
//! |        index tables ... all linked with OffsetPtr            |
//! +--------------------------------------------------------------+
//! ```
//!
//! The bootstrap order matters: the manager is constructed first at a known
//! offset, then the slab state is placement-allocated *from* it and recorded
//! as the segment's small-allocator root, and the index directory follows
//! the same pattern one layer up. Every cross-reference in that graph is an
//! [`OffsetPtr`], so the whole structure tolerates being mapped at an
//! arbitrary address.

pub mod manager;
pub mod node_pool;
pub mod offset_ptr;
pub mod shared_blob;
pub mod small_alloc;

pub use manager::SegmentManager;
pub use node_pool::{NodePool, PoolState};
pub use offset_ptr::OffsetPtr;
pub use shared_blob::{BlobSnapshot, SharedBlob};
pub use small_alloc::{SmallAllocState, SmallSizeAllocator};
