//! # PinDB Configuration Constants
//!
//! Centralizes the layout and tuning constants shared across the segment
//! allocators and the pinnable mapped file. Constants that depend on each
//! other are co-located and the relationships are enforced with compile-time
//! assertions so a change in one place cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096)
//!     │
//!     ├─> HEADER_SIZE (1024): must fit inside the first page so the dirty
//!     │     byte can be set/cleared by touching a single page
//!     │
//!     ├─> arena size requirement: every backing file is a multiple of
//!     │     PAGE_SIZE (checked at open time, DbError::BadSize otherwise)
//!     │
//!     └─> COPY_WINDOW (1 MiB): load/write-back increment; must be a
//!           multiple of PAGE_SIZE so pagemap windows align to pages
//!
//! ALLOC_ALIGN (16)
//!     │
//!     └─> MIN_BLOCK_SIZE (32): a free block stores {size, next, prev}
//!           (24 bytes) in its own storage, rounded up to ALLOC_ALIGN
//!
//! SIZE_CLASS_INCREMENT (8) × SIZE_CLASS_COUNT (64) = SMALL_ALLOC_MAX (512)
//!     Requests above SMALL_ALLOC_MAX bypass the slab layer entirely.
//! ```

/// Granularity of the backing file and of dirty-page tracking.
pub const PAGE_SIZE: usize = 4096;

/// Fixed reservation at the start of the backing file for the database
/// header (magic id, dirty flag, environment descriptor, zero pad).
pub const HEADER_SIZE: usize = 1024;

/// Byte offset of the dirty flag within the header.
pub const HEADER_DIRTY_OFFSET: usize = 8;

/// Window used when streaming the database between the file and an
/// anonymous region, and when scanning pagemap entries during a flush.
pub const COPY_WINDOW: usize = 1 << 20;

/// Alignment of every block handed out by the segment manager.
pub const ALLOC_ALIGN: usize = 16;

/// Smallest block the segment manager will track as free.
pub const MIN_BLOCK_SIZE: usize = 32;

/// Number of slab size classes in the small-size allocator.
pub const SIZE_CLASS_COUNT: usize = 64;

/// Size step between adjacent slab classes.
pub const SIZE_CLASS_INCREMENT: usize = 8;

/// Largest request served by the slab layer; anything bigger goes straight
/// to the segment manager.
pub const SMALL_ALLOC_MAX: usize = SIZE_CLASS_COUNT * SIZE_CLASS_INCREMENT;

/// Blocks linked into a slab class freelist per refill from the segment
/// manager.
pub const SLAB_BATCH: usize = 512;

/// Slots pulled into a node pool freelist per refill.
pub const NODE_BATCH: usize = 512;

/// Smallest file a fresh database may be created with: one header page plus
/// room for the segment manager, its occupancy table, and the size-class
/// allocator state.
pub const MIN_CREATE_SIZE: usize = 4 * PAGE_SIZE;

/// Registered typed-index capacity of the in-segment directory.
pub const INDEX_DIR_CAPACITY: usize = 64;

/// Default OOM score above which `check_memory_and_flush_if_needed` writes
/// dirty pages back. Linux reports 0..=1000; empirically processes are
/// reaped near 1000, and 980 leaves headroom to finish the flush.
pub const DEFAULT_OOM_THRESHOLD: u16 = 980;

/// Default minimum interval between OOM-score checks.
pub const DEFAULT_OOM_DELAY_SECS: u64 = 30;

const _: () = assert!(HEADER_SIZE <= PAGE_SIZE);
const _: () = assert!(HEADER_DIRTY_OFFSET < HEADER_SIZE);
const _: () = assert!(COPY_WINDOW % PAGE_SIZE == 0);
const _: () = assert!(MIN_BLOCK_SIZE % ALLOC_ALIGN == 0);
const _: () = assert!(SMALL_ALLOC_MAX == 512);
const _: () = assert!(MIN_CREATE_SIZE % PAGE_SIZE == 0);
