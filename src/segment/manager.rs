//! # Segment Manager
//!
//! The segment manager owns the byte arena that follows the database header
//! inside the mapped file. It is *constructed in place* at a fixed offset and
//! every piece of its state (the free list, the occupancy table, the roots
//! of the structures built on top) is expressed with self-relative
//! [`OffsetPtr`]s, so the whole arena survives being mapped at a different
//! address on every open.
//!
//! ## Allocation strategy
//!
//! An address-ordered, doubly-linked free list with immediate neighbor
//! coalescing:
//!
//! - every block handed out is a multiple of 16 bytes, at least 32 bytes, so
//!   any freed block can hold the free-list link record in its own storage;
//! - `allocate` is first-fit and only splits a block when the remainder can
//!   itself be tracked (>= 32 bytes), so slivers are never created and a
//!   `deallocate` with the original request size always returns exactly the
//!   bytes that were granted;
//! - `deallocate` reinserts in address order and merges with both neighbors
//!   when they are physically adjacent.
//!
//! Pointers returned by `allocate` stay valid for the lifetime of the
//! allocation as long as the arena itself is not unmapped; the manager never
//! relocates live blocks.
//!
//! ## Occupancy table
//!
//! One byte per 4 KiB page of the backing file, counting 16-byte units in
//! use on that page (saturating at 255). The table feeds visualization and
//! heuristics; it is not consulted by any allocation decision.
//!
//! ## Safety model
//!
//! The manager mutates arena memory through raw pointers derived from its
//! own address. The single-writer discipline of the database (one writable
//! opening, mutations on the opener thread) is what makes the `&mut self`
//! receivers here exclusive in practice; re-entrant calls are impossible
//! because the manager never calls out while holding raw block pointers.

use std::ptr::NonNull;

use eyre::{bail, ensure, Result};

use super::offset_ptr::OffsetPtr;
use crate::config::{ALLOC_ALIGN, MIN_BLOCK_SIZE, PAGE_SIZE};
use crate::error::DbError;

/// Link record living in the storage of a free block.
#[repr(C)]
struct FreeBlock {
    size: u64,
    next: OffsetPtr<FreeBlock>,
    prev: OffsetPtr<FreeBlock>,
}

const _: () = assert!(std::mem::size_of::<FreeBlock>() <= MIN_BLOCK_SIZE);

/// In-arena allocator state. Lives at `file base + HEADER_SIZE` and is
/// reinterpreted, never copied.
#[repr(C)]
pub struct SegmentManager {
    /// Bytes under management, measured from `&self`.
    arena_bytes: u64,
    /// Offset of `&self` within the backing file (the header size).
    page_origin: u64,
    free_bytes: u64,
    free_head: OffsetPtr<FreeBlock>,
    /// Root of the size-class allocator state, set at bootstrap.
    small_root: OffsetPtr<u8>,
    /// Root of the typed-index directory, set by the database layer.
    index_root: OffsetPtr<u8>,
    occupancy: OffsetPtr<u8>,
    occupancy_pages: u64,
}

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline]
fn effective_size(bytes: usize) -> usize {
    round_up(bytes, ALLOC_ALIGN).max(MIN_BLOCK_SIZE)
}

impl SegmentManager {
    /// Constructs a fresh manager over `arena_bytes` of raw memory starting
    /// at `base`, with `page_origin` bytes of file header in front of it.
    ///
    /// # Safety
    ///
    /// `base..base + arena_bytes` must be exclusively owned, writable memory
    /// that outlives every use of the returned pointer. `base` must be
    /// 16-byte aligned.
    pub unsafe fn construct_at(
        base: NonNull<u8>,
        arena_bytes: usize,
        page_origin: usize,
    ) -> Result<NonNull<SegmentManager>> {
        ensure!(
            base.as_ptr() as usize % ALLOC_ALIGN == 0,
            "segment base {:p} is not {}-byte aligned",
            base.as_ptr(),
            ALLOC_ALIGN
        );
        let heap_start = round_up(std::mem::size_of::<SegmentManager>(), ALLOC_ALIGN);
        let total_pages = (page_origin + arena_bytes).div_ceil(PAGE_SIZE);
        ensure!(
            arena_bytes >= heap_start + MIN_BLOCK_SIZE + round_up(total_pages, ALLOC_ALIGN),
            "arena of {} bytes is too small for allocator state",
            arena_bytes
        );

        let mgr_ptr = base.cast::<SegmentManager>();
        mgr_ptr.as_ptr().write(SegmentManager {
            arena_bytes: arena_bytes as u64,
            page_origin: page_origin as u64,
            free_bytes: 0,
            free_head: OffsetPtr::null(),
            small_root: OffsetPtr::null(),
            index_root: OffsetPtr::null(),
            occupancy: OffsetPtr::null(),
            occupancy_pages: 0,
        });

        let mgr = &mut *mgr_ptr.as_ptr();
        let region = NonNull::new_unchecked(base.as_ptr().add(heap_start));
        mgr.insert_free_region(region, arena_bytes - heap_start);
        mgr.free_bytes = (arena_bytes - heap_start) as u64;

        // The occupancy table is the arena's first allocation and accounts
        // for itself; the header and manager struct are charged afterwards.
        let table = mgr.allocate(total_pages)?;
        table.as_ptr().write_bytes(0, total_pages);
        mgr.occupancy.store(Some(table));
        mgr.occupancy_pages = total_pages as u64;
        mgr.occupancy_add(0, page_origin + heap_start);

        Ok(mgr_ptr)
    }

    /// Reinterprets previously constructed manager state at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at memory where [`SegmentManager::construct_at`]
    /// ran (in this process or any prior one mapping the same file).
    pub unsafe fn attach(base: NonNull<u8>) -> Result<NonNull<SegmentManager>> {
        let mgr_ptr = base.cast::<SegmentManager>();
        let mgr = mgr_ptr.as_ref();
        ensure!(
            mgr.arena_bytes != 0 && mgr.free_bytes <= mgr.arena_bytes,
            "segment manager state at {:p} is corrupt",
            base.as_ptr()
        );
        Ok(mgr_ptr)
    }

    /// Returns a block of at least `bytes` bytes, 16-byte aligned.
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>> {
        ensure!(bytes > 0, "zero-size segment allocation");
        let size = effective_size(bytes);

        let mut cursor = self.free_head.load();
        while let Some(block_ptr) = cursor {
            // SAFETY: free-list nodes are only ever created by this manager
            // inside its own arena and unlinked before their storage is
            // handed out, so the pointer is valid and exclusively ours.
            let block = unsafe { &mut *block_ptr.as_ptr() };
            let block_size = block.size as usize;

            if block_size == size {
                unsafe { self.unlink(block_ptr) };
                self.finish_allocation(block_ptr.cast(), size);
                return Ok(block_ptr.cast());
            }
            if block_size >= size + MIN_BLOCK_SIZE {
                // Split: the remainder takes over this block's position in
                // the address-ordered list.
                let remainder_ptr = unsafe {
                    NonNull::new_unchecked(block_ptr.as_ptr().cast::<u8>().add(size))
                        .cast::<FreeBlock>()
                };
                unsafe {
                    remainder_ptr.as_ptr().write(FreeBlock {
                        size: (block_size - size) as u64,
                        next: OffsetPtr::null(),
                        prev: OffsetPtr::null(),
                    });
                    self.replace(block_ptr, remainder_ptr);
                }
                self.finish_allocation(block_ptr.cast(), size);
                return Ok(block_ptr.cast());
            }

            cursor = block.next.load();
        }

        bail!(DbError::OutOfSegmentMemory);
    }

    /// Returns a block to the free pool, coalescing with adjacent free
    /// neighbors.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`SegmentManager::allocate`] on this
    /// manager with the same `bytes`, and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, bytes: usize) {
        let size = effective_size(bytes);
        self.occupancy_sub(self.file_offset(ptr.as_ptr()), size);
        self.free_bytes += size as u64;
        self.insert_free_region(ptr, size);
    }

    /// Extends the managed arena by `delta` bytes appended at the end.
    ///
    /// # Safety
    ///
    /// The mapping backing the arena must already cover the extended range.
    pub unsafe fn grow(&mut self, delta: usize) -> Result<()> {
        ensure!(
            delta > 0 && delta % PAGE_SIZE == 0,
            "grow delta {} is not a positive multiple of {}",
            delta,
            PAGE_SIZE
        );
        let old_end = NonNull::new_unchecked(self.base_ptr().add(self.arena_bytes as usize));
        self.arena_bytes += delta as u64;
        self.free_bytes += delta as u64;
        self.insert_free_region(old_end, delta);
        self.resize_occupancy()
    }

    /// Total bytes currently free.
    pub fn free_memory(&self) -> usize {
        self.free_bytes as usize
    }

    /// Read-only view of the per-page occupancy table.
    pub fn occupancy(&self) -> &[u8] {
        match self.occupancy.load() {
            // SAFETY: the table was allocated from this arena with exactly
            // `occupancy_pages` bytes and is only replaced under `&mut self`.
            Some(table) => unsafe {
                std::slice::from_raw_parts(table.as_ptr(), self.occupancy_pages as usize)
            },
            None => &[],
        }
    }

    /// Bytes under management (excluding the file header).
    pub fn arena_bytes(&self) -> usize {
        self.arena_bytes as usize
    }

    pub fn set_small_root(&mut self, root: Option<NonNull<u8>>) {
        self.small_root.store(root);
    }

    pub fn small_root(&self) -> Option<NonNull<u8>> {
        self.small_root.load()
    }

    pub fn set_index_root(&mut self, root: Option<NonNull<u8>>) {
        self.index_root.store(root);
    }

    pub fn index_root(&self) -> Option<NonNull<u8>> {
        self.index_root.load()
    }

    /// True when `ptr..ptr + len` lies inside the managed heap area.
    pub fn contains(&self, ptr: *const u8, len: usize) -> bool {
        let base = self.base_ptr() as usize;
        let heap_start = base + round_up(std::mem::size_of::<SegmentManager>(), ALLOC_ALIGN);
        let end = base + self.arena_bytes as usize;
        let addr = ptr as usize;
        addr >= heap_start && addr.checked_add(len).is_some_and(|a| a <= end)
    }

    fn base_ptr(&self) -> *mut u8 {
        self as *const SegmentManager as *mut u8
    }

    fn file_offset(&self, ptr: *const u8) -> usize {
        (ptr as usize) - (self.base_ptr() as usize) + self.page_origin as usize
    }

    fn finish_allocation(&mut self, ptr: NonNull<u8>, size: usize) {
        self.free_bytes -= size as u64;
        self.occupancy_add(self.file_offset(ptr.as_ptr()), size);
    }

    /// Links a block into the address-ordered free list and merges with
    /// physically adjacent neighbors. Does not touch accounting.
    unsafe fn insert_free_region(&mut self, ptr: NonNull<u8>, size: usize) {
        let addr = ptr.as_ptr() as usize;

        // Locate the insertion point: `after` is the last free block below
        // `addr`, `before` the first one above it.
        let mut after: Option<NonNull<FreeBlock>> = None;
        let mut before = self.free_head.load();
        while let Some(candidate) = before {
            if candidate.as_ptr() as usize > addr {
                break;
            }
            after = before;
            before = (*candidate.as_ptr()).next.load();
        }

        if let Some(prev_ptr) = after {
            let prev = &mut *prev_ptr.as_ptr();
            if prev_ptr.as_ptr() as usize + prev.size as usize == addr {
                // Absorb into the lower neighbor.
                prev.size += size as u64;
                self.try_merge_with_next(prev_ptr);
                return;
            }
        }

        let block_ptr = ptr.cast::<FreeBlock>();
        block_ptr.as_ptr().write(FreeBlock {
            size: size as u64,
            next: OffsetPtr::null(),
            prev: OffsetPtr::null(),
        });
        let block = &mut *block_ptr.as_ptr();
        block.prev.store(after);
        block.next.store(before);
        match after {
            Some(prev_ptr) => (*prev_ptr.as_ptr()).next.store(Some(block_ptr)),
            None => self.free_head.store(Some(block_ptr)),
        }
        if let Some(next_ptr) = before {
            (*next_ptr.as_ptr()).prev.store(Some(block_ptr));
        }
        self.try_merge_with_next(block_ptr);
    }

    unsafe fn try_merge_with_next(&mut self, block_ptr: NonNull<FreeBlock>) {
        let block = &mut *block_ptr.as_ptr();
        if let Some(next_ptr) = block.next.load() {
            let block_end = block_ptr.as_ptr() as usize + block.size as usize;
            if block_end == next_ptr.as_ptr() as usize {
                block.size += (*next_ptr.as_ptr()).size;
                self.unlink(next_ptr);
            }
        }
    }

    unsafe fn unlink(&mut self, block_ptr: NonNull<FreeBlock>) {
        let block = &mut *block_ptr.as_ptr();
        let prev = block.prev.load();
        let next = block.next.load();
        match prev {
            Some(prev_ptr) => (*prev_ptr.as_ptr()).next.store(next),
            None => self.free_head.store(next),
        }
        if let Some(next_ptr) = next {
            (*next_ptr.as_ptr()).prev.store(prev);
        }
    }

    /// Swaps `old` for `new` at the same position in the list. Used when a
    /// split leaves the remainder where the original block was.
    unsafe fn replace(&mut self, old_ptr: NonNull<FreeBlock>, new_ptr: NonNull<FreeBlock>) {
        let old = &mut *old_ptr.as_ptr();
        let prev = old.prev.load();
        let next = old.next.load();
        let new = &mut *new_ptr.as_ptr();
        new.prev.store(prev);
        new.next.store(next);
        match prev {
            Some(prev_ptr) => (*prev_ptr.as_ptr()).next.store(Some(new_ptr)),
            None => self.free_head.store(Some(new_ptr)),
        }
        if let Some(next_ptr) = next {
            (*next_ptr.as_ptr()).prev.store(Some(new_ptr));
        }
    }

    fn occupancy_add(&mut self, file_offset: usize, len: usize) {
        self.occupancy_adjust(file_offset, len, true);
    }

    fn occupancy_sub(&mut self, file_offset: usize, len: usize) {
        self.occupancy_adjust(file_offset, len, false);
    }

    fn occupancy_adjust(&mut self, file_offset: usize, len: usize, add: bool) {
        let Some(table) = self.occupancy.load() else {
            return;
        };
        if len == 0 {
            return;
        }
        let pages = self.occupancy_pages as usize;
        let first = file_offset / PAGE_SIZE;
        let last = (file_offset + len - 1) / PAGE_SIZE;
        for page in first..=last {
            if page >= pages {
                break;
            }
            let page_start = page * PAGE_SIZE;
            let page_end = page_start + PAGE_SIZE;
            let overlap = (file_offset + len).min(page_end) - file_offset.max(page_start);
            let units = (overlap.div_ceil(ALLOC_ALIGN)).min(255) as u8;
            // SAFETY: `page < occupancy_pages` and the table allocation is
            // exactly `occupancy_pages` bytes.
            let slot = unsafe { &mut *table.as_ptr().add(page) };
            *slot = if add {
                slot.saturating_add(units)
            } else {
                slot.saturating_sub(units)
            };
        }
    }

    unsafe fn resize_occupancy(&mut self) -> Result<()> {
        let new_pages = (self.page_origin as usize + self.arena_bytes as usize).div_ceil(PAGE_SIZE);
        let old_pages = self.occupancy_pages as usize;
        if new_pages <= old_pages {
            return Ok(());
        }
        let old_table = self.occupancy.load();
        let new_table = self.allocate(new_pages)?;
        if let Some(old) = old_table {
            std::ptr::copy_nonoverlapping(old.as_ptr(), new_table.as_ptr(), old_pages);
        }
        new_table
            .as_ptr()
            .add(old_pages)
            .write_bytes(0, new_pages - old_pages);
        self.occupancy.store(Some(new_table));
        self.occupancy_pages = new_pages as u64;
        if let Some(old) = old_table {
            self.deallocate(old, old_pages);
        }
        Ok(())
    }
}
