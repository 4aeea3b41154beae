//! # Node Pool Allocator
//!
//! Per-type freelist for the single-object allocations that dominate index
//! workloads: many small nodes of one exact size. A pool keeps exactly-`T`-
//! sized slots on an intrusive freelist (the link lives in the slot's own
//! storage), refilling in batches of 512 from the segment manager.
//! Multi-element requests (`T[n]`, `n > 1`) are the odd case and are
//! forwarded to the size-class allocator.
//!
//! The arena-resident state is a [`PoolState`], a freelist head plus a
//! count, embedded wherever the owning structure persists its root. The
//! pool itself is a short-lived view constructed around that state for the
//! duration of an operation; it holds no memory of its own and never
//! returns batch storage to the segment (slots cycle through the freelist
//! for the life of the arena).

use std::marker::PhantomData;
use std::ptr::NonNull;

use eyre::Result;

use super::offset_ptr::OffsetPtr;
use super::small_alloc::{FreeSlot, SmallSizeAllocator};
use crate::config::NODE_BATCH;

/// Arena-resident pool state: embed in a persisted root structure.
#[repr(C)]
pub struct PoolState {
    free_head: OffsetPtr<FreeSlot>,
    free_len: u64,
}

impl PoolState {
    /// Empty pool state; position-independent, safe to move into place.
    pub const fn new() -> Self {
        Self {
            free_head: OffsetPtr::null(),
            free_len: 0,
        }
    }
}

impl Default for PoolState {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed allocation view over a [`PoolState`].
pub struct NodePool<'a, T> {
    state: &'a mut PoolState,
    small: &'a SmallSizeAllocator,
    _marker: PhantomData<T>,
}

impl<'a, T> NodePool<'a, T> {
    /// # Safety
    ///
    /// `state` must be the pool state that has always been used for type `T`
    /// on this arena; mixing types over one freelist corrupts slot sizes.
    pub unsafe fn new(state: &'a mut PoolState, small: &'a SmallSizeAllocator) -> Self {
        const {
            assert!(
                std::mem::size_of::<T>() >= std::mem::size_of::<FreeSlot>(),
                "pooled type too small for the freelist link"
            );
            assert!(
                std::mem::align_of::<T>() <= 8,
                "pooled type over-aligned for slab-backed storage"
            );
        }
        Self {
            state,
            small,
            _marker: PhantomData,
        }
    }

    /// Allocates storage for `n` values of `T` (uninitialized).
    pub fn allocate(&mut self, n: usize) -> Result<NonNull<T>> {
        if n == 1 {
            if self.state.free_head.is_null() {
                self.refill(NODE_BATCH)?;
            }
            let slot = self
                .state
                .free_head
                .load()
                .expect("refilled pool has a free slot");
            // SAFETY: freelist slots are live `FreeSlot` records carved from
            // batches of exactly `size_of::<T>()` stride.
            let next = unsafe { (*slot.as_ptr()).next.load() };
            self.state.free_head.store(next);
            self.state.free_len -= 1;
            Ok(slot.cast())
        } else {
            let raw = self.small.allocate(n * std::mem::size_of::<T>())?;
            Ok(raw.cast())
        }
    }

    /// Returns storage obtained from [`NodePool::allocate`] with the same
    /// `n`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(n)` on a pool over the same state and
    /// must not be used afterwards. Any `T` it held must already be
    /// disposed; the pool reuses the bytes for the freelist link.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<T>, n: usize) {
        if n == 1 {
            let slot = ptr.cast::<FreeSlot>();
            slot.as_ptr().write(FreeSlot {
                next: OffsetPtr::null(),
            });
            (*slot.as_ptr()).next.store(self.state.free_head.load());
            self.state.free_head.store(Some(slot));
            self.state.free_len += 1;
        } else {
            self.small
                .backing_deallocate(ptr.cast(), n * std::mem::size_of::<T>());
        }
    }

    /// Tops the freelist up ahead of a bulk insertion. Only engages for
    /// requests of at least two batches; the refill size is rounded up to a
    /// multiple of eight slots.
    pub fn preallocate(&mut self, n: usize) -> Result<()> {
        if n >= 2 * NODE_BATCH {
            let current = self.state.free_len as usize;
            if current < n {
                self.refill((n - current + 7) & !7)?;
            }
        }
        Ok(())
    }

    /// Slots currently on the freelist.
    pub fn freelist_len(&self) -> usize {
        self.state.free_len as usize
    }

    /// Bytes held idle by the freelist.
    pub fn freelist_bytes(&self) -> usize {
        self.state.free_len as usize * std::mem::size_of::<T>()
    }

    fn refill(&mut self, count: usize) -> Result<()> {
        let stride = std::mem::size_of::<T>();
        let batch = self.small.backing_allocate(stride * count)?;

        // SAFETY: the batch is fresh exclusive memory of `stride * count`
        // bytes; each slot is written before being linked, and the old head
        // is chained behind the batch tail.
        unsafe {
            let old_head = self.state.free_head.load();
            for i in 0..count {
                let slot = batch.as_ptr().add(i * stride).cast::<FreeSlot>();
                slot.write(FreeSlot {
                    next: OffsetPtr::null(),
                });
                if i + 1 < count {
                    let next = batch.as_ptr().add((i + 1) * stride).cast::<FreeSlot>();
                    (*slot).next.store(NonNull::new(next));
                } else {
                    (*slot).next.store(old_head);
                }
            }
            self.state.free_head.store(NonNull::new(batch.as_ptr().cast()));
        }
        self.state.free_len += count as u64;
        Ok(())
    }
}
