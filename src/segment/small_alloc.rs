//! # Size-Class Allocator
//!
//! A fixed array of 64 slab allocators, one per 8-byte size increment up to
//! 512 bytes. Each class keeps an intrusive freelist of fixed-size blocks
//! inside the arena and refills itself with a batch of 512 blocks from the
//! segment manager when it runs dry. Requests above 512 bytes bypass the
//! slab layer and go straight to the segment manager.
//!
//! The arena-resident part ([`SmallAllocState`]) is plain data: 64 freelist
//! heads expressed as offset pointers. The process-side handle
//! ([`SmallSizeAllocator`]) adds the per-class mutexes; the slab layer is
//! the one component that may be shared across threads, while the segment
//! manager behind it is serialized by a single backing lock.
//!
//! Class selection is `(bytes - 1) / 8`; block sizes are exact, so a
//! deallocation with the original request size lands back in the class it
//! came from.

use std::ptr::NonNull;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use super::manager::SegmentManager;
use super::offset_ptr::OffsetPtr;
use crate::config::{SIZE_CLASS_COUNT, SIZE_CLASS_INCREMENT, SLAB_BATCH, SMALL_ALLOC_MAX};

/// Intrusive freelist link written into the storage of a free block.
#[repr(C)]
pub(crate) struct FreeSlot {
    pub(crate) next: OffsetPtr<FreeSlot>,
}

/// Arena-resident allocator state: one freelist head per size class.
#[repr(C)]
pub struct SmallAllocState {
    classes: [OffsetPtr<FreeSlot>; SIZE_CLASS_COUNT],
}

const _: () = assert!(std::mem::size_of::<SmallAllocState>() == SIZE_CLASS_COUNT * 8);

/// Process-side handle over [`SmallAllocState`].
pub struct SmallSizeAllocator {
    state: NonNull<SmallAllocState>,
    seg: NonNull<SegmentManager>,
    class_locks: [Mutex<()>; SIZE_CLASS_COUNT],
    /// Serializes every trip into the segment manager made through this
    /// handle (class refills, large requests, node-pool batches).
    seg_lock: Mutex<()>,
}

// SAFETY: the raw pointers target the mapped segment, which outlives the
// handle and is mutated only through this handle's locks (slab classes) or
// under the database's single-writer discipline (everything else).
unsafe impl Send for SmallSizeAllocator {}
unsafe impl Sync for SmallSizeAllocator {}

#[inline]
fn class_index(bytes: usize) -> usize {
    (bytes - 1) / SIZE_CLASS_INCREMENT
}

#[inline]
fn class_block_size(index: usize) -> usize {
    (index + 1) * SIZE_CLASS_INCREMENT
}

impl SmallSizeAllocator {
    /// Allocates and wires fresh allocator state into the segment, recording
    /// it as the segment's small-allocator root.
    ///
    /// # Safety
    ///
    /// `seg` must point at a live, exclusively owned segment manager.
    pub unsafe fn bootstrap(mut seg: NonNull<SegmentManager>) -> Result<Self> {
        let mgr = seg.as_mut();
        let raw = mgr.allocate(std::mem::size_of::<SmallAllocState>())?;
        let state = raw.cast::<SmallAllocState>();
        for i in 0..SIZE_CLASS_COUNT {
            (*state.as_ptr()).classes[i] = OffsetPtr::null();
        }
        mgr.set_small_root(Some(raw));
        Ok(Self::with_state(state, seg))
    }

    /// Attaches to allocator state previously recorded in the segment.
    ///
    /// # Safety
    ///
    /// `seg` must point at a live segment manager whose small-allocator root
    /// was set by [`SmallSizeAllocator::bootstrap`].
    pub unsafe fn attach(seg: NonNull<SegmentManager>) -> Result<Self> {
        let root = seg.as_ref().small_root();
        ensure!(root.is_some(), "segment has no size-class allocator state");
        Ok(Self::with_state(root.unwrap().cast(), seg))
    }

    fn with_state(state: NonNull<SmallAllocState>, seg: NonNull<SegmentManager>) -> Self {
        Self {
            state,
            seg,
            class_locks: std::array::from_fn(|_| Mutex::new(())),
            seg_lock: Mutex::new(()),
        }
    }

    /// Allocates `bytes` bytes: from the matching slab class up to 512,
    /// directly from the segment manager above that.
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        ensure!(bytes > 0, "zero-size small allocation");
        if bytes > SMALL_ALLOC_MAX {
            return self.backing_allocate(bytes);
        }
        let idx = class_index(bytes);
        let _guard = self.class_locks[idx].lock();

        // SAFETY: `state` targets arena memory owned by this allocator;
        // class heads are only touched under the class lock held above. The
        // head borrow is taken after any refill so it never overlaps the
        // refill's own access.
        if unsafe { (*self.state.as_ptr()).classes[idx].is_null() } {
            self.refill_class(idx)?;
        }
        let head = unsafe { &mut (*self.state.as_ptr()).classes[idx] };
        let slot = head.load().expect("refilled class has a free slot");
        // SAFETY: slots on the freelist were carved from a live batch and
        // hold a valid link record until popped here.
        let next = unsafe { (*slot.as_ptr()).next.load() };
        head.store(next);
        Ok(slot.cast())
    }

    /// Returns a block obtained from [`SmallSizeAllocator::allocate`] with
    /// the same size.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(bytes)` on this handle and not be used
    /// afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize) {
        if bytes > SMALL_ALLOC_MAX {
            let _guard = self.seg_lock.lock();
            self.seg_mut().deallocate(ptr, bytes);
            return;
        }
        let idx = class_index(bytes.max(1));
        let _guard = self.class_locks[idx].lock();
        let head = &mut (*self.state.as_ptr()).classes[idx];
        let slot = ptr.cast::<FreeSlot>();
        slot.as_ptr().write(FreeSlot {
            next: OffsetPtr::null(),
        });
        (*slot.as_ptr()).next.store(head.load());
        head.store(Some(slot));
    }

    /// One serialized trip into the segment manager. Also used by the node
    /// pools for their batch refills and multi-element requests.
    pub(crate) fn backing_allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        let _guard = self.seg_lock.lock();
        self.seg_mut().allocate(bytes)
    }

    /// # Safety
    ///
    /// Same contract as [`SegmentManager::deallocate`].
    pub(crate) unsafe fn backing_deallocate(&self, ptr: NonNull<u8>, bytes: usize) {
        let _guard = self.seg_lock.lock();
        self.seg_mut().deallocate(ptr, bytes);
    }

    pub fn segment(&self) -> NonNull<SegmentManager> {
        self.seg
    }

    #[allow(clippy::mut_from_ref)]
    fn seg_mut(&self) -> &mut SegmentManager {
        // SAFETY: all mutation of the segment manager through this handle
        // happens under `seg_lock`, and the mapping outlives the handle.
        unsafe { &mut *self.seg.as_ptr() }
    }

    /// Links a fresh batch of `SLAB_BATCH` blocks into class `idx`. Caller
    /// holds the class lock.
    fn refill_class(&self, idx: usize) -> Result<()> {
        let block_size = class_block_size(idx);
        let batch = self.backing_allocate(block_size * SLAB_BATCH)?;

        // SAFETY: the batch is fresh exclusive memory of exactly
        // `block_size * SLAB_BATCH` bytes; each slot is written before it is
        // linked and slots never overlap.
        unsafe {
            let head = &mut (*self.state.as_ptr()).classes[idx];
            let old_head = head.load();
            for i in 0..SLAB_BATCH {
                let slot = batch.as_ptr().add(i * block_size).cast::<FreeSlot>();
                slot.write(FreeSlot {
                    next: OffsetPtr::null(),
                });
                if i + 1 < SLAB_BATCH {
                    let next = batch.as_ptr().add((i + 1) * block_size).cast::<FreeSlot>();
                    (*slot).next.store(NonNull::new(next));
                } else {
                    (*slot).next.store(old_head);
                }
            }
            head.store(NonNull::new(batch.as_ptr().cast()));
        }
        Ok(())
    }
}
