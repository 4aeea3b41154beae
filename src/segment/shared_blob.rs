//! # Shared Copy-on-Write Byte Vector
//!
//! [`SharedBlob`] is the container primitive for large variable-length
//! fields inside persisted objects: a reference-counted, immutable byte
//! buffer allocated from the segment, with lazy copying at the handle level.
//!
//! The buffer is a `{refcount: u32, len: u32}` header immediately followed
//! by the payload. A handle is two offset pointers (one to the buffer, one
//! to the segment manager that owns it), so handles embedded in arena
//! objects survive remapping like everything else. A null data pointer means
//! empty; a refcount of zero is never observable.
//!
//! ## Mutation rules
//!
//! - a *shared* buffer (refcount >= 2) is never written; mutation allocates
//!   a fresh buffer, copies what survives, edits, then releases the old one;
//! - a *unique* buffer (refcount == 1) of unchanged length is edited in
//!   place;
//! - copying a handle within one segment shares the buffer and bumps the
//!   refcount; copying across segments degrades to a deep copy.
//!
//! Handles stored in the arena are not dropped by Rust; the owning structure
//! calls [`SharedBlob::clear`] when it disposes the object. The process-side
//! [`BlobSnapshot`] (used for undo pre-images) *does* release its reference
//! on drop.

use std::ptr::NonNull;

use eyre::{ensure, Result};

use super::manager::SegmentManager;
use super::offset_ptr::OffsetPtr;

#[repr(C)]
struct BlobHeader {
    refcount: u32,
    len: u32,
}

const BLOB_HEADER_SIZE: usize = std::mem::size_of::<BlobHeader>();
const _: () = assert!(BLOB_HEADER_SIZE == 8);

/// Arena-resident handle to a refcounted byte buffer.
#[repr(C)]
#[derive(Debug)]
pub struct SharedBlob {
    data: OffsetPtr<BlobHeader>,
    seg: OffsetPtr<SegmentManager>,
}

impl SharedBlob {
    /// Empty handle with no segment wired; position-independent until
    /// [`SharedBlob::attach`] runs at its final address.
    pub const fn new_null() -> Self {
        Self {
            data: OffsetPtr::null(),
            seg: OffsetPtr::null(),
        }
    }

    /// Wires the handle, in place, to the segment its buffers will come
    /// from.
    ///
    /// # Safety
    ///
    /// `self` must already live at its final arena address and `seg` must
    /// point at the live segment manager of that arena.
    pub unsafe fn attach(&mut self, seg: NonNull<SegmentManager>) {
        self.seg.store(Some(seg));
    }

    pub fn len(&self) -> usize {
        match self.data.load() {
            // SAFETY: a non-null data pointer targets a live buffer header.
            Some(hdr) => unsafe { (*hdr.as_ptr()).len as usize },
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_null()
    }

    /// Current reference count; 0 only for the empty handle.
    pub fn refcount(&self) -> u32 {
        match self.data.load() {
            Some(hdr) => unsafe { (*hdr.as_ptr()).refcount },
            None => 0,
        }
    }

    pub fn is_unique(&self) -> bool {
        self.refcount() == 1
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.data.load() {
            Some(hdr) => unsafe { payload(hdr) },
            None => &[],
        }
    }

    /// Replaces the contents with `src`. Overwrites in place when the
    /// current buffer is unique and already the right size.
    pub fn assign(&mut self, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            self.clear();
            return Ok(());
        }
        if self.is_unique() && self.len() == src.len() {
            let hdr = self.data.load().expect("unique handle has a buffer");
            // SAFETY: refcount == 1 means this handle owns the buffer
            // exclusively; length is unchanged.
            unsafe { payload_mut(hdr).copy_from_slice(src) };
            return Ok(());
        }
        let hdr = self.alloc_buffer(src.len())?;
        unsafe { payload_mut(hdr).copy_from_slice(src) };
        self.release();
        self.data.store(Some(hdr));
        Ok(())
    }

    /// Resize with partial reuse: the first `copy_len` bytes survive,
    /// `fill` produces the tail `[copy_len..new_len)`. Runs in place when
    /// the buffer is unique and the length does not change.
    pub fn resize_and_fill(
        &mut self,
        new_len: usize,
        copy_len: usize,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        ensure!(
            copy_len <= new_len && copy_len <= self.len(),
            "resize_and_fill: copy_len {} out of range (new_len {}, len {})",
            copy_len,
            new_len,
            self.len()
        );
        if new_len == 0 {
            self.clear();
            return Ok(());
        }
        if self.is_unique() && new_len == self.len() {
            let hdr = self.data.load().expect("unique handle has a buffer");
            // SAFETY: exclusive buffer, unchanged length.
            unsafe { fill(&mut payload_mut(hdr)[copy_len..]) };
            return Ok(());
        }
        let hdr = self.alloc_buffer(new_len)?;
        unsafe {
            let dst = payload_mut(hdr);
            dst[..copy_len].copy_from_slice(&self.as_slice()[..copy_len]);
            fill(&mut dst[copy_len..]);
        }
        self.release();
        self.data.store(Some(hdr));
        Ok(())
    }

    /// Appends one byte (`clear_and_construct(len + 1, len, ..)`).
    pub fn push(&mut self, byte: u8) -> Result<()> {
        let len = self.len();
        self.resize_and_fill(len + 1, len, |tail| tail[0] = byte)
    }

    /// Copy semantics: share-and-bump within one segment, deep copy across
    /// segments.
    pub fn share_from(&mut self, other: &SharedBlob) -> Result<()> {
        if self.same_segment(other) {
            if let Some(hdr) = other.data.load() {
                // Bump before releasing our own reference so self-assignment
                // never drops the buffer to zero.
                unsafe { (*hdr.as_ptr()).refcount += 1 };
                self.release();
                self.data.store(Some(hdr));
            } else {
                self.clear();
            }
            return Ok(());
        }
        let bytes = other.as_slice().to_vec();
        self.assign(&bytes)
    }

    /// Move semantics: steal the buffer within one segment, deep copy across
    /// segments (the source keeps its buffer in that case).
    pub fn take_from(&mut self, other: &mut SharedBlob) -> Result<()> {
        if self.same_segment(other) {
            if (self as *const SharedBlob) == (other as *const SharedBlob) {
                return Ok(());
            }
            self.release();
            self.data.store(other.data.load());
            other.data.store(None);
            return Ok(());
        }
        let bytes = other.as_slice().to_vec();
        self.assign(&bytes)
    }

    /// Drops this handle's reference and empties it.
    pub fn clear(&mut self) {
        self.release();
        self.data.store(None);
    }

    /// Takes a process-side owned reference for use as an undo pre-image.
    pub fn snapshot(&self) -> BlobSnapshot {
        if let Some(hdr) = self.data.load() {
            unsafe { (*hdr.as_ptr()).refcount += 1 };
            BlobSnapshot {
                hdr: Some(hdr),
                seg: self.seg.load(),
            }
        } else {
            BlobSnapshot {
                hdr: None,
                seg: self.seg.load(),
            }
        }
    }

    /// Points the handle back at a snapshot's buffer, restoring the exact
    /// bytes the snapshot captured.
    pub fn restore_from(&mut self, snap: &BlobSnapshot) {
        match snap.hdr {
            Some(hdr) => {
                unsafe { (*hdr.as_ptr()).refcount += 1 };
                self.release();
                self.data.store(Some(hdr));
            }
            None => self.clear(),
        }
    }

    fn same_segment(&self, other: &SharedBlob) -> bool {
        match (self.seg.load(), other.seg.load()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn alloc_buffer(&mut self, len: usize) -> Result<NonNull<BlobHeader>> {
        let seg = self
            .seg
            .load()
            .expect("shared blob used before attach to a segment");
        // SAFETY: single-writer discipline: the segment manager is only
        // mutated from the opener thread, and `seg` targets arena memory
        // disjoint from this handle.
        let raw = unsafe { (*seg.as_ptr()).allocate(BLOB_HEADER_SIZE + len)? };
        let hdr = raw.cast::<BlobHeader>();
        unsafe {
            hdr.as_ptr().write(BlobHeader {
                refcount: 1,
                len: len as u32,
            });
        }
        Ok(hdr)
    }

    fn release(&mut self) {
        let Some(hdr) = self.data.load() else {
            return;
        };
        // SAFETY: non-null data implies a live buffer whose refcount this
        // handle contributes to.
        unsafe {
            let header = &mut *hdr.as_ptr();
            header.refcount -= 1;
            if header.refcount == 0 {
                let len = header.len as usize;
                let seg = self
                    .seg
                    .load()
                    .expect("shared blob buffer without a segment");
                (*seg.as_ptr()).deallocate(hdr.cast(), BLOB_HEADER_SIZE + len);
            }
        }
    }
}

impl PartialEq for SharedBlob {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

unsafe fn payload<'a>(hdr: NonNull<BlobHeader>) -> &'a [u8] {
    let len = (*hdr.as_ptr()).len as usize;
    std::slice::from_raw_parts(hdr.as_ptr().cast::<u8>().add(BLOB_HEADER_SIZE), len)
}

unsafe fn payload_mut<'a>(hdr: NonNull<BlobHeader>) -> &'a mut [u8] {
    let len = (*hdr.as_ptr()).len as usize;
    std::slice::from_raw_parts_mut(hdr.as_ptr().cast::<u8>().add(BLOB_HEADER_SIZE), len)
}

/// Owned process-side reference to a blob buffer, held by undo pre-images.
/// Releases its reference on drop; must not outlive the mapping.
pub struct BlobSnapshot {
    hdr: Option<NonNull<BlobHeader>>,
    seg: Option<NonNull<SegmentManager>>,
}

impl BlobSnapshot {
    pub fn as_slice(&self) -> &[u8] {
        match self.hdr {
            // SAFETY: the snapshot holds a reference keeping the buffer
            // alive.
            Some(hdr) => unsafe { payload(hdr) },
            None => &[],
        }
    }
}

impl Drop for BlobSnapshot {
    fn drop(&mut self) {
        let Some(hdr) = self.hdr else { return };
        // SAFETY: the snapshot owns one reference; the mapping outlives
        // every snapshot (sessions are short-lived within an open database).
        unsafe {
            let header = &mut *hdr.as_ptr();
            header.refcount -= 1;
            if header.refcount == 0 {
                let len = header.len as usize;
                if let Some(seg) = self.seg {
                    (*seg.as_ptr()).deallocate(hdr.cast(), BLOB_HEADER_SIZE + len);
                }
            }
        }
    }
}
