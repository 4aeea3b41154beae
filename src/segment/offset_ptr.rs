//! # Self-Relative Offset Pointer
//!
//! Every pointer persisted inside the mapped segment is an [`OffsetPtr`]: a
//! signed 64-bit distance from the pointer's *own storage address* to its
//! target. Because the distance between two locations inside one arena is
//! invariant under remapping, offset pointers stay valid no matter where the
//! OS places the mapping on the next open.
//!
//! ## Why no `Clone`/`Copy`
//!
//! A raw byte copy of an offset pointer to a different address silently
//! retargets it: the stored distance is only meaningful relative to where
//! it lives. The type therefore implements neither `Clone` nor `Copy`, and
//! the only way to duplicate one is `dst.store(src.load())`, which recomputes
//! the distance for the destination address. Moving a *null* pointer by value
//! is fine (the sentinel is position-independent), which is what makes
//! "construct with nulls, then wire up in place" initialization possible.
//!
//! ## Null sentinel
//!
//! Offset 0 is null. No structure in this crate stores a pointer at the
//! address it points to, so the encoding is unambiguous, and it makes
//! zero-filled arena memory read back as all-null, which the allocators
//! rely on when carving fresh batches.

use std::marker::PhantomData;
use std::ptr::NonNull;

/// A self-relative pointer stored inside the mapped segment.
///
/// The pointee type is only a marker; `OffsetPtr` never reads or writes the
/// target itself.
#[repr(C)]
pub struct OffsetPtr<T> {
    offset: i64,
    _marker: PhantomData<*mut T>,
}

const _: () = assert!(std::mem::size_of::<OffsetPtr<u64>>() == 8);

impl<T> std::fmt::Debug for OffsetPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetPtr").field("offset", &self.offset).finish()
    }
}

impl<T> OffsetPtr<T> {
    /// A null pointer. Position-independent, so the returned value may be
    /// moved into place freely.
    pub const fn null() -> Self {
        Self {
            offset: 0,
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.offset == 0
    }

    /// Resolves the target address relative to where `self` lives.
    pub fn load(&self) -> Option<NonNull<T>> {
        if self.offset == 0 {
            return None;
        }
        let base = self as *const Self as *const u8;
        let target = base.wrapping_offset(self.offset as isize) as *mut T;
        // Non-zero offset cannot produce the pointer's own address, and the
        // segment never spans address zero.
        NonNull::new(target)
    }

    /// Retargets `self`, recomputing the distance for its current address.
    pub fn store(&mut self, target: Option<NonNull<T>>) {
        match target {
            None => self.offset = 0,
            Some(ptr) => {
                let base = self as *mut Self as i64;
                let addr = ptr.as_ptr() as i64;
                debug_assert_ne!(addr, base, "offset pointer may not target its own storage");
                self.offset = addr - base;
            }
        }
    }

    /// Raw resolved pointer; null when the sentinel is stored.
    pub fn as_ptr(&self) -> *mut T {
        match self.load() {
            Some(p) => p.as_ptr(),
            None => std::ptr::null_mut(),
        }
    }
}
