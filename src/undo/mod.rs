//! # Undo Engine
//!
//! [`UndoIndex`] is a typed object collection living in the segment, with
//! multi-level undo layered on top. Rows are allocated from a per-type node
//! pool and reached through a growable id table (both in the arena, both
//! offset-pointer based, both persistent); the undo bookkeeping is
//! process-local and holds *owned snapshots* of row pre-images.
//!
//! ## Frames
//!
//! Each open session contributes one frame:
//!
//! ```text
//! UndoFrame
//! ├── new_ids          ids created inside the frame
//! ├── old_values       id -> pre-image of rows that existed before the
//! │                    frame and were modified inside it
//! ├── removed_values   id -> pre-image of rows deleted inside the frame
//! └── old_next_id      id counter at frame start
//! ```
//!
//! The three sets are pairwise disjoint, and a row mutated repeatedly inside
//! one frame records only its first pre-image. `undo` applies the inverse of
//! the frame: drop `new_ids`, restore `old_values`, reinsert
//! `removed_values`, rewind the id counter. `squash` merges the top frame
//! into its parent under the rules spelled out on [`UndoIndex::squash`];
//! `commit` discards frames from the bottom of the stack, making them
//! permanent.
//!
//! ## Sessions
//!
//! [`UndoSession`] is the scoped handle: it dereferences to the index so
//! operations run through it, and its drop rolls the frame back unless
//! `push` was called. Nesting sessions forms a pure stack.
//!
//! ## Failure behavior
//!
//! A modifier callback returning an error leaves the row byte-identical to
//! its pre-image; allocator exhaustion inside a session surfaces as an error
//! and the session's rollback undoes whatever had already applied.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result};
use hashbrown::{HashMap, HashSet};
use tracing::error;

use crate::config::INDEX_DIR_CAPACITY;
use crate::segment::{NodePool, OffsetPtr, PoolState, SegmentManager, SmallSizeAllocator};

/// A value stored in an [`UndoIndex`].
///
/// Implementations describe how a row is placed into the arena, snapshotted
/// for undo, and disposed. Plain-old-data rows use `Snapshot = Self`; rows
/// carrying [`crate::segment::SharedBlob`] fields snapshot the blob handles
/// (which pins the buffers) and release them in `dispose`.
pub trait ArenaObject: Sized + 'static {
    /// Distinguishes this collection inside the segment's index directory.
    const TYPE_ID: u16;

    /// Owned pre-image used by undo frames.
    type Snapshot;

    /// A row with every arena pointer null; safe to move by value into its
    /// slot before [`ArenaObject::attach`] wires it up.
    fn new_null() -> Self;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);

    /// Wires arena-backed fields once the row sits at its final address.
    ///
    /// # Safety
    ///
    /// `self` must already live at its final arena address and `seg` must be
    /// the live manager of that arena.
    unsafe fn attach(&mut self, seg: NonNull<SegmentManager>) {
        let _ = seg;
    }

    fn snapshot(&self) -> Self::Snapshot;

    /// Overwrites `self` with the state captured in `snap`.
    fn restore(&mut self, snap: &Self::Snapshot);

    /// Releases arena resources owned by the row before its slot is
    /// recycled.
    fn dispose(&mut self) {}
}

// ---------------------------------------------------------------------------
// In-arena state
// ---------------------------------------------------------------------------

/// Persisted root of one typed collection.
#[repr(C)]
pub struct IndexRoot {
    next_id: u64,
    revision: i64,
    count: u64,
    /// Growable array of `OffsetPtr<u8>` row slots, indexed by id.
    table: OffsetPtr<u8>,
    table_cap: u64,
    pool: PoolState,
}

const SLOT_SIZE: usize = 8;
const _: () = assert!(std::mem::size_of::<OffsetPtr<u8>>() == SLOT_SIZE);

#[repr(C)]
struct DirEntry {
    /// `u64::MAX` marks an empty entry.
    type_id: u64,
    root: OffsetPtr<u8>,
}

/// Persisted directory mapping type ids to index roots, hung off the
/// segment's index-root slot.
#[repr(C)]
pub struct IndexDir {
    entries: [DirEntry; INDEX_DIR_CAPACITY],
}

const EMPTY_ENTRY: u64 = u64::MAX;

impl IndexDir {
    /// Returns the segment's directory, creating it on first use when
    /// `create` is set.
    ///
    /// # Safety
    ///
    /// `seg` must point at a live segment manager.
    pub unsafe fn get_or_create(
        seg: NonNull<SegmentManager>,
        small: &SmallSizeAllocator,
        create: bool,
    ) -> Result<Option<NonNull<IndexDir>>> {
        if let Some(root) = seg.as_ref().index_root() {
            return Ok(Some(root.cast()));
        }
        if !create {
            return Ok(None);
        }
        let raw = small.backing_allocate(std::mem::size_of::<IndexDir>())?;
        let dir = raw.cast::<IndexDir>();
        for i in 0..INDEX_DIR_CAPACITY {
            let entry = &mut (*dir.as_ptr()).entries[i];
            entry.type_id = EMPTY_ENTRY;
            entry.root = OffsetPtr::null();
        }
        (*seg.as_ptr()).set_index_root(Some(raw));
        Ok(Some(dir))
    }

    /// Looks up the root registered for `type_id`.
    ///
    /// # Safety
    ///
    /// `seg` must point at a live segment manager.
    pub unsafe fn find_root(
        seg: NonNull<SegmentManager>,
        type_id: u16,
    ) -> Option<NonNull<IndexRoot>> {
        let dir = seg.as_ref().index_root()?.cast::<IndexDir>();
        for entry in &(*dir.as_ptr()).entries {
            if entry.type_id == type_id as u64 {
                return entry.root.load().map(NonNull::cast);
            }
        }
        None
    }

    unsafe fn register(
        dir: NonNull<IndexDir>,
        type_id: u16,
        root: NonNull<IndexRoot>,
    ) -> Result<()> {
        for entry in &mut (*dir.as_ptr()).entries {
            if entry.type_id == EMPTY_ENTRY {
                entry.type_id = type_id as u64;
                entry.root.store(Some(root.cast()));
                return Ok(());
            }
        }
        bail!(
            "index directory full ({} collections registered)",
            INDEX_DIR_CAPACITY
        );
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

struct UndoFrame<T: ArenaObject> {
    old_next_id: u64,
    new_ids: HashSet<u64>,
    old_values: HashMap<u64, T::Snapshot>,
    removed_values: HashMap<u64, T::Snapshot>,
}

impl<T: ArenaObject> UndoFrame<T> {
    fn new(old_next_id: u64) -> Self {
        Self {
            old_next_id,
            new_ids: HashSet::new(),
            old_values: HashMap::new(),
            removed_values: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// UndoIndex
// ---------------------------------------------------------------------------

/// A typed, undo-aware object collection over one segment.
pub struct UndoIndex<T: ArenaObject> {
    seg: NonNull<SegmentManager>,
    small: Arc<SmallSizeAllocator>,
    root: NonNull<IndexRoot>,
    stack: VecDeque<UndoFrame<T>>,
    _marker: PhantomData<fn(T)>,
}

impl<T: ArenaObject> UndoIndex<T> {
    /// Allocates a fresh root in the segment and registers it in the
    /// directory.
    ///
    /// # Safety
    ///
    /// `seg` must point at the live segment manager behind `small`, opened
    /// writable, on the opener thread.
    pub unsafe fn bootstrap(
        seg: NonNull<SegmentManager>,
        small: Arc<SmallSizeAllocator>,
    ) -> Result<Self> {
        ensure!(
            IndexDir::find_root(seg, T::TYPE_ID).is_none(),
            "collection with type id {} already exists",
            T::TYPE_ID
        );
        let dir = IndexDir::get_or_create(seg, &small, true)?
            .expect("directory created on demand");
        let raw = small.backing_allocate(std::mem::size_of::<IndexRoot>())?;
        let root = raw.cast::<IndexRoot>();
        root.as_ptr().write(IndexRoot {
            next_id: 0,
            revision: 0,
            count: 0,
            table: OffsetPtr::null(),
            table_cap: 0,
            pool: PoolState::new(),
        });
        IndexDir::register(dir, T::TYPE_ID, root)?;
        Ok(Self::attach(root, seg, small))
    }

    /// Binds to a root found in the directory.
    ///
    /// # Safety
    ///
    /// `root` must be the root that has always been used for `T` on this
    /// segment, and `seg`/`small` must belong to the same arena.
    pub unsafe fn attach(
        root: NonNull<IndexRoot>,
        seg: NonNull<SegmentManager>,
        small: Arc<SmallSizeAllocator>,
    ) -> Self {
        Self {
            seg,
            small,
            root,
            stack: VecDeque::new(),
            _marker: PhantomData,
        }
    }

    /// Allocates an id, places a row constructed by `f`, and records the
    /// creation in the open frame (if any). Returns the new id.
    pub fn create(&mut self, f: impl FnOnce(&mut T)) -> Result<u64> {
        let id = self.root_ref().next_id;
        self.ensure_table_capacity(id + 1)?;
        let node = self.with_pool(|pool| pool.allocate(1))?;
        // SAFETY: fresh exclusive slot of size_of::<T>() bytes; the row is
        // written null-initialized before any pointer wiring.
        unsafe {
            node.as_ptr().write(T::new_null());
            (*node.as_ptr()).set_id(id);
            (*node.as_ptr()).attach(self.seg);
            f(&mut *node.as_ptr());
            debug_assert_eq!((*node.as_ptr()).id(), id, "constructor must not change the id");
            (*self.slot_ptr(id).expect("capacity ensured above")).store(Some(node.cast()));
        }
        let root = self.root_mut();
        root.count += 1;
        root.next_id = id + 1;

        if let Some(frame) = self.stack.back_mut() {
            // A create that resurrects an id removed earlier in the same
            // frame collapses with the removal into a plain modification.
            if let Some(snap) = frame.removed_values.remove(&id) {
                frame.old_values.insert(id, snap);
            } else {
                frame.new_ids.insert(id);
            }
        }
        Ok(id)
    }

    pub fn find(&self, id: u64) -> Option<&T> {
        // SAFETY: a non-null slot targets a live row owned by this index;
        // shared access is fine under the single-writer discipline.
        self.node_ptr(id).map(|node| unsafe { &*node.as_ptr() })
    }

    pub fn get(&self, id: u64) -> Result<&T> {
        self.find(id)
            .ok_or_else(|| eyre!("id {id} not found in collection {}", T::TYPE_ID))
    }

    /// Applies `f` to the row. The first mutation inside a frame snapshots
    /// the pre-image; a failing `f` leaves the row byte-identical to before
    /// the call.
    pub fn modify(&mut self, id: u64, f: impl FnOnce(&mut T) -> Result<()>) -> Result<()> {
        let node = self
            .node_ptr(id)
            .ok_or_else(|| eyre!("id {id} not found in collection {}", T::TYPE_ID))?;

        if let Some(frame) = self.stack.back_mut() {
            if !frame.new_ids.contains(&id)
                && !frame.old_values.contains_key(&id)
                && !frame.removed_values.contains_key(&id)
            {
                // SAFETY: live row; snapshot takes no references into it.
                let snap = unsafe { (*node.as_ptr()).snapshot() };
                frame.old_values.insert(id, snap);
            }
        }

        // SAFETY: exclusive access through &mut self; no other reference to
        // this row exists during the callback.
        let row = unsafe { &mut *node.as_ptr() };
        let revert = row.snapshot();
        match f(row) {
            Ok(()) => {
                debug_assert_eq!(row.id(), id, "modifier must not change the id");
                Ok(())
            }
            Err(err) => {
                row.restore(&revert);
                Err(err)
            }
        }
    }

    /// Erases the row, recording the pre-image in the open frame unless the
    /// row was created inside that same frame.
    pub fn remove(&mut self, id: u64) -> Result<()> {
        let node = self
            .node_ptr(id)
            .ok_or_else(|| eyre!("id {id} not found in collection {}", T::TYPE_ID))?;

        if let Some(frame) = self.stack.back_mut() {
            if frame.new_ids.remove(&id) {
                // Created in this frame: the object never existed outside it.
            } else if let Some(snap) = frame.old_values.remove(&id) {
                frame.removed_values.insert(id, snap);
            } else {
                // SAFETY: live row, snapshot before disposal.
                let snap = unsafe { (*node.as_ptr()).snapshot() };
                frame.removed_values.insert(id, snap);
            }
        }

        // SAFETY: slot verified non-null above; the node is disposed exactly
        // once and the slot cleared before anyone can observe it.
        unsafe {
            self.dispose_node(node);
            (*self.slot_ptr(id).expect("row existed")).store(None);
        }
        self.root_mut().count -= 1;
        Ok(())
    }

    /// Opens a scoped session. With `enabled = false` the session is a
    /// no-op handle and nothing is recorded.
    pub fn start_undo_session(&mut self, enabled: bool) -> UndoSession<'_, T> {
        if enabled {
            self.begin_frame();
        }
        UndoSession {
            index: self,
            apply: enabled,
        }
    }

    /// Pushes a fresh frame; prefer [`UndoIndex::start_undo_session`].
    pub fn begin_frame(&mut self) {
        let next_id = self.root_ref().next_id;
        self.stack.push_back(UndoFrame::new(next_id));
        self.root_mut().revision += 1;
    }

    /// Pops the top frame and applies its inverse.
    pub fn undo(&mut self) -> Result<()> {
        let Some(frame) = self.stack.pop_back() else {
            return Ok(());
        };
        let UndoFrame {
            old_next_id,
            new_ids,
            old_values,
            removed_values,
        } = frame;

        for id in new_ids {
            if let Some(node) = self.node_ptr(id) {
                // SAFETY: live row created inside the frame being undone.
                unsafe {
                    self.dispose_node(node);
                    (*self.slot_ptr(id).expect("row existed")).store(None);
                }
                self.root_mut().count -= 1;
            }
        }
        for (id, snap) in old_values {
            match self.node_ptr(id) {
                // SAFETY: exclusive access through &mut self.
                Some(node) => unsafe { (*node.as_ptr()).restore(&snap) },
                None => self.reinsert(id, &snap)?,
            }
        }
        for (id, snap) in removed_values {
            self.reinsert(id, &snap)?;
        }

        let root = self.root_mut();
        root.next_id = old_next_id;
        root.revision -= 1;
        Ok(())
    }

    pub fn undo_all(&mut self) -> Result<()> {
        while !self.stack.is_empty() {
            self.undo()?;
        }
        Ok(())
    }

    /// Merges the top frame into the one below it.
    ///
    /// - ids created in the top frame become creations of the parent, except
    ///   that re-creating an id the parent removed collapses into a parent
    ///   modification;
    /// - removals drop entirely when the parent created the id, demote a
    ///   parent modification to a parent removal (keeping the parent's
    ///   earlier pre-image), and carry over otherwise;
    /// - pre-images carry over only when the parent has no earlier record of
    ///   the id.
    pub fn squash(&mut self) {
        if self.stack.is_empty() {
            return;
        }
        if self.stack.len() == 1 {
            self.stack.pop_back();
            self.root_mut().revision -= 1;
            return;
        }
        let top = self.stack.pop_back().expect("checked non-empty");
        let prev = self.stack.back_mut().expect("two frames existed");

        for id in top.new_ids {
            if let Some(snap) = prev.removed_values.remove(&id) {
                prev.old_values.insert(id, snap);
            } else {
                prev.new_ids.insert(id);
            }
        }
        for (id, snap) in top.removed_values {
            if prev.new_ids.remove(&id) {
                // Created and destroyed within the combined session.
            } else if let Some(earlier) = prev.old_values.remove(&id) {
                prev.removed_values.insert(id, earlier);
            } else {
                prev.removed_values.insert(id, snap);
            }
        }
        for (id, snap) in top.old_values {
            if !prev.new_ids.contains(&id) && !prev.old_values.contains_key(&id) {
                prev.old_values.insert(id, snap);
            }
        }
        self.root_mut().revision -= 1;
    }

    /// Discards all frames with revision `<= target`; they become permanent.
    pub fn commit(&mut self, target: i64) {
        let target = target.min(self.revision());
        while !self.stack.is_empty() && self.revision() - (self.stack.len() as i64) < target {
            self.stack.pop_front();
        }
    }

    /// Revision of the most recent session (committed or open).
    pub fn revision(&self) -> i64 {
        self.root_ref().revision
    }

    /// Resets the revision counter; only legal with no open frames.
    pub fn set_revision(&mut self, revision: u64) -> Result<()> {
        ensure!(
            self.stack.is_empty(),
            "cannot set revision while an undo stack exists"
        );
        ensure!(revision <= i64::MAX as u64, "revision too high");
        self.root_mut().revision = revision as i64;
        Ok(())
    }

    pub fn undo_stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Rows currently in the collection.
    pub fn len(&self) -> usize {
        self.root_ref().count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_id(&self) -> u64 {
        self.root_ref().next_id
    }

    pub fn root_ptr(&self) -> NonNull<IndexRoot> {
        self.root
    }

    /// Re-derives the arena pointers after the backing mapping moved (e.g.
    /// a revert to private mode). Refused while frames are open: their
    /// snapshots may reference the old mapping.
    pub fn rebind(
        &mut self,
        seg: NonNull<SegmentManager>,
        small: Arc<SmallSizeAllocator>,
    ) -> Result<()> {
        ensure!(
            self.stack.is_empty(),
            "cannot rebind an index with open undo sessions"
        );
        // SAFETY: the directory persisted in the segment; the root for this
        // type id was registered at bootstrap.
        let root = unsafe { IndexDir::find_root(seg, T::TYPE_ID) }
            .ok_or_else(|| eyre!("collection {} missing from directory", T::TYPE_ID))?;
        self.seg = seg;
        self.small = small;
        self.root = root;
        Ok(())
    }

    // -- internals ---------------------------------------------------------

    fn root_ref(&self) -> &IndexRoot {
        // SAFETY: root is a live arena allocation owned by this index.
        unsafe { self.root.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    fn root_mut(&mut self) -> &mut IndexRoot {
        // SAFETY: exclusive through &mut self.
        unsafe { &mut *self.root.as_ptr() }
    }

    fn with_pool<R>(&mut self, f: impl FnOnce(&mut NodePool<'_, T>) -> R) -> R {
        // SAFETY: the pool state is embedded in the live root and has only
        // ever been used for `T`.
        let state = unsafe { &mut (*self.root.as_ptr()).pool };
        let mut pool = unsafe { NodePool::new(state, &self.small) };
        f(&mut pool)
    }

    unsafe fn dispose_node(&mut self, node: NonNull<T>) {
        (*node.as_ptr()).dispose();
        // SAFETY: the node came from this pool with n == 1 and its row was
        // disposed above.
        self.with_pool(|pool| unsafe { pool.deallocate(node, 1) });
    }

    fn reinsert(&mut self, id: u64, snap: &T::Snapshot) -> Result<()> {
        self.ensure_table_capacity(id + 1)?;
        let node = self.with_pool(|pool| pool.allocate(1))?;
        // SAFETY: fresh exclusive slot; same placement protocol as create.
        unsafe {
            node.as_ptr().write(T::new_null());
            (*node.as_ptr()).set_id(id);
            (*node.as_ptr()).attach(self.seg);
            (*node.as_ptr()).restore(snap);
            (*self.slot_ptr(id).expect("capacity ensured above")).store(Some(node.cast()));
        }
        self.root_mut().count += 1;
        Ok(())
    }

    fn slot_ptr(&self, id: u64) -> Option<*mut OffsetPtr<u8>> {
        let root = self.root_ref();
        if id >= root.table_cap {
            return None;
        }
        let base = root.table.load()?;
        // SAFETY: the table allocation spans `table_cap` slots.
        Some(unsafe { base.as_ptr().add(id as usize * SLOT_SIZE) }.cast())
    }

    fn node_ptr(&self, id: u64) -> Option<NonNull<T>> {
        let slot = self.slot_ptr(id)?;
        // SAFETY: slot lies inside the live table.
        unsafe { (*slot).load() }.map(NonNull::cast)
    }

    /// Grows the id table, recomputing every stored offset for the new
    /// location (offset pointers cannot be memcpy'd between addresses).
    fn ensure_table_capacity(&mut self, needed: u64) -> Result<()> {
        let (old_cap, old_base) = {
            let root = self.root_ref();
            (root.table_cap, root.table.load())
        };
        if needed <= old_cap {
            return Ok(());
        }
        let new_cap = needed.max(old_cap * 2).max(64);
        let new_base = self.small.allocate(new_cap as usize * SLOT_SIZE)?;

        // SAFETY: fresh table of `new_cap` slots; each slot is initialized
        // before use and old entries are re-targeted via load/store.
        unsafe {
            for i in 0..new_cap as usize {
                let slot = new_base.as_ptr().add(i * SLOT_SIZE).cast::<OffsetPtr<u8>>();
                slot.write(OffsetPtr::null());
            }
            for i in 0..old_cap as usize {
                let old_slot = old_base
                    .expect("non-zero capacity has a table")
                    .as_ptr()
                    .add(i * SLOT_SIZE)
                    .cast::<OffsetPtr<u8>>();
                let new_slot = new_base.as_ptr().add(i * SLOT_SIZE).cast::<OffsetPtr<u8>>();
                (*new_slot).store((*old_slot).load());
            }
            if let Some(old) = old_base {
                self.small.deallocate(old, old_cap as usize * SLOT_SIZE);
            }
        }
        let root = self.root_mut();
        root.table.store(Some(new_base));
        root.table_cap = new_cap;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Scoped write session over an [`UndoIndex`].
///
/// Dereferences to the index, so reads and writes flow through the session
/// while it is open. Dropping the session without [`UndoSession::push`]
/// rolls the frame back, including on early returns and panics.
pub struct UndoSession<'a, T: ArenaObject> {
    index: &'a mut UndoIndex<T>,
    apply: bool,
}

impl<T: ArenaObject> UndoSession<'_, T> {
    /// Retains the frame: it stays on the stack and becomes committable.
    pub fn push(mut self) {
        self.apply = false;
    }

    /// Merges the frame into the session below.
    pub fn squash(mut self) {
        if self.apply {
            self.index.squash();
        }
        self.apply = false;
    }

    /// Rolls the frame back immediately.
    pub fn undo(mut self) -> Result<()> {
        if self.apply {
            self.apply = false;
            return self.index.undo();
        }
        Ok(())
    }
}

impl<'a, T: ArenaObject> Deref for UndoSession<'a, T> {
    type Target = UndoIndex<T>;

    fn deref(&self) -> &UndoIndex<T> {
        self.index
    }
}

impl<T: ArenaObject> DerefMut for UndoSession<'_, T> {
    fn deref_mut(&mut self) -> &mut UndoIndex<T> {
        self.index
    }
}

impl<T: ArenaObject> Drop for UndoSession<'_, T> {
    fn drop(&mut self) {
        if self.apply {
            if let Err(err) = self.index.undo() {
                error!(%err, "rolling back undo session failed");
            }
        }
    }
}
