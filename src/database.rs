//! # Database Facade
//!
//! `Database` ties one [`PinnableMappedFile`] to the typed collections
//! registered on it. It owns the process-side allocator handles, the
//! type-erased index registry, and the database-wide session object that
//! brackets every registered collection at once.
//!
//! The facade is single-threaded by design (one logical writer per process,
//! mutating on the opener thread); interior mutability is a
//! `RefCell`, not a lock. Read-only openings accept every read operation and
//! refuse mutation with an error rather than a crash.
//!
//! ```ignore
//! let db = Database::open(dir, true, 8 << 20, false, MapMode::Mapped)?;
//! db.add_index::<Book>()?;
//!
//! let id = db.create::<Book>(|b| {
//!     b.a = 3;
//!     b.b = 4;
//! })?;
//!
//! {
//!     let session = db.start_undo_session(true);
//!     db.modify::<Book>(id, |b| {
//!         b.a = 7;
//!         Ok(())
//!     })?;
//!     session.push();
//! }
//! db.undo()?; // back to a = 3
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, ensure, eyre, Result};
use hashbrown::HashMap;
use tracing::error;

use crate::pinnable::{MapMode, MemoryCheckResult, PinnableMappedFile};
use crate::segment::{SegmentManager, SmallSizeAllocator};
use crate::undo::{ArenaObject, IndexDir, UndoIndex};

/// Type-erased view of a registered [`UndoIndex`], used for database-wide
/// session control.
trait AbstractIndex {
    fn begin_frame(&mut self);
    fn undo(&mut self) -> Result<()>;
    fn undo_all(&mut self) -> Result<()>;
    fn squash(&mut self);
    fn commit(&mut self, revision: i64);
    fn revision(&self) -> i64;
    fn rebind(&mut self, seg: NonNull<SegmentManager>, small: Arc<SmallSizeAllocator>)
        -> Result<()>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: ArenaObject> AbstractIndex for UndoIndex<T> {
    fn begin_frame(&mut self) {
        UndoIndex::begin_frame(self);
    }

    fn undo(&mut self) -> Result<()> {
        UndoIndex::undo(self)
    }

    fn undo_all(&mut self) -> Result<()> {
        UndoIndex::undo_all(self)
    }

    fn squash(&mut self) {
        UndoIndex::squash(self);
    }

    fn commit(&mut self, revision: i64) {
        UndoIndex::commit(self, revision);
    }

    fn revision(&self) -> i64 {
        UndoIndex::revision(self)
    }

    fn rebind(
        &mut self,
        seg: NonNull<SegmentManager>,
        small: Arc<SmallSizeAllocator>,
    ) -> Result<()> {
        UndoIndex::rebind(self, seg, small)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An open database: one mapped file plus its registered collections.
pub struct Database {
    file: PinnableMappedFile,
    small: Arc<SmallSizeAllocator>,
    indexes: RefCell<HashMap<u16, Box<dyn AbstractIndex>>>,
}

impl Database {
    /// Opens (or creates) a database under `dir`. See
    /// [`PinnableMappedFile::open`] for the sizing and dirty-flag rules.
    pub fn open(
        dir: &Path,
        writable: bool,
        shared_file_size: usize,
        allow_dirty: bool,
        mode: MapMode,
    ) -> Result<Self> {
        let file = PinnableMappedFile::open(dir, writable, shared_file_size, allow_dirty, mode)?;
        let seg = file.segment_manager();
        // SAFETY: the segment was bootstrapped at file creation; the handle
        // lives no longer than `file`.
        let small = Arc::new(unsafe { SmallSizeAllocator::attach(seg)? });
        Ok(Self {
            file,
            small,
            indexes: RefCell::new(HashMap::new()),
        })
    }

    /// Registers the collection for `T`, creating its persisted root on a
    /// writable opening and requiring it to exist on a read-only one.
    pub fn add_index<T: ArenaObject>(&self) -> Result<()> {
        let mut indexes = self.indexes.borrow_mut();
        ensure!(
            !indexes.contains_key(&T::TYPE_ID),
            "collection {} is already registered",
            T::TYPE_ID
        );
        let seg = self.file.segment_manager();
        // SAFETY: live segment manager for the lifetime of `self`.
        let index = match unsafe { IndexDir::find_root(seg, T::TYPE_ID) } {
            Some(root) => unsafe { UndoIndex::<T>::attach(root, seg, self.small.clone()) },
            None => {
                ensure!(
                    self.file.is_writable(),
                    "collection {} does not exist in this read-only database",
                    T::TYPE_ID
                );
                unsafe { UndoIndex::<T>::bootstrap(seg, self.small.clone())? }
            }
        };
        indexes.insert(T::TYPE_ID, Box::new(index));
        Ok(())
    }

    /// Creates a row, returning its id.
    pub fn create<T: ArenaObject>(&self, f: impl FnOnce(&mut T)) -> Result<u64> {
        self.ensure_writable()?;
        self.with_index::<T, _>(|index| index.create(f))?
    }

    /// Mutates the row under undo protection.
    pub fn modify<T: ArenaObject>(
        &self,
        id: u64,
        f: impl FnOnce(&mut T) -> Result<()>,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.with_index::<T, _>(|index| index.modify(id, f))?
    }

    /// Erases the row.
    pub fn remove<T: ArenaObject>(&self, id: u64) -> Result<()> {
        self.ensure_writable()?;
        self.with_index::<T, _>(|index| index.remove(id))?
    }

    /// Owned copy of the row; fails for unknown ids.
    pub fn get_value<T: ArenaObject>(&self, id: u64) -> Result<T::Snapshot> {
        self.with_index::<T, _>(|index| index.get(id).map(|row| row.snapshot()))?
    }

    /// Owned copy of the row, or `None`.
    pub fn find_value<T: ArenaObject>(&self, id: u64) -> Option<T::Snapshot> {
        self.with_index::<T, _>(|index| index.find(id).map(|row| row.snapshot()))
            .ok()
            .flatten()
    }

    /// Rows currently in the collection for `T`.
    pub fn index_len<T: ArenaObject>(&self) -> Result<usize> {
        self.with_index::<T, _>(|index| index.len())
    }

    /// Opens a database-wide session: one frame on every registered
    /// collection. Dropping the handle without `push` rolls all of them
    /// back.
    pub fn start_undo_session(&self, enabled: bool) -> DatabaseSession<'_> {
        if enabled {
            for index in self.indexes.borrow_mut().values_mut() {
                index.begin_frame();
            }
        }
        DatabaseSession {
            db: self,
            apply: enabled,
        }
    }

    /// Rolls back the most recent retained session on every collection.
    pub fn undo(&self) -> Result<()> {
        for index in self.indexes.borrow_mut().values_mut() {
            index.undo()?;
        }
        Ok(())
    }

    /// Rolls back every retained session.
    pub fn undo_all(&self) -> Result<()> {
        for index in self.indexes.borrow_mut().values_mut() {
            index.undo_all()?;
        }
        Ok(())
    }

    /// Merges the top two retained sessions on every collection.
    pub fn squash(&self) {
        for index in self.indexes.borrow_mut().values_mut() {
            index.squash();
        }
    }

    /// Makes every session with revision `<= revision` permanent.
    pub fn commit(&self, revision: i64) {
        for index in self.indexes.borrow_mut().values_mut() {
            index.commit(revision);
        }
    }

    /// Revision of the most recent session across the registered
    /// collections (they move in lockstep under database-wide sessions).
    pub fn revision(&self) -> i64 {
        self.indexes
            .borrow()
            .values()
            .next()
            .map(|index| index.revision())
            .unwrap_or(0)
    }

    /// See [`PinnableMappedFile::check_memory_and_flush_if_needed`].
    pub fn check_memory_and_flush_if_needed(&mut self) -> Result<Option<MemoryCheckResult>> {
        self.file.check_memory_and_flush_if_needed()
    }

    pub fn set_oom_threshold(&mut self, threshold: u16) {
        self.file.set_oom_threshold(threshold);
    }

    pub fn set_oom_delay(&mut self, delay: Duration) {
        self.file.set_oom_delay(delay);
    }

    /// Switches a shared writable binding back to `mapped_private` and
    /// re-derives every index handle against the new mapping. Refused while
    /// undo sessions are open.
    pub fn revert_to_private_mode(&mut self) -> Result<()> {
        self.file.revert_to_private_mode()?;
        let seg = self.file.segment_manager();
        // SAFETY: same segment state behind the fresh mapping.
        let small = Arc::new(unsafe { SmallSizeAllocator::attach(seg)? });
        for index in self.indexes.borrow_mut().values_mut() {
            index.rebind(seg, small.clone())?;
        }
        self.small = small;
        Ok(())
    }

    /// Runs `f` against the typed index for `T`.
    ///
    /// The borrow lasts for the duration of `f`; copies of row data must be
    /// taken inside the callback.
    pub fn with_index<T: ArenaObject, R>(
        &self,
        f: impl FnOnce(&mut UndoIndex<T>) -> R,
    ) -> Result<R> {
        let mut indexes = self.indexes.borrow_mut();
        let entry = indexes
            .get_mut(&T::TYPE_ID)
            .ok_or_else(|| eyre!("collection {} is not registered", T::TYPE_ID))?;
        let index = entry
            .as_any_mut()
            .downcast_mut::<UndoIndex<T>>()
            .expect("registry maps each type id to its own index type");
        Ok(f(index))
    }

    pub fn segment_manager(&self) -> NonNull<SegmentManager> {
        self.file.segment_manager()
    }

    /// Bytes currently free in the arena.
    pub fn free_memory(&self) -> usize {
        // SAFETY: live segment manager, shared read.
        unsafe { self.file.segment_manager().as_ref() }.free_memory()
    }

    pub fn is_writable(&self) -> bool {
        self.file.is_writable()
    }

    pub fn mode(&self) -> MapMode {
        self.file.mode()
    }

    pub fn database_size(&self) -> usize {
        self.file.database_size()
    }

    /// Flushes and closes the backing file, clearing the dirty flag. Open
    /// retained sessions are forgotten, exactly as a crash before commit
    /// would forget them.
    pub fn close(self) -> Result<()> {
        drop(self.indexes);
        self.file.close()
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.file.is_writable() {
            bail!("database opened read-only");
        }
        Ok(())
    }
}

/// Scoped database-wide write session.
pub struct DatabaseSession<'db> {
    db: &'db Database,
    apply: bool,
}

impl DatabaseSession<'_> {
    /// Retains the session; it becomes committable and [`Database::undo`]
    /// can still roll it back.
    pub fn push(mut self) {
        self.apply = false;
    }

    /// Merges this session into the enclosing one.
    pub fn squash(mut self) {
        if self.apply {
            self.db.squash();
        }
        self.apply = false;
    }

    /// Rolls the session back immediately.
    pub fn undo(mut self) -> Result<()> {
        if self.apply {
            self.apply = false;
            return self.db.undo();
        }
        Ok(())
    }

    pub fn revision(&self) -> i64 {
        self.db.revision()
    }
}

impl Drop for DatabaseSession<'_> {
    fn drop(&mut self) {
        if self.apply {
            if let Err(err) = self.db.undo() {
                error!(%err, "rolling back database session failed");
            }
        }
    }
}
