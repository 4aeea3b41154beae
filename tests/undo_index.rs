//! Undo-engine semantics over a standalone anonymous arena: creation,
//! modification, and removal under sessions, with undo / squash / commit in
//! every combination, mirroring the write patterns the database layer
//! produces.

use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::MmapMut;
use pindb::config::HEADER_SIZE;
use pindb::{ArenaObject, IndexDir, SegmentManager, SmallSizeAllocator, UndoIndex};

const ARENA_BYTES: usize = 16 << 20;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TestElement {
    id: u64,
    secondary: i32,
}

impl ArenaObject for TestElement {
    const TYPE_ID: u16 = 1;
    type Snapshot = TestElement;

    fn new_null() -> Self {
        Self { id: 0, secondary: 0 }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn snapshot(&self) -> Self {
        *self
    }

    fn restore(&mut self, snap: &Self) {
        *self = *snap;
    }
}

fn harness() -> (MmapMut, UndoIndex<TestElement>) {
    let mut map = MmapMut::map_anon(ARENA_BYTES).unwrap();
    let base = NonNull::new(map.as_mut_ptr()).unwrap();
    let seg = unsafe { SegmentManager::construct_at(base, ARENA_BYTES, HEADER_SIZE) }.unwrap();
    let small = Arc::new(unsafe { SmallSizeAllocator::bootstrap(seg) }.unwrap());
    let index = unsafe { UndoIndex::bootstrap(seg, small) }.unwrap();
    (map, index)
}

fn secondary(index: &UndoIndex<TestElement>, id: u64) -> Option<i32> {
    index.find(id).map(|e| e.secondary)
}

#[test]
fn simple_create_find_remove() {
    let (_map, mut index) = harness();

    let id = index.create(|_| {}).unwrap();
    assert_eq!(id, 0);
    assert!(index.find(0).is_some());
    assert!(index.find(1).is_none());

    let id = index.create(|_| {}).unwrap();
    assert_eq!(id, 1);
    assert_eq!(index.find(1).unwrap().id, 1);

    index.remove(0).unwrap();
    assert!(index.find(0).is_none());
    assert_eq!(index.len(), 1);
}

#[test]
fn get_reports_missing_ids() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    assert_eq!(index.get(0).unwrap().secondary, 42);
    assert!(index.get(1).is_err());
}

#[test]
fn insert_undo() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    assert_eq!(secondary(&index, 0), Some(42));
    {
        let mut session = index.start_undo_session(true);
        session.create(|e| e.secondary = 12).unwrap();
        assert_eq!(secondary(&session, 1), Some(12));
    }
    assert_eq!(secondary(&index, 0), Some(42));
    assert!(index.find(1).is_none());
    assert_eq!(index.next_id(), 1, "id counter rewinds with the frame");
}

#[test]
fn modify_undo() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut session = index.start_undo_session(true);
        session.modify(0, |e| {
            e.secondary = 18;
            Ok(())
        })
        .unwrap();
        assert_eq!(secondary(&session, 0), Some(18));
    }
    assert_eq!(secondary(&index, 0), Some(42));
}

#[test]
fn remove_undo() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut session = index.start_undo_session(true);
        session.remove(0).unwrap();
        assert!(session.find(0).is_none());
    }
    assert_eq!(secondary(&index, 0), Some(42));
}

#[test]
fn insert_modify_undo() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut session = index.start_undo_session(true);
        session.create(|e| e.secondary = 12).unwrap();
        session.modify(1, |e| {
            e.secondary = 24;
            Ok(())
        })
        .unwrap();
        assert_eq!(secondary(&session, 1), Some(24));
    }
    assert_eq!(secondary(&index, 0), Some(42));
    assert!(index.find(1).is_none());
}

#[test]
fn insert_modify_squash() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut outer = index.start_undo_session(true);
        outer.create(|e| e.secondary = 12).unwrap();
        {
            let mut inner = outer.start_undo_session(true);
            inner.modify(1, |e| {
                e.secondary = 24;
                Ok(())
            })
            .unwrap();
            inner.squash();
        }
    }
    assert_eq!(secondary(&index, 0), Some(42));
    assert!(index.find(1).is_none());
}

#[test]
fn insert_remove_undo() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut session = index.start_undo_session(true);
        session.create(|e| e.secondary = 12).unwrap();
        session.remove(1).unwrap();
        assert!(session.find(1).is_none());
    }
    assert_eq!(secondary(&index, 0), Some(42));
    assert!(index.find(1).is_none());
}

#[test]
fn insert_remove_squash() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut outer = index.start_undo_session(true);
        outer.create(|e| e.secondary = 12).unwrap();
        {
            let mut inner = outer.start_undo_session(true);
            inner.remove(1).unwrap();
            inner.squash();
        }
    }
    assert_eq!(secondary(&index, 0), Some(42));
    assert!(index.find(1).is_none());
}

#[test]
fn modify_modify_undo() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut session = index.start_undo_session(true);
        session.modify(0, |e| {
            e.secondary = 18;
            Ok(())
        })
        .unwrap();
        session.modify(0, |e| {
            e.secondary = 24;
            Ok(())
        })
        .unwrap();
        assert_eq!(secondary(&session, 0), Some(24));
    }
    // Only the first pre-image counts.
    assert_eq!(secondary(&index, 0), Some(42));
}

#[test]
fn modify_modify_squash() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut outer = index.start_undo_session(true);
        outer.modify(0, |e| {
            e.secondary = 18;
            Ok(())
        })
        .unwrap();
        {
            let mut inner = outer.start_undo_session(true);
            inner.modify(0, |e| {
                e.secondary = 24;
                Ok(())
            })
            .unwrap();
            inner.squash();
        }
    }
    assert_eq!(secondary(&index, 0), Some(42));
}

#[test]
fn modify_remove_undo() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut session = index.start_undo_session(true);
        session.modify(0, |e| {
            e.secondary = 18;
            Ok(())
        })
        .unwrap();
        session.remove(0).unwrap();
        assert!(session.find(0).is_none());
    }
    assert_eq!(secondary(&index, 0), Some(42));
}

#[test]
fn modify_remove_squash() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();
    {
        let mut outer = index.start_undo_session(true);
        outer.modify(0, |e| {
            e.secondary = 18;
            Ok(())
        })
        .unwrap();
        {
            let mut inner = outer.start_undo_session(true);
            inner.remove(0).unwrap();
            inner.squash();
        }
        assert!(outer.find(0).is_none());
    }
    assert_eq!(secondary(&index, 0), Some(42));
}

#[test]
fn circular_value_swap_restores_exactly() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 10).unwrap();
    index.create(|e| e.secondary = 11).unwrap();
    index.create(|e| e.secondary = 12).unwrap();
    {
        let mut session = index.start_undo_session(true);
        // Rotate the three values, touching each row twice.
        for (id, value) in [(0u64, 11), (1u64, 12), (2u64, 10)] {
            session.modify(id, |e| {
                e.secondary = value;
                Ok(())
            })
            .unwrap();
        }
        for (id, value) in [(0u64, 12), (1u64, 10), (2u64, 11)] {
            session.modify(id, |e| {
                e.secondary = value;
                Ok(())
            })
            .unwrap();
        }
    }
    assert_eq!(secondary(&index, 0), Some(10));
    assert_eq!(secondary(&index, 1), Some(11));
    assert_eq!(secondary(&index, 2), Some(12));
}

#[test]
fn pushed_session_survives_until_explicit_undo() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 5).unwrap();
    {
        let mut session = index.start_undo_session(true);
        session.modify(0, |e| {
            e.secondary = 7;
            Ok(())
        })
        .unwrap();
        session.push();
    }
    assert_eq!(secondary(&index, 0), Some(7));
    assert_eq!(index.undo_stack_len(), 1);

    index.undo().unwrap();
    assert_eq!(secondary(&index, 0), Some(5));
    assert_eq!(index.undo_stack_len(), 0);
}

#[test]
fn commit_makes_sessions_permanent() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 1).unwrap();
    {
        let mut session = index.start_undo_session(true);
        session.modify(0, |e| {
            e.secondary = 2;
            Ok(())
        })
        .unwrap();
        session.push();
    }
    let committed = index.revision();
    {
        let mut session = index.start_undo_session(true);
        session.modify(0, |e| {
            e.secondary = 3;
            Ok(())
        })
        .unwrap();
        session.push();
    }
    assert_eq!(index.undo_stack_len(), 2);

    index.commit(committed);
    assert_eq!(index.undo_stack_len(), 1);

    // Only the uncommitted frame rolls back.
    index.undo_all().unwrap();
    assert_eq!(secondary(&index, 0), Some(2));
}

#[test]
fn squash_then_undo_equals_undo_twice() {
    let run = |use_squash: bool| {
        let (_map, mut index) = harness();
        index.create(|e| e.secondary = 1).unwrap();
        {
            let mut outer = index.start_undo_session(true);
            outer.modify(0, |e| {
                e.secondary = 2;
                Ok(())
            })
            .unwrap();
            outer.create(|e| e.secondary = 100).unwrap();
            {
                let mut inner = outer.start_undo_session(true);
                inner.modify(0, |e| {
                    e.secondary = 3;
                    Ok(())
                })
                .unwrap();
                inner.remove(1).unwrap();
                inner.create(|e| e.secondary = 200).unwrap();
                if use_squash {
                    inner.squash();
                } else {
                    inner.undo().unwrap();
                }
            }
        }
        // Whatever the inner session did, both paths end with every frame
        // unwound.
        let values: Vec<Option<i32>> = (0..3).map(|id| secondary(&index, id)).collect();
        let next = index.next_id();
        (values, next)
    };

    assert_eq!(run(true), run(false));
    let (values, _) = run(true);
    assert_eq!(values[0], Some(1));
    assert_eq!(values[1], None);
    assert_eq!(values[2], None);
}

#[test]
fn failing_modifier_reverts_the_row() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 42).unwrap();

    let err = index.modify(0, |e| {
        e.secondary = 99;
        eyre::bail!("constraint violated");
    });
    assert!(err.is_err());
    assert_eq!(secondary(&index, 0), Some(42));
}

#[test]
fn set_revision_requires_empty_stack() {
    let (_map, mut index) = harness();
    index.set_revision(10).unwrap();
    assert_eq!(index.revision(), 10);

    index.begin_frame();
    assert!(index.set_revision(20).is_err());
    index.undo().unwrap();
    index.set_revision(20).unwrap();
    assert_eq!(index.revision(), 20);
}

#[test]
fn disabled_session_records_nothing() {
    let (_map, mut index) = harness();
    index.create(|e| e.secondary = 1).unwrap();
    {
        let mut session = index.start_undo_session(false);
        session.modify(0, |e| {
            e.secondary = 9;
            Ok(())
        })
        .unwrap();
    }
    // No frame was open: the change sticks.
    assert_eq!(secondary(&index, 0), Some(9));
    assert_eq!(index.undo_stack_len(), 0);
}

#[test]
fn index_state_survives_reattach() {
    let mut map = MmapMut::map_anon(ARENA_BYTES).unwrap();
    let base = NonNull::new(map.as_mut_ptr()).unwrap();
    let seg = unsafe { SegmentManager::construct_at(base, ARENA_BYTES, HEADER_SIZE) }.unwrap();

    {
        let small = Arc::new(unsafe { SmallSizeAllocator::bootstrap(seg) }.unwrap());
        let mut index: UndoIndex<TestElement> =
            unsafe { UndoIndex::bootstrap(seg, small) }.unwrap();
        index.create(|e| e.secondary = 7).unwrap();
        index.create(|e| e.secondary = 8).unwrap();
        index.remove(0).unwrap();
    }

    // A second process would rediscover the root through the directory.
    let small = Arc::new(unsafe { SmallSizeAllocator::attach(seg) }.unwrap());
    let root = unsafe { IndexDir::find_root(seg, TestElement::TYPE_ID) }.unwrap();
    let mut index: UndoIndex<TestElement> = unsafe { UndoIndex::attach(root, seg, small) };

    assert_eq!(index.len(), 1);
    assert!(index.find(0).is_none());
    assert_eq!(index.get(1).unwrap().secondary, 8);
    assert_eq!(index.create(|e| e.secondary = 9).unwrap(), 2);
}
