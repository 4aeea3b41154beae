//! End-to-end database scenarios: concurrent read-only openings, session
//! semantics, persistence across close/reopen, map-mode round trips, and the
//! memory-pressure flush loop for `mapped_private`.

use std::sync::Mutex;
use std::time::Duration;

use pindb::pinnable::pagemap;
use pindb::{ArenaObject, Database, DbError, MapMode};
use tempfile::{tempdir, TempDir};

const DB_SIZE: usize = 8 * 1024 * 1024;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Book {
    id: u64,
    a: i32,
    b: i32,
}

impl ArenaObject for Book {
    const TYPE_ID: u16 = 0;
    type Snapshot = Book;

    fn new_null() -> Self {
        Self { id: 0, a: 0, b: 1 }
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

/// Temp directory on a real filesystem (the cargo target dir), for modes
/// that refuse tmpfs.
fn disk_backed_dir() -> TempDir {
    let base = env!("CARGO_TARGET_TMPDIR");
    std::fs::create_dir_all(base).unwrap();
    tempfile::tempdir_in(base).unwrap()
}

fn is_tmpfs_rejection(err: &eyre::Report) -> bool {
    err.downcast_ref::<DbError>() == Some(&DbError::TempfsIncompatibleMode)
}

/// `clear_refs` and the instance tracker are process-global, and writable
/// `mapped_private` instances must be externally serialized. The tests that
/// create them take this lock.
static PRIVATE_MODE_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn open_and_create() {
    let dir = tempdir().unwrap();

    let db = Database::open(dir.path(), true, DB_SIZE, false, MapMode::Mapped).unwrap();
    // Second opening of the same directory, read-only, while the writer is
    // live. The writer holds the dirty flag, so allow_dirty is required.
    let db2 = Database::open(dir.path(), false, 0, true, MapMode::Mapped).unwrap();

    // The collection does not exist yet in the read-only opening.
    assert!(db2.add_index::<Book>().is_err());

    db.add_index::<Book>().unwrap();
    assert!(db.add_index::<Book>().is_err(), "cannot register twice");

    // Now the root exists in the shared segment.
    db2.add_index::<Book>().unwrap();

    let id = db
        .create::<Book>(|b| {
            b.a = 3;
            b.b = 4;
        })
        .unwrap();
    assert_eq!(id, 0);

    let mine = db.get_value::<Book>(0).unwrap();
    let theirs = db2.get_value::<Book>(0).unwrap();
    assert_eq!(mine.a, theirs.a);
    assert_eq!(mine.b, theirs.b);

    db.modify::<Book>(0, |b| {
        b.a = 5;
        b.b = 6;
        Ok(())
    })
    .unwrap();
    assert_eq!(db.get_value::<Book>(0).unwrap(), db2.get_value::<Book>(0).unwrap());

    // S1: a session dropped without push rolls back.
    {
        let _session = db.start_undo_session(true);
        db.modify::<Book>(0, |b| {
            b.a = 7;
            b.b = 8;
            Ok(())
        })
        .unwrap();
        let inside = db.get_value::<Book>(0).unwrap();
        assert_eq!((inside.a, inside.b), (7, 8));
    }
    let after = db.get_value::<Book>(0).unwrap();
    assert_eq!((after.a, after.b), (5, 6));

    // S2: a pushed session survives until an explicit undo.
    {
        let session = db.start_undo_session(true);
        db.modify::<Book>(0, |b| {
            b.a = 7;
            b.b = 8;
            Ok(())
        })
        .unwrap();
        session.push();
    }
    let pushed = db.get_value::<Book>(0).unwrap();
    assert_eq!((pushed.a, pushed.b), (7, 8));
    db.undo().unwrap();
    let undone = db.get_value::<Book>(0).unwrap();
    assert_eq!((undone.a, undone.b), (5, 6));

    // S3: unknown ids are an error, not a crash.
    assert!(db2.get_value::<Book>(1).is_err());

    drop(db2);
    db.close().unwrap();
}

#[test]
fn committed_rows_survive_reopen_byte_identical() {
    let dir = tempdir().unwrap();
    let expected: Vec<(i32, i32)> = (0..100).map(|i| (i, i * 2 + 1)).collect();

    {
        let db = Database::open(dir.path(), true, DB_SIZE, false, MapMode::Mapped).unwrap();
        db.add_index::<Book>().unwrap();
        for &(a, b) in &expected {
            db.create::<Book>(|book| {
                book.a = a;
                book.b = b;
            })
            .unwrap();
        }
        db.remove::<Book>(10).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(dir.path(), true, 0, false, MapMode::Mapped).unwrap();
    db.add_index::<Book>().unwrap();
    assert_eq!(db.index_len::<Book>().unwrap(), 99);
    for (i, &(a, b)) in expected.iter().enumerate() {
        if i == 10 {
            assert!(db.find_value::<Book>(10).is_none(), "removed row stays removed");
            continue;
        }
        let row = db.get_value::<Book>(i as u64).unwrap();
        assert_eq!((row.a, row.b), (a, b), "row {i} read back intact");
    }
    // Id allocation continues after the persisted counter.
    assert_eq!(db.create::<Book>(|_| {}).unwrap(), 100);
    db.close().unwrap();
}

#[test]
fn session_rollback_restores_every_row_and_the_id_set() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path(), true, DB_SIZE, false, MapMode::Mapped).unwrap();
    db.add_index::<Book>().unwrap();

    for i in 0..10 {
        db.create::<Book>(|b| {
            b.a = i;
            b.b = -i;
        })
        .unwrap();
    }
    let before: Vec<Option<Book>> = (0..12).map(|id| db.find_value::<Book>(id)).collect();

    {
        let _session = db.start_undo_session(true);
        db.modify::<Book>(3, |b| {
            b.a = 999;
            Ok(())
        })
        .unwrap();
        db.remove::<Book>(7).unwrap();
        db.create::<Book>(|b| b.a = 1000).unwrap();
        db.create::<Book>(|b| b.a = 1001).unwrap();
        db.remove::<Book>(10).unwrap();
    }

    let after: Vec<Option<Book>> = (0..12).map(|id| db.find_value::<Book>(id)).collect();
    assert_eq!(before, after);
    assert_eq!(db.index_len::<Book>().unwrap(), 10);
    db.close().unwrap();
}

#[test]
fn squash_then_undo_matches_undo_twice() {
    let scenario = |squash: bool| {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), true, DB_SIZE, false, MapMode::Mapped).unwrap();
        db.add_index::<Book>().unwrap();
        db.create::<Book>(|b| b.a = 1).unwrap();

        let outer = db.start_undo_session(true);
        db.modify::<Book>(0, |b| {
            b.a = 2;
            Ok(())
        })
        .unwrap();
        let inner = db.start_undo_session(true);
        db.modify::<Book>(0, |b| {
            b.a = 3;
            Ok(())
        })
        .unwrap();
        db.create::<Book>(|b| b.a = 4).unwrap();

        if squash {
            inner.squash();
            outer.undo().unwrap();
        } else {
            inner.undo().unwrap();
            outer.undo().unwrap();
        }

        let state: Vec<Option<Book>> = (0..2).map(|id| db.find_value::<Book>(id)).collect();
        let len = db.index_len::<Book>().unwrap();
        db.close().unwrap();
        (state, len)
    };

    assert_eq!(scenario(true), scenario(false));
    let (state, len) = scenario(true);
    assert_eq!(state[0].unwrap().a, 1);
    assert!(state[1].is_none());
    assert_eq!(len, 1);
}

#[test]
fn read_only_database_refuses_mutation() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(dir.path(), true, DB_SIZE, false, MapMode::Mapped).unwrap();
        db.add_index::<Book>().unwrap();
        db.create::<Book>(|b| b.a = 1).unwrap();
        db.close().unwrap();
    }
    let db = Database::open(dir.path(), false, 0, false, MapMode::Mapped).unwrap();
    db.add_index::<Book>().unwrap();
    assert_eq!(db.get_value::<Book>(0).unwrap().a, 1);
    assert!(db.create::<Book>(|_| {}).is_err());
    assert!(db
        .modify::<Book>(0, |b| {
            b.a = 2;
            Ok(())
        })
        .is_err());
    assert!(db.remove::<Book>(0).is_err());
}

#[test]
#[cfg(unix)]
fn heap_mode_loads_and_writes_back() {
    let dir = disk_backed_dir();
    {
        let db = Database::open(dir.path(), true, DB_SIZE, false, MapMode::Mapped).unwrap();
        db.add_index::<Book>().unwrap();
        db.create::<Book>(|b| b.a = 11).unwrap();
        db.close().unwrap();
    }

    match Database::open(dir.path(), true, 0, false, MapMode::Heap) {
        Ok(db) => {
            db.add_index::<Book>().unwrap();
            assert_eq!(db.get_value::<Book>(0).unwrap().a, 11);
            db.modify::<Book>(0, |b| {
                b.a = 22;
                Ok(())
            })
            .unwrap();
            db.create::<Book>(|b| b.a = 33).unwrap();
            db.close().unwrap();
        }
        Err(err) if is_tmpfs_rejection(&err) => return,
        Err(err) => panic!("heap open failed: {err:?}"),
    }

    // The anonymous region was copied back on close.
    let db = Database::open(dir.path(), true, 0, false, MapMode::Mapped).unwrap();
    db.add_index::<Book>().unwrap();
    assert_eq!(db.get_value::<Book>(0).unwrap().a, 22);
    assert_eq!(db.get_value::<Book>(1).unwrap().a, 33);
    db.close().unwrap();
}

#[test]
#[cfg(unix)]
fn locked_mode_pins_or_reports_no_mlock() {
    let dir = disk_backed_dir();
    {
        let db = Database::open(dir.path(), true, DB_SIZE, false, MapMode::Mapped).unwrap();
        db.add_index::<Book>().unwrap();
        db.create::<Book>(|b| b.a = 5).unwrap();
        db.close().unwrap();
    }

    match Database::open(dir.path(), true, 0, false, MapMode::Locked) {
        Ok(db) => {
            db.add_index::<Book>().unwrap();
            assert_eq!(db.get_value::<Book>(0).unwrap().a, 5);
            db.close().unwrap();
        }
        // RLIMIT_MEMLOCK or tmpfs keep this environment from exercising the
        // mode; both rejections are legitimate outcomes here.
        Err(err) => {
            let kind = err.downcast_ref::<DbError>();
            assert!(
                kind == Some(&DbError::NoMlock) || kind == Some(&DbError::TempfsIncompatibleMode),
                "unexpected locked-mode failure: {err:?}"
            );
        }
    }
}

#[test]
#[cfg(unix)]
fn mapped_private_persists_through_oom_flush_loop() {
    if !pagemap::pagemap_supported() {
        return;
    }
    let _guard = PRIVATE_MODE_LOCK.lock().unwrap();
    let dir = disk_backed_dir();
    let mut db = match Database::open(dir.path(), true, DB_SIZE, false, MapMode::MappedPrivate) {
        Ok(db) => db,
        Err(err) if is_tmpfs_rejection(&err) => return,
        Err(err) => panic!("mapped_private open failed: {err:?}"),
    };
    db.add_index::<Book>().unwrap();
    // Threshold 0 with no delay: every check crosses the threshold and runs
    // a full dirty-page flush.
    db.set_oom_threshold(0);
    db.set_oom_delay(Duration::ZERO);

    let rounds = 6;
    let per_round = 500;
    let mut flushed_pages = 0usize;
    for round in 0..rounds {
        for i in 0..per_round {
            let expected = round * per_round + i;
            let id = db
                .create::<Book>(|b| {
                    b.a = expected as i32;
                    b.b = (expected * 2) as i32;
                })
                .unwrap();
            assert_eq!(id, expected as u64);
        }
        let result = db
            .check_memory_and_flush_if_needed()
            .unwrap()
            .expect("threshold 0 with zero delay always checks");
        assert!(result.oom_after.is_some(), "flush ran");
        flushed_pages += result.pages_written;

        // Everything created so far reads back correctly after the flush
        // and the clear_refs that follows it.
        let total = (round + 1) * per_round;
        assert_eq!(db.index_len::<Book>().unwrap(), total);
        for probe in [0, total / 2, total - 1] {
            let row = db.get_value::<Book>(probe as u64).unwrap();
            assert_eq!(row.a, probe as i32);
        }
    }
    assert!(flushed_pages > 0, "dirty pages were written back");
    db.close().unwrap();

    // The private mapping's write-back produced a consistent file.
    let db = Database::open(dir.path(), true, 0, false, MapMode::Mapped).unwrap();
    db.add_index::<Book>().unwrap();
    assert_eq!(db.index_len::<Book>().unwrap(), rounds * per_round);
    assert_eq!(
        db.get_value::<Book>((rounds * per_round - 1) as u64).unwrap().a,
        (rounds * per_round - 1) as i32
    );
    db.close().unwrap();
}

#[test]
#[cfg(unix)]
fn mapped_private_close_persists_without_oom_pressure() {
    let _guard = PRIVATE_MODE_LOCK.lock().unwrap();
    let dir = disk_backed_dir();
    {
        let db = match Database::open(dir.path(), true, DB_SIZE, false, MapMode::MappedPrivate) {
            Ok(db) => db,
            Err(err) if is_tmpfs_rejection(&err) => return,
            Err(err) => panic!("mapped_private open failed: {err:?}"),
        };
        db.add_index::<Book>().unwrap();
        for i in 0..50 {
            db.create::<Book>(|b| b.a = i).unwrap();
        }
        db.close().unwrap();
    }
    let db = Database::open(dir.path(), false, 0, false, MapMode::Mapped).unwrap();
    db.add_index::<Book>().unwrap();
    assert_eq!(db.index_len::<Book>().unwrap(), 50);
    assert_eq!(db.get_value::<Book>(49).unwrap().a, 49);
}

#[test]
#[cfg(unix)]
fn revert_to_private_mode_after_bulk_load() {
    let _guard = PRIVATE_MODE_LOCK.lock().unwrap();
    let dir = disk_backed_dir();
    let mut db = Database::open(dir.path(), true, DB_SIZE, false, MapMode::Mapped).unwrap();
    db.add_index::<Book>().unwrap();
    for i in 0..100 {
        db.create::<Book>(|b| b.a = i).unwrap();
    }

    db.revert_to_private_mode().unwrap();
    assert_eq!(db.mode(), MapMode::MappedPrivate);

    // The rebound handles keep working against the new mapping.
    assert_eq!(db.get_value::<Book>(42).unwrap().a, 42);
    for i in 100..120 {
        db.create::<Book>(|b| b.a = i).unwrap();
    }
    db.close().unwrap();

    let db = Database::open(dir.path(), true, 0, false, MapMode::Mapped).unwrap();
    db.add_index::<Book>().unwrap();
    assert_eq!(db.index_len::<Book>().unwrap(), 120);
    assert_eq!(db.get_value::<Book>(119).unwrap().a, 119);
    db.close().unwrap();
}
