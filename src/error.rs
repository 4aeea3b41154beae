//! # Database Error Surface
//!
//! `DbError` is the stable enumeration of everything that can go wrong while
//! opening, flushing, or allocating inside a database. Rich context is added
//! with `eyre` at the raise site; callers that need to branch on the failure
//! category recover the kind with `report.downcast_ref::<DbError>()`.

/// Stable error kinds of the open/flush/allocation surface.
///
/// The numeric codes returned by [`DbError::code`] form the category surface
/// consumed by embedders; the `Display` text matches what operators see in
/// logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbError {
    /// The file's header dirty bit is set and `allow_dirty` was false.
    Dirty,
    /// Environment descriptor mismatch with the on-disk header.
    Incompatible,
    /// Header magic mismatch; the file was written by an incompatible
    /// database format.
    IncorrectVersion,
    /// Backing file missing on a read-only open.
    NotFound,
    /// Requested size is not a multiple of the page size (or is too small
    /// to hold the header and allocator state on creation).
    BadSize,
    /// The requested map mode is not supported on this platform.
    UnsupportedMode,
    /// Short or unreadable header.
    BadHeader,
    /// The writer lock on the backing file is held elsewhere.
    NoAccess,
    /// A signal arrived during the initial load.
    Aborted,
    /// `mlock` of the database region failed.
    NoMlock,
    /// Writing `/proc/self/clear_refs` failed.
    ClearRefsFailed,
    /// Private/heap/locked mode requested for a file on a tmpfs-backed
    /// filesystem.
    TempfsIncompatibleMode,
    /// A `MAP_FIXED` remap did not come back at the prior address.
    MmapAddressMatchFailed,
    /// The segment allocator has no block of the requested size.
    OutOfSegmentMemory,
}

impl DbError {
    /// Numeric category code.
    pub fn code(&self) -> u16 {
        match self {
            DbError::Dirty => 1,
            DbError::Incompatible => 2,
            DbError::IncorrectVersion => 3,
            DbError::NotFound => 4,
            DbError::BadSize => 5,
            DbError::UnsupportedMode => 6,
            DbError::BadHeader => 7,
            DbError::NoAccess => 8,
            DbError::Aborted => 9,
            DbError::NoMlock => 10,
            DbError::ClearRefsFailed => 11,
            DbError::TempfsIncompatibleMode => 12,
            DbError::MmapAddressMatchFailed => 13,
            DbError::OutOfSegmentMemory => 14,
        }
    }
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            DbError::Dirty => "database dirty flag set",
            DbError::Incompatible => {
                "database incompatible; all environment parameters must match"
            }
            DbError::IncorrectVersion => {
                "database format not compatible with this version of pindb"
            }
            DbError::NotFound => "database file not found",
            DbError::BadSize => "bad database size",
            DbError::UnsupportedMode => "map mode not supported on this platform",
            DbError::BadHeader => "failed to read database header",
            DbError::NoAccess => "could not gain write access to the shared memory file",
            DbError::Aborted => "database load aborted",
            DbError::NoMlock => "failed to mlock database",
            DbError::ClearRefsFailed => "failed to clear soft-dirty bits",
            DbError::TempfsIncompatibleMode => {
                "storing the database file on tmpfs is only supported with map mode \"mapped\""
            }
            DbError::MmapAddressMatchFailed => {
                "failed to recreate memory mapping at previous address"
            }
            DbError::OutOfSegmentMemory => "out of segment memory",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DbError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let all = [
            DbError::Dirty,
            DbError::Incompatible,
            DbError::IncorrectVersion,
            DbError::NotFound,
            DbError::BadSize,
            DbError::UnsupportedMode,
            DbError::BadHeader,
            DbError::NoAccess,
            DbError::Aborted,
            DbError::NoMlock,
            DbError::ClearRefsFailed,
            DbError::TempfsIncompatibleMode,
            DbError::MmapAddressMatchFailed,
            DbError::OutOfSegmentMemory,
        ];
        let mut seen = std::collections::HashSet::new();
        for kind in all {
            assert!(seen.insert(kind.code()), "duplicate code for {:?}", kind);
        }
        assert_eq!(DbError::Dirty.code(), 1);
        assert_eq!(DbError::OutOfSegmentMemory.code(), 14);
    }

    #[test]
    fn downcast_through_eyre_report() {
        fn fails() -> eyre::Result<()> {
            eyre::bail!(DbError::Dirty);
        }
        let err = fails().unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::Dirty));
    }
}
