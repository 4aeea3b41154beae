//! # Pagemap Accessor
//!
//! Thin wrapper over the Linux soft-dirty tracking interface, used by the
//! `mapped_private` flush path:
//!
//! - `/proc/self/pagemap`: one 64-bit entry per virtual page; bit 55 is the
//!   soft-dirty flag, set by the kernel on the first write after the last
//!   reset;
//! - `/proc/self/clear_refs`: writing `"4"` resets the soft-dirty flag for
//!   *every* page of the process (which is why one database instance flushes
//!   its siblings before resetting);
//! - `/proc/self/oom_score`: 0..=1000 estimate of how likely the kernel is
//!   to reap this process under memory pressure.
//!
//! On non-Linux platforms everything reports unsupported and the caller
//! falls back to the full write-back path.

#[cfg(target_os = "linux")]
use std::fs::File;

use eyre::Result;

/// Soft-dirty flag in a pagemap entry.
const SOFT_DIRTY_BIT: u64 = 1 << 55;

/// System page size; pagemap entries are one per page of this size.
#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
}

#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}

/// Whether soft-dirty tracking is usable in this process.
#[cfg(target_os = "linux")]
pub fn pagemap_supported() -> bool {
    use std::os::unix::fs::FileExt;
    use std::sync::OnceLock;
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let Ok(file) = File::open("/proc/self/pagemap") else {
            return false;
        };
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, 0).is_ok()
            && File::options()
                .write(true)
                .open("/proc/self/clear_refs")
                .is_ok()
    })
}

#[cfg(not(target_os = "linux"))]
pub fn pagemap_supported() -> bool {
    false
}

/// Resets the soft-dirty flag for all pages of the process.
#[cfg(target_os = "linux")]
pub fn clear_refs() -> Result<()> {
    use crate::error::DbError;
    use std::io::Write;
    let attempt = (|| -> std::io::Result<()> {
        let mut file = File::options().write(true).open("/proc/self/clear_refs")?;
        file.write_all(b"4")
    })();
    if let Err(io) = attempt {
        return Err(eyre::Report::new(DbError::ClearRefsFailed)
            .wrap_err(format!("writing /proc/self/clear_refs: {io}")));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn clear_refs() -> Result<()> {
    eyre::bail!(crate::error::DbError::ClearRefsFailed)
}

/// Current OOM score, or `None` when the interface is unavailable.
#[cfg(target_os = "linux")]
pub fn read_oom_score() -> Option<u16> {
    let text = std::fs::read_to_string("/proc/self/oom_score").ok()?;
    text.trim().parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn read_oom_score() -> Option<u16> {
    None
}

pub fn is_soft_dirty(entry: u64) -> bool {
    entry & SOFT_DIRTY_BIT != 0
}

/// Handle over `/proc/self/pagemap`, opened lazily and kept for the life of
/// a flush pass.
pub struct PagemapAccessor {
    #[cfg(target_os = "linux")]
    file: Option<File>,
}

impl PagemapAccessor {
    pub fn new() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            file: None,
        }
    }

    /// Reads one pagemap entry per page starting at the page containing
    /// `vaddr`.
    #[cfg(target_os = "linux")]
    pub fn read_entries(&mut self, vaddr: usize, out: &mut [u64]) -> Result<()> {
        use eyre::WrapErr;
        use std::os::unix::fs::FileExt;

        if self.file.is_none() {
            self.file =
                Some(File::open("/proc/self/pagemap").wrap_err("opening /proc/self/pagemap")?);
        }
        let file = self.file.as_ref().expect("pagemap opened above");
        let offset = (vaddr / page_size()) as u64 * 8;
        // SAFETY: a [u64] reinterpreted as bytes is always valid to write.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(out.as_mut_ptr().cast::<u8>(), out.len() * 8)
        };
        file.read_exact_at(bytes, offset)
            .wrap_err("reading /proc/self/pagemap")?;
        Ok(())
    }

    /// Copies the soft-dirty pages of `region` to the matching offsets of
    /// `file`, through a temporary shared mapping of the window. Returns the
    /// number of pages written, or `None` when pagemap is unsupported (the
    /// caller then falls back to a full copy).
    ///
    /// `region.1` must be a multiple of the system page size and the file
    /// must already cover `offset..offset + region.1`.
    ///
    /// # Safety
    ///
    /// `region` must be valid readable memory for the full length.
    #[cfg(target_os = "linux")]
    pub unsafe fn update_file_from_region(
        &mut self,
        region: (*const u8, usize),
        file: &File,
        offset: u64,
        flush: bool,
    ) -> Result<Option<usize>> {
        use smallvec::SmallVec;

        if !pagemap_supported() {
            return Ok(None);
        }
        let (addr, len) = region;
        let pagesz = page_size();
        debug_assert_eq!(len % pagesz, 0);
        let num_pages = len / pagesz;

        let mut entries: SmallVec<[u64; 256]> = SmallVec::new();
        entries.resize(num_pages, 0);
        self.read_entries(addr as usize, &mut entries)?;

        if entries.iter().all(|&e| !is_soft_dirty(e)) {
            return Ok(Some(0));
        }

        // SAFETY (caller + here): the window exists in the file, and the
        // mapping lives only for this scope.
        let mut window = memmap2::MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_mut(file)?;

        let mut written = 0usize;
        let mut i = 0usize;
        while i < num_pages {
            if !is_soft_dirty(entries[i]) {
                i += 1;
                continue;
            }
            let mut j = i + 1;
            while j < num_pages && is_soft_dirty(entries[j]) {
                j += 1;
            }
            let start = i * pagesz;
            let run = (j - i) * pagesz;
            std::ptr::copy_nonoverlapping(addr.add(start), window.as_mut_ptr().add(start), run);
            written += j - i;
            i = j;
        }
        if flush && written > 0 {
            window.flush()?;
        }
        Ok(Some(written))
    }

    /// Fallback stub: soft-dirty tracking is a Linux-only facility.
    ///
    /// # Safety
    ///
    /// No requirements; the region is never dereferenced.
    #[cfg(not(target_os = "linux"))]
    pub unsafe fn update_file_from_region(
        &mut self,
        _region: (*const u8, usize),
        _file: &std::fs::File,
        _offset: u64,
        _flush: bool,
    ) -> Result<Option<usize>> {
        Ok(None)
    }
}

impl Default for PagemapAccessor {
    fn default() -> Self {
        Self::new()
    }
}
