//! # Pinnable Mapped File
//!
//! `PinnableMappedFile` bridges the on-disk database file and the process's
//! virtual address space. It owns the open/close procedure (header
//! validation, sizing, the single-writer lock, the dirty flag) and installs
//! one of four bindings between file and memory:
//!
//! | mode             | binding                                            |
//! |------------------|----------------------------------------------------|
//! | `mapped`         | shared read/write mapping; the kernel writes back  |
//! | `mapped_private` | copy-on-write mapping; the engine writes modified  |
//! |                  | pages back itself using soft-dirty tracking        |
//! | `heap`           | anonymous region loaded from the file at open and  |
//! |                  | written back at close                              |
//! | `locked`         | `heap` plus `mlock`, with 1 GiB / 2 MiB hugepage   |
//! |                  | attempts                                           |
//!
//! ## Dirty flag discipline
//!
//! The byte at offset 8 of the header is 1 for the entire lifetime of a
//! writable opening and cleared only after the final page flush of a clean
//! close. It is always written through a dedicated shared mapping of the
//! header page and flushed immediately, so a crash at any point leaves the
//! flag set and the next opener refuses the file unless told otherwise.
//!
//! ## Write-back
//!
//! `heap`/`locked` regions stream back through 1 MiB windows, skipping
//! windows that are entirely zero. `mapped_private` regions consult the
//! pagemap for soft-dirty pages and copy only those; after a mid-run flush
//! the private mapping is re-established at the same address with
//! `MAP_FIXED` so dirty tracking restarts clean without invalidating any
//! offset pointer. When pagemap support is missing the private path
//! degrades to the zero-skipping full copy.
//!
//! ## Process-wide instance tracker
//!
//! `clear_refs` resets soft-dirty state for the *whole process*, so before
//! any instance resets it, every writable `mapped_private` instance must
//! have its dirty pages written out. The tracker is the registry that makes
//! that possible; all such instances must live on the opener thread, which
//! the `&mut self` receivers of the flush entry points reflect.

pub mod environment;
pub mod pagemap;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use zerocopy::FromBytes;

use crate::config::{
    COPY_WINDOW, DEFAULT_OOM_DELAY_SECS, DEFAULT_OOM_THRESHOLD, HEADER_DIRTY_OFFSET, HEADER_SIZE,
    MIN_CREATE_SIZE, PAGE_SIZE,
};
use crate::error::DbError;
use crate::segment::{SegmentManager, SmallSizeAllocator};
use environment::{DbHeader, EnvironmentDescriptor};
#[cfg(unix)]
use pagemap::PagemapAccessor;

pub const DATA_FILE_NAME: &str = "shared_memory.bin";

/// The four file-to-memory binding strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    Mapped,
    MappedPrivate,
    Heap,
    Locked,
}

impl MapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MapMode::Mapped => "mapped",
            MapMode::MappedPrivate => "mapped_private",
            MapMode::Heap => "heap",
            MapMode::Locked => "locked",
        }
    }
}

impl FromStr for MapMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mapped" => Ok(MapMode::Mapped),
            "mapped_private" => Ok(MapMode::MappedPrivate),
            "heap" => Ok(MapMode::Heap),
            "locked" => Ok(MapMode::Locked),
            other => bail!("unknown map mode \"{other}\""),
        }
    }
}

impl std::fmt::Display for MapMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a memory-pressure check that actually consulted the kernel.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCheckResult {
    pub oom_before: u16,
    /// Present only when the threshold was crossed and a flush ran.
    pub oom_after: Option<u16>,
    pub pages_written: usize,
}

// ---------------------------------------------------------------------------
// Copy-on-write region (mapped_private)
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[derive(Debug)]
struct CowRegion {
    addr: *mut u8,
    len: usize,
    file: File,
    name: String,
}

// SAFETY: the region is only touched from the opener thread; the
// tracker hands out access strictly under each entry's mutex.
#[cfg(unix)]
unsafe impl Send for CowRegion {}

#[cfg(unix)]
impl CowRegion {
    /// Writes modified pages back to the file. Soft-dirty pages when pagemap
    /// is available, zero-skipping full windows otherwise. For a mid-run
    /// flush the mapping is re-established in place so dirty tracking
    /// restarts clean.
    fn save(&mut self, flush: bool, closing: bool) -> Result<usize> {
        if closing {
            info!(db = %self.name, "writing database file, this could take a moment...");
        }
        let mut accessor = PagemapAccessor::new();
        let mut written = 0usize;
        let mut offset = 0usize;
        let mut last_progress = Instant::now();
        while offset < self.len {
            let window = COPY_WINDOW.min(self.len - offset);
            // SAFETY: `addr..addr+len` is our live private mapping.
            let via_pagemap = unsafe {
                accessor.update_file_from_region(
                    (self.addr.add(offset), window),
                    &self.file,
                    offset as u64,
                    flush,
                )?
            };
            match via_pagemap {
                Some(pages) => written += pages,
                None => {
                    // SAFETY: same mapping as above; the window slice lives
                    // only inside this block.
                    let src =
                        unsafe { std::slice::from_raw_parts(self.addr.add(offset), window) };
                    if !all_zeros(src) {
                        let mut dst = unsafe {
                            MmapOptions::new()
                                .offset(offset as u64)
                                .len(window)
                                .map_mut(&self.file)?
                        };
                        dst.copy_from_slice(src);
                        if flush {
                            dst.flush()?;
                        }
                    }
                }
            }
            offset += window;
            if closing && last_progress.elapsed() >= Duration::from_secs(1) {
                last_progress = Instant::now();
                info!(
                    db = %self.name,
                    percent = offset * 100 / self.len,
                    "writing database file"
                );
            }
        }

        if closing {
            info!(db = %self.name, "writing database file, complete");
        } else if pagemap::pagemap_supported() {
            self.remap_in_place()?;
        }
        Ok(written)
    }

    /// Replaces the private mapping with a fresh one at the same address.
    fn remap_in_place(&mut self) -> Result<()> {
        use std::os::fd::AsRawFd;
        // SAFETY: we own `addr..addr+len`; unmapping first avoids
        // overcommit, and MAP_FIXED either reuses the hole or fails.
        unsafe {
            let old = self.addr;
            libc::munmap(old.cast(), self.len);
            let fresh = libc::mmap(
                old.cast(),
                self.len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_FIXED,
                self.file.as_raw_fd(),
                0,
            );
            if fresh == libc::MAP_FAILED || fresh != old.cast() {
                bail!(DbError::MmapAddressMatchFailed);
            }
            debug_assert_eq!(*old.add(HEADER_DIRTY_OFFSET), 1);
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for CowRegion {
    fn drop(&mut self) {
        // SAFETY: exclusive owner of the mapping.
        unsafe {
            libc::munmap(self.addr.cast(), self.len);
        }
    }
}

#[cfg(unix)]
static INSTANCE_TRACKER: Mutex<Vec<Weak<Mutex<CowRegion>>>> = Mutex::new(Vec::new());

/// Flushes every live writable `mapped_private` instance in the process.
#[cfg(unix)]
fn flush_tracked_instances(flush: bool) -> Result<usize> {
    let mut tracker = INSTANCE_TRACKER.lock();
    tracker.retain(|weak| weak.strong_count() > 0);
    let entries: Vec<Arc<Mutex<CowRegion>>> =
        tracker.iter().filter_map(|weak| weak.upgrade()).collect();
    drop(tracker);

    let mut written = 0usize;
    for entry in entries {
        written += entry.lock().save(flush, false)?;
    }
    Ok(written)
}

// ---------------------------------------------------------------------------
// Anonymous region (heap / locked)
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[derive(Debug)]
struct AnonRegion {
    addr: NonNull<u8>,
    /// Mapped length; may exceed the database size after hugepage rounding.
    map_len: usize,
}

// SAFETY: opener-thread only, like the cow region.
#[cfg(unix)]
unsafe impl Send for AnonRegion {}

#[cfg(unix)]
impl Drop for AnonRegion {
    fn drop(&mut self) {
        // SAFETY: exclusive owner of the mapping.
        unsafe {
            libc::munmap(self.addr.as_ptr().cast(), self.map_len);
        }
    }
}

// ---------------------------------------------------------------------------
// Region: the installed mode-specific binding
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Region {
    MappedRw(MmapMut),
    MappedRo(Mmap),
    #[cfg(unix)]
    Cow {
        region: Arc<Mutex<CowRegion>>,
        addr: *mut u8,
    },
    #[cfg(unix)]
    Anon(AnonRegion),
    /// Placeholder while transitioning between bindings and after close.
    Closed,
}

impl Region {
    fn base(&self) -> *mut u8 {
        match self {
            Region::MappedRw(map) => map.as_ptr() as *mut u8,
            Region::MappedRo(map) => map.as_ptr() as *mut u8,
            #[cfg(unix)]
            Region::Cow { addr, .. } => *addr,
            #[cfg(unix)]
            Region::Anon(anon) => anon.addr.as_ptr(),
            Region::Closed => panic!("database region used after close"),
        }
    }
}

// ---------------------------------------------------------------------------
// PinnableMappedFile
// ---------------------------------------------------------------------------

/// A database file bound into memory under one of the four map modes.
///
/// Not `Send`: all writable instances live on the opener thread.
#[derive(Debug)]
pub struct PinnableMappedFile {
    data_file_path: PathBuf,
    database_name: String,
    file: File,
    writable: bool,
    /// True while the binding is a shared read/write mapping.
    sharable: bool,
    mode: MapMode,
    database_size: usize,
    region: Region,
    oom_threshold: u16,
    oom_delay: Duration,
    next_memory_check: Option<Instant>,
    closed: bool,
    _not_send: std::marker::PhantomData<*mut ()>,
}

impl PinnableMappedFile {
    /// Opens (or creates) the database under `dir`.
    ///
    /// `shared_file_size` must be a multiple of 4096; on an existing file a
    /// larger value grows file and arena, a smaller one is ignored with a
    /// warning, and zero means "keep whatever is there".
    pub fn open(
        dir: &Path,
        writable: bool,
        shared_file_size: usize,
        allow_dirty: bool,
        mode: MapMode,
    ) -> Result<Self> {
        let data_file_path = dir.join(DATA_FILE_NAME);
        let database_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "database".to_string());

        if shared_file_size % PAGE_SIZE != 0 {
            return Err(eyre::Report::new(DbError::BadSize).wrap_err(format!(
                "database size must be a multiple of {PAGE_SIZE} bytes, got {shared_file_size}"
            )));
        }
        if !cfg!(unix) && mode != MapMode::Mapped {
            bail!(DbError::UnsupportedMode);
        }

        let exists = data_file_path.exists();
        if !writable && !exists {
            return Err(eyre::Report::new(DbError::NotFound)
                .wrap_err(format!("database file not found at {}", data_file_path.display())));
        }
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("creating database directory {}", dir.display()))?;

        if exists {
            Self::validate_header(&data_file_path, &database_name, allow_dirty)?;
        }

        // Create or size the file and bind a plain shared mapping; the
        // manager is constructed or attached through it.
        let (file, map, database_size) = if !exists {
            ensure!(writable, "fresh database requires a writable opening");
            if shared_file_size < MIN_CREATE_SIZE {
                return Err(eyre::Report::new(DbError::BadSize).wrap_err(format!(
                    "a new database needs at least {MIN_CREATE_SIZE} bytes"
                )));
            }
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&data_file_path)
                .wrap_err_with(|| format!("creating {}", data_file_path.display()))?;
            file.set_len(shared_file_size as u64)?;
            // SAFETY: freshly created file with exclusive access; size set
            // above; the mapping is dropped or moved into `region` below.
            let mut map = unsafe { MmapOptions::new().map_mut(&file)? };

            DbHeader::new().write_to(&mut map[..]);
            let base = NonNull::new(map.as_mut_ptr()).expect("mapping base is non-null");
            // SAFETY: the arena behind the header is exclusively ours.
            unsafe {
                let arena = NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE));
                let seg = SegmentManager::construct_at(
                    arena,
                    shared_file_size - HEADER_SIZE,
                    HEADER_SIZE,
                )?;
                // Bootstrap the slab layer and record its root; the handle
                // itself is rebuilt by whoever consumes the segment.
                drop(SmallSizeAllocator::bootstrap(seg)?);
            }
            (file, Some(map), shared_file_size)
        } else if writable {
            let file = File::options()
                .read(true)
                .write(true)
                .open(&data_file_path)
                .wrap_err_with(|| format!("opening {}", data_file_path.display()))?;
            let existing = file.metadata()?.len() as usize;
            let mut grow_delta = 0usize;
            let mut final_size = existing;
            if shared_file_size > existing {
                grow_delta = shared_file_size - existing;
                file.set_len(shared_file_size as u64)?;
                final_size = shared_file_size;
            } else if shared_file_size != 0 && shared_file_size < existing {
                warn!(
                    db = %database_name,
                    requested = shared_file_size,
                    existing,
                    "requested size is below the existing size; the database \
                     will not be shrunk"
                );
            }
            // SAFETY: single-writer discipline is enforced by the advisory
            // lock taken before any mutation below.
            let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
            let base = NonNull::new(map.as_mut_ptr()).expect("mapping base is non-null");
            // SAFETY: a valid database file has manager state at this offset.
            unsafe {
                let arena = NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE));
                let mut seg = SegmentManager::attach(arena)?;
                if grow_delta != 0 {
                    seg.as_mut().grow(grow_delta)?;
                }
            }
            (file, Some(map), final_size)
        } else {
            let file = File::open(&data_file_path)
                .wrap_err_with(|| format!("opening {}", data_file_path.display()))?;
            let existing = file.metadata()?.len() as usize;
            (file, None, existing)
        };

        if writable {
            acquire_writer_lock(&file)?;
            set_file_dirty(&file, true)?;
        }

        let mut this = Self {
            data_file_path,
            database_name,
            file,
            writable,
            sharable: mode == MapMode::Mapped,
            mode,
            database_size,
            region: Region::Closed,
            oom_threshold: DEFAULT_OOM_THRESHOLD,
            oom_delay: Duration::from_secs(DEFAULT_OOM_DELAY_SECS),
            next_memory_check: None,
            closed: false,
            _not_send: std::marker::PhantomData,
        };

        let install = this.install_region(map, mode);
        if let Err(err) = install {
            if writable {
                let _ = set_file_dirty(&this.file, false);
            }
            this.closed = true;
            return Err(err);
        }
        Ok(this)
    }

    fn install_region(&mut self, rw_map: Option<MmapMut>, mode: MapMode) -> Result<()> {
        match mode {
            MapMode::Mapped => {
                self.region = match rw_map {
                    Some(map) => Region::MappedRw(map),
                    // SAFETY: read-only mapping of a file we keep open.
                    None => Region::MappedRo(unsafe { Mmap::map(&self.file)? }),
                };
                Ok(())
            }
            MapMode::MappedPrivate => {
                if !self.writable {
                    // A read-only opening has nothing to track; a plain
                    // read-only mapping serves it.
                    self.region = Region::MappedRo(unsafe { Mmap::map(&self.file)? });
                    return Ok(());
                }
                self.install_private(rw_map)
            }
            MapMode::Heap | MapMode::Locked => self.install_anon(rw_map, mode),
        }
    }

    #[cfg(unix)]
    fn install_private(&mut self, rw_map: Option<MmapMut>) -> Result<()> {
        self.reject_tmpfs()?;
        drop(rw_map);
        self.setup_copy_on_write()
    }

    #[cfg(not(unix))]
    fn install_private(&mut self, _rw_map: Option<MmapMut>) -> Result<()> {
        bail!(DbError::UnsupportedMode)
    }

    #[cfg(unix)]
    fn install_anon(&mut self, rw_map: Option<MmapMut>, mode: MapMode) -> Result<()> {
        self.reject_tmpfs()?;
        drop(rw_map);
        let anon = self.setup_anon_region()?;
        self.load_database_file(&anon)?;
        if mode == MapMode::Locked {
            // SAFETY: the region was mapped with `map_len` bytes.
            let rc = unsafe { libc::mlock(anon.addr.as_ptr().cast(), anon.map_len) };
            if rc != 0 {
                return Err(eyre::Report::new(DbError::NoMlock).wrap_err(format!(
                    "mlock failed for \"{}\": {}",
                    self.database_name,
                    std::io::Error::last_os_error()
                )));
            }
            info!(db = %self.database_name, "database locked in memory");
        }
        self.region = Region::Anon(anon);
        Ok(())
    }

    #[cfg(not(unix))]
    fn install_anon(&mut self, _rw_map: Option<MmapMut>, _mode: MapMode) -> Result<()> {
        bail!(DbError::UnsupportedMode)
    }

    fn validate_header(path: &Path, name: &str, allow_dirty: bool) -> Result<()> {
        use std::io::Read;
        let mut buf = [0u8; HEADER_SIZE];
        let read_ok = File::open(path).and_then(|mut f| f.read_exact(&mut buf));
        if read_ok.is_err() {
            return Err(eyre::Report::new(DbError::BadHeader)
                .wrap_err(format!("reading header of {}", path.display())));
        }
        let Ok((header, _)) = DbHeader::ref_from_prefix(&buf[..]) else {
            bail!(DbError::BadHeader);
        };
        if !header.magic_ok() {
            return Err(eyre::Report::new(DbError::IncorrectVersion).wrap_err(format!(
                "\"{name}\" database format not compatible with this version"
            )));
        }
        if !allow_dirty && header.is_dirty() {
            return Err(eyre::Report::new(DbError::Dirty)
                .wrap_err(format!("\"{name}\" database dirty flag set")));
        }
        let current = EnvironmentDescriptor::current();
        if header.environment() != &current {
            error!(
                db = %name,
                "database was created in a different environment\n\
                 current environment:\n{}\ndatabase environment:\n{}",
                current.describe(),
                header.environment().describe()
            );
            bail!(DbError::Incompatible);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn reject_tmpfs(&self) -> Result<()> {
        if on_tmpfs_filesystem(&self.data_file_path) {
            bail!(DbError::TempfsIncompatibleMode);
        }
        Ok(())
    }

    /// Installs the copy-on-write binding. Siblings are flushed first so the
    /// process-global `clear_refs` cannot lose their dirty pages.
    #[cfg(unix)]
    fn setup_copy_on_write(&mut self) -> Result<()> {
        use std::os::fd::AsRawFd;

        flush_tracked_instances(true)?;

        // SAFETY: the file stays open for the life of the mapping; length
        // was established during sizing.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.database_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE,
                self.file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error())
                .wrap_err("creating copy-on-write mapping");
        }
        let addr = addr.cast::<u8>();
        // The file's dirty byte was set before this mapping was created.
        debug_assert_eq!(unsafe { *addr.add(HEADER_DIRTY_OFFSET) }, 1);

        let region = Arc::new(Mutex::new(CowRegion {
            addr,
            len: self.database_size,
            file: self.file.try_clone()?,
            name: self.database_name.clone(),
        }));

        if pagemap::pagemap_supported() {
            pagemap::clear_refs()?;
            INSTANCE_TRACKER.lock().push(Arc::downgrade(&region));
        }

        self.region = Region::Cow { addr, region };
        Ok(())
    }

    #[cfg(unix)]
    fn setup_anon_region(&self) -> Result<AnonRegion> {
        let len = self.database_size;
        let common = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        #[cfg(target_os = "linux")]
        {
            for (flag, granule, label) in [
                (libc::MAP_HUGE_1GB, 1usize << 30, "1GB"),
                (libc::MAP_HUGE_2MB, 1usize << 21, "2MB"),
            ] {
                let rounded = len.div_ceil(granule) * granule;
                // SAFETY: anonymous mapping request; failure is reported via
                // MAP_FAILED without touching memory.
                let addr = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        rounded,
                        libc::PROT_READ | libc::PROT_WRITE,
                        common | libc::MAP_HUGETLB | flag,
                        -1,
                        0,
                    )
                };
                if addr != libc::MAP_FAILED {
                    info!(db = %self.database_name, pages = label, "database using hugepages");
                    return Ok(AnonRegion {
                        addr: NonNull::new(addr.cast()).expect("mmap returned null"),
                        map_len: rounded,
                    });
                }
            }
        }

        // SAFETY: as above.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                common,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error()).wrap_err_with(|| {
                format!("failed to map database \"{}\"", self.database_name)
            });
        }
        Ok(AnonRegion {
            addr: NonNull::new(addr.cast()).expect("mmap returned null"),
            map_len: len,
        })
    }

    /// Streams the file into the anonymous region, converting SIGINT,
    /// SIGTERM, and SIGPIPE into `DbError::Aborted`.
    #[cfg(unix)]
    fn load_database_file(&self, anon: &AnonRegion) -> Result<()> {
        use std::os::unix::fs::FileExt;
        use std::sync::atomic::{AtomicBool, Ordering};

        info!(
            db = %self.database_name,
            "preloading database file, this could take a moment..."
        );

        let interrupted = Arc::new(AtomicBool::new(false));
        for sig in [
            signal_hook::consts::SIGINT,
            signal_hook::consts::SIGTERM,
            signal_hook::consts::SIGPIPE,
        ] {
            // A second signal (flag already set) escalates to the default
            // disposition; the registrations are left in place with the flag
            // raised after the load so later signals behave normally.
            signal_hook::flag::register_conditional_default(sig, interrupted.clone())?;
            signal_hook::flag::register(sig, interrupted.clone())?;
        }

        let mut offset = 0usize;
        let mut last_progress = Instant::now();
        let result = loop {
            if offset == self.database_size {
                break Ok(());
            }
            if interrupted.load(Ordering::Relaxed) {
                break Err(eyre::Report::new(DbError::Aborted));
            }
            let window = COPY_WINDOW.min(self.database_size - offset);
            // SAFETY: the anonymous region covers `database_size` bytes and
            // nothing else references it during the load.
            let dst = unsafe {
                std::slice::from_raw_parts_mut(anon.addr.as_ptr().add(offset), window)
            };
            if let Err(io) = self.file.read_exact_at(dst, offset as u64) {
                break Err(eyre::Report::new(io).wrap_err("reading database file"));
            }
            offset += window;
            if last_progress.elapsed() >= Duration::from_secs(1) {
                last_progress = Instant::now();
                info!(
                    db = %self.database_name,
                    percent = offset * 100 / self.database_size,
                    "preloading database file"
                );
            }
        };
        interrupted.store(true, Ordering::Relaxed);
        if result.is_ok() {
            info!(db = %self.database_name, "preloading database file, complete");
        }
        result
    }

    /// Streams the anonymous region back into the file, skipping all-zero
    /// windows.
    #[cfg(unix)]
    fn save_anon_region(&self, anon: &AnonRegion) -> Result<()> {
        info!(
            db = %self.database_name,
            "writing database file, this could take a moment..."
        );
        let mut offset = 0usize;
        let mut last_progress = Instant::now();
        while offset < self.database_size {
            let window = COPY_WINDOW.min(self.database_size - offset);
            // SAFETY: region covers `database_size` bytes; read-only view.
            let src =
                unsafe { std::slice::from_raw_parts(anon.addr.as_ptr().add(offset), window) };
            if !all_zeros(src) {
                let mut dst = unsafe {
                    MmapOptions::new()
                        .offset(offset as u64)
                        .len(window)
                        .map_mut(&self.file)?
                };
                dst.copy_from_slice(src);
                dst.flush()?;
            }
            offset += window;
            if last_progress.elapsed() >= Duration::from_secs(1) {
                last_progress = Instant::now();
                info!(
                    db = %self.database_name,
                    percent = offset * 100 / self.database_size,
                    "writing database file"
                );
            }
        }
        info!(db = %self.database_name, "writing database file, complete");
        Ok(())
    }

    /// Switches a shared (`mapped`) writable binding back to
    /// `mapped_private`. Useful after a bulk load that had to run under
    /// `mapped` to avoid holding every modified page in anonymous memory.
    #[cfg(unix)]
    pub fn revert_to_private_mode(&mut self) -> Result<()> {
        if !self.sharable || !self.writable {
            return Ok(());
        }
        let old = std::mem::replace(&mut self.region, Region::Closed);
        let Region::MappedRw(map) = old else {
            self.region = old;
            return Ok(());
        };
        if let Err(err) = map.flush() {
            error!(db = %self.database_name, %err, "syncing buffers failed");
            self.region = Region::MappedRw(map);
            return Ok(());
        }
        // Disk now matches memory (dirty bit still set): the shared mapping
        // can be replaced by a fresh copy-on-write one.
        drop(map);
        self.setup_copy_on_write()?;
        self.sharable = false;
        self.mode = MapMode::MappedPrivate;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn revert_to_private_mode(&mut self) -> Result<()> {
        Ok(())
    }

    /// Rate-limited memory-pressure check. When the process's OOM score
    /// reaches the configured threshold, every writable `mapped_private`
    /// instance in the process is flushed and soft-dirty tracking restarts.
    ///
    /// Returns `None` when the instance is not a writable `mapped_private`
    /// binding, the rate limit suppressed the check, or the kernel exposes
    /// no OOM score.
    #[cfg(unix)]
    pub fn check_memory_and_flush_if_needed(&mut self) -> Result<Option<MemoryCheckResult>> {
        if !self.writable || !matches!(self.region, Region::Cow { .. }) {
            return Ok(None);
        }
        let now = Instant::now();
        if let Some(next) = self.next_memory_check {
            if now < next {
                return Ok(None);
            }
        }
        self.next_memory_check = Some(now + self.oom_delay);

        let Some(oom_before) = pagemap::read_oom_score() else {
            return Ok(None);
        };
        let mut pages_written = 0;
        let mut oom_after = None;
        if oom_before >= self.oom_threshold {
            pages_written = flush_tracked_instances(true)?;
            pagemap::clear_refs()?;
            oom_after = pagemap::read_oom_score();
        }
        Ok(Some(MemoryCheckResult {
            oom_before,
            oom_after,
            pages_written,
        }))
    }

    #[cfg(not(unix))]
    pub fn check_memory_and_flush_if_needed(&mut self) -> Result<Option<MemoryCheckResult>> {
        Ok(None)
    }

    pub fn set_oom_threshold(&mut self, threshold: u16) {
        self.oom_threshold = threshold.min(1000);
    }

    pub fn set_oom_delay(&mut self, delay: Duration) {
        self.oom_delay = delay;
        self.next_memory_check = None;
    }

    /// The segment manager living behind the header of the current binding.
    pub fn segment_manager(&self) -> NonNull<SegmentManager> {
        let base = self.region.base();
        // SAFETY: every binding covers at least HEADER_SIZE + manager state.
        unsafe { NonNull::new_unchecked(base.add(HEADER_SIZE)).cast() }
    }

    pub fn database_size(&self) -> usize {
        self.database_size
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.data_file_path
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Flushes, writes back, clears the dirty flag, and releases the
    /// binding. Implicit on drop; explicit form surfaces errors.
    pub fn close(mut self) -> Result<()> {
        self.close_internal()
    }

    fn close_internal(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let region = std::mem::replace(&mut self.region, Region::Closed);
        if !self.writable {
            return Ok(());
        }
        match region {
            Region::MappedRw(map) => {
                map.flush().wrap_err("syncing buffers failed")?;
            }
            Region::MappedRo(_) | Region::Closed => {}
            #[cfg(unix)]
            Region::Anon(anon) => {
                self.save_anon_region(&anon)?;
            }
            #[cfg(unix)]
            Region::Cow { region, .. } => {
                region.lock().save(true, true)?;
                let mut tracker = INSTANCE_TRACKER.lock();
                tracker.retain(|weak| {
                    weak.upgrade()
                        .map(|arc| !Arc::ptr_eq(&arc, &region))
                        .unwrap_or(false)
                });
            }
        }
        set_file_dirty(&self.file, false)
    }
}

impl Drop for PinnableMappedFile {
    fn drop(&mut self) {
        if let Err(err) = self.close_internal() {
            error!(db = %self.database_name, %err, "error while closing database");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sets or clears the dirty byte through a dedicated shared mapping of the
/// header page, flushed immediately.
fn set_file_dirty(file: &File, dirty: bool) -> Result<()> {
    // SAFETY: the header page exists in every valid database file; the
    // mapping lives only for this scope.
    let mut header = unsafe { MmapOptions::new().len(PAGE_SIZE).map_mut(file)? };
    header[HEADER_DIRTY_OFFSET] = dirty as u8;
    header.flush().wrap_err("flushing header page")?;
    Ok(())
}

fn acquire_writer_lock(file: &File) -> Result<()> {
    #[cfg(unix)]
    {
        use fs4::FileExt;
        if file.try_lock_exclusive().is_err() {
            bail!(DbError::NoAccess);
        }
    }
    #[cfg(not(unix))]
    let _ = file;
    Ok(())
}

fn all_zeros(bytes: &[u8]) -> bool {
    // SAFETY: u64 has no validity requirements beyond size/alignment, which
    // align_to guarantees.
    let (prefix, words, suffix) = unsafe { bytes.align_to::<u64>() };
    prefix.iter().all(|&b| b == 0)
        && words.iter().all(|&w| w == 0)
        && suffix.iter().all(|&b| b == 0)
}

#[cfg(target_os = "linux")]
fn on_tmpfs_filesystem(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: valid nul-terminated path and out-pointer.
    let mut info: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(cpath.as_ptr(), &mut info) };
    rc == 0 && info.f_type as i64 == libc::TMPFS_MAGIC as i64
}

#[cfg(all(unix, not(target_os = "linux")))]
fn on_tmpfs_filesystem(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEST_SIZE: usize = 8 * 1024 * 1024;

    #[test]
    fn mode_strings_roundtrip() {
        for mode in [
            MapMode::Mapped,
            MapMode::MappedPrivate,
            MapMode::Heap,
            MapMode::Locked,
        ] {
            let parsed: MapMode = mode.as_str().parse().unwrap();
            assert_eq!(parsed, mode);
            assert_eq!(parsed.to_string(), mode.as_str());
        }
        assert!("xyzzy".parse::<MapMode>().is_err());
        assert!("Mapped".parse::<MapMode>().is_err());
    }

    #[test]
    fn create_open_close_reopen() {
        let dir = tempdir().unwrap();
        {
            let db =
                PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
                    .unwrap();
            assert_eq!(db.database_size(), TEST_SIZE);
            assert!(db.is_writable());
            db.close().unwrap();
        }
        let db = PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
            .unwrap();
        let seg = db.segment_manager();
        assert!(unsafe { seg.as_ref() }.free_memory() > 0);
        db.close().unwrap();
    }

    #[test]
    fn bad_size_is_rejected() {
        let dir = tempdir().unwrap();
        let err = PinnableMappedFile::open(dir.path(), true, TEST_SIZE + 1, false, MapMode::Mapped)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::BadSize));
    }

    #[test]
    fn missing_file_fails_read_only_open() {
        let dir = tempdir().unwrap();
        let err =
            PinnableMappedFile::open(dir.path(), false, 0, false, MapMode::Mapped).unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::NotFound));
    }

    #[test]
    fn dirty_byte_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DATA_FILE_NAME);

        let db = PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
            .unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[HEADER_DIRTY_OFFSET], 1, "dirty while writable open");
        db.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[HEADER_DIRTY_OFFSET], 0, "clean after close");
    }

    #[test]
    fn dirty_file_refused_without_allow_dirty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DATA_FILE_NAME);
        PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
            .unwrap()
            .close()
            .unwrap();

        // Simulate a crashed writer.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_DIRTY_OFFSET] = 1;
        std::fs::write(&path, &bytes).unwrap();

        let err = PinnableMappedFile::open(dir.path(), true, 0, false, MapMode::Mapped)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::Dirty));

        // allow_dirty opens it anyway.
        PinnableMappedFile::open(dir.path(), true, 0, true, MapMode::Mapped)
            .unwrap()
            .close()
            .unwrap();
    }

    #[test]
    fn corrupt_magic_fails_with_incorrect_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DATA_FILE_NAME);
        PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
            .unwrap()
            .close()
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err =
            PinnableMappedFile::open(dir.path(), true, 0, false, MapMode::Mapped).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DbError>(),
            Some(&DbError::IncorrectVersion)
        );
    }

    #[test]
    fn environment_mismatch_fails_with_incompatible() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DATA_FILE_NAME);
        PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
            .unwrap()
            .close()
            .unwrap();

        // Flip a byte inside the environment descriptor (starts at 9).
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[16] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err =
            PinnableMappedFile::open(dir.path(), true, 0, false, MapMode::Mapped).unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::Incompatible));
    }

    #[test]
    fn truncated_header_fails_with_bad_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DATA_FILE_NAME);
        std::fs::write(&path, [0u8; 100]).unwrap();

        let err =
            PinnableMappedFile::open(dir.path(), false, 0, false, MapMode::Mapped).unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::BadHeader));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempdir().unwrap();
        let db = PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
            .unwrap();

        let err = PinnableMappedFile::open(dir.path(), true, 0, true, MapMode::Mapped)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<DbError>(), Some(&DbError::NoAccess));

        // A read-only opening is allowed alongside the writer.
        let reader =
            PinnableMappedFile::open(dir.path(), false, 0, true, MapMode::Mapped).unwrap();
        assert!(!reader.is_writable());
        drop(reader);
        db.close().unwrap();
    }

    #[test]
    fn reopen_with_larger_size_grows_the_arena() {
        let dir = tempdir().unwrap();
        let free_small;
        {
            let db =
                PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
                    .unwrap();
            free_small = unsafe { db.segment_manager().as_ref() }.free_memory();
            db.close().unwrap();
        }
        let db =
            PinnableMappedFile::open(dir.path(), true, 2 * TEST_SIZE, false, MapMode::Mapped)
                .unwrap();
        assert_eq!(db.database_size(), 2 * TEST_SIZE);
        let free_grown = unsafe { db.segment_manager().as_ref() }.free_memory();
        assert!(free_grown > free_small + TEST_SIZE / 2);
        db.close().unwrap();
    }

    #[test]
    fn reopen_with_smaller_size_keeps_the_file() {
        let dir = tempdir().unwrap();
        PinnableMappedFile::open(dir.path(), true, 2 * TEST_SIZE, false, MapMode::Mapped)
            .unwrap()
            .close()
            .unwrap();

        let db = PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
            .unwrap();
        assert_eq!(db.database_size(), 2 * TEST_SIZE);
        db.close().unwrap();
    }

    #[test]
    fn memory_check_is_none_for_shared_mode() {
        let dir = tempdir().unwrap();
        let mut db =
            PinnableMappedFile::open(dir.path(), true, TEST_SIZE, false, MapMode::Mapped)
                .unwrap();
        assert!(db.check_memory_and_flush_if_needed().unwrap().is_none());
        db.close().unwrap();
    }
}
