//! # Database Header and Environment Descriptor
//!
//! The first 1024 bytes of `shared_memory.bin` hold a fixed header:
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Magic 0x3242444f49534f45 ("EOSIODB2", little-endian)
//! 8       1     Dirty flag (0 or 1)
//! 9       776   Environment descriptor (packed)
//! 785     239   Zero pad to 1024
//! ```
//!
//! The dirty flag sits at a fixed byte offset so it can be set and cleared
//! with a single stored write plus a targeted flush of the header page.
//!
//! The environment descriptor pins down everything that affects the in-file
//! layout of arena structures: OS, architecture, pointer width, endianness,
//! debug flag, ABI version, and a toolchain identification string. It is
//! compared *bytewise* against the opener's own descriptor; any difference
//! fails the open with `DbError::Incompatible`.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{HEADER_DIRTY_OFFSET, HEADER_SIZE};

/// "EOSIODB2" read as a little-endian u64.
pub const HEADER_MAGIC: u64 = 0x3242444f49534f45;

/// Bumped whenever the layout of arena-resident structures changes.
pub const ABI_VERSION: u32 = 1;

pub const OS_LINUX: u8 = 0;
pub const OS_MACOS: u8 = 1;
pub const OS_WINDOWS: u8 = 2;
pub const OS_OTHER: u8 = 3;

pub const ARCH_X86_64: u8 = 0;
pub const ARCH_ARM: u8 = 1;
pub const ARCH_RISCV: u8 = 2;
pub const ARCH_OTHER: u8 = 3;

const FLAG_POINTER_64: u8 = 1 << 0;
const FLAG_LITTLE_ENDIAN: u8 = 1 << 1;

/// Packed description of the environment a database file was created in.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct EnvironmentDescriptor {
    os: u8,
    arch: u8,
    debug: u8,
    flags: u8,
    abi_version: U32,
    toolchain: [u8; 256],
    reserved: [u8; 512],
}

const _: () = assert!(std::mem::size_of::<EnvironmentDescriptor>() == 776);

impl EnvironmentDescriptor {
    /// The descriptor of the running process.
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "linux" => OS_LINUX,
            "macos" => OS_MACOS,
            "windows" => OS_WINDOWS,
            _ => OS_OTHER,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => ARCH_X86_64,
            "aarch64" | "arm" => ARCH_ARM,
            "riscv64" => ARCH_RISCV,
            _ => ARCH_OTHER,
        };
        let mut flags = 0u8;
        if std::mem::size_of::<usize>() == 8 {
            flags |= FLAG_POINTER_64;
        }
        if cfg!(target_endian = "little") {
            flags |= FLAG_LITTLE_ENDIAN;
        }

        let ident = format!(
            "pindb {} {}/{}",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        let mut toolchain = [0u8; 256];
        let take = ident.len().min(toolchain.len() - 1);
        toolchain[..take].copy_from_slice(&ident.as_bytes()[..take]);

        Self {
            os,
            arch,
            debug: cfg!(debug_assertions) as u8,
            flags,
            abi_version: U32::new(ABI_VERSION),
            toolchain,
            reserved: [0u8; 512],
        }
    }

    pub fn os_name(&self) -> &'static str {
        match self.os {
            OS_LINUX => "Linux",
            OS_MACOS => "macOS",
            OS_WINDOWS => "Windows",
            _ => "Unknown",
        }
    }

    pub fn arch_name(&self) -> &'static str {
        match self.arch {
            ARCH_X86_64 => "x86_64",
            ARCH_ARM => "ARM",
            ARCH_RISCV => "RISC-V",
            _ => "Unknown",
        }
    }

    pub fn is_debug(&self) -> bool {
        self.debug != 0
    }

    pub fn toolchain_str(&self) -> &str {
        let end = self
            .toolchain
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.toolchain.len());
        std::str::from_utf8(&self.toolchain[..end]).unwrap_or("<non-utf8>")
    }

    /// Multi-line summary used when logging a compatibility mismatch.
    pub fn describe(&self) -> String {
        format!(
            "toolchain: {}\ndebug: {}\nos: {}\narch: {}\nabi: {}",
            self.toolchain_str(),
            if self.is_debug() { "yes" } else { "no" },
            self.os_name(),
            self.arch_name(),
            self.abi_version.get(),
        )
    }
}

impl PartialEq for EnvironmentDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for EnvironmentDescriptor {}

/// The fixed file header at offset 0.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DbHeader {
    magic: U64,
    dirty: u8,
    environment: EnvironmentDescriptor,
}

const _: () = assert!(std::mem::size_of::<DbHeader>() <= HEADER_SIZE);
const _: () = assert!(std::mem::offset_of!(DbHeader, dirty) == HEADER_DIRTY_OFFSET);

impl DbHeader {
    pub fn new() -> Self {
        Self {
            magic: U64::new(HEADER_MAGIC),
            dirty: 0,
            environment: EnvironmentDescriptor::current(),
        }
    }

    pub fn magic_ok(&self) -> bool {
        self.magic.get() == HEADER_MAGIC
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }

    pub fn environment(&self) -> &EnvironmentDescriptor {
        &self.environment
    }

    /// Writes the header (with zero pad) into the first `HEADER_SIZE` bytes
    /// of `dst`.
    pub fn write_to(&self, dst: &mut [u8]) {
        assert!(dst.len() >= HEADER_SIZE);
        dst[..HEADER_SIZE].fill(0);
        dst[..std::mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
    }
}

impl Default for DbHeader {
    fn default() -> Self {
        Self::new()
    }
}
